//! Wake-up primitive used to release held frames

use async_trait::async_trait;
use tokio::sync::Notify;

/// A single-slot wake signal.
///
/// `notify` never blocks, and repeated calls before the next `wait` collapse
/// into one wake.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self);

    /// Resolves once `notify` has been called at least once since the last wake.
    async fn wait(&self);
}

#[derive(Debug, Default)]
pub struct ChannelNotifier {
    inner: Notify,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    fn notify(&self) {
        self.inner.notify_one();
    }

    async fn wait(&self) {
        self.inner.notified().await;
    }
}
