//! IdleProcessor - emits Idle frames when nothing interesting has passed for a while

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory, FrameType};
use crate::processor::{FrameProcessor, ProcessorBase};

/// Pushes an Idle frame every `timeout` without a resetting frame.
///
/// The timer is armed by the first frame and fires in that frame's direction.
/// Frames whose type is in `reset_types` restart it; with an empty set every
/// frame does. An End frame stops the timer for good.
pub struct IdleProcessor {
    base: ProcessorBase,
    timeout: Duration,
    reset_types: HashSet<FrameType>,
    reset: Arc<Notify>,
    cancel_token: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl IdleProcessor {
    pub fn new(
        name: impl Into<String>,
        frames: &FrameFactory,
        timeout: Duration,
        reset_types: impl IntoIterator<Item = FrameType>,
    ) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            timeout,
            reset_types: reset_types.into_iter().collect(),
            reset: Arc::new(Notify::new()),
            cancel_token: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    fn ensure_timer(&self, direction: FrameDirection) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.cancel_token.is_cancelled() {
            return;
        }

        let base = self.base.clone();
        let reset = self.reset.clone();
        let token = self.cancel_token.clone();
        let timeout = self.timeout;
        *timer = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = reset.notified() => continue,
                    _ = tokio::time::sleep(timeout) => {
                        debug!("[{}] Idle for {:?}", base.name(), timeout);
                        let idle = base.frames().idle();
                        base.push_frame(idle, direction).await;
                    }
                }
            }
        }));
    }

    fn resets_timer(&self, frame: &Frame) -> bool {
        self.reset_types.is_empty() || self.reset_types.contains(&frame.frame_type())
    }
}

#[async_trait]
impl FrameProcessor for IdleProcessor {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        self.ensure_timer(direction);

        if self.resets_timer(&frame) {
            self.reset.notify_one();
        }

        let end = frame.is_end();
        self.base.push_frame(frame, direction).await;

        if end {
            debug!("[{}] End seen, idle timer stopped", self.base.name());
            self.cancel_token.cancel();
        }
    }

    async fn cleanup(&self) {
        self.cancel_token.cancel();
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }
    }
}
