use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory, FrameType};
use crate::notifier::Notifier;
use crate::processor::{FrameProcessor, ProcessorBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldMode {
    /// Keep every held frame, release them in arrival order.
    AllFrames,
    /// Keep only the most recent held frame.
    LastFrame,
}

enum Listener {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Holds frames of the configured types until the notifier fires.
///
/// Frames of other types pass straight through. The release listener starts on
/// the first frame and releases in that frame's direction.
pub struct HoldAggregator {
    base: ProcessorBase,
    mode: HoldMode,
    hold_types: HashSet<FrameType>,
    notifier: Arc<dyn Notifier>,
    held: Arc<Mutex<Vec<Frame>>>,
    listener: Mutex<Listener>,
    cancel_token: CancellationToken,
}

impl HoldAggregator {
    pub fn new(
        name: impl Into<String>,
        frames: &FrameFactory,
        mode: HoldMode,
        hold_types: impl IntoIterator<Item = FrameType>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            mode,
            hold_types: hold_types.into_iter().collect(),
            notifier,
            held: Arc::new(Mutex::new(Vec::new())),
            listener: Mutex::new(Listener::Idle),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn hold_frames(
        name: impl Into<String>,
        frames: &FrameFactory,
        hold_types: impl IntoIterator<Item = FrameType>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(name, frames, HoldMode::AllFrames, hold_types, notifier)
    }

    pub fn hold_last_frame(
        name: impl Into<String>,
        frames: &FrameFactory,
        hold_types: impl IntoIterator<Item = FrameType>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(name, frames, HoldMode::LastFrame, hold_types, notifier)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn ensure_listener(&self, direction: FrameDirection) {
        let mut listener = self.listener.lock();
        if !matches!(*listener, Listener::Idle) {
            return;
        }

        debug!("[{}] Starting release listener ({})", self.base.name(), direction);
        let base = self.base.clone();
        let held = self.held.clone();
        let notifier = self.notifier.clone();
        let token = self.cancel_token.clone();
        *listener = Listener::Running(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = notifier.wait() => {
                        let released: Vec<Frame> = std::mem::take(&mut *held.lock());
                        debug!("[{}] Releasing {} frames", base.name(), released.len());
                        for frame in released {
                            base.push_frame(frame, direction).await;
                        }
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl FrameProcessor for HoldAggregator {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        self.ensure_listener(direction);

        if !self.hold_types.contains(&frame.frame_type()) {
            self.base.push_frame(frame, direction).await;
            return;
        }

        let mut held = self.held.lock();
        if self.mode == HoldMode::LastFrame {
            held.clear();
        }
        held.push(frame);
    }

    async fn cleanup(&self) {
        self.cancel_token.cancel();
        let listener = std::mem::replace(&mut *self.listener.lock(), Listener::Stopped);
        if let Listener::Running(handle) = listener {
            let _ = handle.await;
        }
    }
}
