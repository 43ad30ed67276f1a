use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

pub type FramePredicate = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

/// What happens to data frames that arrive while the gate is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosedPolicy {
    #[default]
    Drop,
    /// Keep them and replay them, in order, right after the opening frame.
    BufferAndFlush,
}

struct GateState {
    open: bool,
    backlog: Vec<Frame>,
}

/// Admits data frames only between an opening and a closing frame.
///
/// Control and system frames, and frames travelling against the configured
/// direction, always pass. The opening frame and the closing frame are both
/// forwarded.
pub struct GatedAggregator {
    base: ProcessorBase,
    opens_on: FramePredicate,
    closes_on: FramePredicate,
    direction: FrameDirection,
    policy: ClosedPolicy,
    state: Mutex<GateState>,
}

impl GatedAggregator {
    pub fn new<O, C>(
        name: impl Into<String>,
        frames: &FrameFactory,
        opens_on: O,
        closes_on: C,
        start_open: bool,
        direction: FrameDirection,
    ) -> Self
    where
        O: Fn(&Frame) -> bool + Send + Sync + 'static,
        C: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        Self {
            base: ProcessorBase::new(name, frames),
            opens_on: Box::new(opens_on),
            closes_on: Box::new(closes_on),
            direction,
            policy: ClosedPolicy::default(),
            state: Mutex::new(GateState {
                open: start_open,
                backlog: Vec::new(),
            }),
        }
    }

    pub fn with_closed_policy(mut self, policy: ClosedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Frames to forward for `frame`, in order.
    fn admit(&self, frame: Frame) -> Vec<Frame> {
        let mut state = self.state.lock();

        if state.open {
            if (self.closes_on)(&frame) {
                debug!("[{}] Gate closed by {}", self.base.name(), frame);
                state.open = false;
            }
            return vec![frame];
        }

        if (self.opens_on)(&frame) {
            debug!("[{}] Gate opened by {}", self.base.name(), frame);
            state.open = true;
            let mut out = Vec::with_capacity(state.backlog.len() + 1);
            out.push(frame);
            out.append(&mut state.backlog);
            return out;
        }

        match self.policy {
            ClosedPolicy::Drop => {}
            ClosedPolicy::BufferAndFlush => state.backlog.push(frame),
        }
        Vec::new()
    }
}

#[async_trait]
impl FrameProcessor for GatedAggregator {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        if frame.is_pass_through() || direction != self.direction {
            self.base.push_frame(frame, direction).await;
            return;
        }

        for frame in self.admit(frame) {
            self.base.push_frame(frame, direction).await;
        }
    }
}
