use async_trait::async_trait;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameCallback, FrameProcessor, ProcessorBase};

/// Entry node of a [`Pipeline`](super::Pipeline).
///
/// Downstream frames pass on to the first member. Upstream frames have left
/// the pipeline and are handed to the upstream callback.
pub struct PipelineSource {
    base: ProcessorBase,
    upstream_handler: FrameCallback,
}

impl PipelineSource {
    pub fn new(name: impl Into<String>, upstream_handler: FrameCallback, frames: &FrameFactory) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            upstream_handler,
        }
    }
}

#[async_trait]
impl FrameProcessor for PipelineSource {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        match &frame {
            Frame::Start { .. } => debug!("[{}] Pipeline starting", self.base.name()),
            Frame::End { .. } => debug!("[{}] Pipeline ending", self.base.name()),
            Frame::Cancel { .. } => debug!("[{}] Pipeline cancelling", self.base.name()),
            _ => {}
        }

        match direction {
            FrameDirection::Downstream => self.base.push_frame(frame, direction).await,
            FrameDirection::Upstream => (self.upstream_handler)(frame, direction).await,
        }
    }
}
