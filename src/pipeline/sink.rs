use async_trait::async_trait;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameCallback, FrameProcessor, ProcessorBase};

/// Exit node of a [`Pipeline`](super::Pipeline).
///
/// Upstream frames pass back to the last member. Downstream frames have left
/// the pipeline and are handed to the downstream callback.
pub struct PipelineSink {
    base: ProcessorBase,
    downstream_handler: FrameCallback,
}

impl PipelineSink {
    pub fn new(name: impl Into<String>, downstream_handler: FrameCallback, frames: &FrameFactory) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            downstream_handler,
        }
    }
}

#[async_trait]
impl FrameProcessor for PipelineSink {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        if let Frame::End { .. } = frame {
            debug!("[{}] End reached pipeline sink", self.base.name());
        }

        match direction {
            FrameDirection::Downstream => (self.downstream_handler)(frame, direction).await,
            FrameDirection::Upstream => self.base.push_frame(frame, direction).await,
        }
    }
}
