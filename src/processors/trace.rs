use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

/// Logs every frame with a tag, optionally sleeping first to simulate a slow stage.
pub struct FrameTraceLogger {
    base: ProcessorBase,
    tag: String,
    delay: Option<Duration>,
}

impl FrameTraceLogger {
    pub fn new(tag: impl Into<String>, frames: &FrameFactory) -> Self {
        let tag = tag.into();
        Self {
            base: ProcessorBase::new(format!("FrameTraceLogger[{tag}]"), frames),
            tag,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay).filter(|d| !d.is_zero());
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl FrameProcessor for FrameTraceLogger {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        info!("Tag: {} Frame: {} ({})", self.tag, frame, direction);
        self.base.push_frame(frame, direction).await;
    }
}
