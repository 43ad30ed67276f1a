use async_trait::async_trait;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

/// Rewrites the text of Text frames with a function, in either direction.
///
/// Frames are immutable once pushed, so each rewrite is emitted as a new Text
/// frame with a fresh id. Every other frame is forwarded untouched.
pub struct TextTransformer {
    base: ProcessorBase,
    transform: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl TextTransformer {
    pub fn new<F>(name: impl Into<String>, frames: &FrameFactory, transform: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            base: ProcessorBase::new(name, frames),
            transform: Box::new(transform),
        }
    }
}

#[async_trait]
impl FrameProcessor for TextTransformer {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        let frame = match frame.text() {
            Some(text) => self.base.frames().text((self.transform)(text)),
            None => frame,
        };
        self.base.push_frame(frame, direction).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::frame::FrameType;
    use crate::processor::link_processors;
    use crate::test_utils::FrameRecorder;

    #[tokio::test]
    async fn test_rewrites_text_with_new_identity() {
        let frames = FrameFactory::new();
        let upper = Arc::new(TextTransformer::new("upper", &frames, |text| {
            text.to_uppercase()
        }));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[upper.clone(), recorder.clone()]);

        let original = frames.text("hello");
        let original_id = original.id();
        upper
            .process_frame(original, FrameDirection::Downstream)
            .await;
        upper
            .process_frame(frames.end(), FrameDirection::Downstream)
            .await;

        assert_eq!(recorder.texts(), vec!["HELLO"]);
        assert_ne!(recorder.received()[0].0.id(), original_id);
        assert_eq!(recorder.types()[1], FrameType::End);
    }

    #[tokio::test]
    async fn test_rewrites_upstream_text() {
        let frames = FrameFactory::new();
        let head = FrameRecorder::named("head", &frames);
        let reverse = Arc::new(TextTransformer::new("reverse", &frames, |text| {
            text.chars().rev().collect()
        }));
        link_processors(&[head.clone(), reverse.clone()]);

        reverse
            .process_frame(frames.text("abc"), FrameDirection::Upstream)
            .await;
        assert_eq!(head.texts(), vec!["cba"]);
    }
}
