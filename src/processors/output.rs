use std::future::Future;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

type OutputCallback = Box<dyn Fn(Frame, FrameDirection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hands a copy of every frame to a callback, then forwards the frame.
///
/// Typically placed at the end of a pipeline to collect its output.
pub struct OutputProcessor {
    base: ProcessorBase,
    callback: OutputCallback,
}

impl OutputProcessor {
    pub fn new<F, Fut>(name: impl Into<String>, frames: &FrameFactory, callback: F) -> Self
    where
        F: Fn(Frame, FrameDirection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            base: ProcessorBase::new(name, frames),
            callback: Box::new(move |frame, direction| Box::pin(callback(frame, direction))),
        }
    }
}

#[async_trait]
impl FrameProcessor for OutputProcessor {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        (self.callback)(frame.clone(), direction).await;
        self.base.push_frame(frame, direction).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::frame::FrameType;
    use crate::processor::link_processors;
    use crate::test_utils::FrameRecorder;

    #[tokio::test]
    async fn test_callback_sees_frame_before_forward() {
        let frames = FrameFactory::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let output = Arc::new(OutputProcessor::new("out", &frames, move |frame, direction| {
            let sink = sink.clone();
            async move {
                tokio::task::yield_now().await;
                sink.lock().push((frame.frame_type(), direction));
            }
        }));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[output.clone(), recorder.clone()]);

        output
            .process_frame(frames.text("x"), FrameDirection::Downstream)
            .await;
        output
            .process_frame(frames.end(), FrameDirection::Downstream)
            .await;

        assert_eq!(
            *seen.lock(),
            vec![
                (FrameType::Text, FrameDirection::Downstream),
                (FrameType::End, FrameDirection::Downstream)
            ]
        );
        assert_eq!(recorder.types(), vec![FrameType::Text, FrameType::End]);
    }
}
