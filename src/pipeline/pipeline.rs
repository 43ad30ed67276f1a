// Linear pipeline: Source -> members -> Sink

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::pipeline::sink::PipelineSink;
use crate::pipeline::source::PipelineSource;
use crate::processor::{frame_callback, link_processors, FrameCallback, FrameProcessor, ProcessorBase};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} needs at least one branch")]
    EmptyComposition(String),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pipeline error: {0}")]
    Other(String),
}

/// An ordered group of processors that is itself a processor.
///
/// Frames pushed downstream out of the last member reach the downstream
/// callback; frames pushed upstream out of the first member reach the upstream
/// callback. Without callbacks, both escape through the pipeline's own links,
/// which is what lets pipelines nest.
pub struct Pipeline {
    base: ProcessorBase,
    source: Arc<dyn FrameProcessor>,
    sink: Arc<dyn FrameProcessor>,
    processors: Vec<Arc<dyn FrameProcessor>>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        processors: Vec<Arc<dyn FrameProcessor>>,
        frames: &FrameFactory,
    ) -> Arc<Self> {
        Self::with_callbacks(name, processors, None, None, frames)
    }

    pub fn with_callbacks(
        name: impl Into<String>,
        processors: Vec<Arc<dyn FrameProcessor>>,
        upstream: Option<FrameCallback>,
        downstream: Option<FrameCallback>,
        frames: &FrameFactory,
    ) -> Arc<Self> {
        let name = name.into();
        let base = ProcessorBase::new(name.clone(), frames);

        let upstream = upstream.unwrap_or_else(|| {
            let base = base.clone();
            frame_callback(move |frame, direction| {
                let base = base.clone();
                async move { base.push_frame(frame, direction).await }
            })
        });
        let downstream = downstream.unwrap_or_else(|| {
            let base = base.clone();
            frame_callback(move |frame, direction| {
                let base = base.clone();
                async move { base.push_frame(frame, direction).await }
            })
        });

        let source: Arc<dyn FrameProcessor> = Arc::new(PipelineSource::new(
            format!("{}::Source", name),
            upstream,
            frames,
        ));
        let sink: Arc<dyn FrameProcessor> = Arc::new(PipelineSink::new(
            format!("{}::Sink", name),
            downstream,
            frames,
        ));

        let mut chain = Vec::with_capacity(processors.len() + 2);
        chain.push(source.clone());
        chain.extend(processors.iter().cloned());
        chain.push(sink.clone());
        link_processors(&chain);
        debug!("[{}] Linked {} processors", name, processors.len());

        Arc::new(Self {
            base,
            source,
            sink,
            processors,
        })
    }

    pub fn processors(&self) -> &[Arc<dyn FrameProcessor>] {
        &self.processors
    }

    pub fn source(&self) -> &Arc<dyn FrameProcessor> {
        &self.source
    }

    pub fn sink(&self) -> &Arc<dyn FrameProcessor> {
        &self.sink
    }
}

#[async_trait]
impl FrameProcessor for Pipeline {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        match direction {
            FrameDirection::Downstream => self.source.process_frame(frame, direction).await,
            FrameDirection::Upstream => self.sink.process_frame(frame, direction).await,
        }
    }

    async fn cleanup(&self) {
        self.source.cleanup().await;
        for processor in &self.processors {
            processor.cleanup().await;
        }
        self.sink.cleanup().await;
    }

    fn set_verbose(&self, verbose: bool) {
        self.base.set_verbose(verbose);
        self.source.set_verbose(verbose);
        for processor in &self.processors {
            processor.set_verbose(verbose);
        }
        self.sink.set_verbose(verbose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::processor::IdentityProcessor;
    use crate::test_utils::FrameRecorder;

    struct CleanupCounter {
        base: ProcessorBase,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameProcessor for CleanupCounter {
        fn base(&self) -> &ProcessorBase {
            &self.base
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_downstream_callback_receives_frames_in_order() {
        let frames = FrameFactory::new();
        let recorder = FrameRecorder::new(&frames);
        let downstream = {
            let recorder = recorder.clone();
            frame_callback(move |frame, direction| {
                let recorder = recorder.clone();
                async move { recorder.process_frame(frame, direction).await }
            })
        };
        let pipeline = Pipeline::with_callbacks(
            "main",
            vec![
                Arc::new(IdentityProcessor::new("a", &frames)),
                Arc::new(IdentityProcessor::new("b", &frames)),
            ],
            None,
            Some(downstream),
            &frames,
        );

        for text in ["A", "B", "C"] {
            pipeline
                .process_frame(frames.text(text), FrameDirection::Downstream)
                .await;
        }
        assert_eq!(recorder.texts(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_nested_pipeline_escapes_through_parent_links() {
        let frames = FrameFactory::new();
        let head = FrameRecorder::named("head", &frames);
        let tail = FrameRecorder::named("tail", &frames);
        let inner = Pipeline::new(
            "inner",
            vec![Arc::new(IdentityProcessor::new("inner-member", &frames))],
            &frames,
        );
        let outer = Pipeline::new(
            "outer",
            vec![head.clone(), inner.clone(), tail.clone()],
            &frames,
        );

        outer
            .process_frame(frames.text("down"), FrameDirection::Downstream)
            .await;
        assert_eq!(tail.texts(), vec!["down"]);

        // Upstream from the innermost member leaves the inner pipeline into `head`.
        inner.processors()[0]
            .base()
            .push_upstream(frames.text("up"))
            .await;
        assert_eq!(head.texts(), vec!["down", "up"]);
        assert_eq!(head.received()[1].1, FrameDirection::Upstream);
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let frames = FrameFactory::new();
        let recorder = FrameRecorder::new(&frames);
        let pipeline = Pipeline::new("empty", vec![], &frames);
        link_processors(&[pipeline.clone(), recorder.clone()]);

        pipeline
            .process_frame(frames.text("x"), FrameDirection::Downstream)
            .await;
        assert_eq!(recorder.texts(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_start_latched_by_members() {
        let frames = FrameFactory::new();
        let member: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("m", &frames));
        let pipeline = Pipeline::new("p", vec![member.clone()], &frames);

        let setup = crate::processor::ProcessorSetup {
            allow_interruptions: true,
            ..Default::default()
        };
        pipeline
            .process_frame(frames.start(setup), FrameDirection::Downstream)
            .await;

        assert!(member.base().interruptions_allowed());
        assert!(pipeline.base().interruptions_allowed());
    }

    #[tokio::test]
    async fn test_cleanup_cascades_to_members() {
        let frames = FrameFactory::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let members: Vec<Arc<dyn FrameProcessor>> = (0..3)
            .map(|i| {
                Arc::new(CleanupCounter {
                    base: ProcessorBase::new(format!("c{}", i), &frames),
                    cleanups: cleanups.clone(),
                }) as Arc<dyn FrameProcessor>
            })
            .collect();
        let pipeline = Pipeline::new("p", members, &frames);

        pipeline.cleanup().await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
        pipeline.cleanup().await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 6);
    }
}
