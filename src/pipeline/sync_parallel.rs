//! SyncParallelPipeline - fan out, wait for one result per branch, push in branch order
//!
//! For each call, every branch may contribute at most one frame travelling in
//! the call's direction; the results are pushed on once all branches have
//! returned. Output a branch produces in the opposite direction is forwarded
//! straight away. A branch must produce its result before its call returns: a
//! branch that yields later (for instance through an async stage) contributes
//! nothing to that call.
//!
//! Calls are serialised. Output pushed back into this pipeline while one of
//! its own calls is in flight deadlocks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::pipeline::pipeline::{Pipeline, PipelineError};
use crate::processor::{frame_callback, FrameCallback, FrameProcessor, ProcessorBase};

struct ArmedCall {
    direction: FrameDirection,
    result: Option<oneshot::Sender<Frame>>,
}

enum Route {
    Capture(oneshot::Sender<Frame>),
    Extra,
    Forward,
}

/// One-shot interception point at a branch's boundary.
struct ResultSlot {
    name: String,
    parent: ProcessorBase,
    call: Mutex<Option<ArmedCall>>,
}

impl ResultSlot {
    fn arm(&self, direction: FrameDirection) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        *self.call.lock() = Some(ArmedCall {
            direction,
            result: Some(tx),
        });
        rx
    }

    fn disarm(&self) {
        self.call.lock().take();
    }

    async fn deliver(&self, frame: Frame, direction: FrameDirection) {
        let route = match self.call.lock().as_mut() {
            Some(call) if call.direction == direction => match call.result.take() {
                Some(tx) => Route::Capture(tx),
                None => Route::Extra,
            },
            _ => Route::Forward,
        };

        match route {
            Route::Capture(tx) => {
                if tx.send(frame).is_err() {
                    debug!("[{}] Result slot dropped", self.name);
                }
            }
            Route::Extra => warn!(
                "[{}] Branch produced more than one result, dropping {}",
                self.name, frame
            ),
            Route::Forward => self.parent.push_frame(frame, direction).await,
        }
    }

    fn callback(self: &Arc<Self>) -> FrameCallback {
        let slot = self.clone();
        frame_callback(move |frame, direction| {
            let slot = slot.clone();
            async move { slot.deliver(frame, direction).await }
        })
    }
}

struct Branch {
    pipeline: Arc<Pipeline>,
    slot: Arc<ResultSlot>,
}

pub struct SyncParallelPipeline {
    base: ProcessorBase,
    branches: Vec<Branch>,
    section: tokio::sync::Mutex<()>,
}

impl SyncParallelPipeline {
    pub fn new(
        branches: Vec<Vec<Arc<dyn FrameProcessor>>>,
        frames: &FrameFactory,
    ) -> Result<Arc<Self>, PipelineError> {
        let name = "SyncParallelPipeline".to_string();
        if branches.is_empty() {
            return Err(PipelineError::EmptyComposition(name));
        }

        let base = ProcessorBase::new(name.clone(), frames);
        let branches = branches
            .into_iter()
            .enumerate()
            .map(|(i, processors)| {
                let branch = format!("{}::Branch{}", name, i);
                let slot = Arc::new(ResultSlot {
                    name: branch.clone(),
                    parent: base.clone(),
                    call: Mutex::new(None),
                });
                let pipeline = Pipeline::with_callbacks(
                    branch,
                    processors,
                    Some(slot.callback()),
                    Some(slot.callback()),
                    frames,
                );
                Branch { pipeline, slot }
            })
            .collect();

        Ok(Arc::new(Self {
            base,
            branches,
            section: tokio::sync::Mutex::new(()),
        }))
    }
}

#[async_trait]
impl FrameProcessor for SyncParallelPipeline {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        let results = {
            let _section = self.section.lock().await;

            let receivers: Vec<oneshot::Receiver<Frame>> = self
                .branches
                .iter()
                .map(|branch| branch.slot.arm(direction))
                .collect();

            join_all(
                self.branches
                    .iter()
                    .map(|branch| branch.pipeline.process_frame(frame.clone(), direction)),
            )
            .await;

            let mut seen = HashSet::new();
            let mut results = Vec::with_capacity(self.branches.len());
            for (branch, mut rx) in self.branches.iter().zip(receivers) {
                branch.slot.disarm();
                if let Ok(result) = rx.try_recv() {
                    if seen.insert(result.id()) {
                        results.push(result);
                    }
                }
            }
            results
        };

        for result in results {
            self.base.push_frame(result, direction).await;
        }
    }

    async fn cleanup(&self) {
        for branch in &self.branches {
            branch.pipeline.cleanup().await;
        }
    }

    fn set_verbose(&self, verbose: bool) {
        self.base.set_verbose(verbose);
        for branch in &self.branches {
            branch.pipeline.set_verbose(verbose);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::frame::FrameType;
    use crate::processor::link_processors;
    use crate::processors::{NullFilter, TextTransformer};
    use crate::test_utils::FrameRecorder;

    fn transformer(name: &str, frames: &FrameFactory, f: fn(&str) -> String) -> Arc<dyn FrameProcessor> {
        Arc::new(TextTransformer::new(name, frames, f))
    }

    /// Emits two text frames per input text.
    struct Doubler {
        base: ProcessorBase,
    }

    #[async_trait]
    impl FrameProcessor for Doubler {
        fn base(&self) -> &ProcessorBase {
            &self.base
        }

        async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
            if let Some(text) = frame.text() {
                let first = self.base.frames().text(format!("{}-1", text));
                let second = self.base.frames().text(format!("{}-2", text));
                self.base.push_frame(first, direction).await;
                self.base.push_frame(second, direction).await;
            } else {
                self.base.push_frame(frame, direction).await;
            }
        }
    }

    #[tokio::test]
    async fn test_results_pushed_in_branch_order() {
        let frames = FrameFactory::new();
        let sync = SyncParallelPipeline::new(
            vec![
                vec![transformer("upper", &frames, |t| t.to_uppercase())],
                vec![transformer("reverse", &frames, |t| t.chars().rev().collect())],
                vec![transformer("lower", &frames, |t| t.to_lowercase())],
            ],
            &frames,
        )
        .unwrap();
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[sync.clone(), recorder.clone()]);

        for text in ["Ab", "Cd"] {
            sync.process_frame(frames.text(text), FrameDirection::Downstream)
                .await;
        }

        assert_eq!(recorder.texts(), vec!["AB", "bA", "ab", "CD", "dC", "cd"]);
    }

    #[tokio::test]
    async fn test_branch_without_result_contributes_none() {
        let frames = FrameFactory::new();
        let null: Arc<dyn FrameProcessor> = Arc::new(NullFilter::new("null", &frames));
        let sync = SyncParallelPipeline::new(
            vec![
                vec![null],
                vec![transformer("upper", &frames, |t| t.to_uppercase())],
            ],
            &frames,
        )
        .unwrap();
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[sync.clone(), recorder.clone()]);

        sync.process_frame(frames.text("x"), FrameDirection::Downstream)
            .await;
        assert_eq!(recorder.texts(), vec!["X"]);
    }

    #[tokio::test]
    async fn test_pass_through_frames_deduplicated() {
        let frames = FrameFactory::new();
        let sync = SyncParallelPipeline::new(vec![vec![], vec![], vec![]], &frames).unwrap();
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[sync.clone(), recorder.clone()]);

        sync.process_frame(frames.start(Default::default()), FrameDirection::Downstream)
            .await;
        sync.process_frame(frames.end(), FrameDirection::Downstream)
            .await;

        assert_eq!(recorder.types(), vec![FrameType::Start, FrameType::End]);
    }

    #[tokio::test]
    async fn test_extra_results_dropped() {
        let frames = FrameFactory::new();
        let doubler: Arc<dyn FrameProcessor> = Arc::new(Doubler {
            base: ProcessorBase::new("doubler", &frames),
        });
        let sync = SyncParallelPipeline::new(vec![vec![doubler]], &frames).unwrap();
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[sync.clone(), recorder.clone()]);

        sync.process_frame(frames.text("a"), FrameDirection::Downstream)
            .await;
        assert_eq!(recorder.texts(), vec!["a-1"]);
    }

    #[tokio::test]
    async fn test_opposite_direction_output_forwarded_immediately() {
        let frames = FrameFactory::new();
        let head = FrameRecorder::named("head", &frames);
        let tail = FrameRecorder::named("tail", &frames);
        let sync = SyncParallelPipeline::new(vec![vec![]], &frames).unwrap();
        link_processors(&[head.clone(), sync.clone(), tail.clone()]);

        // Upstream output leaving the branch outside of any call.
        let branch_source = sync.branches[0].pipeline.source().clone();
        branch_source
            .process_frame(frames.text("error report"), FrameDirection::Upstream)
            .await;

        assert_eq!(head.texts(), vec!["error report"]);
        assert!(tail.received().is_empty());
    }
}
