//! MergePipeline - N branches feeding one shared output queue
//!
//! A background loop forwards whatever the branches produce, in arrival order,
//! with no ordering between branches. Each branch reports completion by
//! delivering its End frame; once every branch has, a single End is forwarded
//! and the queue is closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::pipeline::pipeline::{Pipeline, PipelineError};
use crate::processor::{frame_callback, FrameCallback, FrameProcessor, ProcessorBase};

const MERGE_QUEUE_SIZE: usize = 128;

struct MergeQueue {
    name: String,
    sender: RwLock<Option<mpsc::Sender<(Frame, FrameDirection)>>>,
    completed: Mutex<Vec<bool>>,
    running: AtomicUsize,
}

impl MergeQueue {
    async fn send(&self, frame: Frame, direction: FrameDirection) {
        let sender = self.sender.read().clone();
        match sender {
            Some(sender) => {
                if let Err(err) = sender.send((frame, direction)).await {
                    debug!("[{}] Merge queue closed, dropping {}", self.name, err.0 .0);
                }
            }
            None => debug!("[{}] Merge queue closed, dropping {}", self.name, frame),
        }
    }

    async fn deliver(&self, branch: usize, frame: Frame, direction: FrameDirection) {
        if !(frame.is_end() && direction == FrameDirection::Downstream) {
            self.send(frame, direction).await;
            return;
        }

        let first_end = {
            let mut completed = self.completed.lock();
            !std::mem::replace(&mut completed[branch], true)
        };
        if !first_end {
            debug!("[{}] Branch {} already completed, dropping {}", self.name, branch, frame);
            return;
        }

        let remaining = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            debug!("[{}] All branches completed", self.name);
            self.send(frame, direction).await;
            self.close();
        } else {
            debug!("[{}] Branch {} completed, {} still running", self.name, branch, remaining);
        }
    }

    fn close(&self) {
        self.sender.write().take();
    }

    fn callback(self: &Arc<Self>, branch: usize) -> FrameCallback {
        let queue = self.clone();
        frame_callback(move |frame, direction| {
            let queue = queue.clone();
            async move { queue.deliver(branch, frame, direction).await }
        })
    }
}

pub struct MergePipeline {
    base: ProcessorBase,
    pipelines: Vec<Arc<Pipeline>>,
    queue: Arc<MergeQueue>,
    receiver: Mutex<Option<mpsc::Receiver<(Frame, FrameDirection)>>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl MergePipeline {
    pub fn new(
        branches: Vec<Vec<Arc<dyn FrameProcessor>>>,
        frames: &FrameFactory,
    ) -> Result<Arc<Self>, PipelineError> {
        let name = "MergePipeline".to_string();
        if branches.is_empty() {
            return Err(PipelineError::EmptyComposition(name));
        }

        let (tx, rx) = mpsc::channel(MERGE_QUEUE_SIZE);
        let queue = Arc::new(MergeQueue {
            name: name.clone(),
            sender: RwLock::new(Some(tx)),
            completed: Mutex::new(vec![false; branches.len()]),
            running: AtomicUsize::new(branches.len()),
        });

        let pipelines = branches
            .into_iter()
            .enumerate()
            .map(|(i, processors)| {
                Pipeline::with_callbacks(
                    format!("{}::Branch{}", name, i),
                    processors,
                    Some(queue.callback(i)),
                    Some(queue.callback(i)),
                    frames,
                )
            })
            .collect();

        Ok(Arc::new(Self {
            base: ProcessorBase::new(name, frames),
            pipelines,
            queue,
            receiver: Mutex::new(Some(rx)),
            forward_task: Mutex::new(None),
        }))
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    /// Number of branches that have not delivered their End frame yet.
    pub fn running_branches(&self) -> usize {
        self.queue.running.load(Ordering::SeqCst)
    }

    fn start_forwarding(&self) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let base = self.base.clone();
        let task = tokio::spawn(async move {
            while let Some((frame, direction)) = receiver.recv().await {
                base.push_frame(frame, direction).await;
            }
            debug!("[{}] Forward loop exited", base.name());
        });
        *self.forward_task.lock() = Some(task);
    }
}

#[async_trait]
impl FrameProcessor for MergePipeline {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        self.start_forwarding();

        join_all(
            self.pipelines
                .iter()
                .map(|pipeline| pipeline.process_frame(frame.clone(), direction)),
        )
        .await;
    }

    async fn cleanup(&self) {
        self.queue.close();
        self.receiver.lock().take();

        let task = self.forward_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        for pipeline in &self.pipelines {
            pipeline.cleanup().await;
        }
    }

    fn set_verbose(&self, verbose: bool) {
        self.base.set_verbose(verbose);
        for pipeline in &self.pipelines {
            pipeline.set_verbose(verbose);
        }
    }
}
