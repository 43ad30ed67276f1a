//! ParallelPipeline - fan a frame out to N branches, fan their output back in
//!
//! Every branch is a [`Pipeline`] whose boundary callbacks feed two shared
//! queues, one per direction. Two background loops drain those queues and push
//! what they find to the parallel pipeline's own neighbours in arrival order.
//! There is no ordering between branches.
//!
//! Each branch's downstream End is absorbed; a single End is forwarded once
//! every branch has delivered its own, and only then are the queues closed,
//! so branches with async stages drain completely. Cancel closes the queues
//! as soon as it has been fanned out.

use std::collections::{HashMap, VecDeque};
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

const FAN_IN_QUEUE_SIZE: usize = 128;

/// How many fanned-out frame ids are remembered for de-duplication.
const DEDUP_WINDOW: usize = 1024;

/// Shared result queues plus the per-branch End barrier.
struct FanIn {
    name: String,
    up: RwLock<Option<mpsc::Sender<Frame>>>,
    down: RwLock<Option<mpsc::Sender<Frame>>>,
    completed: Mutex<Vec<bool>>,
    running: AtomicUsize,
}

impl FanIn {
    fn sender(&self, direction: FrameDirection) -> Option<mpsc::Sender<Frame>> {
        match direction {
            FrameDirection::Upstream => self.up.read().clone(),
            FrameDirection::Downstream => self.down.read().clone(),
        }
    }

    /// Drop both senders. The loops exit once what is already queued is drained.
    fn close(&self) {
        self.up.write().take();
        self.down.write().take();
    }

    async fn send(&self, frame: Frame, direction: FrameDirection) {
        match self.sender(direction) {
            Some(sender) => {
                if let Err(err) = sender.send(frame).await {
                    debug!("[{}] Fan-in queue closed, dropping {}", self.name, err.0);
                }
            }
            None => debug!("[{}] Fan-in queue closed, dropping {}", self.name, frame),
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
            debug!("[{}] Branch {} already ended, dropping {}", self.name, branch, frame);
            return;
        }

        let remaining = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            debug!("[{}] Every branch ended, closing the fan-in queues", self.name);
            self.send(frame, direction).await;
            self.close();
        } else {
            debug!("[{}] Branch {} ended, {} still running", self.name, branch, remaining);
        }
    }

    fn callback(self: &Arc<Self>, branch: usize) -> FrameCallback {
        let fan_in = self.clone();
        frame_callback(move |frame, direction| {
            let fan_in = fan_in.clone();
            async move { fan_in.deliver(branch, frame, direction).await }
        })
    }
}

/// Ids of recently fanned-out frames and how many branches returned each.
///
/// An id is forgotten once every branch has returned it, or once it is older
/// than the last `DEDUP_WINDOW` fanned-out frames (some branch dropped it). Frames a branch
/// creates itself carry fresh ids and are never tracked.
struct FanOutIds {
    branches: usize,
    arrivals: HashMap<u64, usize>,
    order: VecDeque<u64>,
}

impl FanOutIds {
    fn new(branches: usize) -> Self {
        Self {
            branches,
            arrivals: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn expect(&mut self, id: u64) {
        if self.arrivals.insert(id, 0).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.arrivals.remove(&oldest);
            }
        }
    }

    /// Whether a frame arriving from a branch should be forwarded.
    fn admit(&mut self, id: u64) -> bool {
        let Some(count) = self.arrivals.get_mut(&id) else {
            return true;
        };
        *count += 1;
        let first = *count == 1;
        if *count >= self.branches {
            self.arrivals.remove(&id);
        }
        first
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.arrivals.len()
    }
}

struct FanInReceivers {
    up: mpsc::Receiver<Frame>,
    down: mpsc::Receiver<Frame>,
}

pub struct ParallelPipeline {
    base: ProcessorBase,
    pipelines: Vec<Arc<Pipeline>>,
    fan_in: Arc<FanIn>,
    receivers: Mutex<Option<FanInReceivers>>,
    fan_in_tasks: Mutex<Vec<JoinHandle<()>>>,
    fanned_out: Arc<Mutex<FanOutIds>>,
}

impl ParallelPipeline {
    /// Build one branch per processor list.
    pub fn new(
        branches: Vec<Vec<Arc<dyn FrameProcessor>>>,
        frames: &FrameFactory,
    ) -> Result<Arc<Self>, PipelineError> {
        let name = "ParallelPipeline".to_string();
        if branches.is_empty() {
            return Err(PipelineError::EmptyComposition(name));
        }

        let (up_tx, up_rx) = mpsc::channel(FAN_IN_QUEUE_SIZE);
        let (down_tx, down_rx) = mpsc::channel(FAN_IN_QUEUE_SIZE);
        let fan_in = Arc::new(FanIn {
            name: name.clone(),
            up: RwLock::new(Some(up_tx)),
            down: RwLock::new(Some(down_tx)),
            completed: Mutex::new(vec![false; branches.len()]),
            running: AtomicUsize::new(branches.len()),
        });
        let fanned_out = Arc::new(Mutex::new(FanOutIds::new(branches.len())));

        let pipelines = branches
            .into_iter()
            .enumerate()
            .map(|(i, processors)| {
                Pipeline::with_callbacks(
                    format!("{}::Branch{}", name, i),
                    processors,
                    Some(fan_in.callback(i)),
                    Some(fan_in.callback(i)),
                    frames,
                )
            })
            .collect();

        Ok(Arc::new(Self {
            base: ProcessorBase::new(name, frames),
            pipelines,
            fan_in,
            receivers: Mutex::new(Some(FanInReceivers {
                up: up_rx,
                down: down_rx,
            })),
            fan_in_tasks: Mutex::new(Vec::new()),
            fanned_out,
        }))
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    /// Number of branches that have not delivered their End frame yet.
    pub fn running_branches(&self) -> usize {
        self.fan_in.running.load(Ordering::SeqCst)
    }

    /// Start both fan-in loops. Only the first call has any effect.
    fn start_fan_in(&self) {
        let Some(receivers) = self.receivers.lock().take() else {
            return;
        };
        debug!("[{}] Starting fan-in loops", self.base.name());

        let tasks = vec![
            tokio::spawn(fan_in_loop(
                self.base.clone(),
                receivers.up,
                FrameDirection::Upstream,
                self.fanned_out.clone(),
            )),
            tokio::spawn(fan_in_loop(
                self.base.clone(),
                receivers.down,
                FrameDirection::Downstream,
                self.fanned_out.clone(),
            )),
        ];
        self.fan_in_tasks.lock().extend(tasks);
    }
}

/// Forward every frame from `queue` in `direction`, once per fanned-out id.
async fn fan_in_loop(
    base: ProcessorBase,
    mut queue: mpsc::Receiver<Frame>,
    direction: FrameDirection,
    fanned_out: Arc<Mutex<FanOutIds>>,
) {
    while let Some(frame) = queue.recv().await {
        let admitted = fanned_out.lock().admit(frame.id());
        if admitted {
            base.push_frame(frame, direction).await;
        }
    }
    debug!("[{}] {} fan-in loop exited", base.name(), direction);
}

#[async_trait]
impl FrameProcessor for ParallelPipeline {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        self.start_fan_in();
        self.fanned_out.lock().expect(frame.id());

        let cancel = matches!(frame, Frame::Cancel { .. });

        join_all(
            self.pipelines
                .iter()
                .map(|pipeline| pipeline.process_frame(frame.clone(), direction)),
        )
        .await;

        if cancel {
            debug!("[{}] {} closes the fan-in queues", self.base.name(), frame);
            self.fan_in.close();
        }
    }

    async fn cleanup(&self) {
        for pipeline in &self.pipelines {
            pipeline.cleanup().await;
        }

        self.fan_in.close();
        self.receivers.lock().take();

        let tasks: Vec<JoinHandle<()>> = self.fan_in_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn set_verbose(&self, verbose: bool) {
        self.base.set_verbose(verbose);
        for pipeline in &self.pipelines {
            pipeline.set_verbose(verbose);
        }
    }
}
