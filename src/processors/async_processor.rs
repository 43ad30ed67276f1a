//! AsyncFrameProcessor - decouples receiving a frame from forwarding it
//!
//! Frames handed to this processor are put on a bounded queue and forwarded by
//! a background worker, so the caller never waits for the next stage. Ordering
//! within a direction is FIFO for the lifetime of one cancellation epoch.
//!
//! A StartInterruption frame ends the current epoch: the worker is cancelled
//! and joined, anything still queued is discarded, the interruption frame is
//! pushed directly, and a fresh queue and worker take over. Nothing queued
//! before the interruption can reach the next stage after it.
//!
//! A worker can re-enter this processor while pushing, when a later stage
//! answers with a StartInterruption or Cancel of its own. The re-entrant call
//! never joins the calling worker: it ends the epoch, detaches its own handle
//! and lets the worker exit at its next turn of the loop.
//!
//! When a queue is full, `queue_frame` waits up to `enqueue_timeout` for room
//! and then drops the frame with a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameDirection, FrameFactory};
use crate::processor::{FrameProcessor, ProcessorBase};

type QueueItem = (Frame, FrameDirection);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncProcessorConfig {
    /// Capacity of the main queue.
    pub queue_size: usize,
    /// Separate upstream queue with its own worker. Without it, upstream
    /// frames share the main queue.
    pub upstream_queue_size: Option<usize>,
    /// Idle wake-up period of the workers.
    pub tick_interval: Duration,
    /// How long `queue_frame` waits on a full queue before dropping.
    pub enqueue_timeout: Duration,
}

impl Default for AsyncProcessorConfig {
    fn default() -> Self {
        Self {
            queue_size: 128,
            upstream_queue_size: None,
            tick_interval: Duration::from_secs(1),
            enqueue_timeout: Duration::from_secs(1),
        }
    }
}

impl AsyncProcessorConfig {
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn with_upstream_queue_size(mut self, queue_size: usize) -> Self {
        self.upstream_queue_size = Some(queue_size.max(1));
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_enqueue_timeout(mut self, enqueue_timeout: Duration) -> Self {
        self.enqueue_timeout = enqueue_timeout;
        self
    }
}

/// Token, queue senders and worker task ids of the current epoch.
#[derive(Clone)]
struct Epoch {
    token: CancellationToken,
    queue: mpsc::Sender<QueueItem>,
    upstream_queue: Option<mpsc::Sender<QueueItem>>,
    worker_ids: Vec<task::Id>,
}

impl Epoch {
    fn sender(&self, direction: FrameDirection) -> &mpsc::Sender<QueueItem> {
        match (direction, &self.upstream_queue) {
            (FrameDirection::Upstream, Some(upstream)) => upstream,
            _ => &self.queue,
        }
    }
}

pub struct AsyncFrameProcessor {
    base: ProcessorBase,
    config: AsyncProcessorConfig,
    epoch: RwLock<Epoch>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl AsyncFrameProcessor {
    /// # Panics
    ///
    /// Spawns the push workers, so it must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, frames: &FrameFactory, config: AsyncProcessorConfig) -> Self {
        let base = ProcessorBase::new(name, frames);
        let (epoch, handles) = start_epoch(&base, &config, CancellationToken::new());
        Self {
            base,
            config,
            epoch: RwLock::new(epoch),
            workers: tokio::sync::Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AsyncProcessorConfig {
        &self.config
    }

    /// Put a frame on the queue for its direction.
    pub async fn queue_frame(&self, frame: Frame, direction: FrameDirection) {
        let epoch = self.epoch.read().clone();
        let sender = epoch.sender(direction);

        match sender.try_send((frame, direction)) {
            Ok(()) => {}
            Err(TrySendError::Closed((frame, _))) => {
                debug!("[{}] Queue closed, dropping {}", self.base.name(), frame);
            }
            Err(TrySendError::Full(item)) => {
                let frame_name = item.0.name();
                warn!(
                    "[{}] {} queue full, waiting up to {:?} for {}",
                    self.base.name(),
                    direction,
                    self.config.enqueue_timeout,
                    frame_name
                );
                tokio::select! {
                    result = sender.send(item) => {
                        if result.is_err() {
                            debug!("[{}] Queue closed, dropping {}", self.base.name(), frame_name);
                        }
                    }
                    _ = epoch.token.cancelled() => {
                        debug!("[{}] Epoch ended, discarding {}", self.base.name(), frame_name);
                    }
                    _ = tokio::time::sleep(self.config.enqueue_timeout) => {
                        warn!("[{}] {} queue still full, dropping {}", self.base.name(), direction, frame_name);
                    }
                }
            }
        }
    }

    /// End the current epoch and start a new one, pushing `frame` in between.
    pub async fn handle_interruption(&self, frame: Frame, direction: FrameDirection) {
        let mut workers = if self.on_worker() {
            match self.workers.try_lock() {
                Ok(workers) => workers,
                Err(_) => {
                    // Whoever holds the lock is already ending this epoch.
                    self.epoch.read().token.cancel();
                    self.base.push_frame(frame, direction).await;
                    return;
                }
            }
        } else {
            self.workers.lock().await
        };

        self.epoch.read().token.cancel();
        join_workers(&mut workers).await;
        debug!("[{}] Interrupted, pending frames discarded", self.base.name());

        self.base.push_frame(frame, direction).await;

        if self.stopped.load(Ordering::SeqCst) {
            debug!("[{}] Stopped, not restarting workers", self.base.name());
            return;
        }
        let (epoch, handles) = start_epoch(&self.base, &self.config, CancellationToken::new());
        let token = epoch.token.clone();
        *self.epoch.write() = epoch;
        *workers = handles;
        if self.stopped.load(Ordering::SeqCst) {
            token.cancel();
        }
    }

    /// Whether the current task is one of this epoch's push workers.
    fn on_worker(&self) -> bool {
        match task::try_id() {
            Some(id) => self.epoch.read().worker_ids.contains(&id),
            None => false,
        }
    }
}

/// Await every worker except the calling task, whose handle is dropped.
async fn join_workers(handles: &mut Vec<JoinHandle<()>>) {
    let current = task::try_id();
    for handle in handles.drain(..) {
        if Some(handle.id()) == current {
            continue;
        }
        let _ = handle.await;
    }
}

/// New queues plus one worker per queue, bound to `token`.
fn start_epoch(
    base: &ProcessorBase,
    config: &AsyncProcessorConfig,
    token: CancellationToken,
) -> (Epoch, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(config.queue_size.max(1));
    let mut handles = vec![tokio::spawn(push_worker(
        base.clone(),
        rx,
        token.clone(),
        config.tick_interval,
    ))];

    let upstream_queue = config.upstream_queue_size.map(|size| {
        let (tx, rx) = mpsc::channel(size.max(1));
        handles.push(tokio::spawn(push_worker(
            base.clone(),
            rx,
            token.clone(),
            config.tick_interval,
        )));
        tx
    });

    let epoch = Epoch {
        token,
        queue: tx,
        upstream_queue,
        worker_ids: handles.iter().map(JoinHandle::id).collect(),
    };
    (epoch, handles)
}

async fn push_worker(
    base: ProcessorBase,
    mut queue: mpsc::Receiver<QueueItem>,
    token: CancellationToken,
    tick_interval: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("[{}] Push worker cancelled", base.name());
                break;
            }
            item = queue.recv() => match item {
                Some((frame, direction)) => {
                    let end = frame.is_end();
                    base.push_frame(frame, direction).await;
                    if end {
                        debug!("[{}] Push worker finished after End", base.name());
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(tick_interval) => continue,
        }
    }
}

#[async_trait]
impl FrameProcessor for AsyncFrameProcessor {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;

        match frame {
            Frame::StartInterruption { .. } => self.handle_interruption(frame, direction).await,
            Frame::Cancel { .. } => {
                self.cleanup().await;
                self.base.push_frame(frame, direction).await;
            }
            _ => self.queue_frame(frame, direction).await,
        }
    }

    async fn cleanup(&self) {
        let was_stopped = self.stopped.swap(true, Ordering::SeqCst);
        self.epoch.read().token.cancel();

        let mut workers = if self.on_worker() {
            match self.workers.try_lock() {
                Ok(workers) => workers,
                Err(_) => return,
            }
        } else {
            self.workers.lock().await
        };
        join_workers(&mut workers).await;
        if !was_stopped {
            debug!("[{}] Push workers stopped", self.base.name());
        }
    }
}
