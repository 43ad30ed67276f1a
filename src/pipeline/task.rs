//! PipelineTask - the run loop that owns a pipeline
//!
//! A task injects the Start frame, drains its inbound queue into the pipeline
//! and listens for escalations (errors, stop requests) coming out of the
//! pipeline's upstream side. It finishes once both of its driver loops have
//! exited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a task waiting for its terminating frame logs that it is still waiting.
const TERMINATION_WARN_INTERVAL: Duration = Duration::from_secs(5);

use crate::frame::{Frame, FrameDirection, FrameFactory, MetricsData};
use crate::pipeline::pipeline::PipelineError;
use crate::processor::{link_processors, FrameProcessor, ProcessorBase, ProcessorSetup};

/// Task configuration. Everything but `queue_size` ends up in the Start frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub allow_interruptions: bool,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub send_initial_empty_metrics: bool,
    pub report_only_initial_ttfb: bool,
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
    pub queue_size: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        let setup = ProcessorSetup::default();
        Self {
            allow_interruptions: setup.allow_interruptions,
            enable_metrics: setup.enable_metrics,
            enable_usage_metrics: setup.enable_usage_metrics,
            send_initial_empty_metrics: false,
            report_only_initial_ttfb: setup.report_only_initial_ttfb,
            audio_in_sample_rate: setup.audio_in_sample_rate,
            audio_out_sample_rate: setup.audio_out_sample_rate,
            queue_size: 128,
        }
    }
}

impl PipelineParams {
    pub fn with_allow_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    pub fn with_usage_metrics(mut self, enable: bool) -> Self {
        self.enable_usage_metrics = enable;
        self
    }

    pub fn with_initial_empty_metrics(mut self, send: bool) -> Self {
        self.send_initial_empty_metrics = send;
        self
    }

    pub fn with_report_only_initial_ttfb(mut self, only_initial: bool) -> Self {
        self.report_only_initial_ttfb = only_initial;
        self
    }

    pub fn with_sample_rates(mut self, audio_in: u32, audio_out: u32) -> Self {
        self.audio_in_sample_rate = audio_in;
        self.audio_out_sample_rate = audio_out;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn setup(&self) -> ProcessorSetup {
        ProcessorSetup {
            allow_interruptions: self.allow_interruptions,
            enable_metrics: self.enable_metrics,
            enable_usage_metrics: self.enable_usage_metrics,
            report_only_initial_ttfb: self.report_only_initial_ttfb,
            audio_in_sample_rate: self.audio_in_sample_rate,
            audio_out_sample_rate: self.audio_out_sample_rate,
        }
    }
}

// ============================================================================
// Task boundary nodes
// ============================================================================

/// Sits in front of the pipeline; everything that leaves the pipeline
/// upstream lands on the task's escalation queue.
struct TaskSource {
    base: ProcessorBase,
    escalations: mpsc::Sender<Frame>,
}

#[async_trait]
impl FrameProcessor for TaskSource {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        match direction {
            FrameDirection::Downstream => self.base.push_frame(frame, direction).await,
            FrameDirection::Upstream => {
                if self.escalations.send(frame).await.is_err() {
                    debug!("[{}] Escalation queue closed", self.base.name());
                }
            }
        }
    }
}

/// Sits behind the pipeline and signals when a terminating frame made it
/// all the way through.
struct TaskSink {
    base: ProcessorBase,
    terminated: Arc<Notify>,
}

#[async_trait]
impl FrameProcessor for TaskSink {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        match (&frame, direction) {
            (
                Frame::End { .. } | Frame::StopTask { .. } | Frame::Cancel { .. },
                FrameDirection::Downstream,
            ) => {
                debug!("[{}] {} reached the end of the pipeline", self.base.name(), frame);
                self.terminated.notify_one();
            }
            (_, FrameDirection::Upstream) => self.base.push_frame(frame, direction).await,
            _ => {}
        }
    }
}

// ============================================================================
// PipelineTask
// ============================================================================

/// A pipeline run.
///
/// # Example
///
/// ```ignore
/// let task = Arc::new(PipelineTask::new(pipeline, PipelineParams::default(), &frames));
/// let runner = tokio::spawn({
///     let task = task.clone();
///     async move { task.run().await }
/// });
///
/// task.queue_frame(frames.text("Hello")).await;
/// task.stop_when_done().await;
/// runner.await??;
/// ```
pub struct PipelineTask {
    id: Uuid,
    name: String,
    params: PipelineParams,
    frames: FrameFactory,
    pipeline: Arc<dyn FrameProcessor>,
    source: Arc<dyn FrameProcessor>,
    terminated: Arc<Notify>,
    down_tx: mpsc::Sender<Frame>,
    down_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    up_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    cancel_token: CancellationToken,
    finished: AtomicBool,
}

impl PipelineTask {
    pub fn new(pipeline: Arc<dyn FrameProcessor>, params: PipelineParams, frames: &FrameFactory) -> Self {
        let id = Uuid::new_v4();
        let name = format!("PipelineTask#{}", &id.simple().to_string()[..8]);

        let queue_size = params.queue_size.max(1);
        let (down_tx, down_rx) = mpsc::channel(queue_size);
        let (up_tx, up_rx) = mpsc::channel(queue_size);
        let terminated = Arc::new(Notify::new());

        let source: Arc<dyn FrameProcessor> = Arc::new(TaskSource {
            base: ProcessorBase::new(format!("{}::Source", name), frames),
            escalations: up_tx,
        });
        let sink: Arc<dyn FrameProcessor> = Arc::new(TaskSink {
            base: ProcessorBase::new(format!("{}::Sink", name), frames),
            terminated: terminated.clone(),
        });
        link_processors(&[source.clone(), pipeline.clone(), sink]);

        Self {
            id,
            name,
            params,
            frames: frames.clone(),
            pipeline,
            source,
            terminated,
            down_tx,
            down_rx: Mutex::new(Some(down_rx)),
            up_rx: Mutex::new(Some(up_rx)),
            cancel_token: CancellationToken::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// True only once both driver loops have exited.
    pub fn has_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Queue a frame for the pipeline. Waits while the inbound queue is full.
    pub async fn queue_frame(&self, frame: Frame) {
        if let Err(err) = self.down_tx.send(frame).await {
            warn!("[{}] Task is no longer running, dropping {}", self.name, err.0);
        }
    }

    pub async fn queue_frames(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.queue_frame(frame).await;
        }
    }

    /// Queue an End frame: the task stops once everything before it is processed.
    pub async fn stop_when_done(&self) {
        debug!("[{}] Task scheduled to stop when done", self.name);
        self.queue_frame(self.frames.end()).await;
    }

    /// Stop immediately without draining the inbound queue.
    pub async fn cancel(&self) {
        debug!("[{}] Cancelling task", self.name);
        self.source.base().push_downstream(self.frames.cancel()).await;
        self.cancel_token.cancel();
    }

    /// Drive the pipeline until it stops. Can only be called once.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let down_rx = self.down_rx.lock().take();
        let up_rx = self.up_rx.lock().take();
        let (Some(down_rx), Some(up_rx)) = (down_rx, up_rx) else {
            return Err(PipelineError::AlreadyRunning(self.name.clone()));
        };

        info!("[{}] Task started", self.name);
        tokio::join!(self.process_down_queue(down_rx), self.process_up_queue(up_rx));
        self.finished.store(true, Ordering::SeqCst);
        info!("[{}] Task finished", self.name);
        Ok(())
    }

    async fn process_down_queue(&self, mut down_rx: mpsc::Receiver<Frame>) {
        self.source
            .base()
            .push_downstream(self.frames.start(self.params.setup()))
            .await;
        if self.params.send_initial_empty_metrics {
            self.source
                .base()
                .push_downstream(self.frames.metrics(MetricsData::default()))
                .await;
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                frame = down_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let terminating = matches!(frame, Frame::End { .. } | Frame::StopTask { .. });
            self.source.base().push_downstream(frame).await;

            if terminating {
                self.wait_terminated().await;
                self.cancel_token.cancel();
                break;
            }
        }

        self.pipeline.cleanup().await;
        debug!("[{}] Downstream driver exited", self.name);
    }

    /// Wait for the terminating frame to reach the sink, or for cancellation.
    async fn wait_terminated(&self) {
        let started = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return,
                _ = self.terminated.notified() => return,
                _ = tokio::time::sleep(TERMINATION_WARN_INTERVAL) => {
                    warn!(
                        "[{}] Still waiting for the pipeline to finish after {:?}",
                        self.name,
                        started.elapsed()
                    );
                }
            }
        }
    }

    async fn process_up_queue(&self, mut up_rx: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                frame = up_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match frame {
                Frame::StopTask { .. } => {
                    debug!("[{}] Stop requested from the pipeline", self.name);
                    self.queue_frame(self.frames.stop_task()).await;
                }
                Frame::Error { ref error, fatal: true, .. } => {
                    error!("[{}] Fatal error: {}", self.name, error);
                    self.source.base().push_downstream(self.frames.cancel()).await;
                    self.queue_frame(self.frames.stop_task()).await;
                }
                Frame::Error { ref error, .. } => {
                    warn!("[{}] Error: {}", self.name, error);
                }
                other => {
                    debug!("[{}] Dropping upstream {}", self.name, other);
                }
            }
        }
        debug!("[{}] Upstream driver exited", self.name);
    }
}
