//! Processor trait and the shared state every processor carries
//!
//! A processor is a node in a doubly-linked chain: it owns its downstream
//! neighbour (`next`) and holds a weak, lookup-only reference to its upstream
//! neighbour (`prev`). Frames enter through [`FrameProcessor::process_frame`]
//! and leave through [`ProcessorBase::push_frame`].
//!
//! Pushing into a chain that contains a cycle is undefined; callers must not
//! build one.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::frame::{Frame, FrameDirection, FrameFactory, FrameType, SharedError};
use crate::metrics::FrameProcessorMetrics;

/// Session configuration carried by the Start frame and latched by every processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSetup {
    pub allow_interruptions: bool,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    pub report_only_initial_ttfb: bool,
    pub audio_in_sample_rate: u32,
    pub audio_out_sample_rate: u32,
}

impl Default for ProcessorSetup {
    fn default() -> Self {
        Self {
            allow_interruptions: false,
            enable_metrics: false,
            enable_usage_metrics: false,
            report_only_initial_ttfb: false,
            audio_in_sample_rate: 16000,
            audio_out_sample_rate: 24000,
        }
    }
}

/// Trait implemented by every pipeline stage.
///
/// The default `process_frame` observes the frame (latching Start, flushing
/// metrics on StartInterruption) and forwards it unchanged, so a type that only
/// provides [`base`](FrameProcessor::base) is a pass-through stage.
#[async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    fn base(&self) -> &ProcessorBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base().process_frame(&frame).await;
        self.base().push_frame(frame, direction).await;
    }

    /// Release timers and workers. Must be idempotent.
    async fn cleanup(&self) {}

    fn link(&self, next: Arc<dyn FrameProcessor>) {
        self.base().link(next);
    }

    fn set_prev(&self, prev: &Arc<dyn FrameProcessor>) {
        self.base().set_prev(prev);
    }

    fn set_verbose(&self, verbose: bool) {
        self.base().set_verbose(verbose);
    }
}

/// Link `processors` pairwise: each one owns the next and points back weakly.
pub fn link_processors(processors: &[Arc<dyn FrameProcessor>]) {
    for pair in processors.windows(2) {
        pair[0].link(pair[1].clone());
        pair[1].set_prev(&pair[0]);
    }
}

/// Async callback receiving frames that leave a pipeline boundary.
pub type FrameCallback = Arc<dyn Fn(Frame, FrameDirection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box a closure returning a future into a [`FrameCallback`].
pub fn frame_callback<F, Fut>(callback: F) -> FrameCallback
where
    F: Fn(Frame, FrameDirection) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |frame, direction| Box::pin(callback(frame, direction)))
}

// ============================================================================
// ProcessorBase
// ============================================================================

struct BaseInner {
    name: String,
    frames: FrameFactory,
    next: RwLock<Option<Arc<dyn FrameProcessor>>>,
    prev: RwLock<Option<Weak<dyn FrameProcessor>>>,
    setup: RwLock<ProcessorSetup>,
    metrics: Mutex<FrameProcessorMetrics>,
    skip_frames: Mutex<HashSet<u64>>,
    verbose: AtomicBool,
}

/// Links, latched setup and metrics shared by all processors.
///
/// Cloning is cheap and yields a handle to the same state, which is how
/// background workers push on behalf of their processor.
#[derive(Clone)]
pub struct ProcessorBase {
    inner: Arc<BaseInner>,
}

impl ProcessorBase {
    pub fn new(name: impl Into<String>, frames: &FrameFactory) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(BaseInner {
                metrics: Mutex::new(FrameProcessorMetrics::new(name.clone())),
                name,
                frames: frames.clone(),
                next: RwLock::new(None),
                prev: RwLock::new(None),
                setup: RwLock::new(ProcessorSetup::default()),
                skip_frames: Mutex::new(HashSet::new()),
                verbose: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn frames(&self) -> &FrameFactory {
        &self.inner.frames
    }

    pub fn link(&self, next: Arc<dyn FrameProcessor>) {
        if self.verbose() {
            debug!("[{}] linked -> {}", self.name(), next.name());
        }
        *self.inner.next.write() = Some(next);
    }

    pub fn set_prev(&self, prev: &Arc<dyn FrameProcessor>) {
        if self.verbose() {
            debug!("[{}] linked <- {}", self.name(), prev.name());
        }
        *self.inner.prev.write() = Some(Arc::downgrade(prev));
    }

    pub fn has_next(&self) -> bool {
        self.inner.next.read().is_some()
    }

    /// Never deliver `frame` to this processor, whoever pushes it.
    pub fn add_skip_frame(&self, frame: &Frame) {
        self.inner.skip_frames.lock().insert(frame.id());
    }

    pub fn skips(&self, frame: &Frame) -> bool {
        self.inner.skip_frames.lock().contains(&frame.id())
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.inner.verbose.load(Ordering::Relaxed)
    }

    pub fn setup(&self) -> ProcessorSetup {
        self.inner.setup.read().clone()
    }

    pub fn interruptions_allowed(&self) -> bool {
        self.inner.setup.read().allow_interruptions
    }

    pub fn metrics_enabled(&self) -> bool {
        self.inner.setup.read().enable_metrics
    }

    pub fn usage_metrics_enabled(&self) -> bool {
        self.inner.setup.read().enable_usage_metrics
    }

    /// Base handling shared by all processors: latch the session setup from
    /// Start frames and flush in-progress metrics on StartInterruption.
    pub async fn process_frame(&self, frame: &Frame) {
        match frame {
            Frame::Start { setup, .. } => {
                *self.inner.setup.write() = setup.clone();
            }
            Frame::StartInterruption { .. } => {
                self.stop_all_metrics().await;
            }
            _ => {}
        }
    }

    /// Hand `frame` to the neighbour in `direction`.
    ///
    /// A panic raised by the neighbour's handler is caught and logged here and
    /// never propagates to the caller.
    pub async fn push_frame(&self, frame: Frame, direction: FrameDirection) {
        let target = match direction {
            FrameDirection::Downstream => self.inner.next.read().clone(),
            FrameDirection::Upstream => self.inner.prev.read().as_ref().and_then(Weak::upgrade),
        };

        let Some(target) = target else {
            if self.verbose() {
                debug!(
                    "[{}] Frame not pushed: no {} neighbour for {}",
                    self.name(),
                    direction,
                    frame
                );
            }
            return;
        };

        if target.base().skips(&frame) {
            debug!("[{}] {} skips {}", self.name(), target.name(), frame);
            return;
        }

        if self.verbose() {
            debug!(
                "[{}] {} pushing {} -> {}",
                self.name(),
                direction,
                frame,
                target.name()
            );
        }

        let frame_name = frame.name();
        let outcome = AssertUnwindSafe(target.process_frame(frame, direction))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            error!(
                "[{}] Uncaught panic in {} while handling {}: {}\nStack trace:\n{}",
                self.name(),
                target.name(),
                frame_name,
                panic_message(panic.as_ref()),
                Backtrace::capture()
            );
        }
    }

    pub async fn push_downstream(&self, frame: Frame) {
        self.push_frame(frame, FrameDirection::Downstream).await;
    }

    pub async fn push_upstream(&self, frame: Frame) {
        self.push_frame(frame, FrameDirection::Upstream).await;
    }

    /// Push an Error frame upstream.
    pub async fn push_error(&self, error: SharedError, fatal: bool) {
        let frame = Frame::Error {
            header: self.frames().header(FrameType::Error),
            error,
            fatal,
        };
        self.push_upstream(frame).await;
    }

    // ------------------------------------------------------------------------
    // Metrics hooks
    // ------------------------------------------------------------------------

    pub fn start_ttfb_metrics(&self) {
        if self.metrics_enabled() {
            let report_only_initial = self.inner.setup.read().report_only_initial_ttfb;
            self.inner.metrics.lock().start_ttfb(report_only_initial);
        }
    }

    pub async fn stop_ttfb_metrics(&self) {
        if !self.metrics_enabled() {
            return;
        }
        let data = self.inner.metrics.lock().stop_ttfb();
        if let Some(data) = data {
            let frame = self.frames().metrics(data);
            self.push_downstream(frame).await;
        }
    }

    pub fn start_processing_metrics(&self) {
        if self.metrics_enabled() {
            self.inner.metrics.lock().start_processing();
        }
    }

    pub async fn stop_processing_metrics(&self) {
        if !self.metrics_enabled() {
            return;
        }
        let data = self.inner.metrics.lock().stop_processing();
        if let Some(data) = data {
            let frame = self.frames().metrics(data);
            self.push_downstream(frame).await;
        }
    }

    pub async fn stop_all_metrics(&self) {
        self.stop_ttfb_metrics().await;
        self.stop_processing_metrics().await;
    }

    /// Push a UsageMetric frame downstream when usage metrics are enabled.
    pub async fn report_usage_metric(&self, key: &str, value: u64) {
        if self.usage_metrics_enabled() {
            let frame = self.frames().usage_metric(key, value);
            self.push_downstream(frame).await;
        }
    }
}

impl std::fmt::Debug for ProcessorBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBase")
            .field("name", &self.inner.name)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Pass-through stage with no behaviour of its own.
pub struct IdentityProcessor {
    base: ProcessorBase,
}

impl IdentityProcessor {
    pub fn new(name: impl Into<String>, frames: &FrameFactory) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
        }
    }
}

#[async_trait]
impl FrameProcessor for IdentityProcessor {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FrameRecorder;

    struct PanicOnImage {
        base: ProcessorBase,
    }

    #[async_trait]
    impl FrameProcessor for PanicOnImage {
        fn base(&self) -> &ProcessorBase {
            &self.base
        }

        async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
            if frame.frame_type() == FrameType::ImageRaw {
                panic!("cannot handle images");
            }
            self.base.push_frame(frame, direction).await;
        }
    }

    fn identity_chain(frames: &FrameFactory, len: usize) -> Vec<Arc<dyn FrameProcessor>> {
        (0..len)
            .map(|i| Arc::new(IdentityProcessor::new(format!("p{}", i), frames)) as Arc<dyn FrameProcessor>)
            .collect()
    }

    #[tokio::test]
    async fn test_order_preserved_for_every_chain_length() {
        let frames = FrameFactory::new();
        for len in 1..=5 {
            let recorder = FrameRecorder::new(&frames);
            let mut chain = identity_chain(&frames, len);
            chain.push(recorder.clone());
            link_processors(&chain);

            let sent: Vec<Frame> = ["A", "B", "C"].iter().map(|t| frames.text(*t)).collect();
            for frame in &sent {
                chain[0]
                    .process_frame(frame.clone(), FrameDirection::Downstream)
                    .await;
            }

            assert_eq!(recorder.texts(), vec!["A", "B", "C"], "chain length {}", len);
        }
    }

    #[tokio::test]
    async fn test_upstream_push_reaches_predecessor() {
        let frames = FrameFactory::new();
        let recorder = FrameRecorder::new(&frames);
        let middle: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("middle", &frames));
        let chain: Vec<Arc<dyn FrameProcessor>> = vec![recorder.clone(), middle.clone()];
        link_processors(&chain);

        middle
            .process_frame(frames.text("up"), FrameDirection::Upstream)
            .await;

        let received = recorder.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, FrameDirection::Upstream);
    }

    #[tokio::test]
    async fn test_push_without_neighbour_is_noop() {
        let frames = FrameFactory::new();
        let lonely = IdentityProcessor::new("lonely", &frames);
        lonely.set_verbose(true);
        lonely
            .process_frame(frames.text("x"), FrameDirection::Downstream)
            .await;
        lonely
            .process_frame(frames.text("y"), FrameDirection::Upstream)
            .await;
    }

    #[tokio::test]
    async fn test_prev_is_weak() {
        let frames = FrameFactory::new();
        let first: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("first", &frames));
        let second: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("second", &frames));
        link_processors(&[first.clone(), second.clone()]);

        assert_eq!(Arc::strong_count(&first), 1);
        drop(first);
        // The predecessor is gone; pushing upstream must be a silent no-op.
        second
            .process_frame(frames.text("orphan"), FrameDirection::Upstream)
            .await;
    }

    #[tokio::test]
    async fn test_panicking_neighbour_does_not_stop_chain() {
        let frames = FrameFactory::new();
        let head: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("head", &frames));
        let faulty: Arc<dyn FrameProcessor> = Arc::new(PanicOnImage {
            base: ProcessorBase::new("faulty", &frames),
        });
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[head.clone(), faulty, recorder.clone()]);

        head.process_frame(frames.image_raw(vec![], (1, 1), None, None), FrameDirection::Downstream)
            .await;
        head.process_frame(frames.text("after"), FrameDirection::Downstream)
            .await;

        assert_eq!(recorder.texts(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_start_frame_latches_setup() {
        let frames = FrameFactory::new();
        let processor = IdentityProcessor::new("p", &frames);
        assert!(!processor.base().interruptions_allowed());

        let setup = ProcessorSetup {
            allow_interruptions: true,
            enable_metrics: true,
            ..Default::default()
        };
        processor
            .process_frame(frames.start(setup), FrameDirection::Downstream)
            .await;

        assert!(processor.base().interruptions_allowed());
        assert!(processor.base().metrics_enabled());
        assert!(!processor.base().usage_metrics_enabled());
    }

    #[tokio::test]
    async fn test_metrics_pushed_only_when_enabled() {
        let frames = FrameFactory::new();
        let processor: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("tts", &frames));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[processor.clone(), recorder.clone()]);

        processor.base().start_ttfb_metrics();
        processor.base().stop_ttfb_metrics().await;
        assert!(recorder.received().is_empty());

        let setup = ProcessorSetup {
            enable_metrics: true,
            enable_usage_metrics: true,
            ..Default::default()
        };
        processor.base().process_frame(&frames.start(setup)).await;
        processor.base().start_ttfb_metrics();
        processor.base().start_processing_metrics();
        processor
            .process_frame(frames.start_interruption(), FrameDirection::Downstream)
            .await;
        processor.base().report_usage_metric("characters", 42).await;

        let types: Vec<FrameType> = recorder
            .received()
            .iter()
            .map(|(frame, _)| frame.frame_type())
            .collect();
        assert_eq!(
            types,
            vec![
                FrameType::Metrics,
                FrameType::Metrics,
                FrameType::StartInterruption,
                FrameType::UsageMetric
            ]
        );
        match &recorder.received()[0].0 {
            Frame::Metrics { metrics, .. } => assert_eq!(metrics.ttfb[0].processor, "tts"),
            other => panic!("unexpected {}", other),
        }
    }

    #[tokio::test]
    async fn test_push_error_goes_upstream() {
        let frames = FrameFactory::new();
        let recorder = FrameRecorder::new(&frames);
        let processor: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("p", &frames));
        link_processors(&[recorder.clone(), processor.clone()]);

        processor
            .base()
            .push_error(Arc::new(std::io::Error::other("disk full")), false)
            .await;

        let received = recorder.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, FrameDirection::Upstream);
        assert!(matches!(received[0].0, Frame::Error { fatal: false, .. }));
    }

    #[tokio::test]
    async fn test_skipped_frames_are_not_delivered() {
        let frames = FrameFactory::new();
        let processor: Arc<dyn FrameProcessor> = Arc::new(IdentityProcessor::new("p", &frames));
        let recorder = FrameRecorder::new(&frames);
        link_processors(&[processor.clone(), recorder.clone()]);

        let skipped = frames.text("skip me");
        recorder.base().add_skip_frame(&skipped);
        assert!(recorder.base().skips(&skipped));

        processor.base().push_downstream(skipped.clone()).await;
        processor.base().push_downstream(frames.text("keep me")).await;
        processor.base().push_downstream(skipped).await;

        assert_eq!(recorder.texts(), vec!["keep me"]);
        assert_eq!(recorder.downstream().len(), 1);
    }
}
