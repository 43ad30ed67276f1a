//! Frame types for the pipeline
//!
//! Every frame carries a [`FrameHeader`] with a process-wide unique id and a
//! per-type sequence number used for its display name (`TextFrame#3`). Ids are
//! handed out by an injectable [`IdAllocator`]; components that synthesise
//! frames hold a [`FrameFactory`] built once per process and cloned around.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::processor::ProcessorSetup;

/// Error payload carried by [`Frame::Error`].
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

// ============================================================================
// Identity
// ============================================================================

/// Source of frame identities.
pub trait IdAllocator: Send + Sync {
    /// Next process-wide frame id. Never returns the same value twice.
    fn next_id(&self) -> u64;

    /// Next display sequence number for the given frame type.
    fn next_sequence(&self, frame_type: FrameType) -> u64;
}

/// [`IdAllocator`] backed by atomic counters.
pub struct AtomicIdAllocator {
    next_id: AtomicU64,
    sequences: [AtomicU64; FrameType::COUNT],
}

impl AtomicIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            sequences: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Reset all counters. Only meant for tests that assert on display names.
    pub fn reset(&self) {
        self.next_id.store(0, Ordering::SeqCst);
        for seq in &self.sequences {
            seq.store(0, Ordering::SeqCst);
        }
    }
}

impl Default for AtomicIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator for AtomicIdAllocator {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_sequence(&self, frame_type: FrameType) -> u64 {
        self.sequences[frame_type as usize].fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Common frame header - shared by all frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u64,
    pub sequence: u64,
}

impl FrameHeader {
    pub fn new(ids: &dyn IdAllocator, frame_type: FrameType) -> Self {
        Self {
            id: ids.next_id(),
            sequence: ids.next_sequence(frame_type),
        }
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// A timing sample reported by a processor (seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub processor: String,
    pub value: f64,
}

/// A usage sample (tokens, characters) reported by a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub processor: String,
    pub value: u64,
}

/// Payload of a [`Frame::Metrics`] frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsData {
    pub ttfb: Vec<MetricSample>,
    pub processing: Vec<MetricSample>,
    pub tokens: Vec<UsageSample>,
    pub characters: Vec<UsageSample>,
}

impl MetricsData {
    pub fn is_empty(&self) -> bool {
        self.ttfb.is_empty()
            && self.processing.is_empty()
            && self.tokens.is_empty()
            && self.characters.is_empty()
    }
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone)]
pub enum Frame {
    Text {
        header: FrameHeader,
        text: String,
    },
    AudioRaw {
        header: FrameHeader,
        audio: Vec<u8>,
        sample_rate: u32,
        num_channels: u16,
        sample_width: u16,
        num_frames: usize,
    },
    ImageRaw {
        header: FrameHeader,
        image: Vec<u8>,
        size: (u32, u32),
        format: Option<String>,
        mode: Option<String>,
    },
    Bytes {
        header: FrameHeader,
        data: Vec<u8>,
    },
    Start {
        header: FrameHeader,
        setup: ProcessorSetup,
    },
    End {
        header: FrameHeader,
    },
    Sync {
        header: FrameHeader,
    },
    SyncNotify {
        header: FrameHeader,
    },
    Idle {
        header: FrameHeader,
    },
    Cancel {
        header: FrameHeader,
    },
    Error {
        header: FrameHeader,
        error: SharedError,
        fatal: bool,
    },
    StopTask {
        header: FrameHeader,
    },
    StartInterruption {
        header: FrameHeader,
    },
    StopInterruption {
        header: FrameHeader,
    },
    Metrics {
        header: FrameHeader,
        metrics: MetricsData,
    },
    UsageMetric {
        header: FrameHeader,
        key: String,
        value: u64,
    },
}

impl Frame {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Text { header, .. }
            | Frame::AudioRaw { header, .. }
            | Frame::ImageRaw { header, .. }
            | Frame::Bytes { header, .. }
            | Frame::Start { header, .. }
            | Frame::End { header }
            | Frame::Sync { header }
            | Frame::SyncNotify { header }
            | Frame::Idle { header }
            | Frame::Cancel { header }
            | Frame::Error { header, .. }
            | Frame::StopTask { header }
            | Frame::StartInterruption { header }
            | Frame::StopInterruption { header }
            | Frame::Metrics { header, .. }
            | Frame::UsageMetric { header, .. } => header,
        }
    }

    pub fn id(&self) -> u64 {
        self.header().id
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Text { .. } => FrameType::Text,
            Frame::AudioRaw { .. } => FrameType::AudioRaw,
            Frame::ImageRaw { .. } => FrameType::ImageRaw,
            Frame::Bytes { .. } => FrameType::Bytes,
            Frame::Start { .. } => FrameType::Start,
            Frame::End { .. } => FrameType::End,
            Frame::Sync { .. } => FrameType::Sync,
            Frame::SyncNotify { .. } => FrameType::SyncNotify,
            Frame::Idle { .. } => FrameType::Idle,
            Frame::Cancel { .. } => FrameType::Cancel,
            Frame::Error { .. } => FrameType::Error,
            Frame::StopTask { .. } => FrameType::StopTask,
            Frame::StartInterruption { .. } => FrameType::StartInterruption,
            Frame::StopInterruption { .. } => FrameType::StopInterruption,
            Frame::Metrics { .. } => FrameType::Metrics,
            Frame::UsageMetric { .. } => FrameType::UsageMetric,
        }
    }

    /// Type-qualified display name, e.g. `TextFrame#2`.
    pub fn name(&self) -> String {
        format!("{}#{}", self.frame_type().type_name(), self.header().sequence)
    }

    pub fn family(&self) -> FrameFamily {
        self.frame_type().family()
    }

    pub fn is_data(&self) -> bool {
        self.family() == FrameFamily::Data
    }

    /// Control and system frames pass through filters and aggregators unexamined.
    pub fn is_pass_through(&self) -> bool {
        !self.is_data()
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Frame::End { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Frame::Text { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Text { text, .. } => write!(f, "{}(text: {})", self.name(), text),
            Frame::AudioRaw {
                audio,
                sample_rate,
                num_channels,
                sample_width,
                num_frames,
                ..
            } => write!(
                f,
                "{}(size: {}, frames: {}, sample_rate: {}, sample_width: {}, channels: {})",
                self.name(),
                audio.len(),
                num_frames,
                sample_rate,
                sample_width,
                num_channels
            ),
            Frame::ImageRaw {
                size, format, mode, ..
            } => write!(
                f,
                "{}(size: [{}, {}], format: {}, mode: {})",
                self.name(),
                size.0,
                size.1,
                format.as_deref().unwrap_or("-"),
                mode.as_deref().unwrap_or("-")
            ),
            Frame::Bytes { data, .. } => write!(f, "{}(size: {})", self.name(), data.len()),
            Frame::Error { error, fatal, .. } => {
                write!(f, "{}(error: {}, fatal: {})", self.name(), error, fatal)
            }
            Frame::UsageMetric { key, value, .. } => {
                write!(f, "{}(key: {}, value: {})", self.name(), key, value)
            }
            _ => f.write_str(&self.name()),
        }
    }
}

/// Fieldless tag for every frame variant; used for type allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Text,
    AudioRaw,
    ImageRaw,
    Bytes,
    Start,
    End,
    Sync,
    SyncNotify,
    Idle,
    Cancel,
    Error,
    StopTask,
    StartInterruption,
    StopInterruption,
    Metrics,
    UsageMetric,
}

impl FrameType {
    pub const COUNT: usize = 16;

    pub fn type_name(&self) -> &'static str {
        match self {
            FrameType::Text => "TextFrame",
            FrameType::AudioRaw => "AudioRawFrame",
            FrameType::ImageRaw => "ImageRawFrame",
            FrameType::Bytes => "BytesFrame",
            FrameType::Start => "StartFrame",
            FrameType::End => "EndFrame",
            FrameType::Sync => "SyncFrame",
            FrameType::SyncNotify => "SyncNotifyFrame",
            FrameType::Idle => "IdleFrame",
            FrameType::Cancel => "CancelFrame",
            FrameType::Error => "ErrorFrame",
            FrameType::StopTask => "StopTaskFrame",
            FrameType::StartInterruption => "StartInterruptionFrame",
            FrameType::StopInterruption => "StopInterruptionFrame",
            FrameType::Metrics => "MetricsFrame",
            FrameType::UsageMetric => "UsageMetricFrame",
        }
    }

    pub fn family(&self) -> FrameFamily {
        match self {
            FrameType::Text | FrameType::AudioRaw | FrameType::ImageRaw | FrameType::Bytes => {
                FrameFamily::Data
            }
            FrameType::Start
            | FrameType::End
            | FrameType::Sync
            | FrameType::SyncNotify
            | FrameType::Idle => FrameFamily::Control,
            FrameType::Cancel
            | FrameType::Error
            | FrameType::StopTask
            | FrameType::StartInterruption
            | FrameType::StopInterruption
            | FrameType::Metrics
            | FrameType::UsageMetric => FrameFamily::System,
        }
    }
}

/// Direction of frame flow in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    Downstream,
    Upstream,
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDirection::Downstream => f.write_str("Downstream(->)"),
            FrameDirection::Upstream => f.write_str("Upstream(<-)"),
        }
    }
}

/// Frame family classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFamily {
    System,
    Control,
    Data,
}

// ============================================================================
// FrameFactory
// ============================================================================

/// Builds frames with identities drawn from a shared [`IdAllocator`].
#[derive(Clone)]
pub struct FrameFactory {
    ids: Arc<dyn IdAllocator>,
}

impl FrameFactory {
    /// Factory over a fresh [`AtomicIdAllocator`].
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(AtomicIdAllocator::new()))
    }

    pub fn with_allocator(ids: Arc<dyn IdAllocator>) -> Self {
        Self { ids }
    }

    pub fn header(&self, frame_type: FrameType) -> FrameHeader {
        FrameHeader::new(self.ids.as_ref(), frame_type)
    }

    pub fn text(&self, text: impl Into<String>) -> Frame {
        Frame::Text {
            header: self.header(FrameType::Text),
            text: text.into(),
        }
    }

    pub fn audio_raw(
        &self,
        audio: Vec<u8>,
        sample_rate: u32,
        num_channels: u16,
        sample_width: u16,
    ) -> Frame {
        let bytes_per_frame = num_channels as usize * sample_width as usize;
        let num_frames = if bytes_per_frame > 0 {
            audio.len() / bytes_per_frame
        } else {
            0
        };
        Frame::AudioRaw {
            header: self.header(FrameType::AudioRaw),
            audio,
            sample_rate,
            num_channels,
            sample_width,
            num_frames,
        }
    }

    pub fn image_raw(
        &self,
        image: Vec<u8>,
        size: (u32, u32),
        format: Option<String>,
        mode: Option<String>,
    ) -> Frame {
        Frame::ImageRaw {
            header: self.header(FrameType::ImageRaw),
            image,
            size,
            format,
            mode,
        }
    }

    pub fn bytes(&self, data: Vec<u8>) -> Frame {
        Frame::Bytes {
            header: self.header(FrameType::Bytes),
            data,
        }
    }

    pub fn start(&self, setup: ProcessorSetup) -> Frame {
        Frame::Start {
            header: self.header(FrameType::Start),
            setup,
        }
    }

    pub fn end(&self) -> Frame {
        Frame::End {
            header: self.header(FrameType::End),
        }
    }

    pub fn sync(&self) -> Frame {
        Frame::Sync {
            header: self.header(FrameType::Sync),
        }
    }

    pub fn sync_notify(&self) -> Frame {
        Frame::SyncNotify {
            header: self.header(FrameType::SyncNotify),
        }
    }

    pub fn idle(&self) -> Frame {
        Frame::Idle {
            header: self.header(FrameType::Idle),
        }
    }

    pub fn cancel(&self) -> Frame {
        Frame::Cancel {
            header: self.header(FrameType::Cancel),
        }
    }

    pub fn error(
        &self,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        fatal: bool,
    ) -> Frame {
        Frame::Error {
            header: self.header(FrameType::Error),
            error: Arc::from(error.into()),
            fatal,
        }
    }

    pub fn stop_task(&self) -> Frame {
        Frame::StopTask {
            header: self.header(FrameType::StopTask),
        }
    }

    pub fn start_interruption(&self) -> Frame {
        Frame::StartInterruption {
            header: self.header(FrameType::StartInterruption),
        }
    }

    pub fn stop_interruption(&self) -> Frame {
        Frame::StopInterruption {
            header: self.header(FrameType::StopInterruption),
        }
    }

    pub fn metrics(&self, metrics: MetricsData) -> Frame {
        Frame::Metrics {
            header: self.header(FrameType::Metrics),
            metrics,
        }
    }

    pub fn usage_metric(&self, key: impl Into<String>, value: u64) -> Frame {
        Frame::UsageMetric {
            header: self.header(FrameType::UsageMetric),
            key: key.into(),
            value,
        }
    }
}

impl Default for FrameFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameFactory").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_across_threads() {
        let frames = FrameFactory::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let frames = frames.clone();
                std::thread::spawn(move || (0..250).map(|_| frames.text("x").id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_display_name_uses_per_type_sequence() {
        let frames = FrameFactory::new();
        let t1 = frames.text("a");
        let e1 = frames.end();
        let t2 = frames.text("b");

        assert_eq!(t1.name(), "TextFrame#1");
        assert_eq!(e1.name(), "EndFrame#1");
        assert_eq!(t2.name(), "TextFrame#2");
        assert!(t2.id() > e1.id());
        assert_eq!(t2.to_string(), "TextFrame#2(text: b)");
    }

    #[test]
    fn test_allocator_reset() {
        let allocator = Arc::new(AtomicIdAllocator::new());
        let frames = FrameFactory::with_allocator(allocator.clone());
        frames.text("a");
        frames.text("b");

        allocator.reset();
        let frame = frames.text("c");
        assert_eq!(frame.id(), 1);
        assert_eq!(frame.name(), "TextFrame#1");
    }

    #[test]
    fn test_families() {
        let frames = FrameFactory::new();
        assert_eq!(frames.text("a").family(), FrameFamily::Data);
        assert_eq!(frames.bytes(vec![1]).family(), FrameFamily::Data);
        assert_eq!(frames.start(ProcessorSetup::default()).family(), FrameFamily::Control);
        assert_eq!(frames.end().family(), FrameFamily::Control);
        assert_eq!(frames.idle().family(), FrameFamily::Control);
        assert_eq!(frames.cancel().family(), FrameFamily::System);
        assert_eq!(frames.error("boom", true).family(), FrameFamily::System);
        assert_eq!(frames.start_interruption().family(), FrameFamily::System);
        assert_eq!(frames.usage_metric("tokens", 3).family(), FrameFamily::System);
        assert!(frames.stop_task().is_pass_through());
        assert!(!frames.text("a").is_pass_through());
    }

    #[test]
    fn test_audio_frame_count() {
        let frames = FrameFactory::new();
        match frames.audio_raw(vec![0u8; 640], 16000, 1, 2) {
            Frame::AudioRaw { num_frames, .. } => assert_eq!(num_frames, 320),
            other => panic!("unexpected frame {}", other),
        }
        match frames.audio_raw(vec![0u8; 10], 16000, 0, 2) {
            Frame::AudioRaw { num_frames, .. } => assert_eq!(num_frames, 0),
            other => panic!("unexpected frame {}", other),
        }
    }
}
