//! Per-processor timing metrics (time to first byte, processing time)

use tokio::time::Instant;
use tracing::debug;

use crate::frame::{MetricSample, MetricsData};

/// Timers backing the `start_*` / `stop_*` metrics hooks of a processor.
///
/// Stopping a timer that was never started yields nothing, so `stop_*` calls
/// are always safe.
#[derive(Debug)]
pub struct FrameProcessorMetrics {
    name: String,
    start_ttfb_time: Option<Instant>,
    start_processing_time: Option<Instant>,
    should_report_ttfb: bool,
}

impl FrameProcessorMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_ttfb_time: None,
            start_processing_time: None,
            should_report_ttfb: true,
        }
    }

    /// With `report_only_initial_ttfb`, only the first TTFB sample is ever taken.
    pub fn start_ttfb(&mut self, report_only_initial_ttfb: bool) {
        if self.should_report_ttfb {
            self.start_ttfb_time = Some(Instant::now());
            self.should_report_ttfb = !report_only_initial_ttfb;
        }
    }

    pub fn stop_ttfb(&mut self) -> Option<MetricsData> {
        let started = self.start_ttfb_time.take()?;
        let value = started.elapsed().as_secs_f64();
        debug!("[{}] TTFB: {:.6}", self.name, value);
        Some(MetricsData {
            ttfb: vec![MetricSample {
                processor: self.name.clone(),
                value,
            }],
            ..Default::default()
        })
    }

    pub fn start_processing(&mut self) {
        self.start_processing_time = Some(Instant::now());
    }

    pub fn stop_processing(&mut self) -> Option<MetricsData> {
        let started = self.start_processing_time.take()?;
        let value = started.elapsed().as_secs_f64();
        debug!("[{}] processing time: {:.6}", self.name, value);
        Some(MetricsData {
            processing: vec![MetricSample {
                processor: self.name.clone(),
                value,
            }],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_ttfb_elapsed() {
        let mut metrics = FrameProcessorMetrics::new("tts");
        metrics.start_ttfb(false);
        tokio::time::advance(Duration::from_millis(250)).await;

        let data = metrics.stop_ttfb().unwrap();
        assert_eq!(data.ttfb.len(), 1);
        assert_eq!(data.ttfb[0].processor, "tts");
        assert!((data.ttfb[0].value - 0.25).abs() < 1e-3);
        assert!(data.processing.is_empty());
    }

    #[test]
    fn test_stop_without_start_yields_nothing() {
        let mut metrics = FrameProcessorMetrics::new("llm");
        assert!(metrics.stop_ttfb().is_none());
        assert!(metrics.stop_processing().is_none());
    }

    #[tokio::test]
    async fn test_report_only_initial_ttfb() {
        let mut metrics = FrameProcessorMetrics::new("stt");
        metrics.start_ttfb(true);
        assert!(metrics.stop_ttfb().is_some());

        metrics.start_ttfb(true);
        assert!(metrics.stop_ttfb().is_none());
    }

    #[tokio::test]
    async fn test_processing_resets_after_stop() {
        let mut metrics = FrameProcessorMetrics::new("p");
        metrics.start_processing();
        assert!(metrics.stop_processing().is_some());
        assert!(metrics.stop_processing().is_none());
    }
}
