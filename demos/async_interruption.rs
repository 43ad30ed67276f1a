//! Async Interruption Example
//!
//! Text frames are queued behind an async stage feeding a slow consumer.
//! Half way through, a StartInterruption frame discards whatever is still
//! queued, and the frames sent afterwards are processed normally.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example async-interruption

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use framepipe::processor::FrameProcessor;
use framepipe::processors::{AsyncFrameProcessor, AsyncProcessorConfig, FrameTraceLogger, OutputProcessor};
use framepipe::{FrameFactory, Pipeline, PipelineParams, PipelineTask};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("framepipe async interruption example");

    let frames = FrameFactory::new();
    let queue = AsyncFrameProcessor::new("queue", &frames, AsyncProcessorConfig::default());
    let slow = FrameTraceLogger::new("slow", &frames).with_delay(Duration::from_millis(100));
    let output = OutputProcessor::new("output", &frames, |frame, _direction| async move {
        if let Some(text) = frame.text() {
            info!("Delivered: {}", text);
        }
    });

    let processors: Vec<Arc<dyn FrameProcessor>> =
        vec![Arc::new(queue), Arc::new(slow), Arc::new(output)];
    let pipeline = Pipeline::new("interruption-demo", processors, &frames);

    let params = PipelineParams::default().with_allow_interruptions(true);
    let task = Arc::new(PipelineTask::new(pipeline, params, &frames));
    let runner = {
        let task = task.clone();
        tokio::spawn(async move { task.run().await })
    };

    task.queue_frames((1..=10).map(|i| frames.text(format!("before #{i}"))))
        .await;

    sleep(Duration::from_millis(350)).await;
    info!("Interrupting");
    task.queue_frame(frames.start_interruption()).await;
    task.queue_frame(frames.stop_interruption()).await;

    task.queue_frames((1..=3).map(|i| frames.text(format!("after #{i}"))))
        .await;
    task.stop_when_done().await;

    runner.await??;
    info!("Task finished");
    Ok(())
}
