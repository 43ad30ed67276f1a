//! Parallel Pipeline Example
//!
//! Every line read from a buffer is fanned out to two branches, one that
//! upper-cases it and one that reverses it. Both results are collected and
//! printed in their JSON wire form.
//!
//! Usage:
//!   cargo run --example parallel-pipeline

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framepipe::pipeline::ParallelPipeline;
use framepipe::processor::FrameProcessor;
use framepipe::processors::{OutputProcessor, TextTransformer};
use framepipe::serializers::{FrameSerializer, JsonSerializer};
use framepipe::{FrameFactory, Pipeline, PipelineParams, PipelineTask};

const INPUT: &str = "hello world\nframes in parallel\nfan out, fan in";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("framepipe parallel pipeline example");

    let frames = FrameFactory::new();
    let upper: Arc<dyn FrameProcessor> =
        Arc::new(TextTransformer::new("upper", &frames, |text| text.to_uppercase()));
    let reverse: Arc<dyn FrameProcessor> = Arc::new(TextTransformer::new("reverse", &frames, |text| {
        text.chars().rev().collect()
    }));
    let parallel: Arc<dyn FrameProcessor> = ParallelPipeline::new(vec![vec![upper], vec![reverse]], &frames)?;

    let serializer = JsonSerializer::new();
    let output = OutputProcessor::new("output", &frames, move |frame, _direction| {
        if frame.is_data() {
            match serializer.serialize(&frame) {
                Ok(payload) => info!("{}", String::from_utf8_lossy(&payload)),
                Err(e) => warn!("Could not serialize {}: {}", frame, e),
            }
        }
        async {}
    });

    let processors: Vec<Arc<dyn FrameProcessor>> = vec![parallel, Arc::new(output)];
    let pipeline = Pipeline::new("parallel-demo", processors, &frames);
    let task = Arc::new(PipelineTask::new(pipeline, PipelineParams::default(), &frames));
    let runner = {
        let task = task.clone();
        tokio::spawn(async move { task.run().await })
    };

    task.queue_frames(INPUT.lines().map(|line| frames.text(line)))
        .await;
    task.stop_when_done().await;

    runner.await??;
    info!("Task finished");
    Ok(())
}
