//! Bidirectional frame-processing pipelines
//!
//! This library provides frame types, the processor trait, and the building
//! blocks for composing processors into pipelines: linear pipelines and the
//! task that drives them, queue-decoupled async processors, fan-out/fan-in
//! compositions, and stateful aggregators.

pub mod frame;
pub mod metrics;
pub mod notifier;
pub mod pipeline;
pub mod processor;
pub mod processors;
pub mod serializers;

pub use frame::{Frame, FrameDirection, FrameFactory, FrameFamily, FrameType};
pub use pipeline::{Pipeline, PipelineError, PipelineParams, PipelineTask};
pub use processor::{FrameProcessor, ProcessorBase, ProcessorSetup};
