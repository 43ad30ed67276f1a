pub mod aggregators;
pub mod async_processor;
pub mod filters;
pub mod idle;
pub mod io;
pub mod output;
pub mod text;
pub mod trace;

pub use aggregators::{ClosedPolicy, GatedAggregator, HoldAggregator, HoldMode};
pub use async_processor::{AsyncFrameProcessor, AsyncProcessorConfig};
pub use filters::{FilterMode, FrameFilter, NullFilter, TypeFilter};
pub use idle::IdleProcessor;
pub use io::{ReaderProcessor, WriterProcessor};
pub use output::OutputProcessor;
pub use text::TextTransformer;
pub use trace::FrameTraceLogger;
