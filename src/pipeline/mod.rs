pub mod merge;
pub mod parallel;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod sync_parallel;
pub mod task;

pub use merge::MergePipeline;
pub use parallel::ParallelPipeline;
pub use pipeline::{Pipeline, PipelineError};
pub use sync_parallel::SyncParallelPipeline;
pub use task::{PipelineParams, PipelineTask};
