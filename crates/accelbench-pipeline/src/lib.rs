pub mod config;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod streaming;

pub use config::BenchConfig;
pub use runner::{BenchmarkRunner, RunnerConfig};
pub use scheduler::{DoubleBufferedScheduler, SchedulerConfig};
pub use session::BenchSession;
pub use streaming::{
    BatchSource, FnProcessor, PipelineCounters, PipelineOptions, PipelineReport, PipelineState,
    StreamingPipeline, SyntheticSource,
};
