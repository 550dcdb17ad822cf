pub mod error;
pub mod observer;
pub mod slot;
pub mod stats;
pub mod traits;
pub mod types;

pub use error::{AccelError, Result};
pub use observer::{
    BatchObservation, BenchEvent, LogLevel, ObserverSet, Phase, ProgressObserver, TracingObserver,
};
pub use slot::{PingPong, Slot, SlotPair};
pub use stats::LatencySummary;
pub use traits::{BatchProcessor, ComputeTask, DoubleBufferedTask, ExecutionStream, StreamOp};
pub use types::*;
