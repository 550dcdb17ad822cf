use crate::error::Result;
use crate::slot::Slot;
use crate::types::Batch;

/// Deferred device operation queued on an [`ExecutionStream`].
pub type StreamOp = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// An ordered queue of asynchronous device operations.
///
/// Operations on one stream run in issue order; operations on different
/// streams are unordered relative to each other.
pub trait ExecutionStream: Send + Sync {
    /// Stream ordinal, for tracing.
    fn index(&self) -> usize;

    /// Queue `op` behind everything already issued. Returns immediately.
    fn enqueue(&self, op: StreamOp) -> Result<()>;

    /// Block until every previously enqueued operation has completed.
    ///
    /// Returns the first operation error raised since the last call.
    fn synchronize(&self) -> Result<()>;
}

/// A benchmarkable workload that owns its device resources.
pub trait ComputeTask: Send {
    /// Human-readable name for tracing and results.
    fn name(&self) -> &str;

    /// Allocate device resources for batches of up to `capacity_hint` elements.
    fn setup(&mut self, capacity_hint: usize) -> Result<()>;

    /// Run one batch to completion; blocks until the device work is observed done.
    fn execute(&mut self) -> Result<()>;

    /// Release device resources. Safe to call when nothing is allocated.
    fn teardown(&mut self);

    /// Check the last output against a reference.
    fn verify(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability set for workloads that can split a run into copy-in, launch
/// and copy-out on caller-supplied streams.
///
/// `copy_in`, `launch` and `copy_out` only enqueue work; completion is
/// guaranteed after the stream is synchronized. Each slot has its own
/// device and host buffers, so work on one slot never touches the other.
pub trait DoubleBufferedTask: ComputeTask {
    fn setup_double_buffered(
        &mut self,
        capacity_hint: usize,
        stream_a: &dyn ExecutionStream,
        stream_b: &dyn ExecutionStream,
    ) -> Result<()>;

    fn copy_in(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()>;

    fn launch(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()>;

    fn copy_out(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()>;

    /// Snapshot of the slot's host-side output mirror.
    fn host_output(&self, slot: Slot) -> Vec<f32>;
}

/// Per-batch compute function used by the streaming pipeline.
pub trait BatchProcessor: Send {
    fn name(&self) -> &str;

    /// Called once before the pipeline starts.
    fn prepare(&mut self, _batch_size: usize) -> Result<()> {
        Ok(())
    }

    /// Fill `batch.output[..batch.length]` from `batch.input[..batch.length]`.
    fn process(&mut self, batch: &mut Batch) -> Result<()>;

    /// Called once after the compute stage exits.
    fn finish(&mut self) {}
}

impl<P: BatchProcessor + ?Sized> BatchProcessor for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn prepare(&mut self, batch_size: usize) -> Result<()> {
        (**self).prepare(batch_size)
    }

    fn process(&mut self, batch: &mut Batch) -> Result<()> {
        (**self).process(batch)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}
