//! Affine transform `y = scale * x + offset`.
//!
//! The only workload with the double-buffered capability set: its input and
//! output are independent per element, so each slot can be copied in,
//! transformed and copied out without touching the other slot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use accelbench_core::{
    AccelError, Batch, BatchProcessor, ComputeTask, DoubleBufferedTask, ExecutionStream, Result,
    Slot, SlotPair,
};
use accelbench_device::{DeviceBuffer, DeviceContext, HostBuffer, TransferModel};

use crate::data_gen::DataGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffineParams {
    pub scale: f32,
    pub offset: f32,
}

impl Default for AffineParams {
    fn default() -> Self {
        Self {
            scale: 2.0,
            offset: 1.0,
        }
    }
}

fn affine_kernel(params: AffineParams, src: &[f32], dst: &mut [f32]) {
    for (y, &x) in dst.iter_mut().zip(src) {
        *y = params.scale * x + params.offset;
    }
}

/// Host mirror plus device buffers for one slot.
#[derive(Clone)]
struct SlotBuffers {
    host_in: HostBuffer<f32>,
    host_out: HostBuffer<f32>,
    dev_in: DeviceBuffer<f32>,
    dev_out: DeviceBuffer<f32>,
}

impl SlotBuffers {
    /// Reserves device memory first so an oversized batch fails on the
    /// budget before any host data is generated.
    fn allocate(ctx: &DeviceContext, len: usize, gen: &mut DataGenerator) -> Result<Self> {
        let dev_in = ctx.memory_pool.alloc::<f32>(len)?;
        let dev_out = ctx.memory_pool.alloc::<f32>(len)?;
        Ok(Self {
            dev_in,
            dev_out,
            host_in: HostBuffer::from_vec(gen.uniform_f32(len)),
            host_out: HostBuffer::zeroed(len),
        })
    }

    fn copy_in(&self, transfer: &TransferModel) {
        self.dev_in.upload(&self.host_in, transfer);
    }

    fn launch(&self, params: AffineParams, transfer: &TransferModel) -> Result<()> {
        transfer.simulate_launch();
        self.dev_in
            .map_into(&self.dev_out, |src, dst| affine_kernel(params, src, dst))
    }

    fn copy_out(&self, transfer: &TransferModel) {
        self.dev_out.download(&self.host_out, transfer);
    }

    fn verify(&self, params: AffineParams) -> Result<()> {
        let input = self.host_in.to_vec();
        let output = self.host_out.to_vec();
        for (i, (&x, &y)) in input.iter().zip(&output).enumerate() {
            let expected = params.scale * x + params.offset;
            if (y - expected).abs() > 1e-5 * expected.abs().max(1.0) {
                return Err(AccelError::Execution(format!(
                    "affine mismatch at {i}: got {y}, expected {expected}"
                )));
            }
        }
        Ok(())
    }
}

pub struct AffineTask {
    ctx: Arc<DeviceContext>,
    params: AffineParams,
    /// Buffers for the synchronous `execute` and batch paths.
    single: Option<SlotBuffers>,
    slots: Option<SlotPair<SlotBuffers>>,
}

impl AffineTask {
    pub fn new(ctx: Arc<DeviceContext>, params: AffineParams) -> Self {
        Self {
            ctx,
            params,
            single: None,
            slots: None,
        }
    }

    pub fn params(&self) -> AffineParams {
        self.params
    }

    fn slot(&self, slot: Slot) -> Result<SlotBuffers> {
        self.slots
            .as_ref()
            .map(|pair| pair[slot].clone())
            .ok_or_else(|| {
                AccelError::Execution("affine: double-buffered slots are not allocated".into())
            })
    }

    fn single(&self) -> Result<&SlotBuffers> {
        self.single
            .as_ref()
            .ok_or_else(|| AccelError::Execution("affine: setup() was not called".into()))
    }
}

impl ComputeTask for AffineTask {
    fn name(&self) -> &str {
        "affine"
    }

    fn setup(&mut self, capacity_hint: usize) -> Result<()> {
        if capacity_hint == 0 {
            return Err(AccelError::Configuration("affine: batch size must be > 0".into()));
        }
        let mut gen = DataGenerator::default();
        self.single = Some(SlotBuffers::allocate(&self.ctx, capacity_hint, &mut gen)?);
        tracing::debug!(capacity = capacity_hint, "affine buffers allocated");
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        let bufs = self.single()?.clone();
        let params = self.params;
        let transfer = *self.ctx.transfer();
        let stream = self.ctx.default_stream();

        stream.enqueue(Box::new(move || -> Result<()> {
            bufs.copy_in(&transfer);
            bufs.launch(params, &transfer)?;
            bufs.copy_out(&transfer);
            Ok(())
        }))?;
        stream.synchronize()
    }

    fn teardown(&mut self) {
        self.single = None;
        self.slots = None;
    }

    fn verify(&self) -> Result<()> {
        if let Some(single) = &self.single {
            single.verify(self.params)?;
        }
        if let Some(slots) = &self.slots {
            for (_, bufs) in slots.iter() {
                bufs.verify(self.params)?;
            }
        }
        Ok(())
    }
}

impl DoubleBufferedTask for AffineTask {
    fn setup_double_buffered(
        &mut self,
        capacity_hint: usize,
        stream_a: &dyn ExecutionStream,
        stream_b: &dyn ExecutionStream,
    ) -> Result<()> {
        if capacity_hint == 0 {
            return Err(AccelError::Configuration("affine: batch size must be > 0".into()));
        }
        let mut gen = DataGenerator::default();
        let ctx = &self.ctx;
        self.slots = Some(SlotPair::try_from_fn(|_| {
            SlotBuffers::allocate(ctx, capacity_hint, &mut gen)
        })?);
        tracing::debug!(
            capacity = capacity_hint,
            stream_a = stream_a.index(),
            stream_b = stream_b.index(),
            "affine double-buffered slots allocated"
        );
        Ok(())
    }

    fn copy_in(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let bufs = self.slot(slot)?;
        let transfer = *self.ctx.transfer();
        stream.enqueue(Box::new(move || -> Result<()> {
            bufs.copy_in(&transfer);
            Ok(())
        }))
    }

    fn launch(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let bufs = self.slot(slot)?;
        let params = self.params;
        let transfer = *self.ctx.transfer();
        stream.enqueue(Box::new(move || -> Result<()> {
            bufs.launch(params, &transfer)
        }))
    }

    fn copy_out(&mut self, slot: Slot, stream: &dyn ExecutionStream) -> Result<()> {
        let bufs = self.slot(slot)?;
        let transfer = *self.ctx.transfer();
        stream.enqueue(Box::new(move || -> Result<()> {
            bufs.copy_out(&transfer);
            Ok(())
        }))
    }

    fn host_output(&self, slot: Slot) -> Vec<f32> {
        self.slots
            .as_ref()
            .map(|pair| pair[slot].host_out.to_vec())
            .unwrap_or_default()
    }
}

impl BatchProcessor for AffineTask {
    fn name(&self) -> &str {
        "affine"
    }

    fn prepare(&mut self, batch_size: usize) -> Result<()> {
        self.setup(batch_size)
    }

    fn process(&mut self, batch: &mut Batch) -> Result<()> {
        let bufs = self.single()?;
        let transfer = self.ctx.transfer();
        let len = batch.length;
        if len > bufs.dev_in.len() {
            return Err(AccelError::Execution(format!(
                "affine: batch of {len} exceeds device capacity {}",
                bufs.dev_in.len()
            )));
        }

        bufs.dev_in.upload_slice(batch.input());
        transfer.simulate_transfer(len * std::mem::size_of::<f32>());

        transfer.simulate_launch();
        let params = self.params;
        bufs.dev_in.map_into(&bufs.dev_out, |src, dst| {
            affine_kernel(params, &src[..len], &mut dst[..len])
        })?;

        let (_, output) = batch.io_mut();
        bufs.dev_out.download_slice(output);
        transfer.simulate_transfer(len * std::mem::size_of::<f32>());
        Ok(())
    }

    fn finish(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accelbench_device::{DeviceContextConfig, TransferModel};

    fn ctx() -> Arc<DeviceContext> {
        Arc::new(
            DeviceContext::new(DeviceContextConfig {
                pool_size: 1 << 20,
                stream_count: 2,
                transfer: TransferModel::instant(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn execute_then_verify() {
        let ctx = ctx();
        let mut task = AffineTask::new(ctx.clone(), AffineParams::default());
        task.setup(128).unwrap();
        task.execute().unwrap();
        task.verify().unwrap();
        task.teardown();
        task.teardown();
        assert_eq!(ctx.memory_pool.in_use(), 0);
    }

    #[test]
    fn execute_without_setup_fails() {
        let mut task = AffineTask::new(ctx(), AffineParams::default());
        assert!(task.execute().unwrap_err().is_execution_failure());
    }

    #[test]
    fn slots_have_independent_buffers() {
        let ctx = ctx();
        let (a, b) = ctx.stream_pool.acquire_pair().unwrap();
        let mut task = AffineTask::new(ctx.clone(), AffineParams { scale: 3.0, offset: 0.0 });
        task.setup_double_buffered(16, &*a, &*b).unwrap();

        task.copy_in(Slot::One, &*b).unwrap();
        task.launch(Slot::One, &*b).unwrap();
        task.copy_out(Slot::One, &*b).unwrap();
        b.synchronize().unwrap();

        assert!(task.host_output(Slot::Zero).iter().all(|&v| v == 0.0));
        assert!(task.host_output(Slot::One).iter().any(|&v| v != 0.0));
        task.teardown();
        assert!(task.host_output(Slot::One).is_empty());
    }

    #[test]
    fn processes_a_batch_prefix() {
        let mut task = AffineTask::new(ctx(), AffineParams { scale: 2.0, offset: 1.0 });
        task.prepare(8).unwrap();
        let mut batch = Batch::with_capacity(8);
        batch.input[..3].copy_from_slice(&[0.0, 1.0, 2.0]);
        batch.length = 3;
        task.process(&mut batch).unwrap();
        assert_eq!(batch.output(), &[1.0, 3.0, 5.0]);
        assert_eq!(batch.output[3], 0.0);
    }

    #[test]
    fn out_of_memory_surfaces_as_setup_failure() {
        let mut task = AffineTask::new(ctx(), AffineParams::default());
        let err = task.setup(1 << 20).unwrap_err();
        assert!(err.is_setup_failure());
    }

    #[test]
    fn huge_batch_fails_on_the_budget() {
        let ctx = ctx();
        let mut task = AffineTask::new(ctx.clone(), AffineParams::default());
        let err = task.setup(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, AccelError::DeviceOutOfMemory { .. }));

        let (a, b) = ctx.stream_pool.acquire_pair().unwrap();
        let err = task
            .setup_double_buffered(usize::MAX / 2, &*a, &*b)
            .unwrap_err();
        assert!(err.is_setup_failure());
        assert_eq!(ctx.memory_pool.in_use(), 0);
    }
}
