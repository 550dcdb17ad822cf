//! Escape-time Mandelbrot over a fixed viewport.
//!
//! Each input element is a linear pixel index into a `width`-wide image
//! covering x in [-2.0, 1.0], y in [-1.2, 1.2]; the output is the number of
//! iterations before the orbit escapes, capped at `max_iterations`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use accelbench_core::{AccelError, Batch, BatchProcessor, ComputeTask, ExecutionStream, Result};
use accelbench_device::{DeviceBuffer, DeviceContext, HostBuffer};

const X_MIN: f32 = -2.0;
const X_SPAN: f32 = 3.0;
const Y_MIN: f32 = -1.2;
const Y_SPAN: f32 = 2.4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MandelbrotParams {
    pub max_iterations: u32,
    pub width: usize,
}

impl Default for MandelbrotParams {
    fn default() -> Self {
        Self {
            max_iterations: 256,
            width: 1024,
        }
    }
}

impl MandelbrotParams {
    /// Image height keeping square pixels over the viewport.
    pub fn height(&self) -> usize {
        ((self.width as f32 * Y_SPAN / X_SPAN) as usize).max(1)
    }

    /// Escape count for the pixel at linear index `pixel`.
    ///
    /// Indices past the last row wrap back to the top of the image.
    pub fn escape_count(&self, pixel: usize) -> u32 {
        let width = self.width.max(1);
        let px = pixel % width;
        let py = (pixel / width) % self.height();
        let cx = X_MIN + X_SPAN * px as f32 / width as f32;
        let cy = Y_MIN + Y_SPAN * py as f32 / self.height() as f32;

        let (mut zx, mut zy) = (0.0f32, 0.0f32);
        let mut n = 0;
        while n < self.max_iterations && zx * zx + zy * zy <= 4.0 {
            let t = zx * zx - zy * zy + cx;
            zy = 2.0 * zx * zy + cy;
            zx = t;
            n += 1;
        }
        n
    }
}

fn mandelbrot_kernel(params: MandelbrotParams, src: &[f32], dst: &mut [f32]) {
    for (out, &pixel) in dst.iter_mut().zip(src) {
        *out = params.escape_count(pixel.max(0.0) as usize) as f32;
    }
}

struct Buffers {
    host_in: HostBuffer<f32>,
    host_out: HostBuffer<f32>,
    dev_in: DeviceBuffer<f32>,
    dev_out: DeviceBuffer<f32>,
}

pub struct MandelbrotTask {
    ctx: Arc<DeviceContext>,
    params: MandelbrotParams,
    buffers: Option<Buffers>,
}

impl MandelbrotTask {
    pub fn new(ctx: Arc<DeviceContext>, params: MandelbrotParams) -> Result<Self> {
        if params.width == 0 || params.max_iterations == 0 {
            return Err(AccelError::Configuration(
                "mandelbrot: width and max_iterations must be > 0".into(),
            ));
        }
        Ok(Self {
            ctx,
            params,
            buffers: None,
        })
    }

    pub fn params(&self) -> MandelbrotParams {
        self.params
    }

    fn buffers(&self) -> Result<&Buffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| AccelError::Execution("mandelbrot: setup() was not called".into()))
    }
}

impl ComputeTask for MandelbrotTask {
    fn name(&self) -> &str {
        "mandelbrot"
    }

    fn setup(&mut self, capacity_hint: usize) -> Result<()> {
        if capacity_hint == 0 {
            return Err(AccelError::Configuration(
                "mandelbrot: batch size must be > 0".into(),
            ));
        }
        let dev_in = self.ctx.memory_pool.alloc::<f32>(capacity_hint)?;
        let dev_out = self.ctx.memory_pool.alloc::<f32>(capacity_hint)?;
        let pixels: Vec<f32> = (0..capacity_hint).map(|i| i as f32).collect();
        self.buffers = Some(Buffers {
            dev_in,
            dev_out,
            host_in: HostBuffer::from_vec(pixels),
            host_out: HostBuffer::zeroed(capacity_hint),
        });
        tracing::debug!(
            capacity = capacity_hint,
            width = self.params.width,
            max_iterations = self.params.max_iterations,
            "mandelbrot buffers allocated"
        );
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        let bufs = self.buffers()?;
        let (host_in, host_out) = (bufs.host_in.clone(), bufs.host_out.clone());
        let (dev_in, dev_out) = (bufs.dev_in.clone(), bufs.dev_out.clone());
        let params = self.params;
        let transfer = *self.ctx.transfer();
        let stream = self.ctx.default_stream();

        stream.enqueue(Box::new(move || -> Result<()> {
            dev_in.upload(&host_in, &transfer);
            transfer.simulate_launch();
            dev_in.map_into(&dev_out, |src, dst| mandelbrot_kernel(params, src, dst))?;
            dev_out.download(&host_out, &transfer);
            Ok(())
        }))?;
        stream.synchronize()
    }

    fn teardown(&mut self) {
        self.buffers = None;
    }

    fn verify(&self) -> Result<()> {
        let Some(bufs) = &self.buffers else {
            return Ok(());
        };
        let input = bufs.host_in.to_vec();
        let output = bufs.host_out.to_vec();
        for (&pixel, &count) in input.iter().zip(&output) {
            let expected = self.params.escape_count(pixel as usize) as f32;
            if count != expected {
                return Err(AccelError::Execution(format!(
                    "mandelbrot mismatch at pixel {pixel}: got {count}, expected {expected}"
                )));
            }
        }
        Ok(())
    }
}

impl BatchProcessor for MandelbrotTask {
    fn name(&self) -> &str {
        "mandelbrot"
    }

    fn prepare(&mut self, batch_size: usize) -> Result<()> {
        self.setup(batch_size)
    }

    fn process(&mut self, batch: &mut Batch) -> Result<()> {
        let bufs = self.buffers()?;
        let transfer = self.ctx.transfer();
        let len = batch.length;
        if len > bufs.dev_in.len() {
            return Err(AccelError::Execution(format!(
                "mandelbrot: batch of {len} exceeds device capacity {}",
                bufs.dev_in.len()
            )));
        }
        let bytes = len * std::mem::size_of::<f32>();

        bufs.dev_in.upload_slice(batch.input());
        transfer.simulate_transfer(bytes);
        transfer.simulate_launch();
        let params = self.params;
        bufs.dev_in.map_into(&bufs.dev_out, |src, dst| {
            mandelbrot_kernel(params, &src[..len], &mut dst[..len])
        })?;
        let (_, output) = batch.io_mut();
        bufs.dev_out.download_slice(output);
        transfer.simulate_transfer(bytes);
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
                stream_count: 1,
                transfer: TransferModel::instant(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn origin_never_escapes_and_far_points_do() {
        let params = MandelbrotParams {
            max_iterations: 64,
            width: 30,
        };
        // Pixel (20, 12) maps to c = (0.0, 0.0).
        assert_eq!(params.height(), 24);
        assert_eq!(params.escape_count(12 * 30 + 20), 64);
        // Top-left corner c = (-2.0, -1.2) escapes almost immediately.
        assert!(params.escape_count(0) < 4);
    }

    #[test]
    fn execute_matches_reference() {
        let mut task = MandelbrotTask::new(ctx(), MandelbrotParams::default()).unwrap();
        task.setup(2048).unwrap();
        task.execute().unwrap();
        task.verify().unwrap();
        task.teardown();
    }

    #[test]
    fn batch_output_is_escape_counts() {
        let params = MandelbrotParams {
            max_iterations: 32,
            width: 16,
        };
        let mut task = MandelbrotTask::new(ctx(), params).unwrap();
        task.prepare(4).unwrap();
        let mut batch = Batch::with_capacity(4);
        batch.input[..2].copy_from_slice(&[0.0, 100.0]);
        batch.length = 2;
        task.process(&mut batch).unwrap();
        assert_eq!(batch.output()[0], params.escape_count(0) as f32);
        assert_eq!(batch.output()[1], params.escape_count(100) as f32);
        task.finish();
    }

    #[test]
    fn huge_batch_fails_on_the_budget() {
        let mut task = MandelbrotTask::new(ctx(), MandelbrotParams::default()).unwrap();
        let err = task.setup(usize::MAX / 2).unwrap_err();
        assert!(matches!(err, AccelError::DeviceOutOfMemory { .. }));
    }

    #[test]
    fn zero_width_rejected() {
        let params = MandelbrotParams {
            max_iterations: 10,
            width: 0,
        };
        assert!(MandelbrotTask::new(ctx(), params)
            .err()
            .unwrap()
            .is_configuration_error());
    }
}
