use serde::{Deserialize, Serialize};

use accelbench_core::{AccelError, Result};
use accelbench_device::{DeviceContextConfig, TransferModel};
use accelbench_kernels::TaskKind;

use crate::runner::RunnerConfig;
use crate::scheduler::SchedulerConfig;
use crate::streaming::PipelineOptions;

/// Slowest modelled link accepted, in GB/s (1 MB/s).
pub const MIN_BANDWIDTH_GBPS: f64 = 1e-3;

/// Runtime configuration for a benchmark session.
///
/// Loaded from JSON by the CLI (`--config`), then overridden by flags.
/// Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Workload to run.
    pub task: TaskKind,

    /// Elements per batch. For `n_body` this is the body count. Unset
    /// selects the workload's default.
    pub batch_size: Option<usize>,

    /// Timed iterations. Double-buffered runs need at least 2.
    pub iterations: usize,

    /// Untimed iterations before measurement.
    pub warmup_iterations: usize,

    /// Capacity of each streaming pipeline queue.
    pub channel_capacity: usize,

    /// Pooled device streams. Double buffering takes two.
    pub stream_count: usize,

    /// Device memory budget in bytes.
    pub device_pool_size: usize,

    pub device_ordinal: usize,

    /// Modelled interconnect bandwidth and launch overhead.
    pub transfer: TransferModel,

    /// Workload parameters, passed through to the kernel as-is.
    /// `null` selects the workload's defaults.
    pub kernel_params: serde_json::Value,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            task: TaskKind::Affine,
            batch_size: None,
            iterations: 100,
            warmup_iterations: 5,
            channel_capacity: 4,
            stream_count: 2,
            device_pool_size: 256 * 1024 * 1024, // 256 MB
            device_ordinal: 0,
            transfer: TransferModel::default(),
            kernel_params: serde_json::Value::Null,
        }
    }
}

impl BenchConfig {
    /// Small run with free transfers, for smoke tests and CI.
    pub fn quick() -> Self {
        Self {
            batch_size: Some(4096),
            iterations: 10,
            warmup_iterations: 1,
            transfer: TransferModel::instant(),
            ..Self::default()
        }
    }

    /// Large affine batches over a slow link: copies dominate, so double
    /// buffering has the most to hide.
    pub fn transfer_bound() -> Self {
        Self {
            task: TaskKind::Affine,
            batch_size: Some(1 << 20),
            iterations: 50,
            transfer: TransferModel {
                bandwidth_gbps: Some(4.0),
                launch_overhead_us: 10,
            },
            ..Self::default()
        }
    }

    /// Deep Mandelbrot iterations: kernel time dwarfs the copies.
    pub fn compute_bound() -> Self {
        Self {
            task: TaskKind::Mandelbrot,
            batch_size: Some(1 << 16),
            iterations: 20,
            kernel_params: serde_json::json!({ "max_iterations": 1024, "width": 1024 }),
            ..Self::default()
        }
    }

    /// The configured batch size, or the workload's default.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size
            .unwrap_or_else(|| self.task.default_batch_size())
    }

    /// Reject invalid parameters before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(AccelError::Configuration("batch_size must be > 0".into()));
        }
        if self.iterations == 0 {
            return Err(AccelError::Configuration("iterations must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(AccelError::Configuration(
                "channel_capacity must be > 0".into(),
            ));
        }
        if self.stream_count == 0 {
            return Err(AccelError::Configuration("stream_count must be > 0".into()));
        }
        if self.device_pool_size == 0 {
            return Err(AccelError::Configuration(
                "device_pool_size must be > 0".into(),
            ));
        }
        if let Some(bw) = self.transfer.bandwidth_gbps {
            if !(bw >= MIN_BANDWIDTH_GBPS) {
                return Err(AccelError::Configuration(format!(
                    "transfer bandwidth must be >= {MIN_BANDWIDTH_GBPS} GB/s, got {bw}"
                )));
            }
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            batch_size: self.effective_batch_size(),
            iterations: self.iterations,
            warmup_iterations: self.warmup_iterations,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.effective_batch_size(),
            iterations: self.iterations,
            warmup_iterations: self.warmup_iterations,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.effective_batch_size(),
            channel_capacity: self.channel_capacity,
            kernel_params: self.kernel_params.clone(),
        }
    }

    pub fn device_config(&self) -> DeviceContextConfig {
        DeviceContextConfig {
            device_ordinal: self.device_ordinal,
            pool_size: self.device_pool_size,
            stream_count: self.stream_count,
            transfer: self.transfer,
        }
    }
}
