use std::sync::Arc;
use std::time::Duration;

use accelbench_core::{
    AccelError, BenchmarkResult, DoubleBufferedResult, ObserverSet, ProgressObserver, Result,
};
use accelbench_device::DeviceContext;
use accelbench_kernels::KernelTask;

use crate::config::BenchConfig;
use crate::runner::BenchmarkRunner;
use crate::scheduler::DoubleBufferedScheduler;
use crate::streaming::{PipelineReport, StreamingPipeline, SyntheticSource};

/// A configured device plus the selected workload, ready to benchmark.
pub struct BenchSession {
    config: BenchConfig,
    ctx: Arc<DeviceContext>,
    task: KernelTask,
    observers: ObserverSet,
}

impl BenchSession {
    /// Validate `config`, bring up the device and build the workload.
    pub fn build(config: BenchConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(task = %config.task, "building benchmark session");

        let ctx = Arc::new(DeviceContext::new(config.device_config())?);
        let task = KernelTask::build(config.task, ctx.clone(), &config.kernel_params)?;

        Ok(Self {
            config,
            ctx,
            task,
            observers: ObserverSet::new(),
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn subscribe(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn run_simple(&mut self) -> Result<BenchmarkResult> {
        BenchmarkRunner::new(self.ctx.descriptor(), self.config.runner_config())
            .with_observers(self.observers.clone())
            .run(&mut self.task)
    }

    pub fn run_double_buffered(&mut self) -> Result<DoubleBufferedResult> {
        let kind = self.task.kind();
        let task = self.task.as_double_buffered_mut().ok_or_else(|| {
            AccelError::Configuration(format!("{kind} does not support double buffering"))
        })?;
        DoubleBufferedScheduler::new(self.ctx.clone(), self.config.scheduler_config())
            .with_observers(self.observers.clone())
            .run(task)
    }

    /// Stream synthetic batches for `duration`, then stop and drain.
    pub async fn run_streaming(&mut self, duration: Duration) -> Result<PipelineReport> {
        let mut pipeline = self.start_pipeline(SyntheticSource::unbounded())?;
        tokio::time::sleep(duration).await;
        pipeline.stop().await
    }

    /// Stream exactly `batches` synthetic batches and wait for them to drain.
    pub async fn run_streaming_batches(&mut self, batches: u64) -> Result<PipelineReport> {
        let mut pipeline = self.start_pipeline(SyntheticSource::with_limit(batches))?;
        pipeline.wait().await
    }

    fn start_pipeline(&self, source: SyntheticSource) -> Result<StreamingPipeline> {
        // The compute stage owns its processor, so it gets a fresh instance
        // on the shared device.
        let processor =
            KernelTask::build(self.config.task, self.ctx.clone(), &self.config.kernel_params)?
                .into_processor()?;

        let mut pipeline = StreamingPipeline::new(self.config.pipeline_options())?;
        for observer in self.observers.iter() {
            pipeline.subscribe(observer.clone());
        }
        pipeline.start(source, processor)?;
        Ok(pipeline)
    }
}
