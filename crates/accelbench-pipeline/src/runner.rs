use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use accelbench_core::stats::{self, duration_ms};
use accelbench_core::{
    AccelError, BenchEvent, BenchmarkResult, ComputeTask, DeviceDescriptor, LogLevel,
    ObserverSet, Phase, ProgressObserver, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub batch_size: usize,
    pub iterations: usize,
    pub warmup_iterations: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1 << 16,
            iterations: 100,
            warmup_iterations: 5,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AccelError::Configuration("batch_size must be > 0".into()));
        }
        if self.iterations == 0 {
            return Err(AccelError::Configuration("iterations must be > 0".into()));
        }
        Ok(())
    }
}

/// Simple path: warmup, then back-to-back synchronous `execute()` calls.
pub struct BenchmarkRunner {
    device: DeviceDescriptor,
    config: RunnerConfig,
    observers: ObserverSet,
}

impl BenchmarkRunner {
    pub fn new(device: DeviceDescriptor, config: RunnerConfig) -> Self {
        Self {
            device,
            config,
            observers: ObserverSet::new(),
        }
    }

    pub fn with_observers(mut self, observers: ObserverSet) -> Self {
        self.observers = observers;
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn run(&self, task: &mut dyn ComputeTask) -> Result<BenchmarkResult> {
        self.config.validate()?;
        let batch_size = self.config.batch_size;

        tracing::info!(
            task = task.name(),
            batch_size,
            iterations = self.config.iterations,
            warmup = self.config.warmup_iterations,
            "benchmark starting"
        );

        if let Err(e) = task.setup(batch_size) {
            tracing::error!(task = task.name(), error = %e, "setup failed");
            task.teardown();
            return Err(e.into_setup());
        }

        let measured = self.measure(task);
        if measured.is_ok() {
            if let Err(e) = task.verify() {
                tracing::warn!(task = task.name(), error = %e, "output verification failed");
                self.observers
                    .log(LogLevel::Warn, format!("{} verification failed: {e}", task.name()));
            }
        }
        task.teardown();
        let samples = measured?;

        let result = BenchmarkResult::from_samples(task.name(), &self.device, batch_size, &samples)?;
        tracing::info!(
            task = task.name(),
            avg_latency_ms = result.avg_latency_ms,
            p95_latency_ms = result.p95_latency_ms,
            throughput = result.throughput_elements_per_sec,
            "benchmark complete"
        );
        Ok(result)
    }

    fn measure(&self, task: &mut dyn ComputeTask) -> Result<Vec<f64>> {
        let warmup = self.config.warmup_iterations;
        if warmup > 0 {
            self.observers.emit(&BenchEvent::PhaseStarted {
                task: task.name().to_string(),
                phase: Phase::Warmup,
                iterations: warmup,
            });
            for _ in 0..warmup {
                task.execute()?;
            }
        }

        let n = self.config.iterations;
        self.observers.emit(&BenchEvent::PhaseStarted {
            task: task.name().to_string(),
            phase: Phase::Timed,
            iterations: n,
        });
        let mut samples = Vec::with_capacity(n);
        for index in 0..n {
            let start = Instant::now();
            task.execute()?;
            let latency_ms = duration_ms(start.elapsed());

            samples.push(latency_ms);
            metrics::histogram!("accelbench_iteration_latency_ms").record(latency_ms);
            self.observers.emit(&BenchEvent::IterationCompleted {
                phase: Phase::Timed,
                index,
                latency_ms,
            });
        }

        self.observers.emit(&BenchEvent::PhaseCompleted {
            phase: Phase::Timed,
            avg_latency_ms: stats::average(&samples)?,
        });
        Ok(samples)
    }
}
