use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use accelbench_core::stats::{self, duration_ms};
use accelbench_core::{
    AccelError, BenchEvent, BenchmarkResult, DoubleBufferedResult, DoubleBufferedTask,
    ExecutionStream, LogLevel, ObserverSet, Phase, ProgressObserver, Result, Slot,
};
use accelbench_device::DeviceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// Timed iterations per phase. At least 2: one priming pass plus one
    /// steady-state pass.
    pub iterations: usize,
    pub warmup_iterations: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1 << 16,
            iterations: 100,
            warmup_iterations: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AccelError::Configuration("batch_size must be > 0".into()));
        }
        if self.iterations < 2 {
            return Err(AccelError::Configuration(format!(
                "double-buffered runs need at least 2 iterations, got {}",
                self.iterations
            )));
        }
        Ok(())
    }
}

struct PhaseSamples {
    single_ms: Vec<f64>,
    double_ms: Vec<f64>,
}

/// Measures how much of a workload's transfer time two alternating slots on
/// two streams can hide.
///
/// Phase 1 runs every iteration fully serialized on stream A and gives the
/// baseline. Phase 2 primes slot 0 on stream A, then on iteration `i`
/// issues slot `(i + 1) % 2` on its own stream before waiting on slot
/// `i % 2`, so one slot's copies overlap the other slot's kernel.
pub struct DoubleBufferedScheduler {
    ctx: Arc<DeviceContext>,
    config: SchedulerConfig,
    observers: ObserverSet,
}

impl DoubleBufferedScheduler {
    pub fn new(ctx: Arc<DeviceContext>, config: SchedulerConfig) -> Self {
        Self {
            ctx,
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

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run both phases and derive speedup and overlap.
    ///
    /// `task.teardown()` is called exactly once whenever setup was attempted,
    /// after both streams have been synchronized.
    pub fn run(&self, task: &mut dyn DoubleBufferedTask) -> Result<DoubleBufferedResult> {
        self.config.validate()?;
        let batch_size = self.config.batch_size;

        let (stream_a, stream_b) = self.ctx.stream_pool.acquire_pair()?;
        let streams: [&dyn ExecutionStream; 2] = [&*stream_a, &*stream_b];

        tracing::info!(
            task = task.name(),
            batch_size,
            iterations = self.config.iterations,
            stream_a = streams[0].index(),
            stream_b = streams[1].index(),
            "double-buffered run starting"
        );

        if let Err(e) = task.setup_double_buffered(batch_size, streams[0], streams[1]) {
            tracing::error!(task = task.name(), error = %e, "double-buffered setup failed");
            task.teardown();
            return Err(e.into_setup());
        }

        let measured = self.measure(task, streams);

        // Buffers may still be in use by queued work.
        let drained = streams[0].synchronize().and(streams[1].synchronize());
        if measured.is_ok() {
            if let Err(e) = task.verify() {
                tracing::warn!(task = task.name(), error = %e, "output verification failed");
                self.observers
                    .log(LogLevel::Warn, format!("{} verification failed: {e}", task.name()));
            }
        }
        task.teardown();

        let samples = measured?;
        drained?;

        let overlapped = BenchmarkResult::from_samples(
            task.name(),
            &self.ctx.descriptor(),
            batch_size,
            &samples.double_ms,
        )?;
        let result = DoubleBufferedResult::new(overlapped, &samples.single_ms)?;

        metrics::histogram!("accelbench_speedup_factor").record(result.speedup_factor);
        tracing::info!(
            task = task.name(),
            single_buffer_avg_ms = result.single_buffer_avg_ms,
            avg_latency_ms = result.result.avg_latency_ms,
            speedup = result.speedup_factor,
            overlap_pct = result.overlap_percentage,
            "double-buffered run complete"
        );
        Ok(result)
    }

    fn measure(
        &self,
        task: &mut dyn DoubleBufferedTask,
        streams: [&dyn ExecutionStream; 2],
    ) -> Result<PhaseSamples> {
        let n = self.config.iterations;
        let stream_a = streams[0];

        if self.config.warmup_iterations > 0 {
            self.phase_started(task, Phase::Warmup, self.config.warmup_iterations);
            for _ in 0..self.config.warmup_iterations {
                serial_pass(task, Slot::Zero, stream_a)?;
            }
        }

        self.phase_started(task, Phase::SingleBuffered, n);
        let mut single_ms = Vec::with_capacity(n);
        for i in 0..n {
            let start = Instant::now();
            serial_pass(task, Slot::Zero, stream_a)?;
            self.record(Phase::SingleBuffered, i, duration_ms(start.elapsed()), &mut single_ms);
        }
        self.phase_completed(Phase::SingleBuffered, &single_ms)?;

        self.phase_started(task, Phase::DoubleBuffered, n);
        let mut double_ms = Vec::with_capacity(n);
        issue(task, Slot::Zero, stream_a)?;
        for i in 0..n {
            let current = Slot::for_iteration(i);
            let next = current.flip();
            let start = Instant::now();

            if i + 1 < n {
                issue(task, next, streams[next.index()])?;
            }
            streams[current.index()].synchronize()?;

            self.record(Phase::DoubleBuffered, i, duration_ms(start.elapsed()), &mut double_ms);
        }
        self.phase_completed(Phase::DoubleBuffered, &double_ms)?;

        Ok(PhaseSamples {
            single_ms,
            double_ms,
        })
    }

    fn phase_started(&self, task: &dyn DoubleBufferedTask, phase: Phase, iterations: usize) {
        tracing::debug!(task = task.name(), %phase, iterations, "phase started");
        self.observers.emit(&BenchEvent::PhaseStarted {
            task: task.name().to_string(),
            phase,
            iterations,
        });
    }

    fn record(&self, phase: Phase, index: usize, latency_ms: f64, samples: &mut Vec<f64>) {
        samples.push(latency_ms);
        self.observers.emit(&BenchEvent::IterationCompleted {
            phase,
            index,
            latency_ms,
        });
    }

    fn phase_completed(&self, phase: Phase, samples: &[f64]) -> Result<()> {
        let avg_latency_ms = stats::average(samples)?;
        self.observers.emit(&BenchEvent::PhaseCompleted {
            phase,
            avg_latency_ms,
        });
        Ok(())
    }
}

/// Queue copy-in, launch and copy-out for `slot` without waiting.
fn issue(
    task: &mut dyn DoubleBufferedTask,
    slot: Slot,
    stream: &dyn ExecutionStream,
) -> Result<()> {
    task.copy_in(slot, stream)?;
    task.launch(slot, stream)?;
    task.copy_out(slot, stream)
}

/// Fully serialized pass: every step is waited on before the next is issued.
fn serial_pass(
    task: &mut dyn DoubleBufferedTask,
    slot: Slot,
    stream: &dyn ExecutionStream,
) -> Result<()> {
    task.copy_in(slot, stream)?;
    stream.synchronize()?;
    task.launch(slot, stream)?;
    stream.synchronize()?;
    task.copy_out(slot, stream)?;
    stream.synchronize()
}
