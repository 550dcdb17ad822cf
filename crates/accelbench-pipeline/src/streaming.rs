//! Bounded streaming pipeline: producer -> compute -> consumer.
//!
//! ```text
//! ┌──────────┐ to_compute ┌────────────┐ from_compute ┌──────────┐
//! │ Producer │───────────►│  Compute   │─────────────►│ Consumer │
//! │ (async)  │            │ (blocking) │              │ (async)  │
//! └──────────┘            └────────────┘              └──────────┘
//!      ▲                                                   │
//!      └─────────────── recycled batches ──────────────────┘
//! ```
//!
//! # Backpressure
//!
//! Both queues are bounded `tokio::sync::mpsc` channels. The producer
//! reserves a slot in `to_compute` before it builds a batch, so a slow
//! compute stage parks the producer with at most `channel_capacity` batches
//! queued and nothing half-built.
//!
//! # Shutdown
//!
//! Two tokens: `abort` (root) and `stop` (child of `abort`, watched only by
//! the producer).
//!
//! 1. `stop()` cancels `stop`. The producer exits and drops its sender, which
//!    closes `to_compute`. Compute drains what is queued, then drops its
//!    sender, closing `from_compute`. The consumer drains and exits.
//! 2. A finite source ends the same cascade from the producer side.
//! 3. A stage error cancels `abort`. Every stage observes it at its next
//!    suspension point or loop head and exits without draining; the error
//!    is returned from `stop()`/`wait()`.
//!
//! Queues are only ever closed by their single writer dropping its sender,
//! so a write-after-close cannot happen.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use accelbench_core::{
    stats, AccelError, Batch, BatchObservation, BatchProcessor, BenchEvent, LatencySummary,
    LogLevel, ObserverSet, Phase, ProgressObserver, Result,
};

/// Fixed once the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Elements per batch.
    pub batch_size: usize,
    /// Capacity of each of the two queues.
    pub channel_capacity: usize,
    /// Opaque workload parameters.
    pub kernel_params: serde_json::Value,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            channel_capacity: 4,
            kernel_params: serde_json::Value::Null,
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AccelError::Configuration("batch_size must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(AccelError::Configuration(
                "channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Input side of the pipeline.
pub trait BatchSource: Send + 'static {
    /// Write the next batch into `input` and return how many elements are
    /// valid, or `None` at end of stream.
    fn fill(&mut self, input: &mut [f32]) -> Result<Option<usize>>;
}

impl<F> BatchSource for F
where
    F: FnMut(&mut [f32]) -> Result<Option<usize>> + Send + 'static,
{
    fn fill(&mut self, input: &mut [f32]) -> Result<Option<usize>> {
        self(input)
    }
}

const RAMP_PERIOD: u64 = 1 << 16;

/// Deterministic ramp `0, 1, 2, ...` wrapping at 65536, continuing across
/// batches.
#[derive(Debug, Clone, Default)]
pub struct SyntheticSource {
    cursor: u64,
    remaining: Option<u64>,
}

impl SyntheticSource {
    /// Never ends; the pipeline runs until `stop()`.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Ends after `batches` full batches.
    pub fn with_limit(batches: u64) -> Self {
        Self {
            cursor: 0,
            remaining: Some(batches),
        }
    }
}

impl BatchSource for SyntheticSource {
    fn fill(&mut self, input: &mut [f32]) -> Result<Option<usize>> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        for (i, v) in input.iter_mut().enumerate() {
            *v = ((self.cursor + i as u64) % RAMP_PERIOD) as f32;
        }
        self.cursor += input.len() as u64;
        Ok(Some(input.len()))
    }
}

/// Adapts a closure into a [`BatchProcessor`].
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: FnMut(&mut Batch) -> Result<()> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> BatchProcessor for FnProcessor<F>
where
    F: FnMut(&mut Batch) -> Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, batch: &mut Batch) -> Result<()> {
        (self.f)(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Stopped,
    Running,
    Draining,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Per-stage batch counts for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    /// Batches handed to `to_compute`.
    pub produced: u64,
    /// Batches the compute stage finished processing.
    pub computed: u64,
    /// Batches the consumer observed.
    pub consumed: u64,
}

#[derive(Default)]
struct StageCounters {
    produced: AtomicU64,
    computed: AtomicU64,
    consumed: AtomicU64,
}

impl StageCounters {
    fn reset(&self) {
        self.produced.store(0, Ordering::Relaxed);
        self.computed.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            produced: self.produced.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Summary of one pipeline run, from `start` to shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub batches: u64,
    pub elements: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Sum of every consumed batch's checksum.
    pub checksum: f64,
    pub elapsed_ms: f64,
    /// Producer stamp to consumer receipt.
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub throughput_elements_per_sec: f64,
}

#[derive(Default)]
struct ConsumerTally {
    batches: u64,
    elements: u64,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    checksum: f64,
    latencies_ms: Vec<f64>,
}

impl ConsumerTally {
    fn record(&mut self, obs: &BatchObservation) {
        self.batches += 1;
        self.elements += obs.length as u64;
        if self.first_sequence.is_none() {
            self.first_sequence = Some(obs.sequence);
        }
        self.last_sequence = Some(obs.sequence);
        self.checksum += obs.checksum;
        self.latencies_ms.push(obs.latency_ms);
    }

    fn into_report(self, elapsed_ms: f64) -> PipelineReport {
        let (avg_latency_ms, p95_latency_ms) = LatencySummary::from_samples(&self.latencies_ms)
            .map(|s| (s.avg_ms, s.p95_ms))
            .unwrap_or((0.0, 0.0));
        let throughput_elements_per_sec = if elapsed_ms > 0.0 {
            self.elements as f64 * 1000.0 / elapsed_ms
        } else {
            0.0
        };
        PipelineReport {
            batches: self.batches,
            elements: self.elements,
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
            checksum: self.checksum,
            elapsed_ms,
            avg_latency_ms,
            p95_latency_ms,
            throughput_elements_per_sec,
        }
    }
}

enum StageExit {
    Producer,
    Compute,
    Consumer(ConsumerTally),
}

struct RunHandle {
    tasks: JoinSet<Result<StageExit>>,
    abort: CancellationToken,
    stop: CancellationToken,
    started: Instant,
    processor_name: String,
}

/// Three-stage streaming pipeline with bounded queues and staged shutdown.
///
/// Lifecycle: `Stopped -> Running -> Draining -> Stopped`. A stopped
/// pipeline can be started again; sequence numbers keep counting from where
/// the previous run left off.
pub struct StreamingPipeline {
    options: PipelineOptions,
    state: PipelineState,
    sequence: Arc<AtomicU64>,
    counters: Arc<StageCounters>,
    recycler: Arc<Mutex<Vec<Batch>>>,
    observers: ObserverSet,
    run: Option<RunHandle>,
}

impl StreamingPipeline {
    /// Rejects invalid options before anything is allocated.
    pub fn new(options: PipelineOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: PipelineState::Stopped,
            sequence: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(StageCounters::default()),
            recycler: Arc::new(Mutex::new(Vec::new())),
            observers: ObserverSet::new(),
            run: None,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn counters(&self) -> PipelineCounters {
        self.counters.snapshot()
    }

    /// Register a listener for `BatchCompleted` and lifecycle events.
    /// Takes effect from the next `start`.
    pub fn subscribe(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.subscribe(observer);
    }

    /// Launch the three stages on the current tokio runtime.
    ///
    /// `processor.prepare` runs here, synchronously; its failure is a setup
    /// failure and leaves the pipeline stopped.
    pub fn start<S, P>(&mut self, source: S, mut processor: P) -> Result<()>
    where
        S: BatchSource,
        P: BatchProcessor + 'static,
    {
        if self.state != PipelineState::Stopped {
            return Err(AccelError::Pipeline(format!(
                "cannot start: pipeline is {}",
                self.state
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AccelError::Pipeline("start() must be called within a tokio runtime".into())
        })?;

        let batch_size = self.options.batch_size;
        let capacity = self.options.channel_capacity;
        processor
            .prepare(batch_size)
            .map_err(AccelError::into_setup)?;
        let processor_name = processor.name().to_string();

        self.counters.reset();
        let (to_compute_tx, to_compute_rx) = mpsc::channel::<Batch>(capacity);
        let (from_compute_tx, from_compute_rx) = mpsc::channel::<Batch>(capacity);
        let abort = CancellationToken::new();
        let stop = abort.child_token();
        let mut tasks = JoinSet::new();

        {
            let producer = Producer {
                tx: to_compute_tx,
                stop: stop.clone(),
                batch_size,
                sequence: self.sequence.clone(),
                counters: self.counters.clone(),
                recycler: self.recycler.clone(),
            };
            let abort = abort.clone();
            tasks.spawn_on(
                async move {
                    let result = producer.run(source).await;
                    stage_exit("producer", &abort, result.map(|()| StageExit::Producer))
                },
                &runtime,
            );
        }

        {
            let abort = abort.clone();
            let counters = self.counters.clone();
            tasks.spawn_blocking_on(
                move || {
                    let result = compute_stage(
                        &mut processor,
                        to_compute_rx,
                        from_compute_tx,
                        &abort,
                        &counters,
                    );
                    processor.finish();
                    stage_exit("compute", &abort, result.map(|()| StageExit::Compute))
                },
                &runtime,
            );
        }

        {
            let abort = abort.clone();
            let counters = self.counters.clone();
            let recycler = self.recycler.clone();
            let observers = self.observers.clone();
            tasks.spawn_on(
                async move {
                    let result =
                        consumer_stage(from_compute_rx, &abort, &counters, &recycler, &observers)
                            .await;
                    stage_exit("consumer", &abort, result.map(StageExit::Consumer))
                },
                &runtime,
            );
        }

        self.observers.emit(&BenchEvent::PhaseStarted {
            task: processor_name.clone(),
            phase: Phase::Streaming,
            iterations: 0,
        });
        tracing::info!(
            processor = %processor_name,
            batch_size,
            channel_capacity = capacity,
            "streaming pipeline started"
        );

        self.run = Some(RunHandle {
            tasks,
            abort,
            stop,
            started: Instant::now(),
            processor_name,
        });
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Request shutdown and wait for every in-flight batch to drain.
    ///
    /// Cancellation is not an error: a clean drain returns the report.
    pub async fn stop(&mut self) -> Result<PipelineReport> {
        if self.state != PipelineState::Running {
            return Err(AccelError::Pipeline(format!(
                "cannot stop: pipeline is {}",
                self.state
            )));
        }
        self.state = PipelineState::Draining;
        if let Some(run) = &self.run {
            tracing::debug!("stop requested, draining pipeline");
            run.stop.cancel();
        }
        self.collect().await
    }

    /// Wait for the source to run dry and the pipeline to drain.
    ///
    /// Never returns for an unbounded source unless a stage fails.
    pub async fn wait(&mut self) -> Result<PipelineReport> {
        if self.state != PipelineState::Running {
            return Err(AccelError::Pipeline(format!(
                "cannot wait: pipeline is {}",
                self.state
            )));
        }
        self.collect().await
    }

    async fn collect(&mut self) -> Result<PipelineReport> {
        let Some(mut run) = self.run.take() else {
            self.state = PipelineState::Stopped;
            return Err(AccelError::Pipeline("no run in progress".into()));
        };

        let mut first_error: Option<AccelError> = None;
        let mut tally = None;

        while let Some(joined) = run.tasks.join_next().await {
            match joined {
                Ok(Ok(StageExit::Consumer(t))) => tally = Some(t),
                Ok(Ok(StageExit::Producer | StageExit::Compute)) => {}
                Ok(Err(e)) => {
                    run.abort.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    tracing::error!(%join_err, "pipeline stage panicked");
                    run.abort.cancel();
                    if first_error.is_none() {
                        first_error = Some(AccelError::Execution(format!(
                            "pipeline stage panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        self.state = PipelineState::Stopped;
        let elapsed_ms = stats::duration_ms(run.started.elapsed());

        if let Some(e) = first_error {
            self.observers
                .log(LogLevel::Warn, format!("pipeline failed: {e}"));
            return Err(e);
        }

        let report = tally.unwrap_or_default().into_report(elapsed_ms);
        let counters = self.counters.snapshot();
        debug_assert!(
            counters.produced >= counters.computed && counters.computed >= counters.consumed,
            "pipeline ordering violation: {counters:?}"
        );

        self.observers.emit(&BenchEvent::PhaseCompleted {
            phase: Phase::Streaming,
            avg_latency_ms: report.avg_latency_ms,
        });
        metrics::histogram!("accelbench_pipeline_throughput_eps")
            .record(report.throughput_elements_per_sec);
        tracing::info!(
            processor = %run.processor_name,
            batches = report.batches,
            elements = report.elements,
            elapsed_ms = report.elapsed_ms,
            avg_latency_ms = report.avg_latency_ms,
            "streaming pipeline stopped"
        );
        Ok(report)
    }
}

impl Drop for StreamingPipeline {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            run.abort.cancel();
        }
    }
}

fn stage_exit(
    stage: &'static str,
    abort: &CancellationToken,
    result: Result<StageExit>,
) -> Result<StageExit> {
    match &result {
        Ok(_) => tracing::debug!(stage, "pipeline stage exited"),
        Err(e) => {
            tracing::error!(stage, error = %e, "pipeline stage failed");
            abort.cancel();
        }
    }
    result
}

struct Producer {
    tx: mpsc::Sender<Batch>,
    stop: CancellationToken,
    batch_size: usize,
    sequence: Arc<AtomicU64>,
    counters: Arc<StageCounters>,
    recycler: Arc<Mutex<Vec<Batch>>>,
}

impl Producer {
    async fn run<S: BatchSource>(self, mut source: S) -> Result<()> {
        loop {
            // Reserve first: a full queue parks the producer before the
            // source is advanced.
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    tracing::debug!("producer cancelled");
                    break;
                }
                permit = self.tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::debug!("producer: compute stage closed");
                        break;
                    }
                }
            };

            let mut batch = self
                .recycler
                .lock()
                .pop()
                .unwrap_or_else(|| Batch::with_capacity(self.batch_size));
            batch.ensure_capacity(self.batch_size);

            let Some(length) = source.fill(&mut batch.input[..self.batch_size])? else {
                tracing::info!("producer: source exhausted");
                break;
            };
            if length > self.batch_size {
                return Err(AccelError::Execution(format!(
                    "source filled {length} elements into a batch of {}",
                    self.batch_size
                )));
            }

            batch.length = length;
            batch.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            batch.created_at = Instant::now();
            permit.send(batch);

            self.counters.produced.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("accelbench_batches_produced_total").increment(1);
        }
        Ok(())
    }
}

fn compute_stage<P: BatchProcessor>(
    processor: &mut P,
    mut rx: mpsc::Receiver<Batch>,
    tx: mpsc::Sender<Batch>,
    abort: &CancellationToken,
    counters: &StageCounters,
) -> Result<()> {
    while let Some(mut batch) = rx.blocking_recv() {
        if abort.is_cancelled() {
            tracing::debug!("compute cancelled");
            break;
        }
        processor.process(&mut batch)?;
        counters.computed.fetch_add(1, Ordering::Relaxed);

        if tx.blocking_send(batch).is_err() {
            tracing::debug!("compute: consumer closed");
            break;
        }
    }
    Ok(())
}

async fn consumer_stage(
    mut rx: mpsc::Receiver<Batch>,
    abort: &CancellationToken,
    counters: &StageCounters,
    recycler: &Mutex<Vec<Batch>>,
    observers: &ObserverSet,
) -> Result<ConsumerTally> {
    let mut tally = ConsumerTally::default();
    loop {
        let batch = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                tracing::debug!("consumer cancelled");
                break;
            }
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            }
        };

        if let Some(last) = tally.last_sequence {
            if batch.sequence != last + 1 {
                return Err(AccelError::Execution(format!(
                    "sequence gap: expected {}, got {}",
                    last + 1,
                    batch.sequence
                )));
            }
        }

        let obs = BatchObservation {
            sequence: batch.sequence,
            length: batch.length,
            checksum: batch.checksum(),
            latency_ms: stats::duration_ms(batch.age()),
        };
        tally.record(&obs);
        counters.consumed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("accelbench_batches_consumed_total").increment(1);
        metrics::histogram!("accelbench_batch_latency_ms").record(obs.latency_ms);
        observers.emit(&BenchEvent::BatchCompleted(obs));

        recycler.lock().push(batch);
    }
    Ok(tally)
}
