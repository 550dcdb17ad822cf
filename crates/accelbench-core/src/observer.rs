//! Progress events and listener registration.
//!
//! Runners, the scheduler and the streaming pipeline publish [`BenchEvent`]s
//! to every registered [`ProgressObserver`]. Observers are called inline on
//! the publishing thread, so they should return quickly.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Measurement phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Warmup,
    Timed,
    SingleBuffered,
    DoubleBuffered,
    Streaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Warmup => "warmup",
            Phase::Timed => "timed",
            Phase::SingleBuffered => "single-buffered",
            Phase::DoubleBuffered => "double-buffered",
            Phase::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// What the consumer stage learned from one completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchObservation {
    pub sequence: u64,
    pub length: usize,
    pub checksum: f64,
    /// Producer stamp to consumer receipt.
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BenchEvent {
    PhaseStarted {
        task: String,
        phase: Phase,
        iterations: usize,
    },
    IterationCompleted {
        phase: Phase,
        index: usize,
        latency_ms: f64,
    },
    PhaseCompleted {
        phase: Phase,
        avg_latency_ms: f64,
    },
    BatchCompleted(BatchObservation),
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Listener for benchmark progress.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &BenchEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&BenchEvent) + Send + Sync,
{
    fn on_event(&self, event: &BenchEvent) {
        self(event)
    }
}

/// The set of observers registered with one runner, scheduler or pipeline.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ProgressObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Arc<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProgressObserver>> {
        self.observers.iter()
    }

    pub fn emit(&self, event: &BenchEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.observers.is_empty() {
            return;
        }
        self.emit(&BenchEvent::Log {
            level,
            message: message.into(),
        });
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Renders events as tracing lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &BenchEvent) {
        match event {
            BenchEvent::PhaseStarted {
                task,
                phase,
                iterations,
            } => tracing::info!(task = %task, %phase, iterations, "phase started"),
            BenchEvent::IterationCompleted {
                phase,
                index,
                latency_ms,
            } => tracing::trace!(%phase, index, latency_ms, "iteration complete"),
            BenchEvent::PhaseCompleted {
                phase,
                avg_latency_ms,
            } => tracing::info!(%phase, avg_latency_ms, "phase complete"),
            BenchEvent::BatchCompleted(obs) => tracing::debug!(
                sequence = obs.sequence,
                length = obs.length,
                checksum = obs.checksum,
                latency_ms = obs.latency_ms,
                "batch complete"
            ),
            BenchEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
            },
        }
    }
}
