use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats::{self, LatencySummary};

/// The unit of work flowing through the streaming pipeline.
///
/// A batch is never cloned: whichever stage holds it owns it outright, and
/// handing it to the next queue moves it.
#[derive(Debug)]
pub struct Batch {
    pub input: Vec<f32>,
    pub output: Vec<f32>,
    /// Number of valid elements in `input`/`output`.
    pub length: usize,
    /// Assigned once by the producer; strictly increasing per pipeline.
    pub sequence: u64,
    pub created_at: Instant,
}

impl Batch {
    /// Allocate an empty batch with room for `capacity` elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            input: vec![0.0; capacity],
            output: vec![0.0; capacity],
            length: 0,
            sequence: 0,
            created_at: Instant::now(),
        }
    }

    /// Grow the payload buffers if they are smaller than `capacity`.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.input.len() < capacity {
            self.input.resize(capacity, 0.0);
        }
        if self.output.len() < capacity {
            self.output.resize(capacity, 0.0);
        }
    }

    /// Valid input elements.
    pub fn input(&self) -> &[f32] {
        &self.input[..self.length]
    }

    /// Valid output elements.
    pub fn output(&self) -> &[f32] {
        &self.output[..self.length]
    }

    /// Split borrow of the valid input and output regions.
    pub fn io_mut(&mut self) -> (&[f32], &mut [f32]) {
        let len = self.length;
        (&self.input[..len], &mut self.output[..len])
    }

    /// Sum of the valid output elements, accumulated in f64.
    pub fn checksum(&self) -> f64 {
        self.output().iter().map(|&v| v as f64).sum()
    }

    /// Time since the producer stamped this batch.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Labels identifying the backend and device a result was measured on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub backend: String,
    pub device: String,
}

impl DeviceDescriptor {
    pub fn new(backend: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            device: device.into(),
        }
    }
}

/// Outcome of a simple (non-overlapped) benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub task_name: String,
    pub backend_label: String,
    pub device_label: String,
    pub batch_size: usize,
    pub iterations: usize,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub throughput_elements_per_sec: f64,
}

impl BenchmarkResult {
    /// Assemble a result from per-iteration latencies in milliseconds.
    pub fn from_samples(
        task_name: &str,
        device: &DeviceDescriptor,
        batch_size: usize,
        samples_ms: &[f64],
    ) -> Result<Self> {
        let summary = LatencySummary::from_samples(samples_ms)?;
        Ok(Self {
            task_name: task_name.to_string(),
            backend_label: device.backend.clone(),
            device_label: device.device.clone(),
            batch_size,
            iterations: samples_ms.len(),
            avg_latency_ms: summary.avg_ms,
            p95_latency_ms: summary.p95_ms,
            throughput_elements_per_sec: stats::throughput(batch_size, samples_ms.len(), samples_ms),
        })
    }
}

/// Outcome of a double-buffered run: the overlapped figures plus the
/// single-buffer baseline they are compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleBufferedResult {
    #[serde(flatten)]
    pub result: BenchmarkResult,
    pub single_buffer_avg_ms: f64,
    pub single_buffer_p95_ms: f64,
    pub speedup_factor: f64,
    pub overlap_percentage: f64,
}

impl DoubleBufferedResult {
    /// Combine the overlapped result with the baseline phase samples.
    pub fn new(result: BenchmarkResult, baseline_samples_ms: &[f64]) -> Result<Self> {
        let baseline = LatencySummary::from_samples(baseline_samples_ms)?;
        Ok(Self {
            speedup_factor: stats::speedup_factor(baseline.avg_ms, result.avg_latency_ms),
            overlap_percentage: stats::overlap_percentage(baseline.avg_ms, result.avg_latency_ms),
            single_buffer_avg_ms: baseline.avg_ms,
            single_buffer_p95_ms: baseline.p95_ms,
            result,
        })
    }
}
