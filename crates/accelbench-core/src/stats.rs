//! Latency statistics.
//!
//! All inputs are per-iteration wall-clock latencies in milliseconds. The
//! percentile uses floor-index selection on the sorted samples, not
//! interpolation, so results stay comparable across runs and tools that
//! share the convention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AccelError, Result};

/// Convert a duration to fractional milliseconds.
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn require_samples(samples: &[f64]) -> Result<()> {
    if samples.is_empty() {
        return Err(AccelError::Configuration(
            "latency sample set is empty".into(),
        ));
    }
    Ok(())
}

/// Arithmetic mean.
pub fn average(samples: &[f64]) -> Result<f64> {
    require_samples(samples)?;
    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Element at index `floor(n * fraction)` of the ascending-sorted samples.
pub fn percentile_floor(samples: &[f64], fraction: f64) -> Result<f64> {
    require_samples(samples)?;
    if !(0.0..=1.0).contains(&fraction) {
        return Err(AccelError::Configuration(format!(
            "percentile fraction {fraction} outside [0, 1]"
        )));
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let index = ((n as f64) * fraction).floor() as usize;
    Ok(sorted[index.min(n - 1)])
}

/// 95th-percentile latency.
pub fn p95(samples: &[f64]) -> Result<f64> {
    percentile_floor(samples, 0.95)
}

/// Elements processed per second of measured wall-clock time:
/// `batch_size * iterations / (sum(samples) / 1000)`.
///
/// Returns 0.0 when the measured time is zero.
pub fn throughput(batch_size: usize, iterations: usize, samples: &[f64]) -> f64 {
    let total_ms: f64 = samples.iter().sum();
    if total_ms <= 0.0 {
        return 0.0;
    }
    (batch_size as f64 * iterations as f64) * 1000.0 / total_ms
}

/// `single_buffer_ms / overlapped_ms`, or 0.0 if the overlapped time is zero.
pub fn speedup_factor(single_buffer_ms: f64, overlapped_ms: f64) -> f64 {
    if overlapped_ms > 0.0 {
        single_buffer_ms / overlapped_ms
    } else {
        0.0
    }
}

/// Share of the serial latency hidden by overlap, clamped at zero:
/// `max(0, (1 - overlapped / single) * 100)`.
pub fn overlap_percentage(single_buffer_ms: f64, overlapped_ms: f64) -> f64 {
    if single_buffer_ms <= 0.0 {
        return 0.0;
    }
    ((1.0 - overlapped_ms / single_buffer_ms) * 100.0).max(0.0)
}

/// Summary of one latency sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
    pub sample_count: usize,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Result<Self> {
        let avg_ms = average(samples)?;
        let p95_ms = p95(samples)?;
        let min_ms = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok(Self {
            avg_ms,
            p95_ms,
            min_ms,
            max_ms,
            total_ms: samples.iter().sum(),
            sample_count: samples.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_three() {
        assert_eq!(average(&[10.0, 20.0, 30.0]).unwrap(), 20.0);
    }

    #[test]
    fn p95_uses_floor_index() {
        let samples: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(p95(&samples).unwrap(), 10.0);
    }

    #[test]
    fn p95_sorts_before_selecting() {
        let samples: Vec<f64> = (1..=20).rev().map(|v| v as f64).collect();
        // floor(20 * 0.95) = 19 -> largest
        assert_eq!(p95(&samples).unwrap(), 20.0);

        let samples: Vec<f64> = (1..=100).rev().map(|v| v as f64).collect();
        // floor(100 * 0.95) = 95 -> 96th smallest
        assert_eq!(p95(&samples).unwrap(), 96.0);
    }

    #[test]
    fn p95_single_sample() {
        assert_eq!(p95(&[42.0]).unwrap(), 42.0);
    }

    #[test]
    fn empty_samples_rejected() {
        assert!(average(&[]).unwrap_err().is_configuration_error());
        assert!(p95(&[]).unwrap_err().is_configuration_error());
    }

    #[test]
    fn throughput_uses_measured_wall_clock() {
        let t = throughput(100, 2, &[10.0, 10.0]);
        assert!((t - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn throughput_zero_time() {
        assert_eq!(throughput(100, 2, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn overlap_is_clamped_at_zero() {
        assert_eq!(overlap_percentage(10.0, 12.0), 0.0);
        assert!((overlap_percentage(10.0, 4.0) - 60.0).abs() < 1e-9);
        assert!((speedup_factor(10.0, 4.0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn summary_bounds() {
        let s = LatencySummary::from_samples(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(s.min_ms, 1.0);
        assert_eq!(s.max_ms, 3.0);
        assert_eq!(s.total_ms, 6.0);
        assert_eq!(s.sample_count, 3);
    }

    #[test]
    fn duration_conversion() {
        assert!((duration_ms(Duration::from_micros(1500)) - 1.5).abs() < 1e-12);
    }
}
