use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cost model for the host-simulated interconnect and launch path.
///
/// Copies and launches sleep the issuing stream's worker for the modelled
/// time, so work on two streams overlaps in wall-clock time the way DMA and
/// kernels on a discrete accelerator do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferModel {
    /// Host<->device bandwidth in GB/s. `None` makes copies free.
    pub bandwidth_gbps: Option<f64>,
    /// Fixed cost per kernel launch, in microseconds.
    pub launch_overhead_us: u64,
}

impl Default for TransferModel {
    fn default() -> Self {
        Self {
            bandwidth_gbps: Some(12.0), // PCIe 4.0 x16, effective
            launch_overhead_us: 10,
        }
    }
}

impl TransferModel {
    /// No modelled cost: copies and launches take only the host time they use.
    pub fn instant() -> Self {
        Self {
            bandwidth_gbps: None,
            launch_overhead_us: 0,
        }
    }

    /// Saturates at `Duration::MAX` when the modelled time does not fit.
    pub fn transfer_time(&self, bytes: usize) -> Duration {
        match self.bandwidth_gbps {
            Some(gbps) if gbps > 0.0 => {
                Duration::try_from_secs_f64(bytes as f64 / (gbps * 1e9)).unwrap_or(Duration::MAX)
            }
            _ => Duration::ZERO,
        }
    }

    pub fn launch_overhead(&self) -> Duration {
        Duration::from_micros(self.launch_overhead_us)
    }

    pub fn simulate_transfer(&self, bytes: usize) {
        pause(self.transfer_time(bytes));
    }

    pub fn simulate_launch(&self) {
        pause(self.launch_overhead());
    }
}

fn pause(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}
