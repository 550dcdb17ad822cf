use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use accelbench_core::{AccelError, BatchProcessor, ComputeTask, DoubleBufferedTask, Result};
use accelbench_device::DeviceContext;

use crate::affine::{AffineParams, AffineTask};
use crate::mandelbrot::{MandelbrotParams, MandelbrotTask};
use crate::nbody::{NBodyParams, NBodyTask};

/// Workload selector used by configs and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Affine,
    Mandelbrot,
    NBody,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Affine, TaskKind::Mandelbrot, TaskKind::NBody];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Affine => "affine",
            TaskKind::Mandelbrot => "mandelbrot",
            TaskKind::NBody => "n_body",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TaskKind::Affine => "y = scale * x + offset; simple, double-buffered, streaming",
            TaskKind::Mandelbrot => "escape-time fractal over pixel indices; simple, streaming",
            TaskKind::NBody => "all-pairs softened gravity with ping-pong state; simple",
        }
    }

    /// Batch size used when a config leaves it unset. For `n_body` this is
    /// the body count, and each step costs O(n^2).
    pub fn default_batch_size(self) -> usize {
        match self {
            TaskKind::Affine | TaskKind::Mandelbrot => 1 << 16,
            TaskKind::NBody => 1024,
        }
    }

    pub fn supports_double_buffering(self) -> bool {
        matches!(self, TaskKind::Affine)
    }

    pub fn supports_streaming(self) -> bool {
        matches!(self, TaskKind::Affine | TaskKind::Mandelbrot)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "affine" => Ok(TaskKind::Affine),
            "mandelbrot" => Ok(TaskKind::Mandelbrot),
            "n_body" | "nbody" => Ok(TaskKind::NBody),
            other => Err(AccelError::Configuration(format!("unknown task '{other}'"))),
        }
    }
}

fn parse_params<P>(kind: TaskKind, value: &serde_json::Value) -> Result<P>
where
    P: DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| AccelError::Configuration(format!("invalid {kind} parameters: {e}")))
}

/// One of the built-in workloads.
pub enum KernelTask {
    Affine(AffineTask),
    Mandelbrot(MandelbrotTask),
    NBody(NBodyTask),
}

impl KernelTask {
    /// Build the workload for `kind`. A null `params` selects the defaults.
    pub fn build(
        kind: TaskKind,
        ctx: Arc<DeviceContext>,
        params: &serde_json::Value,
    ) -> Result<Self> {
        let task = match kind {
            TaskKind::Affine => KernelTask::Affine(AffineTask::new(
                ctx,
                parse_params::<AffineParams>(kind, params)?,
            )),
            TaskKind::Mandelbrot => KernelTask::Mandelbrot(MandelbrotTask::new(
                ctx,
                parse_params::<MandelbrotParams>(kind, params)?,
            )?),
            TaskKind::NBody => KernelTask::NBody(NBodyTask::new(
                ctx,
                parse_params::<NBodyParams>(kind, params)?,
            )?),
        };
        tracing::debug!(task = %kind, "kernel task built");
        Ok(task)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            KernelTask::Affine(_) => TaskKind::Affine,
            KernelTask::Mandelbrot(_) => TaskKind::Mandelbrot,
            KernelTask::NBody(_) => TaskKind::NBody,
        }
    }

    pub fn as_double_buffered_mut(&mut self) -> Option<&mut dyn DoubleBufferedTask> {
        match self {
            KernelTask::Affine(t) => Some(t as &mut dyn DoubleBufferedTask),
            _ => None,
        }
    }

    /// Convert into a streaming batch processor, if the workload supports it.
    pub fn into_processor(self) -> Result<Box<dyn BatchProcessor>> {
        match self {
            KernelTask::Affine(t) => Ok(Box::new(t)),
            KernelTask::Mandelbrot(t) => Ok(Box::new(t)),
            KernelTask::NBody(_) => Err(AccelError::Configuration(
                "n_body carries state between steps and cannot process independent batches".into(),
            )),
        }
    }
}

impl ComputeTask for KernelTask {
    fn name(&self) -> &str {
        match self {
            KernelTask::Affine(t) => ComputeTask::name(t),
            KernelTask::Mandelbrot(t) => ComputeTask::name(t),
            KernelTask::NBody(t) => t.name(),
        }
    }

    fn setup(&mut self, capacity_hint: usize) -> Result<()> {
        match self {
            KernelTask::Affine(t) => t.setup(capacity_hint),
            KernelTask::Mandelbrot(t) => t.setup(capacity_hint),
            KernelTask::NBody(t) => t.setup(capacity_hint),
        }
    }

    fn execute(&mut self) -> Result<()> {
        match self {
            KernelTask::Affine(t) => t.execute(),
            KernelTask::Mandelbrot(t) => t.execute(),
            KernelTask::NBody(t) => t.execute(),
        }
    }

    fn teardown(&mut self) {
        match self {
            KernelTask::Affine(t) => t.teardown(),
            KernelTask::Mandelbrot(t) => t.teardown(),
            KernelTask::NBody(t) => t.teardown(),
        }
    }

    fn verify(&self) -> Result<()> {
        match self {
            KernelTask::Affine(t) => t.verify(),
            KernelTask::Mandelbrot(t) => t.verify(),
            KernelTask::NBody(t) => t.verify(),
        }
    }
}
