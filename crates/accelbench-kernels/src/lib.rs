pub mod affine;
pub mod data_gen;
pub mod mandelbrot;
pub mod nbody;
pub mod task;

pub use affine::{AffineParams, AffineTask};
pub use data_gen::DataGenerator;
pub use mandelbrot::{MandelbrotParams, MandelbrotTask};
pub use nbody::{NBodyParams, NBodyTask};
pub use task::{KernelTask, TaskKind};
