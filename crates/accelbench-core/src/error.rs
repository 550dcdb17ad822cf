use thiserror::Error;

/// Top-level error type for accelbench.
#[derive(Debug, Error)]
pub enum AccelError {
    /// The compute collaborator could not be brought up (backend unavailable,
    /// allocation failure, bad kernel parameters).
    #[error("setup failed: {0}")]
    Setup(String),

    /// Device work failed after timing began.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Invalid parameters, rejected before any resource is allocated.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("device memory allocation failed: requested {requested} bytes, available {available} bytes")]
    DeviceOutOfMemory { requested: usize, available: usize },

    /// Lifecycle misuse, e.g. starting a pipeline that is already running.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AccelError {
    pub fn is_setup_failure(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::DeviceOutOfMemory { .. })
    }

    pub fn is_execution_failure(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Re-tag an error raised during setup as a setup failure.
    ///
    /// Out-of-memory and configuration errors keep their own variant.
    pub fn into_setup(self) -> Self {
        match self {
            Self::Execution(msg) | Self::Pipeline(msg) => Self::Setup(msg),
            Self::Io(e) => Self::Setup(e.to_string()),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
