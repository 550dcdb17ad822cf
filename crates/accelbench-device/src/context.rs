use accelbench_core::{AccelError, DeviceDescriptor, ExecutionStream, Result};

use crate::memory::DeviceMemoryPool;
use crate::stream::{HostStream, StreamPool};
use crate::transfer::TransferModel;

/// Default device memory budget: 256 MB.
const DEFAULT_POOL_SIZE: usize = 256 * 1024 * 1024;

/// Default number of streams in the pool.
const DEFAULT_STREAM_COUNT: usize = 4;

/// Backend label reported in results.
pub const BACKEND_LABEL: &str = "host-sim";

/// Central device context holding the memory pool, stream pool and the
/// default stream used by synchronous execution.
///
/// Created once per session and shared (behind an `Arc`) by every task.
pub struct DeviceContext {
    pub memory_pool: DeviceMemoryPool,
    pub stream_pool: StreamPool,
    default_stream: HostStream,
    transfer: TransferModel,
    device_ordinal: usize,
}

/// Configuration for device context initialization.
#[derive(Debug, Clone)]
pub struct DeviceContextConfig {
    /// Device ordinal (default 0).
    pub device_ordinal: usize,
    /// Device memory budget in bytes.
    pub pool_size: usize,
    /// Number of pooled streams (the default stream is extra).
    pub stream_count: usize,
    pub transfer: TransferModel,
}

impl Default for DeviceContextConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            pool_size: DEFAULT_POOL_SIZE,
            stream_count: DEFAULT_STREAM_COUNT,
            transfer: TransferModel::default(),
        }
    }
}

impl DeviceContext {
    /// Initialize the device context with the given configuration.
    pub fn new(config: DeviceContextConfig) -> Result<Self> {
        tracing::info!(
            device = config.device_ordinal,
            pool_mb = config.pool_size / (1024 * 1024),
            streams = config.stream_count,
            bandwidth_gbps = ?config.transfer.bandwidth_gbps,
            "initializing host-simulated device"
        );

        if config.stream_count == 0 {
            return Err(AccelError::Configuration(
                "device needs at least one pooled stream".into(),
            ));
        }

        let memory_pool = DeviceMemoryPool::new(config.pool_size)?;
        let default_stream = HostStream::new(0)?;
        let stream_pool = StreamPool::new(config.stream_count, 1)?;

        Ok(Self {
            memory_pool,
            stream_pool,
            default_stream,
            transfer: config.transfer,
            device_ordinal: config.device_ordinal,
        })
    }

    pub fn transfer(&self) -> &TransferModel {
        &self.transfer
    }

    /// Stream used for synchronous `execute` paths.
    pub fn default_stream(&self) -> &HostStream {
        &self.default_stream
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(
            BACKEND_LABEL,
            format!(
                "{BACKEND_LABEL}:{} ({} streams)",
                self.device_ordinal,
                self.stream_pool.pool_size()
            ),
        )
    }

    /// Wait for all work on every stream to complete.
    pub fn synchronize(&self) -> Result<()> {
        let default = self.default_stream.synchronize();
        let pooled = self.stream_pool.sync_all();
        default.and(pooled)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_ordinal", &self.device_ordinal)
            .field("memory_pool", &self.memory_pool)
            .field("streams", &self.stream_pool.pool_size())
            .field("transfer", &self.transfer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_labels() {
        let ctx = DeviceContext::new(DeviceContextConfig {
            device_ordinal: 2,
            stream_count: 3,
            ..Default::default()
        })
        .unwrap();
        let d = ctx.descriptor();
        assert_eq!(d.backend, "host-sim");
        assert_eq!(d.device, "host-sim:2 (3 streams)");
        ctx.synchronize().unwrap();
    }

    #[test]
    fn zero_streams_rejected() {
        let err = DeviceContext::new(DeviceContextConfig {
            stream_count: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.is_configuration_error());
    }
}
