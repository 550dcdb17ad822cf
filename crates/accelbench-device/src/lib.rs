pub mod buffer;
pub mod context;
pub mod memory;
pub mod stream;
pub mod transfer;

pub use buffer::{DeviceBuffer, HostBuffer};
pub use context::{DeviceContext, DeviceContextConfig};
pub use memory::DeviceMemoryPool;
pub use stream::{HostStream, PooledStream, StreamPool};
pub use transfer::TransferModel;
