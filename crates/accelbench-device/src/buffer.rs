use std::sync::Arc;

use parking_lot::Mutex;

use accelbench_core::{AccelError, Result};

use crate::memory::Reservation;
use crate::transfer::TransferModel;

/// A typed buffer in simulated device memory.
///
/// Handles are cheap to clone so stream operations can own the buffers
/// they touch; all clones refer to the same storage. The memory budget
/// reservation is released when the last handle drops.
pub struct DeviceBuffer<T: bytemuck::Pod> {
    inner: Arc<DeviceBufferInner<T>>,
}

struct DeviceBufferInner<T: bytemuck::Pod> {
    data: Mutex<Vec<T>>,
    len: usize,
    reservation: Reservation,
}

impl<T: bytemuck::Pod> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: bytemuck::Pod + Send> DeviceBuffer<T> {
    pub(crate) fn new(len: usize, reservation: Reservation) -> Self {
        Self {
            inner: Arc::new(DeviceBufferInner {
                data: Mutex::new(vec![T::zeroed(); len]),
                len,
                reservation,
            }),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.inner.len * std::mem::size_of::<T>()
    }

    /// Pool the buffer was carved from.
    pub fn pool_id(&self) -> u64 {
        self.inner.reservation.pool_id()
    }

    /// True if both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Host -> device copy of the common prefix. Returns elements copied.
    pub fn upload(&self, host: &HostBuffer<T>, transfer: &TransferModel) -> usize {
        let copied = {
            let src = host.data.lock();
            self.upload_slice(&src)
        };
        transfer.simulate_transfer(copied * std::mem::size_of::<T>());
        copied
    }

    /// Device -> host copy of the common prefix. Returns elements copied.
    pub fn download(&self, host: &HostBuffer<T>, transfer: &TransferModel) -> usize {
        let copied = {
            let mut dst = host.data.lock();
            self.download_slice(&mut dst)
        };
        transfer.simulate_transfer(copied * std::mem::size_of::<T>());
        copied
    }

    /// Copy from a host slice without modelled transfer cost.
    pub fn upload_slice(&self, src: &[T]) -> usize {
        let mut data = self.inner.data.lock();
        let n = src.len().min(data.len());
        data[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Copy into a host slice without modelled transfer cost.
    pub fn download_slice(&self, dst: &mut [T]) -> usize {
        let data = self.inner.data.lock();
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Run a kernel body reading `self` and writing `output`.
    ///
    /// `self` and `output` must be different allocations.
    pub fn map_into<F>(&self, output: &DeviceBuffer<T>, kernel: F) -> Result<()>
    where
        F: FnOnce(&[T], &mut [T]),
    {
        if self.same_allocation(output) {
            return Err(AccelError::Execution(
                "kernel input and output alias the same device buffer".into(),
            ));
        }
        let src = self.inner.data.lock();
        let mut dst = output.inner.data.lock();
        kernel(&src, &mut dst);
        Ok(())
    }

    /// In-place access to the device contents.
    pub fn with_contents_mut<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> R {
        f(&mut self.inner.data.lock())
    }

    pub fn with_contents<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.inner.data.lock())
    }

    /// Raw bytes of the buffer, for debugging and checksums.
    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.inner.data.lock()).to_vec()
    }
}

impl<T: bytemuck::Pod + Send> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.inner.len)
            .field("size_bytes", &self.size_bytes())
            .field("pool_id", &self.inner.reservation.pool_id())
            .finish()
    }
}

/// A host-side staging buffer, shareable with stream operations.
pub struct HostBuffer<T: bytemuck::Pod> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: bytemuck::Pod> Clone for HostBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: bytemuck::Pod> HostBuffer<T> {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![T::zeroed(); len])
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.lock().clone()
    }

    pub fn with_contents<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.data.lock())
    }
}

impl<T: bytemuck::Pod> std::fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DeviceMemoryPool;

    #[test]
    fn upload_kernel_download() {
        let pool = DeviceMemoryPool::new(1 << 20).unwrap();
        let transfer = TransferModel::instant();
        let d_in = pool.alloc::<f32>(4).unwrap();
        let d_out = pool.alloc::<f32>(4).unwrap();
        let h_in = HostBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        let h_out = HostBuffer::<f32>::zeroed(4);

        assert_eq!(d_in.upload(&h_in, &transfer), 4);
        d_in.map_into(&d_out, |src, dst| {
            for (y, x) in dst.iter_mut().zip(src) {
                *y = x * 10.0;
            }
        })
        .unwrap();
        assert_eq!(d_out.download(&h_out, &transfer), 4);
        assert_eq!(h_out.to_vec(), vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn aliasing_kernel_is_rejected() {
        let pool = DeviceMemoryPool::new(1 << 20).unwrap();
        let buf = pool.alloc::<f32>(4).unwrap();
        let alias = buf.clone();
        let err = buf.map_into(&alias, |_, _| {}).unwrap_err();
        assert!(err.is_execution_failure());
    }

    #[test]
    fn copies_clamp_to_shorter_side() {
        let pool = DeviceMemoryPool::new(1 << 20).unwrap();
        let buf = pool.alloc::<u32>(2).unwrap();
        assert_eq!(buf.upload_slice(&[7, 8, 9]), 2);
        let mut out = [0u32; 4];
        assert_eq!(buf.download_slice(&mut out), 2);
        assert_eq!(out, [7, 8, 0, 0]);
        assert_eq!(buf.to_bytes().len(), 8);
    }

    #[test]
    fn debug_reports_unaligned_size() {
        let pool = DeviceMemoryPool::new(1 << 20).unwrap();
        let buf = pool.alloc::<f32>(3).unwrap();
        assert_eq!(buf.size_bytes(), 12);
        // The pool reserves the aligned size; the buffer reports its own.
        assert_eq!(pool.in_use(), 256);
        assert!(format!("{buf:?}").contains("size_bytes: 12"));
    }
}
