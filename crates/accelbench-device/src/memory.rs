use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use accelbench_core::{AccelError, Result};

use crate::buffer::DeviceBuffer;

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Alignment for device allocations.
const DEVICE_ALLOC_ALIGN: usize = 256;

fn align_up(size: usize, align: usize) -> Option<usize> {
    size.checked_add(align - 1).map(|s| s & !(align - 1))
}

/// Byte budget for simulated device memory.
///
/// Every buffer reserves its aligned size from the budget when allocated
/// and gives it back when its last handle drops, so a task that leaks no
/// buffers returns the pool to zero usage after teardown.
pub struct DeviceMemoryPool {
    accounting: Arc<PoolAccounting>,
}

pub(crate) struct PoolAccounting {
    id: u64,
    capacity: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    total_allocated: AtomicU64,
}

/// One buffer's share of the budget. Released on drop.
pub(crate) struct Reservation {
    accounting: Arc<PoolAccounting>,
    bytes: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.accounting.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

impl Reservation {
    pub(crate) fn pool_id(&self) -> u64 {
        self.accounting.id
    }
}

impl DeviceMemoryPool {
    /// Create a pool that can hand out up to `capacity` bytes at once.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AccelError::Configuration(
                "device memory pool capacity must be non-zero".into(),
            ));
        }
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pool_id = id, capacity, "created device memory pool");

        Ok(Self {
            accounting: Arc::new(PoolAccounting {
                id,
                capacity,
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                total_allocated: AtomicU64::new(0),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.accounting.id
    }

    pub fn capacity(&self) -> usize {
        self.accounting.capacity
    }

    /// Bytes currently reserved by live buffers.
    pub fn in_use(&self) -> usize {
        self.accounting.in_use.load(Ordering::Acquire)
    }

    /// High-water mark of `in_use`.
    pub fn peak(&self) -> usize {
        self.accounting.peak.load(Ordering::Acquire)
    }

    /// Cumulative bytes handed out over the pool's lifetime.
    pub fn total_allocated(&self) -> u64 {
        self.accounting.total_allocated.load(Ordering::Relaxed)
    }

    /// Allocate a zeroed device buffer of `count` elements.
    pub fn alloc<T: bytemuck::Pod + Send>(&self, count: usize) -> Result<DeviceBuffer<T>> {
        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|bytes| align_up(bytes, DEVICE_ALLOC_ALIGN))
            .ok_or_else(|| AccelError::DeviceOutOfMemory {
                requested: usize::MAX,
                available: self.capacity().saturating_sub(self.in_use()),
            })?;
        let reservation = self.reserve(size)?;
        Ok(DeviceBuffer::new(count, reservation))
    }

    fn reserve(&self, size: usize) -> Result<Reservation> {
        let acct = &self.accounting;
        let mut current = acct.in_use.load(Ordering::Acquire);
        loop {
            let available = acct.capacity.saturating_sub(current);
            if size > available {
                return Err(AccelError::DeviceOutOfMemory {
                    requested: size,
                    available,
                });
            }
            match acct.in_use.compare_exchange_weak(
                current,
                current + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        acct.peak.fetch_max(current + size, Ordering::AcqRel);
        acct.total_allocated.fetch_add(size as u64, Ordering::Relaxed);

        tracing::trace!(
            pool_id = acct.id,
            size,
            in_use = current + size,
            "reserved device memory"
        );

        Ok(Reservation {
            accounting: Arc::clone(acct),
            bytes: size,
        })
    }
}

impl std::fmt::Debug for DeviceMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryPool")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_released() {
        let pool = DeviceMemoryPool::new(4096).unwrap();
        let a = pool.alloc::<f32>(10).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(pool.in_use(), 256);

        let b = pool.alloc::<f32>(100).unwrap();
        assert_eq!(pool.in_use(), 256 + 512);

        drop(a);
        assert_eq!(pool.in_use(), 512);
        drop(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak(), 768);
        assert_eq!(pool.total_allocated(), 768);
    }

    #[test]
    fn clones_share_one_reservation() {
        let pool = DeviceMemoryPool::new(1024).unwrap();
        let a = pool.alloc::<u32>(4).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(pool.in_use(), 256);
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhausted_budget_reports_out_of_memory() {
        let pool = DeviceMemoryPool::new(1024).unwrap();
        let _held = pool.alloc::<u8>(768).unwrap();
        match pool.alloc::<u8>(512) {
            Err(AccelError::DeviceOutOfMemory {
                requested,
                available,
            }) => {
                assert_eq!(requested, 512);
                assert_eq!(available, 256);
            }
            other => panic!("expected out-of-memory, got {other:?}"),
        }
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let pool = DeviceMemoryPool::new(1024).unwrap();
        for count in [usize::MAX / 2, usize::MAX] {
            match pool.alloc::<f32>(count) {
                Err(AccelError::DeviceOutOfMemory { available, .. }) => {
                    assert_eq!(available, 1024)
                }
                other => panic!("expected out-of-memory, got {other:?}"),
            }
        }
        // Rounds past the top of the address space.
        assert!(pool.alloc::<u8>(usize::MAX - 1).unwrap_err().is_setup_failure());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(DeviceMemoryPool::new(0).unwrap_err().is_configuration_error());
    }
}
