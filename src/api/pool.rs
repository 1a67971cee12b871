//! Custom memory pools.
//!
//! A pool is a user-configured block vector plus its own committed-allocation
//! list. Pools are reference counted: clones share the same storage, and the
//! last clone dropping unregisters the pool from its allocator.

use std::sync::{Arc, Weak};

use crate::api::allocator::{Allocator, AllocatorInner};
use crate::api::config::{
    PoolDesc, PoolFlags, DEFAULT_ALIGNMENT, DEFAULT_BLOCK_SIZE, DEFAULT_HEAP_ALIGNMENT,
    MSAA_HEAP_ALIGNMENT,
};
use crate::core::allocation::CommittedAllocationList;
use crate::core::block::{BlockVector, BlockVectorConfig};
use crate::core::stats::{DetailedStatistics, Statistics};
use crate::device::{Device, HeapFlags, HeapType};
use crate::error::{Error, Result};
use crate::sync::Mutex;

pub(crate) struct PoolInner<D: Device> {
    pub allocator: Weak<AllocatorInner<D>>,
    pub block_vector: Arc<BlockVector<D>>,
    pub committed: Arc<CommittedAllocationList>,
    pub flags: PoolFlags,
    pub always_committed: bool,
    pub msaa_always_committed: bool,
    name: Mutex<Option<String>>,
}

impl<D: Device> PoolInner<D> {
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }
}

impl<D: Device> Drop for PoolInner<D> {
    fn drop(&mut self) {
        debug_assert!(
            self.block_vector.is_empty() && self.committed.is_empty(),
            "pool destroyed while allocations are still alive"
        );
        if let Some(allocator) = self.allocator.upgrade() {
            let heap_type = self.block_vector.config.heap_type;
            let mut list = allocator.pool_lists[heap_type as usize].write();
            list.retain(|w| w.upgrade().is_some());
        }
    }
}

/// A user-created memory pool. Cheap to clone.
pub struct Pool<D: Device> {
    pub(crate) inner: Arc<PoolInner<D>>,
}

impl<D: Device> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Device> Pool<D> {
    pub(crate) fn inner(&self) -> &Arc<PoolInner<D>> {
        &self.inner
    }

    pub fn set_name(&self, name: Option<&str>) {
        *self.inner.name.lock() = name.map(str::to_owned);
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name()
    }

    pub fn heap_type(&self) -> HeapType {
        self.inner.block_vector.config.heap_type
    }

    /// Cheap counters over the pool's blocks and dedicated allocations.
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.inner.block_vector.add_statistics(&mut stats);
        if let Some(allocator) = self.inner.allocator.upgrade() {
            self.inner
                .committed
                .add_statistics(&allocator.objects, &mut stats);
        }
        stats
    }

    /// Exhaustive statistics, including free-range distribution.
    pub fn calculate_statistics(&self) -> DetailedStatistics {
        let mut detailed = DetailedStatistics::default();
        self.inner.block_vector.add_detailed_statistics(&mut detailed);
        if let Some(allocator) = self.inner.allocator.upgrade() {
            self.inner
                .committed
                .add_detailed_statistics(&allocator.objects, &mut detailed);
        }
        detailed
    }
}

impl<D: Device> Allocator<D> {
    /// Create a custom pool.
    pub fn create_pool(&self, desc: &PoolDesc) -> Result<Pool<D>> {
        let inner = &self.inner;
        if desc.max_block_count != 0 && desc.min_block_count > desc.max_block_count {
            return Err(Error::InvalidArgument(
                "pool min block count exceeds max block count",
            ));
        }
        if desc.min_allocation_alignment != 0 && !desc.min_allocation_alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(
                "pool min allocation alignment must be a power of two",
            ));
        }
        let always_committed = desc.flags.contains(PoolFlags::ALWAYS_COMMITTED);
        if always_committed && desc.min_block_count > 0 {
            return Err(Error::InvalidArgument(
                "an always-committed pool cannot pre-create blocks",
            ));
        }
        if desc.heap_type == HeapType::GpuUpload && !inner.features.gpu_upload_heap_supported {
            return Err(Error::Unsupported("GPU upload heap"));
        }

        let msaa_always_committed = desc.flags.contains(PoolFlags::MSAA_TEXTURES_ALWAYS_COMMITTED);
        // Heaps that may receive MSAA render targets need the large
        // alignment.
        let may_hold_rt_ds = !desc
            .heap_flags
            .intersects(HeapFlags::ALLOW_ONLY_BUFFERS | HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES);
        let config = BlockVectorConfig {
            heap_type: desc.heap_type,
            heap_flags: desc.heap_flags,
            preferred_block_size: if desc.block_size != 0 {
                desc.block_size
            } else {
                DEFAULT_BLOCK_SIZE
            },
            min_block_count: desc.min_block_count,
            max_block_count: if desc.max_block_count == 0 {
                usize::MAX
            } else {
                desc.max_block_count
            },
            explicit_block_size: desc.block_size != 0,
            min_allocation_alignment: if desc.min_allocation_alignment == 0 {
                DEFAULT_ALIGNMENT
            } else {
                desc.min_allocation_alignment
            },
            linear_algorithm: desc.flags.contains(PoolFlags::ALGORITHM_LINEAR),
            heap_alignment: if may_hold_rt_ds && !msaa_always_committed {
                MSAA_HEAP_ALIGNMENT
            } else {
                DEFAULT_HEAP_ALIGNMENT
            },
            residency_priority: desc.residency_priority,
        };
        let block_vector = Arc::new(BlockVector::new(config));

        let pool = Arc::new(PoolInner {
            allocator: Arc::downgrade(&self.inner),
            block_vector: Arc::clone(&block_vector),
            committed: Arc::new(CommittedAllocationList::new(desc.heap_type)),
            flags: desc.flags,
            always_committed,
            msaa_always_committed,
            name: Mutex::new(None),
        });

        {
            let ctx = inner.vector_ctx(&block_vector);
            block_vector.create_min_blocks(&ctx)?;
        }
        inner.pool_lists[desc.heap_type as usize]
            .write()
            .push(Arc::downgrade(&pool));
        crate::debug_log!("created pool for heap type {:?}", desc.heap_type);
        Ok(Pool { inner: pool })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::AllocatorDesc;
    use crate::testing::MockDevice;

    fn allocator() -> Allocator<MockDevice> {
        Allocator::new(MockDevice::new(), &AllocatorDesc::default()).unwrap()
    }

    #[test]
    fn test_create_pool_with_min_blocks() {
        let a = allocator();
        let pool = a
            .create_pool(
                &PoolDesc::new(HeapType::Default)
                    .with_block_size(1 << 20)
                    .with_block_counts(2, 8),
            )
            .unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.block_bytes, 2 << 20);
        assert_eq!(stats.allocation_count, 0);
    }

    #[test]
    fn test_pool_validation() {
        let a = allocator();
        assert!(matches!(
            a.create_pool(&PoolDesc::new(HeapType::Default).with_block_counts(4, 2)),
            Err(Error::InvalidArgument(_))
        ));
        let mut desc = PoolDesc::new(HeapType::Default);
        desc.min_allocation_alignment = 3;
        assert!(matches!(
            a.create_pool(&desc),
            Err(Error::InvalidArgument(_))
        ));
        let desc = PoolDesc::new(HeapType::Default)
            .with_flags(PoolFlags::ALWAYS_COMMITTED)
            .with_block_counts(1, 0);
        assert!(matches!(
            a.create_pool(&desc),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pool_name_roundtrip() {
        let a = allocator();
        let pool = a.create_pool(&PoolDesc::new(HeapType::Upload)).unwrap();
        assert_eq!(pool.name(), None);
        pool.set_name(Some("staging"));
        assert_eq!(pool.name().as_deref(), Some("staging"));
        pool.set_name(None);
        assert_eq!(pool.name(), None);
    }

    #[test]
    fn test_pool_unregisters_on_drop() {
        let a = allocator();
        let pool = a.create_pool(&PoolDesc::new(HeapType::Default)).unwrap();
        assert_eq!(a.inner.pools_of(HeapType::Default).len(), 1);
        drop(pool);
        assert_eq!(a.inner.pools_of(HeapType::Default).len(), 0);
    }
}
