//! Allocator configuration: flag enums, creation descriptions, and the
//! policy constants they default to.

use crate::device::{HeapFlags, HeapType, ResidencyPriority};
use crate::util::size::{kb, mb};

/// Default size of a block allocated as a single device heap.
pub const DEFAULT_BLOCK_SIZE: u64 = mb(64);

/// Default alignment of suballocations in default pools and custom pools with
/// `min_allocation_alignment == 0`.
pub const DEFAULT_ALIGNMENT: u64 = 256;

/// Default heap alignment.
pub const DEFAULT_HEAP_ALIGNMENT: u64 = kb(64);

/// Heap alignment when the heap may contain MSAA textures.
pub const MSAA_HEAP_ALIGNMENT: u64 = mb(4);

/// Alignment the allocator tries to obtain for small non-RT/DS textures.
pub const SMALL_RESOURCE_PLACEMENT_ALIGNMENT: u64 = kb(4);

/// Buffers at or below this size prefer committed resources (unless
/// [`AllocatorFlags::DONT_PREFER_SMALL_BUFFERS_COMMITTED`]).
pub const SMALL_BUFFER_COMMITTED_SIZE: u64 = kb(32);

bitflags! {
    /// Flags configuring the whole allocator.
    pub struct AllocatorFlags: u32 {
        const NONE = 0;
        /// Caller promises external synchronization. Kept for flag
        /// compatibility; lock elision itself is the compile-time
        /// `single_threaded` feature.
        const SINGLE_THREADED = 0x1;
        /// Every allocation becomes a committed resource or dedicated heap.
        const ALWAYS_COMMITTED = 0x2;
        /// Heaps of the default pools skip zero-initialization when the
        /// device supports it.
        const DEFAULT_POOLS_NOT_ZEROED = 0x4;
        /// MSAA textures always get their own committed resource.
        const MSAA_TEXTURES_ALWAYS_COMMITTED = 0x8;
        /// Disable the heuristic that places small buffers as committed.
        const DONT_PREFER_SMALL_BUFFERS_COMMITTED = 0x10;
        /// Do not ask the device for tightened allocation sizes even when
        /// supported.
        const DONT_USE_TIGHT_ALIGNMENT = 0x20;
    }
}

bitflags! {
    /// Flags for a single allocation.
    pub struct AllocationFlags: u32 {
        const NONE = 0;
        /// Allocate as a committed resource / dedicated heap.
        const COMMITTED = 0x1;
        /// Only suballocate from existing blocks; never create new heaps or
        /// committed resources.
        const NEVER_ALLOCATE = 0x2;
        /// Fail with OutOfMemory instead of exceeding the device budget.
        const WITHIN_BUDGET = 0x4;
        /// Place at the highest available offset (linear pools only).
        const UPPER_ADDRESS = 0x8;
        /// The allocation may host aliasing resources.
        const CAN_ALIAS = 0x10;
        /// Prefer the tightest fit.
        const STRATEGY_MIN_MEMORY = 0x0001_0000;
        /// Prefer the fastest placement search.
        const STRATEGY_MIN_TIME = 0x0002_0000;
        /// Prefer the lowest offset.
        const STRATEGY_MIN_OFFSET = 0x0004_0000;
        const STRATEGY_MASK = 0x000F_0000;
    }
}

bitflags! {
    /// Flags for a custom pool.
    pub struct PoolFlags: u32 {
        const NONE = 0;
        /// Use the linear (ring / double-stack) algorithm.
        const ALGORITHM_LINEAR = 0x1;
        /// MSAA textures in this pool always get committed resources.
        const MSAA_TEXTURES_ALWAYS_COMMITTED = 0x2;
        /// Every allocation in this pool is committed; the pool keeps no
        /// block vector.
        const ALWAYS_COMMITTED = 0x4;
    }
}

bitflags! {
    /// Defragmentation algorithm selection. Empty flags mean Balanced.
    pub struct DefragmentationFlags: u32 {
        const ALGORITHM_FAST = 0x1;
        const ALGORITHM_BALANCED = 0x2;
        const ALGORITHM_FULL = 0x4;
    }
}

bitflags! {
    /// Flags for a virtual block.
    pub struct VirtualBlockFlags: u32 {
        const NONE = 0;
        /// Use the linear (ring / double-stack) algorithm.
        const ALGORITHM_LINEAR = 0x1;
    }
}

bitflags! {
    /// Flags for a virtual allocation.
    pub struct VirtualAllocationFlags: u32 {
        const NONE = 0;
        /// Place at the highest available offset (linear blocks only).
        const UPPER_ADDRESS = 0x8;
        const STRATEGY_MIN_MEMORY = 0x0001_0000;
        const STRATEGY_MIN_TIME = 0x0002_0000;
        const STRATEGY_MIN_OFFSET = 0x0004_0000;
    }
}

/// Parameters for [`Allocator::new`](crate::Allocator::new).
#[derive(Debug, Clone)]
pub struct AllocatorDesc {
    pub flags: AllocatorFlags,
    /// Preferred size of blocks in the default pools; 0 means
    /// [`DEFAULT_BLOCK_SIZE`].
    pub preferred_block_size: u64,
}

impl Default for AllocatorDesc {
    fn default() -> Self {
        Self {
            flags: AllocatorFlags::NONE,
            preferred_block_size: 0,
        }
    }
}

impl AllocatorDesc {
    /// Builder pattern: set allocator flags.
    pub fn with_flags(mut self, flags: AllocatorFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builder pattern: set the preferred default-pool block size.
    pub fn with_preferred_block_size(mut self, size: u64) -> Self {
        self.preferred_block_size = size;
        self
    }
}

/// Parameters of a single allocation request.
#[derive(Clone)]
pub struct AllocationDesc<'a, D: crate::device::Device> {
    pub flags: AllocationFlags,
    /// Target heap type; ignored when `pool` is set.
    pub heap_type: HeapType,
    /// Extra flags for heaps created on behalf of this allocation.
    pub extra_heap_flags: HeapFlags,
    /// Custom pool to allocate from instead of the default pools.
    pub pool: Option<&'a crate::api::pool::Pool<D>>,
}

impl<'a, D: crate::device::Device> AllocationDesc<'a, D> {
    pub fn new(heap_type: HeapType) -> Self {
        Self {
            flags: AllocationFlags::NONE,
            heap_type,
            extra_heap_flags: HeapFlags::NONE,
            pool: None,
        }
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_pool(mut self, pool: &'a crate::api::pool::Pool<D>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Parameters for creating a custom pool.
#[derive(Debug, Clone)]
pub struct PoolDesc {
    pub flags: PoolFlags,
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    /// Fixed block size; 0 lets the pool pick and halve sizes freely.
    pub block_size: u64,
    pub min_block_count: usize,
    /// 0 means unlimited.
    pub max_block_count: usize,
    /// Minimum alignment applied on top of per-request alignments; 0 means
    /// [`DEFAULT_ALIGNMENT`].
    pub min_allocation_alignment: u64,
    pub residency_priority: Option<ResidencyPriority>,
}

impl PoolDesc {
    pub fn new(heap_type: HeapType) -> Self {
        Self {
            flags: PoolFlags::NONE,
            heap_type,
            heap_flags: HeapFlags::NONE,
            block_size: 0,
            min_block_count: 0,
            max_block_count: 0,
            min_allocation_alignment: 0,
            residency_priority: None,
        }
    }

    pub fn with_flags(mut self, flags: PoolFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_block_counts(mut self, min: usize, max: usize) -> Self {
        self.min_block_count = min;
        self.max_block_count = max;
        self
    }
}

/// Parameters for starting a defragmentation context.
#[derive(Debug, Clone)]
pub struct DefragmentationDesc {
    pub flags: DefragmentationFlags,
    /// Byte budget for one pass; 0 means unlimited.
    pub max_bytes_per_pass: u64,
    /// Allocation-move budget for one pass; 0 means unlimited.
    pub max_allocations_per_pass: u32,
}

impl Default for DefragmentationDesc {
    fn default() -> Self {
        Self {
            flags: DefragmentationFlags::empty(),
            max_bytes_per_pass: 0,
            max_allocations_per_pass: 0,
        }
    }
}

/// Parameters for creating a virtual block.
#[derive(Debug, Clone)]
pub struct VirtualBlockDesc {
    pub flags: VirtualBlockFlags,
    pub size: u64,
}

impl VirtualBlockDesc {
    pub fn new(size: u64) -> Self {
        Self {
            flags: VirtualBlockFlags::NONE,
            size,
        }
    }
}

/// Parameters of one virtual allocation.
#[derive(Debug, Clone)]
pub struct VirtualAllocationDesc {
    pub size: u64,
    /// 0 means no alignment requirement.
    pub alignment: u64,
    pub flags: VirtualAllocationFlags,
    pub private_data: u64,
}

impl VirtualAllocationDesc {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            alignment: 0,
            flags: VirtualAllocationFlags::NONE,
            private_data: 0,
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}
