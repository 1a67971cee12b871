//! Allocation statistics.
//!
//! `Statistics` is the cheap counter set kept up to date on every operation;
//! `DetailedStatistics` adds min/max tracking over allocation and unused-range
//! sizes and is computed by walking metadata. Both merge additively.

use crate::device::{HeapType, MemorySegmentGroup, HEAP_TYPE_COUNT};

/// Basic counters for a set of heaps and the allocations inside them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of device heaps counted.
    pub block_count: u32,
    /// Number of live suballocations plus dedicated allocations.
    pub allocation_count: u32,
    /// Total bytes of the counted heaps.
    pub block_bytes: u64,
    /// Bytes occupied by live allocations. Always <= `block_bytes`.
    pub allocation_bytes: u64,
}

impl Statistics {
    pub(crate) fn add(&mut self, other: &Statistics) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.block_bytes += other.block_bytes;
        self.allocation_bytes += other.allocation_bytes;
    }
}

/// Statistics with distribution information, computed on demand.
#[derive(Debug, Clone, Copy)]
pub struct DetailedStatistics {
    pub stats: Statistics,
    /// Number of free regions between allocations.
    pub unused_range_count: u32,
    /// Smallest live allocation, or `u64::MAX` if there are none.
    pub allocation_size_min: u64,
    pub allocation_size_max: u64,
    /// Smallest free region, or `u64::MAX` if there are none.
    pub unused_range_size_min: u64,
    pub unused_range_size_max: u64,
}

impl Default for DetailedStatistics {
    fn default() -> Self {
        Self {
            stats: Statistics::default(),
            unused_range_count: 0,
            allocation_size_min: u64::MAX,
            allocation_size_max: 0,
            unused_range_size_min: u64::MAX,
            unused_range_size_max: 0,
        }
    }
}

impl DetailedStatistics {
    pub(crate) fn add_allocation(&mut self, size: u64) {
        self.stats.allocation_count += 1;
        self.stats.allocation_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    pub(crate) fn add_unused_range(&mut self, size: u64) {
        self.unused_range_count += 1;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    /// Count one dedicated (committed or heap) allocation: its heap and its
    /// single allocation are the same bytes.
    pub(crate) fn add_dedicated(&mut self, size: u64) {
        self.stats.block_count += 1;
        self.stats.block_bytes += size;
        self.add_allocation(size);
    }

    pub(crate) fn add(&mut self, other: &DetailedStatistics) {
        self.stats.add(&other.stats);
        self.unused_range_count += other.unused_range_count;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    pub(crate) fn write_json(&self, json: &mut crate::json::JsonWriter<'_>) {
        json.begin_object();
        json.write_key("BlockCount");
        json.write_u32(self.stats.block_count);
        json.write_key("BlockBytes");
        json.write_u64(self.stats.block_bytes);
        json.write_key("AllocationCount");
        json.write_u32(self.stats.allocation_count);
        json.write_key("AllocationBytes");
        json.write_u64(self.stats.allocation_bytes);
        json.write_key("UnusedRangeCount");
        json.write_u32(self.unused_range_count);
        // Min/max are meaningless sentinels when nothing was counted.
        if self.stats.allocation_count > 0 {
            json.write_key("AllocationSizeMin");
            json.write_u64(self.allocation_size_min);
            json.write_key("AllocationSizeMax");
            json.write_u64(self.allocation_size_max);
        }
        if self.unused_range_count > 0 {
            json.write_key("UnusedRangeSizeMin");
            json.write_u64(self.unused_range_size_min);
            json.write_key("UnusedRangeSizeMax");
            json.write_u64(self.unused_range_size_max);
        }
        json.end_object();
    }
}

/// Statistics for the whole allocator, broken down two ways.
#[derive(Debug, Clone, Default)]
pub struct TotalStatistics {
    /// Indexed by [`HeapType`] discriminant order.
    pub heap_type: [DetailedStatistics; HEAP_TYPE_COUNT],
    /// Indexed by [`MemorySegmentGroup`]: 0 = Local, 1 = NonLocal.
    pub memory_segment_group: [DetailedStatistics; 2],
    pub total: DetailedStatistics,
}

impl TotalStatistics {
    pub(crate) fn add_to_heap_type(
        &mut self,
        heap_type: HeapType,
        group: MemorySegmentGroup,
        detailed: &DetailedStatistics,
    ) {
        self.heap_type[heap_type as usize].add(detailed);
        self.memory_segment_group[group as usize].add(detailed);
        self.total.add(detailed);
    }
}

/// Budget of one memory segment group, as last fetched from the device and
/// adjusted for heaps created or destroyed since.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    /// Heap/allocation counters maintained by this allocator.
    pub stats: Statistics,
    /// Estimated current usage of the whole segment group, including other
    /// processes.
    pub usage_bytes: u64,
    /// OS-provided budget the process should stay under.
    pub budget_bytes: u64,
}
