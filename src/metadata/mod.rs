//! Suballocation bookkeeping for a single heap.
//!
//! Two complete algorithms are provided: [`linear`] (ring / double-stack, for
//! frame-scoped or monotonically produced allocations) and [`tlsf`]
//! (two-level segregated fit, the general-purpose default). A metadata
//! instance never touches device memory - it only decides offsets - which is
//! also what makes virtual blocks possible.

pub mod linear;
pub mod tlsf;

use std::num::NonZeroU64;

use crate::core::stats::{DetailedStatistics, Statistics};
use crate::json::JsonWriter;

use linear::LinearMetadata;
use tlsf::TlsfMetadata;

/// Margin kept free before and after every suballocation for overrun
/// detection. Zero unless the `debug` feature is enabled.
#[cfg(feature = "debug")]
pub(crate) const DEBUG_MARGIN: u64 = 16;
#[cfg(not(feature = "debug"))]
pub(crate) const DEBUG_MARGIN: u64 = 0;

/// Opaque handle to one suballocation inside a block.
///
/// The payload is algorithm-specific (an offset for the linear algorithm, an
/// arena index for TLSF); callers must never do arithmetic on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AllocHandle(NonZeroU64);

impl AllocHandle {
    #[inline]
    pub(crate) fn new(raw: u64) -> Self {
        Self(NonZeroU64::new(raw).expect("alloc handle payload must be nonzero"))
    }

    #[inline]
    pub(crate) fn raw(self) -> u64 {
        self.0.get()
    }
}

/// Placement strategy, decoded from the public STRATEGY_* allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Hybrid of MinTime and MinMemory.
    Default,
    /// Prefer the fastest path to a fit.
    MinTime,
    /// Prefer the tightest fit.
    MinMemory,
    /// Prefer the lowest offset. Used by defragmentation.
    MinOffset,
}

/// How an allocation request is to be committed, produced by
/// `create_allocation_request` and consumed by `alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Linear: append to the first suballocation vector.
    EndOf1st,
    /// Linear: wrap around into the second vector (ring buffer).
    EndOf2nd,
    /// Linear: push onto the upper-address stack.
    UpperAddress,
    /// TLSF: place at this exact offset inside the chosen free block.
    TlsfAt(u64),
}

/// A planned placement inside one block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AllocationRequest {
    pub handle: AllocHandle,
    /// Net allocation size, excluding any debug margin.
    pub size: u64,
    pub kind: RequestKind,
}

/// One region reported by metadata iteration, in address order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    pub offset: u64,
    pub size: u64,
    /// `None` for free regions, otherwise the suballocation's user data.
    pub user_data: Option<u64>,
}

/// Offset, size and user data of one live suballocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuballocInfo {
    pub offset: u64,
    pub size: u64,
    pub user_data: u64,
}

/// The suballocator of one heap: a sum of the two algorithms.
pub(crate) enum BlockMetadata {
    Linear(LinearMetadata),
    Tlsf(TlsfMetadata),
}

impl BlockMetadata {
    pub fn new_linear(size: u64) -> Self {
        BlockMetadata::Linear(LinearMetadata::new(size))
    }

    pub fn new_tlsf(size: u64, is_virtual: bool) -> Self {
        BlockMetadata::Tlsf(TlsfMetadata::new(size, is_virtual))
    }

    pub fn size(&self) -> u64 {
        match self {
            BlockMetadata::Linear(m) => m.size(),
            BlockMetadata::Tlsf(m) => m.size(),
        }
    }

    pub fn sum_free_size(&self) -> u64 {
        match self {
            BlockMetadata::Linear(m) => m.sum_free_size(),
            BlockMetadata::Tlsf(m) => m.sum_free_size(),
        }
    }

    pub fn allocation_count(&self) -> u32 {
        match self {
            BlockMetadata::Linear(m) => m.allocation_count(),
            BlockMetadata::Tlsf(m) => m.allocation_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    /// Plan a placement. Returns `None` when the block cannot satisfy the
    /// request; the caller then moves on to the next block.
    pub fn create_allocation_request(
        &mut self,
        size: u64,
        alignment: u64,
        upper_address: bool,
        strategy: Strategy,
    ) -> Option<AllocationRequest> {
        match self {
            BlockMetadata::Linear(m) => m.create_allocation_request(size, alignment, upper_address),
            BlockMetadata::Tlsf(m) => {
                assert!(
                    !upper_address,
                    "upper-address allocation is not supported by the TLSF algorithm"
                );
                m.create_allocation_request(size, alignment, strategy)
            }
        }
    }

    /// Commit a previously planned request.
    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        match self {
            BlockMetadata::Linear(m) => m.alloc(request, user_data),
            BlockMetadata::Tlsf(m) => m.alloc(request, user_data),
        }
    }

    pub fn free(&mut self, handle: AllocHandle) {
        match self {
            BlockMetadata::Linear(m) => m.free(handle),
            BlockMetadata::Tlsf(m) => m.free(handle),
        }
    }

    pub fn clear(&mut self) {
        match self {
            BlockMetadata::Linear(m) => m.clear(),
            BlockMetadata::Tlsf(m) => m.clear(),
        }
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> SuballocInfo {
        match self {
            BlockMetadata::Linear(m) => m.allocation_info(handle),
            BlockMetadata::Tlsf(m) => m.allocation_info(handle),
        }
    }

    pub fn allocation_offset(&self, handle: AllocHandle) -> u64 {
        match self {
            BlockMetadata::Linear(m) => m.allocation_offset(handle),
            BlockMetadata::Tlsf(m) => m.allocation_info(handle).offset,
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        match self {
            BlockMetadata::Linear(m) => m.set_allocation_user_data(handle, user_data),
            BlockMetadata::Tlsf(m) => m.set_allocation_user_data(handle, user_data),
        }
    }

    /// First live allocation in physical order, for defragmentation. Only the
    /// TLSF algorithm supports iteration; linear blocks are not
    /// defragmentable.
    pub fn allocation_list_begin(&self) -> Option<AllocHandle> {
        match self {
            BlockMetadata::Linear(_) => unreachable!("linear blocks are not defragmentable"),
            BlockMetadata::Tlsf(m) => m.allocation_list_begin(),
        }
    }

    pub fn next_allocation(&self, handle: AllocHandle) -> Option<AllocHandle> {
        match self {
            BlockMetadata::Linear(_) => unreachable!("linear blocks are not defragmentable"),
            BlockMetadata::Tlsf(m) => m.next_allocation(handle),
        }
    }

    /// Size of the free region physically preceding `handle`, or 0.
    pub fn next_free_region_size(&self, handle: AllocHandle) -> u64 {
        match self {
            BlockMetadata::Linear(_) => unreachable!("linear blocks are not defragmentable"),
            BlockMetadata::Tlsf(m) => m.next_free_region_size(handle),
        }
    }

    pub fn free_regions_count(&self) -> u32 {
        match self {
            BlockMetadata::Linear(_) => unreachable!("linear blocks are not defragmentable"),
            BlockMetadata::Tlsf(m) => m.free_regions_count(),
        }
    }

    /// Walk every region of the block in address order, free gaps included.
    pub fn for_each_region(&self, f: &mut dyn FnMut(Region)) {
        match self {
            BlockMetadata::Linear(m) => m.for_each_region(f),
            BlockMetadata::Tlsf(m) => m.for_each_region(f),
        }
    }

    /// Exhaustive structural check. Panics on any broken invariant.
    pub fn validate(&self) {
        match self {
            BlockMetadata::Linear(m) => m.validate(),
            BlockMetadata::Tlsf(m) => m.validate(),
        }
    }

    #[inline]
    pub fn validate_heavy(&self) {
        #[cfg(feature = "debug")]
        self.validate();
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        stats.block_count += 1;
        stats.block_bytes += self.size();
        stats.allocation_count += self.allocation_count();
        stats.allocation_bytes += self.size() - self.sum_free_size();
    }

    pub fn add_detailed_statistics(&self, detailed: &mut DetailedStatistics) {
        detailed.stats.block_count += 1;
        detailed.stats.block_bytes += self.size();
        self.for_each_region(&mut |region| match region.user_data {
            Some(_) => detailed.add_allocation(region.size),
            None => detailed.add_unused_range(region.size),
        });
    }

    /// Emit this block's suballocation map. `extra` is invoked inside every
    /// allocation object so the caller can append fields resolved from the
    /// suballocation's user data (name, private data).
    pub fn write_allocation_info_json(
        &self,
        json: &mut JsonWriter<'_>,
        extra: &dyn Fn(&mut JsonWriter<'_>, u64),
    ) {
        let mut detailed = DetailedStatistics::default();
        self.add_detailed_statistics(&mut detailed);

        json.begin_object();
        json.write_key("TotalBytes");
        json.write_u64(self.size());
        json.write_key("UnusedBytes");
        json.write_u64(self.sum_free_size());
        json.write_key("Allocations");
        json.write_u32(detailed.stats.allocation_count);
        json.write_key("UnusedRanges");
        json.write_u32(detailed.unused_range_count);
        json.write_key("Suballocations");
        json.begin_array();
        self.for_each_region(&mut |region| {
            json.begin_object();
            json.write_key("Offset");
            json.write_u64(region.offset);
            match region.user_data {
                Some(user_data) => {
                    json.write_key("Type");
                    json.write_string("ALLOCATION");
                    json.write_key("Size");
                    json.write_u64(region.size);
                    extra(json, user_data);
                }
                None => {
                    json.write_key("Type");
                    json.write_string("FREE");
                    json.write_key("Size");
                    json.write_u64(region.size);
                }
            }
            json.end_object();
        });
        json.end_array();
        json.end_object();
    }
}
