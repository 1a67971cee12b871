//! # heapalloc
//!
//! Heap-aware, budget-smart GPU memory suballocation for explicit graphics
//! APIs.
//!
//! ## Features
//!
//! - Placed vs. committed policy: suballocate big device heaps, fall back to
//!   dedicated resources when it pays off
//! - Two complete suballocators: TLSF (general purpose) and linear
//!   (ring / double-stack for frame-scoped data)
//! - Default pools per heap type (and per resource class on devices without
//!   unified resource heaps), plus user-configured custom pools
//! - Device budget tracking with lazy refresh and within-budget allocations
//! - Pass-based defragmentation (Fast / Balanced / Full)
//! - Statistics and JSON introspection of every block and allocation
//! - Virtual blocks: the allocator algorithms over plain offset ranges
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use heapalloc::{Allocator, AllocatorDesc, AllocationDesc, HeapType, ResourceDesc};
//!
//! let allocator = Allocator::new(device, &AllocatorDesc::default())?;
//!
//! let allocation = allocator.create_resource(
//!     &AllocationDesc::new(HeapType::Default),
//!     &ResourceDesc::buffer(64 * 1024),
//! )?;
//!
//! // ... bind, upload, draw ...
//!
//! allocator.free_allocation(allocation)?;
//! ```
//!
//! The device behind the allocator is anything implementing the [`Device`]
//! trait: heap creation, committed/placed resources, allocation-info and
//! budget queries.

#[macro_use]
extern crate bitflags;

/// Debug logging through the `log` crate when the `log` feature is enabled;
/// compiled out otherwise.
#[cfg(feature = "log")]
macro_rules! debug_log {
    ($($arg:tt)*) => { ::log::debug!($($arg)*) };
}
#[cfg(not(feature = "log"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}
pub(crate) use debug_log;

mod api;
mod core;
mod error;
mod json;
mod metadata;
mod sync;
mod util;

pub mod device;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::api::allocator::Allocator;
pub use crate::api::config::{
    AllocationDesc, AllocationFlags, AllocatorDesc, AllocatorFlags, DefragmentationDesc,
    DefragmentationFlags, PoolDesc, PoolFlags, VirtualAllocationDesc, VirtualAllocationFlags,
    VirtualBlockDesc, VirtualBlockFlags, DEFAULT_ALIGNMENT, DEFAULT_BLOCK_SIZE,
    DEFAULT_HEAP_ALIGNMENT, MSAA_HEAP_ALIGNMENT, SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
};
pub use crate::api::defrag::{
    DefragmentationContext, DefragmentationMove, DefragmentationMoveOperation,
    DefragmentationPassMoveInfo, DefragmentationStats,
};
pub use crate::api::pool::Pool;
pub use crate::api::virtual_block::{VirtualAllocation, VirtualAllocationInfo, VirtualBlock};
pub use crate::core::allocation::Allocation;
pub use crate::core::stats::{Budget, DetailedStatistics, Statistics, TotalStatistics};
pub use crate::device::{
    Device, FeatureInfo, Format, HeapDesc, HeapFlags, HeapType, MemorySegmentGroup,
    ResidencyPriority, ResourceAllocationInfo, ResourceDesc, ResourceDimension, ResourceFlags,
    VideoMemoryInfo,
};
pub use crate::error::{Error, Result};
