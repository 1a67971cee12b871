//! Budget accounting.
//!
//! Heap and allocation byte tallies are kept in atomics, updated on every
//! create/destroy. The device's own usage/budget numbers are fetched lazily:
//! after [`OPERATIONS_PER_BUDGET_FETCH`] mutations the next budget query
//! refreshes the snapshot, and between refreshes usage is extrapolated from
//! the heap bytes this allocator added or removed since the fetch.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::core::stats::{Budget, Statistics};
use crate::device::{Device, MemorySegmentGroup};
use crate::error::Result;
use crate::sync::RwMutex;

/// Number of alloc/free operations after which the next budget query
/// re-fetches device usage numbers.
const OPERATIONS_PER_BUDGET_FETCH: u32 = 30;

#[derive(Default)]
struct FetchedBudget {
    device_usage: [u64; 2],
    device_budget: [u64; 2],
    /// Our own heap bytes at the moment of the fetch, used to extrapolate.
    block_bytes_at_fetch: [u64; 2],
}

pub(crate) struct CurrentBudgetData {
    block_bytes: [AtomicU64; 2],
    allocation_bytes: [AtomicU64; 2],
    block_count: [AtomicU32; 2],
    allocation_count: [AtomicU32; 2],
    operations_since_fetch: AtomicU32,
    fetched: RwMutex<FetchedBudget>,
}

impl CurrentBudgetData {
    pub fn new() -> Self {
        Self {
            block_bytes: [AtomicU64::new(0), AtomicU64::new(0)],
            allocation_bytes: [AtomicU64::new(0), AtomicU64::new(0)],
            block_count: [AtomicU32::new(0), AtomicU32::new(0)],
            allocation_count: [AtomicU32::new(0), AtomicU32::new(0)],
            operations_since_fetch: AtomicU32::new(OPERATIONS_PER_BUDGET_FETCH),
            fetched: RwMutex::new(FetchedBudget::default()),
        }
    }

    pub fn add_block(&self, group: MemorySegmentGroup, size: u64) {
        let g = group as usize;
        self.block_bytes[g].fetch_add(size, Ordering::Relaxed);
        self.block_count[g].fetch_add(1, Ordering::Relaxed);
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_block(&self, group: MemorySegmentGroup, size: u64) {
        let g = group as usize;
        self.block_bytes[g].fetch_sub(size, Ordering::Relaxed);
        self.block_count[g].fetch_sub(1, Ordering::Relaxed);
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_allocation(&self, group: MemorySegmentGroup, size: u64) {
        let g = group as usize;
        self.allocation_bytes[g].fetch_add(size, Ordering::Relaxed);
        self.allocation_count[g].fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_allocation(&self, group: MemorySegmentGroup, size: u64) {
        let g = group as usize;
        self.allocation_bytes[g].fetch_sub(size, Ordering::Relaxed);
        self.allocation_count[g].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn block_bytes(&self, group: MemorySegmentGroup) -> u64 {
        self.block_bytes[group as usize].load(Ordering::Relaxed)
    }

    pub fn allocation_bytes(&self, group: MemorySegmentGroup) -> u64 {
        self.allocation_bytes[group as usize].load(Ordering::Relaxed)
    }

    fn statistics(&self, group: MemorySegmentGroup) -> Statistics {
        let g = group as usize;
        Statistics {
            block_count: self.block_count[g].load(Ordering::Relaxed),
            allocation_count: self.allocation_count[g].load(Ordering::Relaxed),
            block_bytes: self.block_bytes[g].load(Ordering::Relaxed),
            allocation_bytes: self.allocation_bytes[g].load(Ordering::Relaxed),
        }
    }

    fn should_fetch(&self) -> bool {
        self.operations_since_fetch.load(Ordering::Relaxed) >= OPERATIONS_PER_BUDGET_FETCH
    }

    /// Refresh the device snapshot if enough operations happened since the
    /// last fetch, then report the budget for `group`.
    pub fn get_budget<D: Device>(&self, device: &D, group: MemorySegmentGroup) -> Result<Budget> {
        if self.should_fetch() {
            self.fetch(device)?;
        }
        let g = group as usize;
        let fetched = self.fetched.read();
        let block_bytes = self.block_bytes(group);
        // Extrapolate device usage by what we allocated or freed since the
        // snapshot was taken.
        let usage = (fetched.device_usage[g] + block_bytes)
            .saturating_sub(fetched.block_bytes_at_fetch[g]);
        Ok(Budget {
            stats: self.statistics(group),
            usage_bytes: usage,
            budget_bytes: fetched.device_budget[g],
        })
    }

    fn fetch<D: Device>(&self, device: &D) -> Result<()> {
        let local = device.query_video_memory_info(MemorySegmentGroup::Local)?;
        let nonlocal = device.query_video_memory_info(MemorySegmentGroup::NonLocal)?;
        crate::debug_log!(
            "budget refresh: local {}/{}, nonlocal {}/{}",
            local.current_usage_bytes,
            local.budget_bytes,
            nonlocal.current_usage_bytes,
            nonlocal.budget_bytes
        );
        let mut fetched = self.fetched.write();
        fetched.device_usage = [local.current_usage_bytes, nonlocal.current_usage_bytes];
        fetched.device_budget = [local.budget_bytes, nonlocal.budget_bytes];
        fetched.block_bytes_at_fetch = [
            self.block_bytes(MemorySegmentGroup::Local),
            self.block_bytes(MemorySegmentGroup::NonLocal),
        ];
        self.operations_since_fetch.store(0, Ordering::Relaxed);
        Ok(())
    }
}
