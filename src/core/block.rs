//! Memory blocks and block vectors.
//!
//! A [`MemoryBlock`] pairs one device heap with the metadata that carves it
//! up. A [`BlockVector`] owns a growing set of blocks with identical heap
//! properties, placing allocations first-fit across them in ascending
//! free-size order, creating blocks on demand (with size halving for young
//! vectors), and retaining at most one empty block as hysteresis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::budget::CurrentBudgetData;
use crate::core::stats::{DetailedStatistics, Statistics};
use crate::device::{Device, HeapDesc, HeapFlags, HeapType, MemorySegmentGroup, ResidencyPriority};
use crate::error::{Error, Result};
use crate::json::JsonWriter;
use crate::metadata::{AllocHandle, BlockMetadata, Strategy, DEBUG_MARGIN};
use crate::sync::RwMutex;

/// How many times a new block may be halved while looking for a size the
/// device will accept.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

/// One device heap plus its suballocation metadata.
pub(crate) struct MemoryBlock<D: Device> {
    pub id: u32,
    pub size: u64,
    pub heap: Arc<D::Heap>,
    pub metadata: BlockMetadata,
}

/// Immutable configuration of a block vector.
pub(crate) struct BlockVectorConfig {
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    pub preferred_block_size: u64,
    pub min_block_count: usize,
    pub max_block_count: usize,
    /// Fixed block size requested by the user; disables size halving.
    pub explicit_block_size: bool,
    pub min_allocation_alignment: u64,
    pub linear_algorithm: bool,
    pub heap_alignment: u64,
    pub residency_priority: Option<ResidencyPriority>,
}

pub(crate) struct VectorState<D: Device> {
    pub blocks: Vec<MemoryBlock<D>>,
    next_block_id: u32,
}

/// Everything a block vector needs from its owning allocator to talk to the
/// outside world.
pub(crate) struct VectorCtx<'a, D: Device> {
    pub device: &'a D,
    pub budget: &'a CurrentBudgetData,
    pub segment_group: MemorySegmentGroup,
}

/// Per-request knobs derived from the public allocation flags.
#[derive(Clone, Copy)]
pub(crate) struct VectorAllocParams {
    pub strategy: Strategy,
    pub upper_address: bool,
    pub never_allocate: bool,
    pub within_budget: bool,
    /// Whether the caller can fall back to a committed resource; influences
    /// the new-block policy under budget pressure.
    pub committed_allowed: bool,
}

/// A successful placement inside one of the vector's blocks.
pub(crate) struct BlockAllocation<D: Device> {
    pub block_id: u32,
    pub handle: AllocHandle,
    pub offset: u64,
    pub heap: Arc<D::Heap>,
}

impl<D: Device> std::fmt::Debug for BlockAllocation<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocation")
            .field("block_id", &self.block_id)
            .field("handle", &self.handle)
            .field("offset", &self.offset)
            .finish()
    }
}

pub(crate) struct BlockVector<D: Device> {
    pub config: BlockVectorConfig,
    pub state: RwMutex<VectorState<D>>,
    incremental_sort_enabled: AtomicBool,
}

impl<D: Device> BlockVector<D> {
    pub fn new(config: BlockVectorConfig) -> Self {
        debug_assert!(config.preferred_block_size > 0);
        Self {
            config,
            state: RwMutex::new(VectorState {
                blocks: Vec::new(),
                next_block_id: 0,
            }),
            incremental_sort_enabled: AtomicBool::new(true),
        }
    }

    pub fn set_incremental_sort_enabled(&self, enabled: bool) {
        self.incremental_sort_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Pre-create the configured minimum number of blocks.
    pub fn create_min_blocks(&self, ctx: &VectorCtx<'_, D>) -> Result<()> {
        let mut state = self.state.write();
        while state.blocks.len() < self.config.min_block_count {
            self.create_block(&mut state, ctx, self.config.preferred_block_size)?;
        }
        Ok(())
    }

    /// Perform `count` independent placements under one write lock. On any
    /// failure every placement already made is rolled back.
    pub fn allocate(
        &self,
        ctx: &VectorCtx<'_, D>,
        size: u64,
        alignment: u64,
        params: &VectorAllocParams,
        count: usize,
    ) -> Result<Vec<BlockAllocation<D>>> {
        let mut state = self.state.write();
        let mut done: Vec<BlockAllocation<D>> = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_page(&mut state, ctx, size, alignment, params) {
                Ok(allocation) => done.push(allocation),
                Err(e) => {
                    for a in done.drain(..) {
                        self.free_inner(&mut state, ctx, a.block_id, a.handle, false);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    fn allocate_page(
        &self,
        state: &mut VectorState<D>,
        ctx: &VectorCtx<'_, D>,
        size: u64,
        alignment: u64,
        params: &VectorAllocParams,
    ) -> Result<BlockAllocation<D>> {
        if size + DEBUG_MARGIN > self.config.preferred_block_size {
            return Err(Error::OutOfMemory);
        }

        let budget = ctx.budget.get_budget(ctx.device, ctx.segment_group)?;
        let free_memory = budget.budget_bytes.saturating_sub(budget.usage_bytes);
        // When over budget we prefer committed fallback over growing the
        // vector; when there is no fallback, growing is the only option left,
        // unless the request explicitly demanded to stay within budget.
        let can_create_new_block = !params.never_allocate
            && state.blocks.len() < self.config.max_block_count
            && (free_memory >= size || !params.committed_allowed)
            && !(params.within_budget && free_memory < size);

        // Blocks are kept sorted by ascending free size, so this walk is a
        // cheap approximation of best-fit.
        for index in 0..state.blocks.len() {
            if let Some(allocation) = self.allocate_from_block(state, index, size, alignment, params)
            {
                return Ok(allocation);
            }
        }

        if !can_create_new_block {
            return Err(Error::OutOfMemory);
        }

        // Young vectors start with halved block sizes so tiny pools do not
        // commit a full preferred-size heap up front.
        let mut new_block_size = self.config.preferred_block_size;
        let mut shift = 0u32;
        if !self.config.explicit_block_size {
            let max_existing = state.blocks.iter().map(|b| b.size).max().unwrap_or(0);
            for _ in 0..NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller > max_existing && smaller >= size * 2 {
                    new_block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        let block_index = loop {
            match self.create_block(state, ctx, new_block_size) {
                Ok(index) => break index,
                Err(e) => {
                    if self.config.explicit_block_size || shift >= NEW_BLOCK_SIZE_SHIFT_MAX {
                        return Err(e);
                    }
                    let smaller = new_block_size / 2;
                    if smaller < size + DEBUG_MARGIN {
                        return Err(e);
                    }
                    new_block_size = smaller;
                    shift += 1;
                }
            }
        };

        self.allocate_from_block(state, block_index, size, alignment, params)
            .ok_or(Error::OutOfMemory)
    }

    fn allocate_from_block(
        &self,
        state: &mut VectorState<D>,
        block_index: usize,
        size: u64,
        alignment: u64,
        params: &VectorAllocParams,
    ) -> Option<BlockAllocation<D>> {
        let alignment = alignment.max(self.config.min_allocation_alignment);
        let block = &mut state.blocks[block_index];
        let request = block.metadata.create_allocation_request(
            size,
            alignment,
            params.upper_address,
            params.strategy,
        )?;
        block.metadata.alloc(&request, 0);
        block.metadata.validate_heavy();
        Some(BlockAllocation {
            block_id: block.id,
            handle: request.handle,
            offset: block.metadata.allocation_offset(request.handle),
            heap: Arc::clone(&block.heap),
        })
    }

    fn create_block(
        &self,
        state: &mut VectorState<D>,
        ctx: &VectorCtx<'_, D>,
        block_size: u64,
    ) -> Result<usize> {
        let heap = ctx.device.create_heap(&HeapDesc {
            size: block_size,
            heap_type: self.config.heap_type,
            alignment: self.config.heap_alignment,
            flags: self.config.heap_flags,
        })?;
        if let Some(priority) = self.config.residency_priority {
            ctx.device.set_heap_residency_priority(&heap, priority)?;
        }
        ctx.budget.add_block(ctx.segment_group, block_size);

        let id = state.next_block_id;
        state.next_block_id += 1;
        let metadata = if self.config.linear_algorithm {
            BlockMetadata::new_linear(block_size)
        } else {
            BlockMetadata::new_tlsf(block_size, false)
        };
        crate::debug_log!("created block {} of {} bytes", id, block_size);
        state.blocks.push(MemoryBlock {
            id,
            size: block_size,
            heap: Arc::new(heap),
            metadata,
        });
        Ok(state.blocks.len() - 1)
    }

    /// Release one suballocation and apply the empty-block hysteresis.
    /// Returns true if a block was destroyed.
    pub fn free(&self, ctx: &VectorCtx<'_, D>, block_id: u32, handle: AllocHandle) -> bool {
        // Device budget is consulted before taking the write lock.
        let budget_exceeded = ctx
            .budget
            .get_budget(ctx.device, ctx.segment_group)
            .map(|b| b.usage_bytes >= b.budget_bytes)
            .unwrap_or(false);
        let mut state = self.state.write();
        self.free_inner(&mut state, ctx, block_id, handle, budget_exceeded)
    }

    fn free_inner(
        &self,
        state: &mut VectorState<D>,
        ctx: &VectorCtx<'_, D>,
        block_id: u32,
        handle: AllocHandle,
        budget_exceeded: bool,
    ) -> bool {
        let index = state
            .blocks
            .iter()
            .position(|b| b.id == block_id)
            .expect("allocation freed into a foreign block vector");
        let block = &mut state.blocks[index];
        block.metadata.free(handle);
        block.metadata.validate_heavy();

        let mut destroyed = false;
        let over_min = state.blocks.len() > self.config.min_block_count;
        if state.blocks[index].metadata.is_empty() {
            let other_empty = state
                .blocks
                .iter()
                .enumerate()
                .any(|(i, b)| i != index && b.metadata.is_empty());
            // Keep one empty block around to avoid re-creating a heap on the
            // next allocation, unless budget pressure says otherwise.
            if (other_empty || budget_exceeded) && over_min {
                let block = state.blocks.remove(index);
                ctx.budget.remove_block(ctx.segment_group, block.size);
                crate::debug_log!("destroyed empty block {}", block.id);
                destroyed = true;
            }
        }

        self.incrementally_sort_blocks(state);
        destroyed
    }

    /// One bubble-sort pass by ascending free size, stopping after the first
    /// swap.
    fn incrementally_sort_blocks(&self, state: &mut VectorState<D>) {
        if !self.incremental_sort_enabled.load(Ordering::Relaxed) {
            return;
        }
        for i in 1..state.blocks.len() {
            if state.blocks[i - 1].metadata.sum_free_size()
                > state.blocks[i].metadata.sum_free_size()
            {
                state.blocks.swap(i - 1, i);
                return;
            }
        }
    }

    /// Full sort by ascending free size (defragmentation setup).
    pub fn sort_by_free_size(&self) {
        let mut state = self.state.write();
        state
            .blocks
            .sort_by_key(|b| b.metadata.sum_free_size());
    }

    pub fn set_allocation_user_data(&self, block_id: u32, handle: AllocHandle, user_data: u64) {
        let mut state = self.state.write();
        let block = state
            .blocks
            .iter_mut()
            .find(|b| b.id == block_id)
            .expect("unknown block id");
        block.metadata.set_allocation_user_data(handle, user_data);
    }

    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn calc_sum_block_size(&self) -> u64 {
        self.state.read().blocks.iter().map(|b| b.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().blocks.iter().all(|b| b.metadata.is_empty())
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        let state = self.state.read();
        for block in state.blocks.iter() {
            block.metadata.add_statistics(stats);
        }
    }

    pub fn add_detailed_statistics(&self, detailed: &mut DetailedStatistics) {
        let state = self.state.read();
        for block in state.blocks.iter() {
            block.metadata.add_detailed_statistics(detailed);
        }
    }

    /// Emit `{"<block id>": {...}}` maps for the detailed stats string.
    pub fn write_blocks_json(
        &self,
        json: &mut JsonWriter<'_>,
        extra: &dyn Fn(&mut JsonWriter<'_>, u64),
    ) {
        let state = self.state.read();
        json.begin_object();
        for block in state.blocks.iter() {
            json.write_key(&block.id.to_string());
            block.metadata.write_allocation_info_json(json, extra);
        }
        json.end_object();
    }

    pub fn validate(&self) {
        let state = self.state.read();
        let mut empty_count = 0;
        for block in state.blocks.iter() {
            block.metadata.validate();
            debug_assert_eq!(block.metadata.size(), block.size);
            if block.metadata.is_empty() {
                empty_count += 1;
            }
        }
        assert!(empty_count <= 1, "at most one empty block may be retained");
    }
}
