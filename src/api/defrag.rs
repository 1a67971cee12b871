//! Pass-based defragmentation.
//!
//! A context plans moves (`begin_pass`), the caller copies GPU data and
//! chooses an outcome per move, and `end_pass` commits: Copy swaps the source
//! allocation into its new location, Ignore marks the source block immovable
//! for the rest of the context, Destroy drops the allocation entirely.
//! Three planners are provided: Fast (move into earlier blocks), Balanced
//! (adds heuristic same-block compaction), Full (unconditional both).

use std::sync::Arc;

use crate::api::allocator::{Allocator, AllocatorInner};
use crate::api::config::{DefragmentationDesc, DefragmentationFlags};
use crate::api::pool::Pool;
use crate::core::allocation::{pack_allocation, unpack_allocation, Allocation, AllocationData, Place};
use crate::core::block::{BlockVector, VectorState};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::metadata::{RequestKind, Strategy};

/// Allocations that would overshoot the per-pass byte budget are skipped; the
/// pass ends after this many consecutive skips.
const MAX_ALLOCS_TO_IGNORE: u32 = 16;

/// What the caller decided to do with one planned move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragmentationMoveOperation {
    /// Data was copied; commit the relocation.
    Copy,
    /// Skip this move and never touch the source block again in this context.
    Ignore,
    /// Drop the source allocation instead of relocating it.
    Destroy,
}

/// One planned relocation.
#[derive(Debug, Clone, Copy)]
pub struct DefragmentationMove {
    pub operation: DefragmentationMoveOperation,
    pub src_allocation: Allocation,
    /// Temporary allocation holding the destination memory. Released by
    /// `end_pass`.
    pub dst_tmp_allocation: Allocation,
}

/// Moves planned by one `begin_pass`.
pub struct DefragmentationPassMoveInfo {
    pub moves: Vec<DefragmentationMove>,
}

/// Cumulative results of a defragmentation context.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefragmentationStats {
    pub bytes_moved: u64,
    pub bytes_freed: u64,
    pub allocations_moved: u32,
    pub heaps_freed: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Fast,
    Balanced,
    Full,
}

/// Running averages steering the Balanced planner, per vector.
struct StateBalanced {
    avg_alloc_size: u64,
    avg_free_size: u64,
}

struct InternalMove {
    vector_index: usize,
    src: Allocation,
    dst: Allocation,
    size: u64,
}

enum CounterStatus {
    Pass,
    Ignore,
    End,
}

pub struct DefragmentationContext<D: Device> {
    inner: Arc<AllocatorInner<D>>,
    algorithm: Algorithm,
    max_pass_bytes: u64,
    max_pass_allocations: u32,
    vectors: Vec<Arc<BlockVector<D>>>,
    /// Leading blocks of each vector excluded from further planning.
    immovable_block_count: Vec<usize>,
    balanced_states: Vec<StateBalanced>,
    moves: Vec<InternalMove>,
    ignored_allocs: u32,
    pass_stats: DefragmentationStats,
    global_stats: DefragmentationStats,
}

impl<D: Device> Allocator<D> {
    /// Start defragmenting the default pools.
    pub fn begin_defragmentation(&self, desc: &DefragmentationDesc) -> DefragmentationContext<D> {
        let vectors: Vec<_> = self
            .inner
            .default_pools
            .iter()
            .flatten()
            .cloned()
            .collect();
        DefragmentationContext::new(Arc::clone(&self.inner), desc, vectors)
    }
}

impl<D: Device> Pool<D> {
    /// Start defragmenting this pool. Linear pools cannot be defragmented.
    pub fn begin_defragmentation(
        &self,
        desc: &DefragmentationDesc,
    ) -> Result<DefragmentationContext<D>> {
        let inner = self.inner();
        if inner.block_vector.config.linear_algorithm {
            return Err(Error::InvalidArgument(
                "linear pools cannot be defragmented",
            ));
        }
        let allocator = inner
            .allocator
            .upgrade()
            .ok_or(Error::InvalidArgument("allocator was destroyed"))?;
        Ok(DefragmentationContext::new(
            allocator,
            desc,
            vec![Arc::clone(&inner.block_vector)],
        ))
    }
}

impl<D: Device> DefragmentationContext<D> {
    fn new(
        inner: Arc<AllocatorInner<D>>,
        desc: &DefragmentationDesc,
        vectors: Vec<Arc<BlockVector<D>>>,
    ) -> Self {
        let algorithm = if desc.flags.contains(DefragmentationFlags::ALGORITHM_FAST) {
            Algorithm::Fast
        } else if desc.flags.contains(DefragmentationFlags::ALGORITHM_FULL) {
            Algorithm::Full
        } else {
            Algorithm::Balanced
        };
        for vector in vectors.iter() {
            vector.set_incremental_sort_enabled(false);
            vector.sort_by_free_size();
        }
        let count = vectors.len();
        crate::debug_log!("defragmentation started over {} block vectors", count);
        Self {
            inner,
            algorithm,
            max_pass_bytes: if desc.max_bytes_per_pass == 0 {
                u64::MAX
            } else {
                desc.max_bytes_per_pass
            },
            max_pass_allocations: if desc.max_allocations_per_pass == 0 {
                u32::MAX
            } else {
                desc.max_allocations_per_pass
            },
            vectors,
            immovable_block_count: vec![0; count],
            balanced_states: (0..count)
                .map(|_| StateBalanced {
                    avg_alloc_size: u64::MAX,
                    avg_free_size: 0,
                })
                .collect(),
            moves: Vec::new(),
            ignored_allocs: 0,
            pass_stats: DefragmentationStats::default(),
            global_stats: DefragmentationStats::default(),
        }
    }

    /// Plan the next batch of moves. An empty move list means the context has
    /// nothing left to do.
    pub fn begin_pass(&mut self) -> DefragmentationPassMoveInfo {
        debug_assert!(self.moves.is_empty(), "previous pass was not ended");
        self.moves.clear();
        self.ignored_allocs = 0;
        self.pass_stats = DefragmentationStats::default();
        for vector_index in 0..self.vectors.len() {
            let ended = match self.algorithm {
                Algorithm::Fast => self.compute_fast(vector_index),
                Algorithm::Balanced => self.compute_balanced(vector_index, true),
                Algorithm::Full => self.compute_full(vector_index),
            };
            if ended {
                break;
            }
        }
        DefragmentationPassMoveInfo {
            moves: self
                .moves
                .iter()
                .map(|m| DefragmentationMove {
                    operation: DefragmentationMoveOperation::Copy,
                    src_allocation: m.src,
                    dst_tmp_allocation: m.dst,
                })
                .collect(),
        }
    }

    /// Commit the caller's decisions for the current pass. Returns true when
    /// the context is finished (the pass had no moves).
    pub fn end_pass(&mut self, pass: DefragmentationPassMoveInfo) -> Result<bool> {
        if pass.moves.len() != self.moves.len() {
            return Err(Error::InvalidArgument(
                "pass move list does not match the planned moves",
            ));
        }
        let counts_before: Vec<usize> = self.vectors.iter().map(|v| v.block_count()).collect();
        let mut immovable_blocks: Vec<(usize, u32)> = Vec::new();

        let internal_moves = std::mem::take(&mut self.moves);
        for (decision, internal) in pass.moves.iter().zip(internal_moves.iter()) {
            debug_assert_eq!(decision.src_allocation, internal.src);
            match decision.operation {
                DefragmentationMoveOperation::Copy => {
                    self.swap_into_destination(internal)?;
                    self.inner.free_allocation_inner(internal.dst)?;
                }
                DefragmentationMoveOperation::Ignore => {
                    self.pass_stats.bytes_moved -= internal.size;
                    self.pass_stats.allocations_moved -= 1;
                    let src_block = self.inner.objects.with(internal.src, |d| match &d.place {
                        Place::Placed { block_id, .. } => *block_id,
                        Place::Dedicated { .. } => unreachable!("defragmented allocations are placed"),
                    })?;
                    self.inner.free_allocation_inner(internal.dst)?;
                    if !immovable_blocks.contains(&(internal.vector_index, src_block)) {
                        immovable_blocks.push((internal.vector_index, src_block));
                    }
                }
                DefragmentationMoveOperation::Destroy => {
                    self.pass_stats.bytes_moved -= internal.size;
                    self.pass_stats.allocations_moved -= 1;
                    self.pass_stats.bytes_freed += internal.size;
                    self.inner.free_allocation_inner(internal.src)?;
                    self.inner.free_allocation_inner(internal.dst)?;
                }
            }
        }

        for (index, before) in counts_before.iter().enumerate() {
            let after = self.vectors[index].block_count();
            self.pass_stats.heaps_freed += before.saturating_sub(after) as u32;
        }

        // Blocks with ignored moves migrate to the front and are excluded
        // from every later pass.
        for (vector_index, block_id) in immovable_blocks {
            let vector = &self.vectors[vector_index];
            let mut state = vector.state.write();
            let front = self.immovable_block_count[vector_index];
            if let Some(position) = state.blocks.iter().position(|b| b.id == block_id) {
                if position >= front {
                    state.blocks.swap(position, front);
                    self.immovable_block_count[vector_index] = front + 1;
                }
            }
        }

        self.global_stats.bytes_moved += self.pass_stats.bytes_moved;
        self.global_stats.bytes_freed += self.pass_stats.bytes_freed;
        self.global_stats.allocations_moved += self.pass_stats.allocations_moved;
        self.global_stats.heaps_freed += self.pass_stats.heaps_freed;

        let done = internal_moves.is_empty();
        crate::debug_log!(
            "defragmentation pass ended: {} moves, done: {}",
            internal_moves.len(),
            done
        );
        Ok(done)
    }

    pub fn stats(&self) -> DefragmentationStats {
        self.global_stats
    }

    // ---- planning ----------------------------------------------------------

    fn check_counters(&mut self, bytes: u64) -> CounterStatus {
        if self.pass_stats.bytes_moved + bytes > self.max_pass_bytes {
            self.ignored_allocs += 1;
            if self.ignored_allocs < MAX_ALLOCS_TO_IGNORE {
                return CounterStatus::Ignore;
            }
            return CounterStatus::End;
        }
        self.ignored_allocs = 0;
        CounterStatus::Pass
    }

    fn increment_counters(&mut self, bytes: u64) -> bool {
        self.pass_stats.bytes_moved += bytes;
        self.pass_stats.allocations_moved += 1;
        self.pass_stats.allocations_moved >= self.max_pass_allocations
            || self.pass_stats.bytes_moved >= self.max_pass_bytes
    }

    /// Commit a planned request in `block_index` as a temporary destination
    /// allocation and record the move.
    fn commit_move(
        &mut self,
        vector_index: usize,
        vector: &Arc<BlockVector<D>>,
        state: &mut VectorState<D>,
        block_index: usize,
        request: crate::metadata::AllocationRequest,
        src: Allocation,
        size: u64,
        alignment: u64,
    ) -> bool {
        let block = &mut state.blocks[block_index];
        block.metadata.alloc(&request, 0);
        let offset = block.metadata.allocation_offset(request.handle);
        let dst = self.inner.objects.insert(AllocationData {
            size,
            alignment,
            resource: None,
            name: None,
            private_data: 0,
            is_defrag_tmp: true,
            place: Place::Placed {
                vector: Arc::clone(vector),
                block_id: block.id,
                handle: request.handle,
                offset,
                heap: Arc::clone(&block.heap),
            },
        });
        state.blocks[block_index]
            .metadata
            .set_allocation_user_data(request.handle, pack_allocation(dst));
        let group = self.inner.segment_group(vector.config.heap_type);
        self.inner.budget.add_allocation(group, size);
        self.moves.push(InternalMove {
            vector_index,
            src,
            dst,
            size,
        });
        self.increment_counters(size)
    }

    /// Try to place a relocation of `src` in blocks `[start, end)`. Returns
    /// true when the pass budget was exhausted.
    #[allow(clippy::too_many_arguments)]
    fn alloc_in_other_block(
        &mut self,
        vector_index: usize,
        vector: &Arc<BlockVector<D>>,
        state: &mut VectorState<D>,
        start: usize,
        end: usize,
        src: Allocation,
        size: u64,
        alignment: u64,
    ) -> bool {
        let alignment = alignment.max(vector.config.min_allocation_alignment);
        for block_index in start..end {
            if state.blocks[block_index].metadata.sum_free_size() < size {
                continue;
            }
            let request = state.blocks[block_index].metadata.create_allocation_request(
                size,
                alignment,
                false,
                Strategy::Default,
            );
            if let Some(request) = request {
                return self.commit_move(
                    vector_index,
                    vector,
                    state,
                    block_index,
                    request,
                    src,
                    size,
                    alignment,
                );
            }
        }
        false
    }

    /// Source-allocation facts needed to plan one move. Suballocations whose
    /// user data does not resolve (not yet registered by a concurrent
    /// allocation) are reported as temporaries so the planner skips them.
    fn move_data(&self, state: &VectorState<D>, block_index: usize, handle: crate::metadata::AllocHandle)
        -> (Allocation, u64, u64, u64, bool) {
        let info = state.blocks[block_index].metadata.allocation_info(handle);
        let src = unpack_allocation(info.user_data);
        match self
            .inner
            .objects
            .with(src, |d| (d.size, d.alignment, d.is_defrag_tmp))
        {
            Ok((size, alignment, is_tmp)) => (src, size, alignment, info.offset, is_tmp),
            Err(_) => (src, 0, 0, info.offset, true),
        }
    }

    /// Move allocations of late blocks into any earlier block.
    fn compute_fast(&mut self, vector_index: usize) -> bool {
        let vector = Arc::clone(&self.vectors[vector_index]);
        let mut state = vector.state.write();
        let immovable = self.immovable_block_count[vector_index];

        let mut block_index = state.blocks.len();
        while block_index > immovable + 1 {
            block_index -= 1;
            let mut cursor = state.blocks[block_index].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = state.blocks[block_index].metadata.next_allocation(handle);
                let (src, size, alignment, _offset, is_tmp) =
                    self.move_data(&state, block_index, handle);
                if is_tmp {
                    continue;
                }
                match self.check_counters(size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                if self.alloc_in_other_block(
                    vector_index,
                    &vector,
                    &mut state,
                    0,
                    block_index,
                    src,
                    size,
                    alignment,
                ) {
                    return true;
                }
            }
        }
        false
    }

    /// Like Fast, with a heuristic same-block compaction when relocation into
    /// earlier blocks fails.
    fn compute_balanced(&mut self, vector_index: usize, first_sweep: bool) -> bool {
        if self.balanced_states[vector_index].avg_alloc_size == u64::MAX {
            self.update_vector_statistics(vector_index);
        }
        let vector = Arc::clone(&self.vectors[vector_index]);
        let mut state = vector.state.write();
        let immovable = self.immovable_block_count[vector_index];
        let start_moves = self.moves.len();
        let minimal_free_region = self.balanced_states[vector_index].avg_free_size / 2;
        let avg_alloc = self.balanced_states[vector_index].avg_alloc_size;
        let avg_free = self.balanced_states[vector_index].avg_free_size;

        let mut block_index = state.blocks.len();
        while block_index > immovable + 1 {
            block_index -= 1;
            let mut prev_free_region = 0u64;
            let mut cursor = state.blocks[block_index].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = state.blocks[block_index].metadata.next_allocation(handle);
                let (src, size, alignment, offset, is_tmp) =
                    self.move_data(&state, block_index, handle);
                if is_tmp {
                    continue;
                }
                match self.check_counters(size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }

                let moves_before = self.moves.len();
                if self.alloc_in_other_block(
                    vector_index,
                    &vector,
                    &mut state,
                    0,
                    block_index,
                    src,
                    size,
                    alignment,
                ) {
                    return true;
                }
                let next_free_region =
                    state.blocks[block_index].metadata.next_free_region_size(handle);

                // No other block had room: compact inside this block if the
                // neighborhood or the averages suggest it pays off.
                if moves_before == self.moves.len()
                    && offset != 0
                    && state.blocks[block_index].metadata.sum_free_size() >= size
                    && (prev_free_region >= minimal_free_region
                        || next_free_region >= minimal_free_region
                        || size <= avg_free
                        || size <= avg_alloc)
                    && self.try_realloc_lower(
                        vector_index,
                        &vector,
                        &mut state,
                        block_index,
                        src,
                        size,
                        alignment,
                        offset,
                    )
                {
                    return true;
                }
                prev_free_region = next_free_region;
            }
        }

        // A sweep with no moves means the averages went stale; refresh them
        // and sweep once more.
        if start_moves == self.moves.len() && first_sweep {
            self.balanced_states[vector_index].avg_alloc_size = u64::MAX;
            drop(state);
            return self.compute_balanced(vector_index, false);
        }
        false
    }

    /// Relocation and same-block compaction, both unconditional.
    fn compute_full(&mut self, vector_index: usize) -> bool {
        let vector = Arc::clone(&self.vectors[vector_index]);
        let mut state = vector.state.write();
        let immovable = self.immovable_block_count[vector_index];

        let mut block_index = state.blocks.len();
        while block_index > immovable + 1 {
            block_index -= 1;
            let mut cursor = state.blocks[block_index].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = state.blocks[block_index].metadata.next_allocation(handle);
                let (src, size, alignment, offset, is_tmp) =
                    self.move_data(&state, block_index, handle);
                if is_tmp {
                    continue;
                }
                match self.check_counters(size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }

                let moves_before = self.moves.len();
                if self.alloc_in_other_block(
                    vector_index,
                    &vector,
                    &mut state,
                    0,
                    block_index,
                    src,
                    size,
                    alignment,
                ) {
                    return true;
                }
                if moves_before == self.moves.len()
                    && offset != 0
                    && state.blocks[block_index].metadata.sum_free_size() >= size
                    && self.try_realloc_lower(
                        vector_index,
                        &vector,
                        &mut state,
                        block_index,
                        src,
                        size,
                        alignment,
                        offset,
                    )
                {
                    return true;
                }
            }
        }
        false
    }

    /// Plan a same-block move to a strictly lower offset, if one exists.
    #[allow(clippy::too_many_arguments)]
    fn try_realloc_lower(
        &mut self,
        vector_index: usize,
        vector: &Arc<BlockVector<D>>,
        state: &mut VectorState<D>,
        block_index: usize,
        src: Allocation,
        size: u64,
        alignment: u64,
        current_offset: u64,
    ) -> bool {
        let alignment = alignment.max(vector.config.min_allocation_alignment);
        let request = state.blocks[block_index].metadata.create_allocation_request(
            size,
            alignment,
            false,
            Strategy::MinOffset,
        );
        if let Some(request) = request {
            let new_offset = match request.kind {
                RequestKind::TlsfAt(offset) => offset,
                _ => unreachable!("defragmentation only runs on TLSF metadata"),
            };
            if new_offset < current_offset {
                return self.commit_move(
                    vector_index,
                    vector,
                    state,
                    block_index,
                    request,
                    src,
                    size,
                    alignment,
                );
            }
        }
        false
    }

    fn update_vector_statistics(&mut self, vector_index: usize) {
        let state = self.vectors[vector_index].state.read();
        let mut alloc_count = 0u64;
        let mut free_count = 0u64;
        let mut alloc_bytes = 0u64;
        let mut free_bytes = 0u64;
        for block in state.blocks.iter() {
            alloc_count += block.metadata.allocation_count() as u64;
            free_count += block.metadata.free_regions_count() as u64;
            alloc_bytes += block.metadata.size() - block.metadata.sum_free_size();
            free_bytes += block.metadata.sum_free_size();
        }
        let balanced = &mut self.balanced_states[vector_index];
        balanced.avg_alloc_size = alloc_bytes / alloc_count.max(1);
        balanced.avg_free_size = free_bytes / free_count.max(1);
    }

    /// Swap the source allocation's binding with its temporary destination
    /// and repoint both metadata user-data entries.
    fn swap_into_destination(&mut self, internal: &InternalMove) -> Result<()> {
        let vector = Arc::clone(&self.vectors[internal.vector_index]);
        let mut state = vector.state.write();
        let (src_loc, dst_loc) =
            self.inner
                .objects
                .with_two_mut(internal.src, internal.dst, |src, dst| {
                    std::mem::swap(&mut src.resource, &mut dst.resource);
                    std::mem::swap(&mut src.place, &mut dst.place);
                    let src_loc = match &src.place {
                        Place::Placed {
                            block_id, handle, ..
                        } => (*block_id, *handle),
                        Place::Dedicated { .. } => unreachable!(),
                    };
                    let dst_loc = match &dst.place {
                        Place::Placed {
                            block_id, handle, ..
                        } => (*block_id, *handle),
                        Place::Dedicated { .. } => unreachable!(),
                    };
                    (src_loc, dst_loc)
                })?;
        for (allocation, (block_id, handle)) in
            [(internal.src, src_loc), (internal.dst, dst_loc)]
        {
            let block = state
                .blocks
                .iter_mut()
                .find(|b| b.id == block_id)
                .expect("swapped allocation references a live block");
            block
                .metadata
                .set_allocation_user_data(handle, pack_allocation(allocation));
        }
        Ok(())
    }
}

impl<D: Device> Drop for DefragmentationContext<D> {
    fn drop(&mut self) {
        for vector in self.vectors.iter() {
            vector.set_incremental_sort_enabled(true);
        }
    }
}
