//! TLSF block metadata: two-level segregated-fit allocation in O(1).
//!
//! A doubly-linked physical chain of blocks spans the whole heap, capped on
//! the high side by a distinguished null block that absorbs the unused tail.
//! Free blocks additionally sit in segregated free lists indexed by
//! (memory class, second-level index); two bitmap layers make finding a
//! non-empty list a pair of bit scans. Blocks live in an index arena, so
//! handles stay valid however the chain is relinked.

use crate::metadata::{AllocHandle, AllocationRequest, Region, RequestKind, Strategy, SuballocInfo};
use crate::metadata::DEBUG_MARGIN;
use crate::util::align::{align_up, bit_scan_lsb, bit_scan_msb};

const NIL: u32 = u32::MAX;

const SECOND_LEVEL_INDEX: u32 = 5;
const MEMORY_CLASS_SHIFT: u32 = 7;
/// Sizes at or below this fall into memory class 0.
const SMALL_BUFFER_SIZE: u64 = 256;

#[derive(Debug, Clone)]
struct Block {
    offset: u64,
    size: u64,
    prev_phys: u32,
    next_phys: u32,
    prev_free: u32,
    next_free: u32,
    free: bool,
    user_data: u64,
}

impl Block {
    fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            prev_phys: NIL,
            next_phys: NIL,
            prev_free: NIL,
            next_free: NIL,
            free: false,
            user_data: 0,
        }
    }
}

pub(crate) struct TlsfMetadata {
    size: u64,
    is_virtual: bool,
    blocks: Vec<Block>,
    /// Recycled arena slots.
    spare_nodes: Vec<u32>,
    /// Sentinel capping the physical chain on the high side.
    null_block: u32,
    /// Free-list heads, one per (memory class, second index) bucket.
    free_lists: Vec<u32>,
    /// Bit per memory class with at least one non-empty inner list.
    is_free_bitmap: u32,
    /// Bit per second-level index, one word per memory class.
    inner_is_free_bitmap: Vec<u32>,
    alloc_count: u32,
    /// Free blocks, excluding the null block.
    blocks_free_count: u32,
    /// Bytes in free blocks, excluding the null block.
    blocks_free_size: u64,
}

impl TlsfMetadata {
    pub fn new(size: u64, is_virtual: bool) -> Self {
        debug_assert!(size > 0);
        let memory_class = Self::size_to_memory_class(size);
        let memory_classes = memory_class as usize + 2;

        let sli = Self::second_index(size, memory_class, is_virtual);
        let top_list = if memory_class == 0 {
            0
        } else {
            (memory_class as u32 - 1) * (1 << SECOND_LEVEL_INDEX) + sli as u32
        };
        // Class 0 is finer-grained on virtual blocks (steps of 8 vs 64).
        let class_zero_lists = if is_virtual { 1 << SECOND_LEVEL_INDEX } else { 4 };
        let lists_count = top_list + 1 + class_zero_lists;

        let mut blocks = Vec::with_capacity(16);
        let mut null = Block::new(0, size);
        null.free = true;
        blocks.push(null);

        Self {
            size,
            is_virtual,
            blocks,
            spare_nodes: Vec::new(),
            null_block: 0,
            free_lists: vec![NIL; lists_count as usize],
            is_free_bitmap: 0,
            inner_is_free_bitmap: vec![0; memory_classes],
            alloc_count: 0,
            blocks_free_count: 0,
            blocks_free_size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sum_free_size(&self) -> u64 {
        self.blocks_free_size + self.blocks[self.null_block as usize].size
    }

    pub fn allocation_count(&self) -> u32 {
        self.alloc_count
    }

    pub fn free_regions_count(&self) -> u32 {
        self.blocks_free_count + 1
    }

    // ---- bucket math -------------------------------------------------------

    fn size_to_memory_class(size: u64) -> u8 {
        if size > SMALL_BUFFER_SIZE {
            (bit_scan_msb(size) - MEMORY_CLASS_SHIFT) as u8
        } else {
            0
        }
    }

    fn second_index(size: u64, memory_class: u8, is_virtual: bool) -> u16 {
        if memory_class == 0 {
            if is_virtual {
                ((size - 1) / 8) as u16
            } else {
                ((size - 1) / 64) as u16
            }
        } else {
            ((size >> (memory_class as u32 + MEMORY_CLASS_SHIFT - SECOND_LEVEL_INDEX))
                ^ (1u64 << SECOND_LEVEL_INDEX)) as u16
        }
    }

    fn size_to_second_index(&self, size: u64, memory_class: u8) -> u16 {
        Self::second_index(size, memory_class, self.is_virtual)
    }

    fn get_list_index(&self, memory_class: u8, second_index: u16) -> u32 {
        if memory_class == 0 {
            second_index as u32
        } else {
            (memory_class as u32 - 1) * (1 << SECOND_LEVEL_INDEX)
                + second_index as u32
                + if self.is_virtual { 1 << SECOND_LEVEL_INDEX } else { 4 }
        }
    }

    fn list_index_for_size(&self, size: u64) -> u32 {
        let class = Self::size_to_memory_class(size);
        self.get_list_index(class, self.size_to_second_index(size, class))
    }

    fn lists_count(&self) -> u32 {
        self.free_lists.len() as u32
    }

    // ---- arena -------------------------------------------------------------

    fn alloc_node(&mut self, block: Block) -> u32 {
        if let Some(index) = self.spare_nodes.pop() {
            self.blocks[index as usize] = block;
            index
        } else {
            self.blocks.push(block);
            (self.blocks.len() - 1) as u32
        }
    }

    fn release_node(&mut self, index: u32) {
        self.spare_nodes.push(index);
    }

    // ---- free lists --------------------------------------------------------

    fn insert_free_block(&mut self, index: u32) {
        debug_assert!(index != self.null_block);
        debug_assert!(!self.blocks[index as usize].free, "cannot insert block twice");
        let size = self.blocks[index as usize].size;
        let class = Self::size_to_memory_class(size);
        let second = self.size_to_second_index(size, class);
        let list = self.get_list_index(class, second) as usize;

        let head = self.free_lists[list];
        {
            let block = &mut self.blocks[index as usize];
            block.free = true;
            block.prev_free = NIL;
            block.next_free = head;
        }
        self.free_lists[list] = index;
        if head != NIL {
            self.blocks[head as usize].prev_free = index;
        } else {
            self.inner_is_free_bitmap[class as usize] |= 1u32 << second;
            self.is_free_bitmap |= 1u32 << class;
        }
        self.blocks_free_count += 1;
        self.blocks_free_size += size;
    }

    fn remove_free_block(&mut self, index: u32) {
        debug_assert!(index != self.null_block);
        debug_assert!(self.blocks[index as usize].free, "block is not free");
        let (size, prev, next) = {
            let block = &self.blocks[index as usize];
            (block.size, block.prev_free, block.next_free)
        };
        if next != NIL {
            self.blocks[next as usize].prev_free = prev;
        }
        if prev != NIL {
            self.blocks[prev as usize].next_free = next;
        } else {
            let class = Self::size_to_memory_class(size);
            let second = self.size_to_second_index(size, class);
            let list = self.get_list_index(class, second) as usize;
            debug_assert_eq!(self.free_lists[list], index);
            self.free_lists[list] = next;
            if next == NIL {
                self.inner_is_free_bitmap[class as usize] &= !(1u32 << second);
                if self.inner_is_free_bitmap[class as usize] == 0 {
                    self.is_free_bitmap &= !(1u32 << class);
                }
            }
        }
        let block = &mut self.blocks[index as usize];
        block.free = false;
        block.prev_free = NIL;
        block.next_free = NIL;
        block.user_data = 0;
        self.blocks_free_count -= 1;
        self.blocks_free_size -= size;
    }

    /// Lowest non-empty list holding blocks of at least `size`, found with two
    /// bit scans.
    fn find_free_block(&self, size: u64) -> (u32, u32) {
        let mut class = Self::size_to_memory_class(size);
        let mut inner =
            self.inner_is_free_bitmap[class as usize] & (!0u32 << self.size_to_second_index(size, class));
        if inner == 0 {
            let upper = class as u32 + 1;
            let free_map = if upper >= 32 {
                0
            } else {
                self.is_free_bitmap & (!0u32 << upper)
            };
            if free_map == 0 {
                return (NIL, 0);
            }
            class = bit_scan_lsb(free_map) as u8;
            inner = self.inner_is_free_bitmap[class as usize];
        }
        let list = self.get_list_index(class, bit_scan_lsb(inner) as u16);
        (self.free_lists[list as usize], list)
    }

    // ---- request planning --------------------------------------------------

    /// Test whether `index` can host the request; on success, also bump the
    /// block to the head of its free list so recently probed blocks are found
    /// first next time.
    fn check_block(
        &mut self,
        index: u32,
        list_index: u32,
        alloc_size: u64,
        alignment: u64,
    ) -> Option<AllocationRequest> {
        debug_assert!(self.blocks[index as usize].free, "block is already taken");
        let (offset, size) = {
            let block = &self.blocks[index as usize];
            (block.offset, block.size)
        };
        let aligned_offset = align_up(offset, alignment);
        if size < alloc_size + (aligned_offset - offset) {
            return None;
        }

        if list_index != self.lists_count() && self.blocks[index as usize].prev_free != NIL {
            let (prev, next) = {
                let block = &self.blocks[index as usize];
                (block.prev_free, block.next_free)
            };
            self.blocks[prev as usize].next_free = next;
            if next != NIL {
                self.blocks[next as usize].prev_free = prev;
            }
            let head = self.free_lists[list_index as usize];
            self.blocks[index as usize].prev_free = NIL;
            self.blocks[index as usize].next_free = head;
            self.free_lists[list_index as usize] = index;
            if head != NIL {
                self.blocks[head as usize].prev_free = index;
            }
        }

        Some(AllocationRequest {
            handle: AllocHandle::new(index as u64 + 1),
            size: alloc_size - DEBUG_MARGIN,
            kind: RequestKind::TlsfAt(aligned_offset),
        })
    }

    fn check_null_block(&mut self, alloc_size: u64, alignment: u64) -> Option<AllocationRequest> {
        let lists_count = self.lists_count();
        let null_block = self.null_block;
        if self.blocks[null_block as usize].size == 0 {
            return None;
        }
        self.check_block(null_block, lists_count, alloc_size, alignment)
    }

    fn walk_list(
        &mut self,
        mut index: u32,
        list_index: u32,
        alloc_size: u64,
        alignment: u64,
    ) -> Option<AllocationRequest> {
        while index != NIL {
            let next = self.blocks[index as usize].next_free;
            if let Some(request) = self.check_block(index, list_index, alloc_size, alignment) {
                return Some(request);
            }
            index = next;
        }
        None
    }

    pub fn create_allocation_request(
        &mut self,
        size: u64,
        alignment: u64,
        strategy: Strategy,
    ) -> Option<AllocationRequest> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());

        let alloc_size = size + DEBUG_MARGIN;
        if alloc_size > self.sum_free_size() {
            return None;
        }

        // Smallest size guaranteed to land in the bucket above this request,
        // so its first block fits without walking.
        let small_step = SMALL_BUFFER_SIZE / if self.is_virtual { 1 << SECOND_LEVEL_INDEX } else { 4 };
        let size_for_next_list = if alloc_size > SMALL_BUFFER_SIZE {
            alloc_size + (1u64 << (bit_scan_msb(alloc_size) - SECOND_LEVEL_INDEX))
        } else if alloc_size > SMALL_BUFFER_SIZE - small_step {
            SMALL_BUFFER_SIZE + 1
        } else {
            alloc_size + small_step
        };

        match strategy {
            Strategy::MinTime => {
                let (next_head, next_list) = self.find_free_block(size_for_next_list);
                if next_head != NIL {
                    if let Some(r) = self.check_block(next_head, next_list, alloc_size, alignment) {
                        return Some(r);
                    }
                }
                if let Some(r) = self.check_null_block(alloc_size, alignment) {
                    return Some(r);
                }
                if let Some(r) = self.walk_list(next_head, next_list, alloc_size, alignment) {
                    return Some(r);
                }
                let (best_head, best_list) = self.find_free_block(alloc_size);
                if let Some(r) = self.walk_list(best_head, best_list, alloc_size, alignment) {
                    return Some(r);
                }
            }
            Strategy::MinMemory => {
                let (best_head, best_list) = self.find_free_block(alloc_size);
                if let Some(r) = self.walk_list(best_head, best_list, alloc_size, alignment) {
                    return Some(r);
                }
                if let Some(r) = self.check_null_block(alloc_size, alignment) {
                    return Some(r);
                }
                let (next_head, next_list) = self.find_free_block(size_for_next_list);
                if let Some(r) = self.walk_list(next_head, next_list, alloc_size, alignment) {
                    return Some(r);
                }
            }
            Strategy::MinOffset => {
                // Enumerate candidate free blocks in ascending offset order.
                let mut candidates = Vec::with_capacity(self.blocks_free_count as usize);
                let mut index = self.blocks[self.null_block as usize].prev_phys;
                while index != NIL {
                    let block = &self.blocks[index as usize];
                    if block.free && block.size >= alloc_size {
                        candidates.push(index);
                    }
                    index = block.prev_phys;
                }
                for &index in candidates.iter().rev() {
                    let list = self.list_index_for_size(self.blocks[index as usize].size);
                    if let Some(r) = self.check_block(index, list, alloc_size, alignment) {
                        return Some(r);
                    }
                }
                if let Some(r) = self.check_null_block(alloc_size, alignment) {
                    return Some(r);
                }
                // The whole range has been searched; nothing fits.
                return None;
            }
            Strategy::Default => {
                let (next_head, next_list) = self.find_free_block(size_for_next_list);
                if let Some(r) = self.walk_list(next_head, next_list, alloc_size, alignment) {
                    return Some(r);
                }
                if let Some(r) = self.check_null_block(alloc_size, alignment) {
                    return Some(r);
                }
                let (best_head, best_list) = self.find_free_block(alloc_size);
                if let Some(r) = self.walk_list(best_head, best_list, alloc_size, alignment) {
                    return Some(r);
                }
            }
        }

        // Worst case: scan every list that could hold a fitting block.
        let start = self.list_index_for_size(alloc_size);
        for list in start..self.lists_count() {
            let head = self.free_lists[list as usize];
            if let Some(r) = self.walk_list(head, list, alloc_size, alignment) {
                return Some(r);
            }
        }
        None
    }

    // ---- commit / free -----------------------------------------------------

    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        let offset = match request.kind {
            RequestKind::TlsfAt(offset) => offset,
            _ => unreachable!("request kind does not belong to the TLSF algorithm"),
        };
        let current = (request.handle.raw() - 1) as u32;
        debug_assert!(self.blocks[current as usize].offset <= offset);

        if current != self.null_block {
            self.remove_free_block(current);
        }

        // Fold leading alignment padding into the previous free block, or
        // carve it out as its own free block.
        let missing_alignment = offset - self.blocks[current as usize].offset;
        if missing_alignment > 0 {
            let prev = self.blocks[current as usize].prev_phys;
            debug_assert!(prev != NIL, "there should be no missing alignment at offset 0");
            if self.blocks[prev as usize].free && self.blocks[prev as usize].size != DEBUG_MARGIN {
                let old_size = self.blocks[prev as usize].size;
                let old_list = self.list_index_for_size(old_size);
                let grown = old_size + missing_alignment;
                if old_list != self.list_index_for_size(grown) {
                    self.remove_free_block(prev);
                    self.blocks[prev as usize].size = grown;
                    self.insert_free_block(prev);
                } else {
                    self.blocks[prev as usize].size = grown;
                    self.blocks_free_size += missing_alignment;
                }
            } else {
                let padding = self.alloc_node(Block {
                    offset: self.blocks[current as usize].offset,
                    size: missing_alignment,
                    prev_phys: prev,
                    next_phys: current,
                    ..Block::new(0, 0)
                });
                self.blocks[prev as usize].next_phys = padding;
                self.blocks[current as usize].prev_phys = padding;
                self.insert_free_block(padding);
            }
            self.blocks[current as usize].size -= missing_alignment;
            self.blocks[current as usize].offset += missing_alignment;
        }

        let size = request.size + DEBUG_MARGIN;
        if self.blocks[current as usize].size == size {
            if current == self.null_block {
                // The null block was consumed whole; cap the chain with a
                // fresh zero-sized null block.
                let new_null = self.alloc_node(Block {
                    offset: self.blocks[current as usize].offset + size,
                    size: 0,
                    prev_phys: current,
                    free: true,
                    ..Block::new(0, 0)
                });
                self.null_block = new_null;
                self.blocks[current as usize].next_phys = new_null;
                self.blocks[current as usize].free = false;
            }
        } else {
            debug_assert!(
                self.blocks[current as usize].size > size,
                "proper block already found, shouldn't find smaller one"
            );
            let trailing = self.alloc_node(Block {
                offset: self.blocks[current as usize].offset + size,
                size: self.blocks[current as usize].size - size,
                prev_phys: current,
                next_phys: self.blocks[current as usize].next_phys,
                ..Block::new(0, 0)
            });
            self.blocks[current as usize].next_phys = trailing;
            self.blocks[current as usize].size = size;
            if current == self.null_block {
                self.null_block = trailing;
                self.blocks[trailing as usize].free = true;
                self.blocks[current as usize].free = false;
            } else {
                let after = self.blocks[trailing as usize].next_phys;
                self.blocks[after as usize].prev_phys = trailing;
                self.insert_free_block(trailing);
            }
        }
        self.blocks[current as usize].user_data = user_data;

        if DEBUG_MARGIN > 0 {
            // Trailing guard region for overrun detection.
            self.blocks[current as usize].size -= DEBUG_MARGIN;
            let guard = self.alloc_node(Block {
                offset: self.blocks[current as usize].offset + self.blocks[current as usize].size,
                size: DEBUG_MARGIN,
                prev_phys: current,
                next_phys: self.blocks[current as usize].next_phys,
                ..Block::new(0, 0)
            });
            let after = self.blocks[guard as usize].next_phys;
            self.blocks[after as usize].prev_phys = guard;
            self.blocks[current as usize].next_phys = guard;
            self.insert_free_block(guard);
        }
        self.alloc_count += 1;
    }

    /// Merge `prev` (the physical predecessor) into `into` and release its
    /// arena node.
    fn merge_block(&mut self, into: u32, prev: u32) {
        debug_assert_eq!(self.blocks[into as usize].prev_phys, prev);
        debug_assert!(!self.blocks[prev as usize].free, "cannot merge separate physical regions");
        let (prev_offset, prev_size, prev_prev) = {
            let b = &self.blocks[prev as usize];
            (b.offset, b.size, b.prev_phys)
        };
        let block = &mut self.blocks[into as usize];
        block.offset = prev_offset;
        block.size += prev_size;
        block.prev_phys = prev_prev;
        if prev_prev != NIL {
            self.blocks[prev_prev as usize].next_phys = into;
        }
        self.release_node(prev);
    }

    pub fn free(&mut self, handle: AllocHandle) {
        let mut block = (handle.raw() - 1) as u32;
        assert!(!self.blocks[block as usize].free, "block is already free");
        self.alloc_count -= 1;
        self.blocks[block as usize].user_data = 0;

        if DEBUG_MARGIN > 0 {
            // Absorb the trailing guard region first.
            let guard = self.blocks[block as usize].next_phys;
            self.remove_free_block(guard);
            self.merge_block(guard, block);
            block = guard;
        }

        let prev = self.blocks[block as usize].prev_phys;
        if prev != NIL
            && self.blocks[prev as usize].free
            && self.blocks[prev as usize].size != DEBUG_MARGIN
        {
            self.remove_free_block(prev);
            self.merge_block(block, prev);
        }

        let next = self.blocks[block as usize].next_phys;
        if !self.blocks[next as usize].free {
            self.insert_free_block(block);
        } else if next == self.null_block {
            self.merge_block(self.null_block, block);
        } else {
            self.remove_free_block(next);
            self.merge_block(next, block);
            self.insert_free_block(next);
        }
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.spare_nodes.clear();
        let mut null = Block::new(0, self.size);
        null.free = true;
        self.blocks.push(null);
        self.null_block = 0;
        for head in self.free_lists.iter_mut() {
            *head = NIL;
        }
        self.is_free_bitmap = 0;
        for word in self.inner_is_free_bitmap.iter_mut() {
            *word = 0;
        }
        self.alloc_count = 0;
        self.blocks_free_count = 0;
        self.blocks_free_size = 0;
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> SuballocInfo {
        let block = &self.blocks[(handle.raw() - 1) as usize];
        debug_assert!(!block.free);
        SuballocInfo {
            offset: block.offset,
            size: block.size,
            user_data: block.user_data,
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        let block = &mut self.blocks[(handle.raw() - 1) as usize];
        debug_assert!(!block.free);
        block.user_data = user_data;
    }

    // ---- iteration ---------------------------------------------------------

    pub fn allocation_list_begin(&self) -> Option<AllocHandle> {
        if self.alloc_count == 0 {
            return None;
        }
        let mut index = self.blocks[self.null_block as usize].prev_phys;
        while index != NIL {
            if !self.blocks[index as usize].free {
                return Some(AllocHandle::new(index as u64 + 1));
            }
            index = self.blocks[index as usize].prev_phys;
        }
        unreachable!("alloc count is nonzero but no taken block found")
    }

    pub fn next_allocation(&self, handle: AllocHandle) -> Option<AllocHandle> {
        let mut index = self.blocks[(handle.raw() - 1) as usize].prev_phys;
        while index != NIL {
            if !self.blocks[index as usize].free {
                return Some(AllocHandle::new(index as u64 + 1));
            }
            index = self.blocks[index as usize].prev_phys;
        }
        None
    }

    pub fn next_free_region_size(&self, handle: AllocHandle) -> u64 {
        let prev = self.blocks[(handle.raw() - 1) as usize].prev_phys;
        if prev != NIL && self.blocks[prev as usize].free {
            self.blocks[prev as usize].size
        } else {
            0
        }
    }

    pub fn for_each_region(&self, f: &mut dyn FnMut(Region)) {
        let mut chain = Vec::new();
        let mut index = self.null_block;
        loop {
            chain.push(index);
            let prev = self.blocks[index as usize].prev_phys;
            if prev == NIL {
                break;
            }
            index = prev;
        }
        for &index in chain.iter().rev() {
            let block = &self.blocks[index as usize];
            if block.size == 0 {
                continue;
            }
            f(Region {
                offset: block.offset,
                size: block.size,
                user_data: if block.free { None } else { Some(block.user_data) },
            });
        }
    }

    // ---- validation --------------------------------------------------------

    pub fn validate(&self) {
        assert!(self.sum_free_size() <= self.size);

        // Free lists: well-formed chains of free blocks, bucketed correctly.
        let mut in_free_list = vec![false; self.blocks.len()];
        for (list, &head) in self.free_lists.iter().enumerate() {
            let mut index = head;
            let mut prev = NIL;
            while index != NIL {
                let block = &self.blocks[index as usize];
                assert!(block.free, "free list contains a taken block");
                assert_eq!(block.prev_free, prev, "broken free-list back link");
                assert_eq!(
                    self.list_index_for_size(block.size) as usize, list,
                    "free block filed in the wrong bucket"
                );
                assert!(!in_free_list[index as usize], "block in two free lists");
                in_free_list[index as usize] = true;
                prev = index;
                index = block.next_free;
            }
        }

        // Null block caps the chain.
        let null = &self.blocks[self.null_block as usize];
        assert!(null.free, "null block must be free");
        assert_eq!(null.next_phys, NIL, "null block must be last");
        assert!(!in_free_list[self.null_block as usize], "null block must not be listed");

        // Physical chain: contiguous, fully accounted.
        let mut chain = Vec::new();
        let mut index = self.null_block;
        loop {
            chain.push(index);
            let prev = self.blocks[index as usize].prev_phys;
            if prev == NIL {
                break;
            }
            assert_eq!(self.blocks[prev as usize].next_phys, index, "broken physical link");
            index = prev;
        }

        let mut expected_offset = 0u64;
        let mut taken_count = 0u32;
        let mut free_count = 0u32;
        let mut free_size = 0u64;
        for &index in chain.iter().rev() {
            let block = &self.blocks[index as usize];
            assert_eq!(block.offset, expected_offset, "physical offsets must be contiguous");
            expected_offset += block.size;
            if index == self.null_block {
                continue;
            }
            if block.free {
                assert!(in_free_list[index as usize], "free block missing from free lists");
                free_count += 1;
                free_size += block.size;
            } else {
                taken_count += 1;
            }
        }
        assert_eq!(expected_offset, self.size, "physical sizes must sum to block size");
        assert_eq!(taken_count, self.alloc_count);
        assert_eq!(free_count, self.blocks_free_count);
        assert_eq!(free_size, self.blocks_free_size);
        assert_eq!(
            taken_count + free_count + 1,
            chain.len() as u32,
            "alloc count + free count + null must equal block count"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(m: &mut TlsfMetadata, size: u64, alignment: u64, strategy: Strategy) -> AllocHandle {
        let request = m
            .create_allocation_request(size, alignment, strategy)
            .expect("allocation must fit");
        m.alloc(&request, 0);
        m.validate();
        request.handle
    }

    #[test]
    fn test_basic_sequence() {
        let mut m = TlsfMetadata::new(1 << 20, false);
        let sizes = [200u64, 1000, 4096, 200_000];
        let mut handles = Vec::new();
        let mut expected_free = 1u64 << 20;
        for &size in sizes.iter() {
            let h = alloc(&mut m, size, 256, Strategy::Default);
            expected_free -= size;
            assert_eq!(m.sum_free_size(), expected_free);
            handles.push(h);
        }
        assert_eq!(m.allocation_count(), 4);

        // Freeing in reverse order collapses everything back into one region.
        for h in handles.into_iter().rev() {
            m.free(h);
            m.validate();
        }
        assert_eq!(m.allocation_count(), 0);
        assert_eq!(m.sum_free_size(), 1 << 20);

        let mut regions = Vec::new();
        m.for_each_region(&mut |r| regions.push(r));
        assert_eq!(regions.len(), 1);
        assert!(regions[0].user_data.is_none());
        assert_eq!(regions[0].size, 1 << 20);
    }

    #[test]
    fn test_offsets_are_aligned_and_disjoint() {
        let mut m = TlsfMetadata::new(1 << 20, false);
        let mut spans: Vec<(u64, u64)> = Vec::new();
        for &(size, alignment) in [(200u64, 256u64), (1000, 64), (4096, 4096), (50_000, 512)].iter()
        {
            let h = alloc(&mut m, size, alignment, Strategy::Default);
            let info = m.allocation_info(h);
            assert_eq!(info.offset % alignment, 0);
            assert_eq!(info.size, size);
            for &(o, s) in spans.iter() {
                assert!(info.offset + size <= o || o + s <= info.offset, "overlap");
            }
            spans.push((info.offset, size));
        }
    }

    #[test]
    fn test_free_middle_and_reuse() {
        let mut m = TlsfMetadata::new(1 << 16, false);
        let a = alloc(&mut m, 4096, 1, Strategy::Default);
        let b = alloc(&mut m, 4096, 1, Strategy::Default);
        let c = alloc(&mut m, 4096, 1, Strategy::Default);
        let b_offset = m.allocation_info(b).offset;
        m.free(b);
        m.validate();
        assert_eq!(m.allocation_count(), 2);

        // A min-offset request of the same size lands exactly in the hole.
        let d = alloc(&mut m, 4096, 1, Strategy::MinOffset);
        assert_eq!(m.allocation_info(d).offset, b_offset);

        m.free(a);
        m.free(c);
        m.free(d);
        assert_eq!(m.sum_free_size(), 1 << 16);
    }

    #[test]
    fn test_merge_on_free_both_sides() {
        let mut m = TlsfMetadata::new(1 << 16, false);
        let a = alloc(&mut m, 1024, 1, Strategy::Default);
        let b = alloc(&mut m, 1024, 1, Strategy::Default);
        let c = alloc(&mut m, 1024, 1, Strategy::Default);
        let _d = alloc(&mut m, 1024, 1, Strategy::Default);
        m.free(a);
        m.free(c);
        m.validate();
        // Freeing b merges with both neighbors into one 3 KiB region.
        m.free(b);
        m.validate();
        let mut free_regions = Vec::new();
        m.for_each_region(&mut |r| {
            if r.user_data.is_none() {
                free_regions.push(r.size);
            }
        });
        // merged hole + tail
        assert_eq!(free_regions.len(), 2);
        assert_eq!(free_regions[0], 3072);
    }

    #[test]
    fn test_alignment_padding_becomes_free_block() {
        let mut m = TlsfMetadata::new(1 << 16, false);
        let _a = alloc(&mut m, 100, 1, Strategy::Default);
        // The next allocation needs padding between 100 and 4096.
        let b = alloc(&mut m, 4096, 4096, Strategy::Default);
        assert_eq!(m.allocation_info(b).offset, 4096);
        // The padding is reusable free space.
        assert_eq!(m.sum_free_size(), (1 << 16) - 100 - 4096);
        let c = alloc(&mut m, 1024, 1, Strategy::MinOffset);
        assert!(m.allocation_info(c).offset < 4096);
    }

    #[test]
    fn test_small_block_all_class_zero() {
        // A block of exactly SMALL_BUFFER_SIZE keeps every allocation in
        // memory class 0.
        let mut m = TlsfMetadata::new(256, false);
        assert_eq!(TlsfMetadata::size_to_memory_class(256), 0);
        let a = alloc(&mut m, 64, 1, Strategy::Default);
        let b = alloc(&mut m, 64, 1, Strategy::Default);
        let c = alloc(&mut m, 128, 1, Strategy::Default);
        assert_eq!(m.sum_free_size(), 0);
        m.free(b);
        m.validate();
        let b2 = alloc(&mut m, 64, 1, Strategy::Default);
        assert_eq!(m.allocation_info(b2).offset, 64);
        m.free(a);
        m.free(c);
        m.free(b2);
        assert_eq!(m.sum_free_size(), 256);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut m = TlsfMetadata::new(4096, false);
        let _a = alloc(&mut m, 4096, 1, Strategy::Default);
        assert!(m
            .create_allocation_request(1, 1, Strategy::Default)
            .is_none());
        assert!(m
            .create_allocation_request(8192, 1, Strategy::MinOffset)
            .is_none());
    }

    #[test]
    fn test_strategies_all_find_space() {
        for strategy in [
            Strategy::Default,
            Strategy::MinTime,
            Strategy::MinMemory,
            Strategy::MinOffset,
        ] {
            let mut m = TlsfMetadata::new(1 << 18, false);
            let mut handles = Vec::new();
            for i in 0..32 {
                handles.push(alloc(&mut m, 512 + i * 128, 64, strategy));
            }
            for h in handles.drain(..).step_by(2) {
                m.free(h);
            }
            m.validate();
            // Fragmented block still serves requests under every strategy.
            let h = alloc(&mut m, 700, 128, strategy);
            let info = m.allocation_info(h);
            assert_eq!(info.offset % 128, 0);
        }
    }

    #[test]
    fn test_min_offset_prefers_lowest() {
        let mut m = TlsfMetadata::new(1 << 18, false);
        let a = alloc(&mut m, 8192, 1, Strategy::Default);
        let _b = alloc(&mut m, 8192, 1, Strategy::Default);
        let c = alloc(&mut m, 8192, 1, Strategy::Default);
        let _d = alloc(&mut m, 8192, 1, Strategy::Default);
        m.free(a);
        m.free(c);
        // Both holes fit; min-offset must pick the one at offset 0.
        let e = alloc(&mut m, 4096, 1, Strategy::MinOffset);
        assert_eq!(m.allocation_info(e).offset, 0);
    }

    #[test]
    fn test_iteration_walks_all_allocations() {
        let mut m = TlsfMetadata::new(1 << 16, false);
        let mut expected = Vec::new();
        for i in 0..8 {
            let h = alloc(&mut m, 512, 1, Strategy::Default);
            m.set_allocation_user_data(h, 100 + i);
            expected.push(100 + i);
        }
        let mut seen = Vec::new();
        let mut cursor = m.allocation_list_begin();
        while let Some(h) = cursor {
            seen.push(m.allocation_info(h).user_data);
            cursor = m.next_allocation(h);
        }
        // The walk runs from the null block downward, so highest offset first.
        seen.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_next_free_region_size() {
        let mut m = TlsfMetadata::new(1 << 16, false);
        let a = alloc(&mut m, 1024, 1, Strategy::Default);
        let b = alloc(&mut m, 1024, 1, Strategy::Default);
        assert_eq!(m.next_free_region_size(b), 0);
        m.free(a);
        assert_eq!(m.next_free_region_size(b), 1024);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut m = TlsfMetadata::new(1 << 16, true);
        for _ in 0..4 {
            let _ = alloc(&mut m, 1000, 8, Strategy::Default);
        }
        m.clear();
        m.validate();
        assert_eq!(m.allocation_count(), 0);
        assert_eq!(m.sum_free_size(), 1 << 16);
        let h = alloc(&mut m, 1000, 8, Strategy::Default);
        assert_eq!(m.allocation_info(h).offset, 0);
    }

    #[test]
    fn test_virtual_small_class_granularity() {
        // Virtual blocks bucket class 0 in steps of 8 instead of 64.
        assert_eq!(TlsfMetadata::second_index(8, 0, true), 0);
        assert_eq!(TlsfMetadata::second_index(9, 0, true), 1);
        assert_eq!(TlsfMetadata::second_index(256, 0, true), 31);
        assert_eq!(TlsfMetadata::second_index(64, 0, false), 0);
        assert_eq!(TlsfMetadata::second_index(256, 0, false), 3);
    }

    #[test]
    fn test_bucket_math() {
        assert_eq!(TlsfMetadata::size_to_memory_class(256), 0);
        assert_eq!(TlsfMetadata::size_to_memory_class(257), 1);
        assert_eq!(TlsfMetadata::size_to_memory_class(512), 2);
        assert_eq!(TlsfMetadata::second_index(257, 1, false), 0);
        assert_eq!(TlsfMetadata::second_index(511, 1, false), 31);
        assert_eq!(TlsfMetadata::second_index(512, 2, false), 0);
    }
}
