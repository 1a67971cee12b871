//! Linear block metadata: O(1) bump allocation with ring-buffer and
//! double-stack modes.
//!
//! Suballocations live in two ordered vectors. The first holds the main
//! sequence; the second is either a ring-buffer continuation (offsets below
//! the first vector's front, used after wrap-around) or an upper-address
//! stack (offsets above the first vector's back), discovered implicitly from
//! the sequence of requests. Frees only mark holes; the holes are reclaimed
//! when they reach a vector's edge, when the first vector drains (ring swap),
//! or by compaction once the null ratio grows too large.

use crate::metadata::{AllocHandle, AllocationRequest, Region, RequestKind, SuballocInfo};
use crate::metadata::DEBUG_MARGIN;
use crate::util::align::{align_down, align_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuballocKind {
    Free,
    Allocation,
}

#[derive(Debug, Clone, Copy)]
struct Suballoc {
    offset: u64,
    size: u64,
    user_data: u64,
    kind: SuballocKind,
}

/// Role of the second suballocation vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecondVectorMode {
    Empty,
    /// Offsets below the first vector's front; filled after wrap-around.
    RingBuffer,
    /// Offsets above the first vector's back; filled by upper-address
    /// requests, stored in decreasing offset order.
    DoubleStack,
}

pub(crate) struct LinearMetadata {
    size: u64,
    sum_free_size: u64,
    suballocations: [Vec<Suballoc>; 2],
    /// Which of the two vectors currently acts as "first"; flipped when a
    /// drained first vector swaps with a ring-buffer second vector.
    first_vector_index: usize,
    second_vector_mode: SecondVectorMode,
    /// Number of freed items at the front of the first vector.
    null_items_begin_count: usize,
    /// Number of freed items in the middle of the first vector.
    null_items_middle_count: usize,
    /// Number of freed items anywhere in the second vector.
    null_items_count_2nd: usize,
}

impl LinearMetadata {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            sum_free_size: size,
            suballocations: [Vec::new(), Vec::new()],
            first_vector_index: 0,
            second_vector_mode: SecondVectorMode::Empty,
            null_items_begin_count: 0,
            null_items_middle_count: 0,
            null_items_count_2nd: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sum_free_size(&self) -> u64 {
        self.sum_free_size
    }

    pub fn allocation_count(&self) -> u32 {
        let first = self.first();
        let second = self.second();
        (first.len() - self.null_items_begin_count - self.null_items_middle_count
            + second.len()
            - self.null_items_count_2nd) as u32
    }

    fn first(&self) -> &Vec<Suballoc> {
        &self.suballocations[self.first_vector_index]
    }

    fn first_mut(&mut self) -> &mut Vec<Suballoc> {
        &mut self.suballocations[self.first_vector_index]
    }

    fn second(&self) -> &Vec<Suballoc> {
        &self.suballocations[self.first_vector_index ^ 1]
    }

    fn second_mut(&mut self) -> &mut Vec<Suballoc> {
        &mut self.suballocations[self.first_vector_index ^ 1]
    }

    pub fn create_allocation_request(
        &mut self,
        size: u64,
        alignment: u64,
        upper_address: bool,
    ) -> Option<AllocationRequest> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());
        if upper_address {
            self.create_request_upper(size, alignment)
        } else {
            self.create_request_lower(size, alignment)
        }
    }

    fn create_request_upper(&self, size: u64, alignment: u64) -> Option<AllocationRequest> {
        assert!(
            self.second_vector_mode != SecondVectorMode::RingBuffer,
            "cannot use upper-address allocation in a linear block already used as ring buffer"
        );
        if size > self.size {
            return None;
        }
        // Top of the free region: block end, or the lowest upper allocation.
        let second = self.second();
        let mut result_offset = if let Some(last) = second.last() {
            if size > last.offset {
                return None;
            }
            last.offset - size
        } else {
            self.size - size
        };
        if DEBUG_MARGIN > 0 {
            result_offset = result_offset.checked_sub(DEBUG_MARGIN)?;
        }
        result_offset = align_down(result_offset, alignment);

        // Must stay above everything in the first vector.
        let end_of_1st = self
            .first()
            .last()
            .map_or(0, |last| last.offset + last.size);
        if end_of_1st + DEBUG_MARGIN > result_offset {
            return None;
        }
        Some(AllocationRequest {
            handle: AllocHandle::new(result_offset + 1),
            size,
            kind: RequestKind::UpperAddress,
        })
    }

    fn create_request_lower(&self, size: u64, alignment: u64) -> Option<AllocationRequest> {
        let first = self.first();
        let second = self.second();

        if second.is_empty() || self.second_vector_mode == SecondVectorMode::DoubleStack {
            // Try the end of the first vector.
            let base = first.last().map_or(0, |last| last.offset + last.size);
            let result_offset = align_up(base + DEBUG_MARGIN, alignment);
            let free_space_end =
                if self.second_vector_mode == SecondVectorMode::DoubleStack && !second.is_empty() {
                    second.last().map(|s| s.offset).unwrap_or(self.size)
                } else {
                    self.size
                };
            if result_offset + size + DEBUG_MARGIN <= free_space_end {
                return Some(AllocationRequest {
                    handle: AllocHandle::new(result_offset + 1),
                    size,
                    kind: RequestKind::EndOf1st,
                });
            }
        }

        if self.second_vector_mode == SecondVectorMode::Empty
            || self.second_vector_mode == SecondVectorMode::RingBuffer
        {
            // Wrap around: allocate at the end of the second vector, with the
            // first live item of the first vector as the end of free space.
            let base = second.last().map_or(0, |last| last.offset + last.size);
            let result_offset = align_up(base + DEBUG_MARGIN, alignment);
            let limit = first
                .get(self.null_items_begin_count)
                .map_or(self.size, |s| s.offset);
            if result_offset + size + DEBUG_MARGIN <= limit && !first.is_empty() {
                return Some(AllocationRequest {
                    handle: AllocHandle::new(result_offset + 1),
                    size,
                    kind: RequestKind::EndOf2nd,
                });
            }
        }
        None
    }

    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        let offset = request.handle.raw() - 1;
        let item = Suballoc {
            offset,
            size: request.size,
            user_data,
            kind: SuballocKind::Allocation,
        };
        match request.kind {
            RequestKind::UpperAddress => {
                assert!(
                    self.second_vector_mode != SecondVectorMode::RingBuffer,
                    "cannot use linear block as double stack: it is already a ring buffer"
                );
                self.second_mut().push(item);
                self.second_vector_mode = SecondVectorMode::DoubleStack;
            }
            RequestKind::EndOf1st => {
                debug_assert!(self
                    .first()
                    .last()
                    .map_or(true, |last| last.offset + last.size <= offset));
                self.first_mut().push(item);
            }
            RequestKind::EndOf2nd => {
                // The wrapped item must lie entirely before the first vector's
                // first live suballocation.
                let first = self.first();
                assert!(
                    !first.is_empty()
                        && offset + request.size <= first[self.null_items_begin_count].offset,
                    "cannot use linear block as ring buffer: no room before the first vector"
                );
                self.second_mut().push(item);
                self.second_vector_mode = SecondVectorMode::RingBuffer;
            }
            RequestKind::TlsfAt(_) => unreachable!("linear metadata never produces TlsfAt requests"),
        }
        self.sum_free_size -= item.size;
    }

    pub fn free(&mut self, handle: AllocHandle) {
        let offset = handle.raw() - 1;
        let begin = self.null_items_begin_count;

        // Fast path: first live item of the first vector.
        if begin < self.first().len() && self.first()[begin].offset == offset {
            let item = &mut self.suballocations[self.first_vector_index][begin];
            debug_assert!(item.kind == SuballocKind::Allocation);
            item.kind = SuballocKind::Free;
            item.user_data = 0;
            self.sum_free_size += item.size;
            self.null_items_begin_count += 1;
            self.cleanup_after_free();
            return;
        }

        // Fast path: newest item of the active last vector.
        if self.second_vector_mode != SecondVectorMode::Empty {
            if let Some(last) = self.second().last() {
                if last.offset == offset {
                    let size = last.size;
                    self.second_mut().pop();
                    self.sum_free_size += size;
                    self.cleanup_after_free();
                    return;
                }
            }
        } else if let Some(last) = self.first().last() {
            if last.offset == offset {
                let size = last.size;
                self.first_mut().pop();
                self.sum_free_size += size;
                self.cleanup_after_free();
                return;
            }
        }

        // Middle of the first vector.
        if let Some(index) = self.find_in_first(offset) {
            let item = &mut self.suballocations[self.first_vector_index][index];
            debug_assert!(item.kind == SuballocKind::Allocation);
            item.kind = SuballocKind::Free;
            item.user_data = 0;
            self.sum_free_size += item.size;
            self.null_items_middle_count += 1;
            self.cleanup_after_free();
            return;
        }

        // Middle of the second vector.
        if self.second_vector_mode != SecondVectorMode::Empty {
            if let Some(index) = self.find_in_second(offset) {
                let item = &mut self.suballocations[self.first_vector_index ^ 1][index];
                debug_assert!(item.kind == SuballocKind::Allocation);
                item.kind = SuballocKind::Free;
                item.user_data = 0;
                self.sum_free_size += item.size;
                self.null_items_count_2nd += 1;
                self.cleanup_after_free();
                return;
            }
        }

        panic!("allocation to free not found in linear block");
    }

    /// Binary search the live range of the first vector (ascending offsets).
    fn find_in_first(&self, offset: u64) -> Option<usize> {
        let first = self.first();
        let begin = self.null_items_begin_count;
        first[begin..]
            .binary_search_by(|s| s.offset.cmp(&offset))
            .ok()
            .map(|i| i + begin)
    }

    /// Binary search the second vector. Ring buffers keep ascending offsets,
    /// double stacks descending.
    fn find_in_second(&self, offset: u64) -> Option<usize> {
        let second = self.second();
        match self.second_vector_mode {
            SecondVectorMode::RingBuffer => {
                second.binary_search_by(|s| s.offset.cmp(&offset)).ok()
            }
            SecondVectorMode::DoubleStack => {
                second.binary_search_by(|s| offset.cmp(&s.offset)).ok()
            }
            SecondVectorMode::Empty => None,
        }
    }

    fn should_compact_1st(&self) -> bool {
        let null_count = self.null_items_begin_count + self.null_items_middle_count;
        let total = self.first().len();
        total > 32 && null_count * 2 >= (total - null_count) * 3
    }

    fn cleanup_after_free(&mut self) {
        if self.allocation_count() == 0 {
            self.suballocations[0].clear();
            self.suballocations[1].clear();
            self.null_items_begin_count = 0;
            self.null_items_middle_count = 0;
            self.null_items_count_2nd = 0;
            self.second_vector_mode = SecondVectorMode::Empty;
            debug_assert_eq!(self.sum_free_size, self.size);
            return;
        }

        // Extend the leading-null run of the first vector.
        {
            let fvi = self.first_vector_index;
            while self.null_items_begin_count < self.suballocations[fvi].len()
                && self.suballocations[fvi][self.null_items_begin_count].kind == SuballocKind::Free
            {
                self.null_items_begin_count += 1;
                self.null_items_middle_count -= 1;
            }
            // Drop trailing nulls of the first vector.
            while self.null_items_middle_count > 0
                && self.suballocations[fvi].last().map(|s| s.kind) == Some(SuballocKind::Free)
            {
                self.null_items_middle_count -= 1;
                self.suballocations[fvi].pop();
            }
            // Drop trailing and then leading nulls of the second vector.
            let svi = fvi ^ 1;
            while self.null_items_count_2nd > 0
                && self.suballocations[svi].last().map(|s| s.kind) == Some(SuballocKind::Free)
            {
                self.null_items_count_2nd -= 1;
                self.suballocations[svi].pop();
            }
            while self.null_items_count_2nd > 0
                && self.suballocations[svi].first().map(|s| s.kind) == Some(SuballocKind::Free)
            {
                self.null_items_count_2nd -= 1;
                self.suballocations[svi].remove(0);
            }
        }

        if self.should_compact_1st() {
            let fvi = self.first_vector_index;
            let first = &mut self.suballocations[fvi];
            first.retain(|s| s.kind == SuballocKind::Allocation);
            self.null_items_begin_count = 0;
            self.null_items_middle_count = 0;
        }

        // First vector drained: clear it, and if the second vector is a ring
        // buffer, promote it to be the new first vector.
        if self.first().len() == self.null_items_begin_count {
            self.first_mut().clear();
            self.null_items_begin_count = 0;
            if !self.second().is_empty()
                && self.second_vector_mode == SecondVectorMode::RingBuffer
            {
                self.second_vector_mode = SecondVectorMode::Empty;
                self.null_items_middle_count = self.null_items_count_2nd;
                self.null_items_count_2nd = 0;
                self.first_vector_index ^= 1;
                // Re-scan the new first vector's leading nulls.
                let fvi = self.first_vector_index;
                while self.null_items_begin_count < self.suballocations[fvi].len()
                    && self.suballocations[fvi][self.null_items_begin_count].kind
                        == SuballocKind::Free
                {
                    self.null_items_begin_count += 1;
                    self.null_items_middle_count -= 1;
                }
            }
        }

        #[cfg(feature = "debug")]
        self.validate();
    }

    pub fn clear(&mut self) {
        self.suballocations[0].clear();
        self.suballocations[1].clear();
        self.first_vector_index = 0;
        self.second_vector_mode = SecondVectorMode::Empty;
        self.null_items_begin_count = 0;
        self.null_items_middle_count = 0;
        self.null_items_count_2nd = 0;
        self.sum_free_size = self.size;
    }

    /// Handles encode the suballocation offset directly.
    pub fn allocation_offset(&self, handle: AllocHandle) -> u64 {
        handle.raw() - 1
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> SuballocInfo {
        let offset = handle.raw() - 1;
        let item = self
            .find_in_first(offset)
            .map(|i| &self.first()[i])
            .or_else(|| self.find_in_second(offset).map(|i| &self.second()[i]))
            .expect("suballocation not found in linear block");
        SuballocInfo {
            offset: item.offset,
            size: item.size,
            user_data: item.user_data,
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        let offset = handle.raw() - 1;
        if let Some(index) = self.find_in_first(offset) {
            self.suballocations[self.first_vector_index][index].user_data = user_data;
            return;
        }
        if let Some(index) = self.find_in_second(offset) {
            self.suballocations[self.first_vector_index ^ 1][index].user_data = user_data;
            return;
        }
        panic!("suballocation not found in linear block");
    }

    pub fn for_each_region(&self, f: &mut dyn FnMut(Region)) {
        // Both vectors hold address-sorted items; merge them into one address
        // walk, materializing the free gaps between live suballocations.
        let mut used: Vec<&Suballoc> = self
            .first()
            .iter()
            .chain(self.second().iter())
            .filter(|s| s.kind == SuballocKind::Allocation)
            .collect();
        used.sort_unstable_by_key(|s| s.offset);

        let mut cursor = 0u64;
        for item in used {
            if item.offset > cursor {
                f(Region {
                    offset: cursor,
                    size: item.offset - cursor,
                    user_data: None,
                });
            }
            f(Region {
                offset: item.offset,
                size: item.size,
                user_data: Some(item.user_data),
            });
            cursor = item.offset + item.size;
        }
        if cursor < self.size {
            f(Region {
                offset: cursor,
                size: self.size - cursor,
                user_data: None,
            });
        }
    }

    pub fn validate(&self) {
        let first = self.first();
        let second = self.second();

        assert!(self.null_items_begin_count <= first.len());
        assert!(
            self.null_items_begin_count + self.null_items_middle_count <= first.len()
        );
        assert!(self.null_items_count_2nd <= second.len());
        assert!(
            second.is_empty() == (self.second_vector_mode == SecondVectorMode::Empty),
            "second vector emptiness must match its mode"
        );

        // Leading nulls really are free.
        for item in &first[..self.null_items_begin_count] {
            assert!(item.kind == SuballocKind::Free);
        }

        let mut used_size = 0u64;
        let mut free_in_first = 0;
        let mut prev_end = 0u64;
        for item in first.iter() {
            assert!(item.offset >= prev_end, "first vector offsets must ascend");
            prev_end = item.offset + item.size;
            match item.kind {
                SuballocKind::Free => free_in_first += 1,
                SuballocKind::Allocation => used_size += item.size,
            }
        }
        assert_eq!(
            free_in_first,
            self.null_items_begin_count + self.null_items_middle_count
        );
        let first_end = prev_end;

        let mut free_in_second = 0;
        match self.second_vector_mode {
            SecondVectorMode::Empty => {}
            SecondVectorMode::RingBuffer => {
                let mut prev_end = 0u64;
                for item in second.iter() {
                    assert!(item.offset >= prev_end, "ring offsets must ascend");
                    prev_end = item.offset + item.size;
                    match item.kind {
                        SuballocKind::Free => free_in_second += 1,
                        SuballocKind::Allocation => used_size += item.size,
                    }
                }
                // The whole ring lies before the first live item of 1st.
                if let Some(first_live) = first.get(self.null_items_begin_count) {
                    assert!(prev_end <= first_live.offset);
                }
            }
            SecondVectorMode::DoubleStack => {
                let mut prev_offset = u64::MAX;
                for item in second.iter() {
                    assert!(item.offset < prev_offset, "stack offsets must descend");
                    prev_offset = item.offset;
                    match item.kind {
                        SuballocKind::Free => free_in_second += 1,
                        SuballocKind::Allocation => used_size += item.size,
                    }
                }
                // The whole stack lies after the end of 1st.
                if let Some(lowest) = second.last() {
                    assert!(lowest.offset >= first_end);
                }
            }
        }
        assert_eq!(free_in_second, self.null_items_count_2nd);
        assert_eq!(
            self.sum_free_size,
            self.size - used_size,
            "sum of free and used sizes must equal block size"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        m: &mut LinearMetadata,
        size: u64,
        alignment: u64,
        upper: bool,
    ) -> AllocationRequest {
        m.create_allocation_request(size, alignment, upper)
            .expect("allocation must fit")
    }

    fn alloc(m: &mut LinearMetadata, size: u64, alignment: u64, upper: bool) -> AllocHandle {
        let r = request(m, size, alignment, upper);
        m.alloc(&r, 0);
        r.handle
    }

    #[test]
    fn test_sequential_fill_and_reset() {
        let mut m = LinearMetadata::new(4096);
        let a = alloc(&mut m, 1024, 1, false);
        let b = alloc(&mut m, 1024, 1, false);
        let c = alloc(&mut m, 1024, 1, false);
        assert_eq!(m.allocation_offset(a), 0);
        assert_eq!(m.allocation_offset(b), 1024);
        assert_eq!(m.allocation_offset(c), 2048);
        m.validate();

        m.free(a);
        // There is still room at the end of the first vector.
        let d = alloc(&mut m, 1024, 1, false);
        assert_eq!(m.allocation_offset(d), 3072);
        m.validate();

        m.free(b);
        m.free(c);
        m.free(d);
        assert_eq!(m.allocation_count(), 0);
        assert_eq!(m.sum_free_size(), 4096);
        m.validate();
    }

    #[test]
    fn test_ring_wrap() {
        let mut m = LinearMetadata::new(4096);
        let a = alloc(&mut m, 1024, 1, false);
        let _b = alloc(&mut m, 1024, 1, false);
        let _c = alloc(&mut m, 1536, 1, false);
        m.free(a);

        // 512 bytes remain at the tail; 1024 must wrap to the front.
        let d = alloc(&mut m, 1024, 1, false);
        assert_eq!(m.allocation_offset(d), 0);
        assert_eq!(m.sum_free_size(), 4096 - 1024 - 1536 - 1024);
        m.validate();
    }

    #[test]
    fn test_ring_swap_on_drain() {
        let mut m = LinearMetadata::new(4096);
        let a = alloc(&mut m, 2048, 1, false);
        let b = alloc(&mut m, 1024, 1, false);
        m.free(a);
        let c = alloc(&mut m, 2048, 1, false); // wraps to offset 0
        assert_eq!(m.allocation_offset(c), 0);
        // Draining the first vector promotes the ring to first.
        m.free(b);
        m.validate();
        assert_eq!(m.allocation_count(), 1);
        // New allocations continue after the promoted vector.
        let d = alloc(&mut m, 1024, 1, false);
        assert_eq!(m.allocation_offset(d), 2048);
        m.validate();
    }

    #[test]
    fn test_double_stack() {
        let mut m = LinearMetadata::new(4096);
        let l = alloc(&mut m, 512, 1, false);
        let u = alloc(&mut m, 512, 256, true);
        assert_eq!(m.allocation_offset(l), 0);
        assert_eq!(m.allocation_offset(u), 3584);
        m.validate();

        m.free(l);
        let l2 = alloc(&mut m, 2048, 1, false);
        assert_eq!(m.allocation_offset(l2), 0);
        assert_eq!(m.sum_free_size(), 4096 - 512 - 2048);
        m.validate();

        m.free(u);
        m.free(l2);
        assert_eq!(m.sum_free_size(), 4096);
    }

    #[test]
    fn test_upper_address_alignment_rounds_down() {
        let mut m = LinearMetadata::new(4000);
        let u = alloc(&mut m, 512, 256, true);
        // 4000 - 512 = 3488, aligned down to 3328.
        assert_eq!(m.allocation_offset(u), 3328);
        m.validate();
    }

    #[test]
    #[should_panic(expected = "ring buffer")]
    fn test_upper_after_ring_panics() {
        let mut m = LinearMetadata::new(4096);
        let a = alloc(&mut m, 2048, 1, false);
        let _b = alloc(&mut m, 2048, 1, false);
        m.free(a);
        let _wrapped = alloc(&mut m, 512, 1, false); // enters ring mode
        let _ = m.create_allocation_request(128, 1, true);
    }

    #[test]
    fn test_wrap_blocked_by_double_stack() {
        let mut m = LinearMetadata::new(4096);
        let _u = alloc(&mut m, 1024, 1, true);
        let _l = alloc(&mut m, 2048, 1, false);
        // 1024 left between the stacks, but wrapping is only legal in ring
        // mode; an oversized request must simply fail.
        assert!(m.create_allocation_request(1536, 1, false).is_none());
        m.validate();
    }

    #[test]
    fn test_middle_free_marks_hole() {
        let mut m = LinearMetadata::new(8192);
        let handles: Vec<_> = (0..6).map(|_| alloc(&mut m, 1024, 1, false)).collect();
        m.free(handles[2]);
        m.free(handles[4]);
        assert_eq!(m.allocation_count(), 4);
        assert_eq!(m.sum_free_size(), 8192 - 4 * 1024);
        m.validate();

        // The holes are not reusable until they reach an edge.
        assert!(m.create_allocation_request(4096, 1, false).is_none());

        for &h in [handles[0], handles[1], handles[3], handles[5]].iter() {
            m.free(h);
        }
        assert_eq!(m.allocation_count(), 0);
        assert_eq!(m.sum_free_size(), 8192);
    }

    #[test]
    fn test_compaction_threshold() {
        let mut m = LinearMetadata::new(1 << 20);
        let handles: Vec<_> = (0..64).map(|_| alloc(&mut m, 1024, 1, false)).collect();
        // Free all even-indexed allocations except the first, creating many
        // middle holes; then odd tail frees trigger cleanup passes.
        for chunk in handles[1..].chunks(2) {
            m.free(chunk[0]);
        }
        m.validate();
        assert_eq!(m.allocation_count(), 32);
        // Freeing more keeps counters consistent through compaction.
        for chunk in handles[1..].chunks(2) {
            if chunk.len() > 1 {
                m.free(chunk[1]);
            }
        }
        m.free(handles[0]);
        assert_eq!(m.allocation_count(), 0);
        assert_eq!(m.sum_free_size(), 1 << 20);
    }

    #[test]
    fn test_for_each_region_reports_gaps() {
        let mut m = LinearMetadata::new(4096);
        let a = alloc(&mut m, 1024, 1, false);
        let _b = alloc(&mut m, 512, 1, false);
        let _u = alloc(&mut m, 256, 1, true);
        m.free(a);

        let mut regions = Vec::new();
        m.for_each_region(&mut |r| regions.push(r));
        let total: u64 = regions.iter().map(|r| r.size).sum();
        assert_eq!(total, 4096);
        // free hole at 0, live at 1024, free gap, live at top
        assert!(regions[0].user_data.is_none());
        assert_eq!(regions[0].size, 1024);
        assert_eq!(regions[1].offset, 1024);
        assert!(regions[1].user_data.is_some());
        assert_eq!(regions.last().unwrap().offset, 3840);
    }

    #[test]
    fn test_too_large_request_fails() {
        let mut m = LinearMetadata::new(1024);
        assert!(m.create_allocation_request(1025, 1, false).is_none());
        assert!(m.create_allocation_request(1025, 1, true).is_none());
        let _a = alloc(&mut m, 1024, 1, false);
        assert!(m.create_allocation_request(1, 1, false).is_none());
    }
}
