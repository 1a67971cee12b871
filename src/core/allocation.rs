//! Allocation objects.
//!
//! Every allocation handed to the caller is a small `Copy` handle into a
//! generation-checked slab owned by the allocator. The slab recycles freed
//! slots through a lock-free queue, and committed/heap allocations form
//! intrusive per-list chains through `prev`/`next` indices embedded in their
//! slot data.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::core::block::BlockVector;
use crate::core::stats::{DetailedStatistics, Statistics};
use crate::device::{Device, HeapType};
use crate::error::{Error, Result};
use crate::json::JsonWriter;
use crate::metadata::AllocHandle;
use crate::sync::{Mutex, RwMutex};

const NIL: u32 = u32::MAX;

/// Handle to a single memory allocation.
///
/// Plain `Copy` data; all queries and mutations go through the owning
/// [`Allocator`](crate::Allocator). Using a handle after freeing it (or
/// freeing it twice) is caught by a generation check and reported as
/// [`Error::InvalidArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Where an allocation's bytes physically live.
pub(crate) enum Place<D: Device> {
    /// Its own heap: either a committed resource (implicit heap) or an
    /// explicitly created dedicated heap.
    Dedicated {
        /// `None` for committed resources, whose heap is implicit.
        heap: Option<Arc<D::Heap>>,
        heap_type: HeapType,
        list: Arc<CommittedAllocationList>,
        prev: u32,
        next: u32,
    },
    /// A suballocation inside a block of a block vector.
    Placed {
        vector: Arc<BlockVector<D>>,
        block_id: u32,
        handle: AllocHandle,
        offset: u64,
        heap: Arc<D::Heap>,
    },
}

pub(crate) struct AllocationData<D: Device> {
    pub size: u64,
    pub alignment: u64,
    pub resource: Option<Arc<D::Resource>>,
    pub name: Option<String>,
    pub private_data: u64,
    /// Set on temporary destination allocations created by defragmentation,
    /// so the planner skips its own work products.
    pub is_defrag_tmp: bool,
    pub place: Place<D>,
}

impl<D: Device> AllocationData<D> {
    pub fn offset(&self) -> u64 {
        match &self.place {
            Place::Dedicated { .. } => 0,
            Place::Placed { offset, .. } => *offset,
        }
    }

    pub fn heap(&self) -> Option<Arc<D::Heap>> {
        match &self.place {
            Place::Dedicated { heap, .. } => heap.clone(),
            Place::Placed { heap, .. } => Some(heap.clone()),
        }
    }
}

struct Slot<D: Device> {
    generation: u32,
    data: Option<AllocationData<D>>,
}

/// Slab of allocation objects shared by the whole allocator.
pub(crate) struct AllocationObjectAllocator<D: Device> {
    slots: RwMutex<Vec<Slot<D>>>,
    recycled: SegQueue<u32>,
}

impl<D: Device> AllocationObjectAllocator<D> {
    pub fn new() -> Self {
        Self {
            slots: RwMutex::new(Vec::with_capacity(256)),
            recycled: SegQueue::new(),
        }
    }

    pub fn insert(&self, data: AllocationData<D>) -> Allocation {
        let mut slots = self.slots.write();
        if let Some(index) = self.recycled.pop() {
            let slot = &mut slots[index as usize];
            debug_assert!(slot.data.is_none());
            slot.generation = slot.generation.wrapping_add(1);
            slot.data = Some(data);
            Allocation {
                index,
                generation: slot.generation,
            }
        } else {
            let index = slots.len() as u32;
            slots.push(Slot {
                generation: 1,
                data: Some(data),
            });
            Allocation {
                index,
                generation: 1,
            }
        }
    }

    /// Take the data out, invalidating the handle.
    pub fn remove(&self, allocation: Allocation) -> Result<AllocationData<D>> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(allocation.index as usize)
            .ok_or(Error::InvalidArgument("unknown allocation"))?;
        if slot.generation != allocation.generation || slot.data.is_none() {
            return Err(Error::InvalidArgument("stale allocation handle"));
        }
        let data = slot.data.take().expect("checked above");
        drop(slots);
        self.recycled.push(allocation.index);
        Ok(data)
    }

    pub fn with<R>(
        &self,
        allocation: Allocation,
        f: impl FnOnce(&AllocationData<D>) -> R,
    ) -> Result<R> {
        let slots = self.slots.read();
        let slot = slots
            .get(allocation.index as usize)
            .ok_or(Error::InvalidArgument("unknown allocation"))?;
        match &slot.data {
            Some(data) if slot.generation == allocation.generation => Ok(f(data)),
            _ => Err(Error::InvalidArgument("stale allocation handle")),
        }
    }

    pub fn with_mut<R>(
        &self,
        allocation: Allocation,
        f: impl FnOnce(&mut AllocationData<D>) -> R,
    ) -> Result<R> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(allocation.index as usize)
            .ok_or(Error::InvalidArgument("unknown allocation"))?;
        match &mut slot.data {
            Some(data) if slot.generation == allocation.generation => Ok(f(data)),
            _ => Err(Error::InvalidArgument("stale allocation handle")),
        }
    }

    /// Access two distinct allocations at once (defragmentation swaps).
    pub fn with_two_mut<R>(
        &self,
        a: Allocation,
        b: Allocation,
        f: impl FnOnce(&mut AllocationData<D>, &mut AllocationData<D>) -> R,
    ) -> Result<R> {
        assert_ne!(a.index, b.index);
        let mut slots = self.slots.write();
        let (low, high) = if a.index < b.index { (a, b) } else { (b, a) };
        let (head, tail) = slots.split_at_mut(high.index as usize);
        let low_slot = head
            .get_mut(low.index as usize)
            .ok_or(Error::InvalidArgument("unknown allocation"))?;
        let high_slot = tail
            .get_mut(0)
            .ok_or(Error::InvalidArgument("unknown allocation"))?;
        let low_ok = low_slot.generation == low.generation && low_slot.data.is_some();
        let high_ok = high_slot.generation == high.generation && high_slot.data.is_some();
        if !low_ok || !high_ok {
            return Err(Error::InvalidArgument("stale allocation handle"));
        }
        let low_data = low_slot.data.as_mut().expect("checked above");
        let high_data = high_slot.data.as_mut().expect("checked above");
        if a.index < b.index {
            Ok(f(low_data, high_data))
        } else {
            Ok(f(high_data, low_data))
        }
    }

    /// Whether the handle still refers to a live allocation.
    pub fn is_valid(&self, allocation: Allocation) -> bool {
        let slots = self.slots.read();
        slots
            .get(allocation.index as usize)
            .map_or(false, |s| s.generation == allocation.generation && s.data.is_some())
    }
}

/// Pack an allocation handle into the u64 a metadata suballocation carries.
pub(crate) fn pack_allocation(allocation: Allocation) -> u64 {
    ((allocation.generation as u64) << 32) | allocation.index as u64
}

pub(crate) fn unpack_allocation(user_data: u64) -> Allocation {
    Allocation {
        index: user_data as u32,
        generation: (user_data >> 32) as u32,
    }
}

struct ListHead {
    first: u32,
    last: u32,
    count: u32,
}

/// Intrusive list of committed/heap allocations sharing a heap type (default
/// pools) or a pool.
pub(crate) struct CommittedAllocationList {
    heap_type: HeapType,
    head: Mutex<ListHead>,
}

impl CommittedAllocationList {
    pub fn new(heap_type: HeapType) -> Self {
        Self {
            heap_type,
            head: Mutex::new(ListHead {
                first: NIL,
                last: NIL,
                count: 0,
            }),
        }
    }

    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    pub fn is_empty(&self) -> bool {
        self.head.lock().count == 0
    }

    /// Link a freshly inserted dedicated allocation at the back.
    pub fn register<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        allocation: Allocation,
    ) {
        let mut head = self.head.lock();
        let mut slots = objects.slots.write();
        let old_last = head.last;
        {
            let data = slots[allocation.index as usize]
                .data
                .as_mut()
                .expect("registering a dead allocation");
            match &mut data.place {
                Place::Dedicated { prev, next, .. } => {
                    *prev = old_last;
                    *next = NIL;
                }
                Place::Placed { .. } => unreachable!("placed allocations are not list members"),
            }
        }
        if old_last != NIL {
            let last_data = slots[old_last as usize]
                .data
                .as_mut()
                .expect("list tail must be alive");
            match &mut last_data.place {
                Place::Dedicated { next, .. } => *next = allocation.index,
                Place::Placed { .. } => unreachable!(),
            }
        } else {
            head.first = allocation.index;
        }
        head.last = allocation.index;
        head.count += 1;
    }

    /// Unlink an allocation; must happen before its slot is removed.
    pub fn unregister<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        allocation: Allocation,
    ) {
        let mut head = self.head.lock();
        let mut slots = objects.slots.write();
        let (prev, next) = {
            let data = slots[allocation.index as usize]
                .data
                .as_ref()
                .expect("unregistering a dead allocation");
            match &data.place {
                Place::Dedicated { prev, next, .. } => (*prev, *next),
                Place::Placed { .. } => unreachable!("placed allocations are not list members"),
            }
        };
        if prev != NIL {
            match &mut slots[prev as usize].data.as_mut().expect("live").place {
                Place::Dedicated { next: n, .. } => *n = next,
                Place::Placed { .. } => unreachable!(),
            }
        } else {
            head.first = next;
        }
        if next != NIL {
            match &mut slots[next as usize].data.as_mut().expect("live").place {
                Place::Dedicated { prev: p, .. } => *p = prev,
                Place::Placed { .. } => unreachable!(),
            }
        } else {
            head.last = prev;
        }
        head.count -= 1;
    }

    pub fn for_each<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        mut f: impl FnMut(&AllocationData<D>),
    ) {
        let head = self.head.lock();
        let slots = objects.slots.read();
        let mut index = head.first;
        while index != NIL {
            let data = slots[index as usize].data.as_ref().expect("list member must be alive");
            f(data);
            index = match &data.place {
                Place::Dedicated { next, .. } => *next,
                Place::Placed { .. } => unreachable!(),
            };
        }
    }

    pub fn add_statistics<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        stats: &mut Statistics,
    ) {
        self.for_each(objects, |data| {
            stats.block_count += 1;
            stats.allocation_count += 1;
            stats.block_bytes += data.size;
            stats.allocation_bytes += data.size;
        });
    }

    pub fn add_detailed_statistics<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        detailed: &mut DetailedStatistics,
    ) {
        self.for_each(objects, |data| detailed.add_dedicated(data.size));
    }

    pub fn write_json<D: Device>(
        &self,
        objects: &AllocationObjectAllocator<D>,
        json: &mut JsonWriter<'_>,
    ) {
        json.begin_array();
        self.for_each(objects, |data| {
            json.begin_object();
            json.write_key("Type");
            json.write_string(if data.resource.is_some() {
                "COMMITTED"
            } else {
                "HEAP"
            });
            json.write_key("Size");
            json.write_u64(data.size);
            if let Some(name) = &data.name {
                json.write_key("Name");
                json.write_string(name);
            }
            if data.private_data != 0 {
                json.write_key("PrivateData");
                json.write_u64(data.private_data);
            }
            json.end_object();
        });
        json.end_array();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        FeatureInfo, HeapDesc, MemorySegmentGroup, ResidencyPriority, ResourceAllocationInfo,
        ResourceDesc, VideoMemoryInfo,
    };
    use crate::device::HeapFlags;

    struct NoDevice;

    impl Device for NoDevice {
        type Heap = ();
        type Resource = ();

        fn query_feature_info(&self) -> FeatureInfo {
            FeatureInfo::default()
        }
        fn create_heap(&self, _desc: &HeapDesc) -> Result<()> {
            Ok(())
        }
        fn create_committed_resource(
            &self,
            _heap_type: HeapType,
            _heap_flags: HeapFlags,
            _desc: &ResourceDesc,
        ) -> Result<()> {
            Ok(())
        }
        fn create_placed_resource(&self, _heap: &(), _offset: u64, _desc: &ResourceDesc) -> Result<()> {
            Ok(())
        }
        fn resource_allocation_info(&self, desc: &ResourceDesc) -> ResourceAllocationInfo {
            ResourceAllocationInfo {
                size: desc.width,
                alignment: 65536,
            }
        }
        fn query_video_memory_info(&self, _group: MemorySegmentGroup) -> Result<VideoMemoryInfo> {
            Ok(VideoMemoryInfo::default())
        }
        fn set_heap_residency_priority(&self, _heap: &(), _p: ResidencyPriority) -> Result<()> {
            Ok(())
        }
        fn set_resource_residency_priority(&self, _r: &(), _p: ResidencyPriority) -> Result<()> {
            Ok(())
        }
    }

    fn dedicated(list: &Arc<CommittedAllocationList>, size: u64) -> AllocationData<NoDevice> {
        AllocationData {
            size,
            alignment: 65536,
            resource: None,
            name: None,
            private_data: 0,
            is_defrag_tmp: false,
            place: Place::Dedicated {
                heap: Some(Arc::new(())),
                heap_type: HeapType::Default,
                list: Arc::clone(list),
                prev: NIL,
                next: NIL,
            },
        }
    }

    #[test]
    fn test_slab_generation_check() {
        let objects = AllocationObjectAllocator::<NoDevice>::new();
        let list = Arc::new(CommittedAllocationList::new(HeapType::Default));
        let a = objects.insert(dedicated(&list, 100));
        assert!(objects.is_valid(a));
        assert_eq!(objects.with(a, |d| d.size).unwrap(), 100);

        objects.remove(a).unwrap();
        assert!(!objects.is_valid(a));
        assert!(matches!(objects.remove(a), Err(Error::InvalidArgument(_))));

        // The slot is recycled with a new generation.
        let b = objects.insert(dedicated(&list, 200));
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(!objects.is_valid(a));
        assert!(objects.is_valid(b));
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let a = Allocation {
            index: 12345,
            generation: 678,
        };
        assert_eq!(unpack_allocation(pack_allocation(a)), a);
    }

    #[test]
    fn test_committed_list_links() {
        let objects = AllocationObjectAllocator::<NoDevice>::new();
        let list = Arc::new(CommittedAllocationList::new(HeapType::Default));
        let handles: Vec<_> = (1..=4u64)
            .map(|i| {
                let a = objects.insert(dedicated(&list, i * 100));
                list.register(&objects, a);
                a
            })
            .collect();
        assert!(!list.is_empty());

        let mut sizes = Vec::new();
        list.for_each(&objects, |d| sizes.push(d.size));
        assert_eq!(sizes, vec![100, 200, 300, 400]);

        // Unlink from the middle and the ends.
        list.unregister(&objects, handles[1]);
        objects.remove(handles[1]).unwrap();
        list.unregister(&objects, handles[0]);
        objects.remove(handles[0]).unwrap();
        list.unregister(&objects, handles[3]);
        objects.remove(handles[3]).unwrap();

        let mut sizes = Vec::new();
        list.for_each(&objects, |d| sizes.push(d.size));
        assert_eq!(sizes, vec![300]);

        let mut stats = Statistics::default();
        list.add_statistics(&objects, &mut stats);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.block_bytes, 300);

        list.unregister(&objects, handles[2]);
        objects.remove(handles[2]).unwrap();
        assert!(list.is_empty());
    }
}
