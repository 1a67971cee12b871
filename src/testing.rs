//! Mock device used by unit tests.
//!
//! Backed by nothing but counters: heaps and resources are plain structs, and
//! both budgets and creation failures can be programmed per test.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::device::{
    Device, FeatureInfo, HeapDesc, HeapType, MemorySegmentGroup, ResidencyPriority,
    ResourceAllocationInfo, ResourceDesc, ResourceDimension, VideoMemoryInfo,
};
use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct MockHeap {
    pub size: u64,
    pub heap_type: HeapType,
}

pub(crate) struct MockResource {
    pub size: u64,
    pub placed_offset: Option<u64>,
}

pub(crate) struct MockDevice {
    pub features: FeatureInfo,
    pub heap_create_count: AtomicU32,
    pub heap_fail_after: AtomicU32,
    pub placed_fail: AtomicBool,
    pub committed_fail: AtomicBool,
    pub usage: [AtomicU64; 2],
    pub budget: [AtomicU64; 2],
    pub residency_calls: Mutex<Vec<ResidencyPriority>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            features: FeatureInfo {
                uma: false,
                cache_coherent_uma: false,
                unified_resource_heaps: true,
                gpu_upload_heap_supported: false,
                tight_alignment_supported: false,
                create_not_zeroed_supported: true,
                local_memory_size: 8 << 30,
                nonlocal_memory_size: 16 << 30,
            },
            heap_create_count: AtomicU32::new(0),
            heap_fail_after: AtomicU32::new(u32::MAX),
            placed_fail: AtomicBool::new(false),
            committed_fail: AtomicBool::new(false),
            usage: [AtomicU64::new(0), AtomicU64::new(0)],
            budget: [AtomicU64::new(4 << 30), AtomicU64::new(8 << 30)],
            residency_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_budget(&self, group: MemorySegmentGroup, usage: u64, budget: u64) {
        self.usage[group as usize].store(usage, Ordering::Relaxed);
        self.budget[group as usize].store(budget, Ordering::Relaxed);
    }
}

impl Device for MockDevice {
    type Heap = MockHeap;
    type Resource = MockResource;

    fn query_feature_info(&self) -> FeatureInfo {
        self.features
    }

    fn create_heap(&self, desc: &HeapDesc) -> Result<MockHeap> {
        let n = self.heap_create_count.fetch_add(1, Ordering::Relaxed);
        if n >= self.heap_fail_after.load(Ordering::Relaxed) {
            return Err(Error::Device("heap creation failed".into()));
        }
        Ok(MockHeap {
            size: desc.size,
            heap_type: desc.heap_type,
        })
    }

    fn create_committed_resource(
        &self,
        _heap_type: HeapType,
        _heap_flags: crate::device::HeapFlags,
        desc: &ResourceDesc,
    ) -> Result<MockResource> {
        if self.committed_fail.load(Ordering::Relaxed) {
            return Err(Error::Device("committed resource creation failed".into()));
        }
        Ok(MockResource {
            size: self.resource_allocation_info(desc).size,
            placed_offset: None,
        })
    }

    fn create_placed_resource(
        &self,
        _heap: &MockHeap,
        offset: u64,
        desc: &ResourceDesc,
    ) -> Result<MockResource> {
        if self.placed_fail.load(Ordering::Relaxed) {
            return Err(Error::Device("placed resource creation failed".into()));
        }
        Ok(MockResource {
            size: self.resource_allocation_info(desc).size,
            placed_offset: Some(offset),
        })
    }

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> ResourceAllocationInfo {
        let granted_alignment = match desc.alignment {
            0 => 65536,
            // The mock grants the small-resource alignment to non-MSAA
            // textures only.
            a if desc.dimension != ResourceDimension::Buffer && desc.sample_count == 1 => a,
            _ => 65536,
        };
        let raw_size = match desc.dimension {
            ResourceDimension::Buffer => desc.width,
            _ => {
                desc.width
                    * desc.height as u64
                    * desc.depth_or_array_size as u64
                    * 4
                    * desc.sample_count as u64
            }
        };
        ResourceAllocationInfo {
            size: (raw_size + granted_alignment - 1) & !(granted_alignment - 1),
            alignment: granted_alignment,
        }
    }

    fn query_video_memory_info(&self, group: MemorySegmentGroup) -> Result<VideoMemoryInfo> {
        Ok(VideoMemoryInfo {
            current_usage_bytes: self.usage[group as usize].load(Ordering::Relaxed),
            budget_bytes: self.budget[group as usize].load(Ordering::Relaxed),
        })
    }

    fn set_heap_residency_priority(&self, _heap: &MockHeap, p: ResidencyPriority) -> Result<()> {
        self.residency_calls.lock().unwrap().push(p);
        Ok(())
    }

    fn set_resource_residency_priority(
        &self,
        _resource: &MockResource,
        p: ResidencyPriority,
    ) -> Result<()> {
        self.residency_calls.lock().unwrap().push(p);
        Ok(())
    }
}
