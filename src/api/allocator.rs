//! The top-level allocator.
//!
//! Owns the default block vectors (one per heap type on devices with unified
//! resource heaps, otherwise one per heap type and resource class), the
//! per-heap-type committed-allocation lists, the registry of custom pools,
//! the budget counters, and the slab of allocation objects. Every public
//! entry point lives here or on [`Pool`](crate::Pool).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::api::config::{
    AllocationDesc, AllocationFlags, AllocatorDesc, AllocatorFlags, DEFAULT_ALIGNMENT,
    DEFAULT_BLOCK_SIZE, DEFAULT_HEAP_ALIGNMENT, MSAA_HEAP_ALIGNMENT,
    SMALL_BUFFER_COMMITTED_SIZE, SMALL_RESOURCE_PLACEMENT_ALIGNMENT,
};
use crate::api::pool::PoolInner;
use crate::core::allocation::{
    pack_allocation, unpack_allocation, Allocation, AllocationData, AllocationObjectAllocator,
    CommittedAllocationList, Place,
};
use crate::core::block::{BlockVector, BlockVectorConfig, VectorAllocParams, VectorCtx};
use crate::core::budget::CurrentBudgetData;
use crate::core::stats::{Budget, DetailedStatistics, TotalStatistics};
use crate::device::{
    Device, FeatureInfo, Format, HeapDesc, HeapFlags, HeapType, MemorySegmentGroup,
    ResidencyPriority, ResourceAllocationInfo, ResourceClass, ResourceDesc, HEAP_TYPE_COUNT,
};
use crate::error::{Error, Result};
use crate::json::JsonWriter;
use crate::metadata::Strategy;
use crate::sync::RwMutex;

/// Heap flag bits that only encode a resource class restriction.
fn resource_class_heap_flags() -> HeapFlags {
    HeapFlags::ALLOW_ONLY_BUFFERS
        | HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES
        | HeapFlags::ALLOW_ONLY_RT_DS_TEXTURES
}

fn heap_flags_to_resource_class(flags: HeapFlags) -> Option<ResourceClass> {
    if flags.contains(HeapFlags::ALLOW_ONLY_BUFFERS) {
        Some(ResourceClass::Buffer)
    } else if flags.contains(HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES) {
        Some(ResourceClass::NonRtDsTexture)
    } else if flags.contains(HeapFlags::ALLOW_ONLY_RT_DS_TEXTURES) {
        Some(ResourceClass::RtDsTexture)
    } else {
        None
    }
}

/// Parameters a committed (or dedicated-heap) allocation would use.
pub(crate) struct CommittedParams {
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    pub list: Arc<CommittedAllocationList>,
    pub priority: Option<ResidencyPriority>,
}

/// Outcome of the placement-policy decision for one request.
pub(crate) struct AllocationParams<D: Device> {
    pub block_vector: Option<Arc<BlockVector<D>>>,
    /// `None` when NEVER_ALLOCATE forbids creating heaps or committed
    /// resources.
    pub committed: Option<CommittedParams>,
    pub prefer_committed: bool,
    pub strategy: Strategy,
    pub upper_address: bool,
    pub within_budget: bool,
    pub never_allocate: bool,
}

pub(crate) struct AllocatorInner<D: Device> {
    pub device: D,
    pub flags: AllocatorFlags,
    pub features: FeatureInfo,
    pub preferred_block_size: u64,
    pub budget: CurrentBudgetData,
    pub objects: AllocationObjectAllocator<D>,
    /// Indexed by [`Self::default_pool_index`]; `None` for unsupported heap
    /// types.
    pub default_pools: Vec<Option<Arc<BlockVector<D>>>>,
    pub committed_lists: Vec<Arc<CommittedAllocationList>>,
    pub pool_lists: [RwMutex<Vec<Weak<PoolInner<D>>>>; HEAP_TYPE_COUNT],
    pub current_frame: AtomicU32,
}

/// General-purpose GPU memory allocator for one device.
///
/// Cheap to clone (`Arc` inside); all methods take `&self` and are safe to
/// call from multiple threads unless the crate was built `single_threaded`.
pub struct Allocator<D: Device> {
    pub(crate) inner: Arc<AllocatorInner<D>>,
}

impl<D: Device> Clone for Allocator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Device> Allocator<D> {
    pub fn new(device: D, desc: &AllocatorDesc) -> Result<Self> {
        let features = device.query_feature_info();
        let preferred_block_size = if desc.preferred_block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            desc.preferred_block_size
        };

        let msaa_always_committed = desc
            .flags
            .contains(AllocatorFlags::MSAA_TEXTURES_ALWAYS_COMMITTED);
        let not_zeroed = features.create_not_zeroed_supported
            && desc.flags.contains(AllocatorFlags::DEFAULT_POOLS_NOT_ZEROED);

        let pool_count = if features.unified_resource_heaps {
            HEAP_TYPE_COUNT
        } else {
            HEAP_TYPE_COUNT * 3
        };
        let mut default_pools = Vec::with_capacity(pool_count);
        for heap_type in HeapType::ALL {
            if heap_type == HeapType::GpuUpload && !features.gpu_upload_heap_supported {
                for _ in 0..(pool_count / HEAP_TYPE_COUNT) {
                    default_pools.push(None);
                }
                continue;
            }
            if features.unified_resource_heaps {
                default_pools.push(Some(Arc::new(BlockVector::new(Self::default_pool_config(
                    heap_type,
                    None,
                    preferred_block_size,
                    msaa_always_committed,
                    not_zeroed,
                )))));
            } else {
                for class in [
                    ResourceClass::Buffer,
                    ResourceClass::NonRtDsTexture,
                    ResourceClass::RtDsTexture,
                ] {
                    default_pools.push(Some(Arc::new(BlockVector::new(
                        Self::default_pool_config(
                            heap_type,
                            Some(class),
                            preferred_block_size,
                            msaa_always_committed,
                            not_zeroed,
                        ),
                    ))));
                }
            }
        }

        let committed_lists = HeapType::ALL
            .iter()
            .map(|&ht| Arc::new(CommittedAllocationList::new(ht)))
            .collect();

        Ok(Self {
            inner: Arc::new(AllocatorInner {
                device,
                flags: desc.flags,
                features,
                preferred_block_size,
                budget: CurrentBudgetData::new(),
                objects: AllocationObjectAllocator::new(),
                default_pools,
                committed_lists,
                pool_lists: [
                    RwMutex::new(Vec::new()),
                    RwMutex::new(Vec::new()),
                    RwMutex::new(Vec::new()),
                    RwMutex::new(Vec::new()),
                ],
                current_frame: AtomicU32::new(0),
            }),
        })
    }

    fn default_pool_config(
        heap_type: HeapType,
        class: Option<ResourceClass>,
        preferred_block_size: u64,
        msaa_always_committed: bool,
        not_zeroed: bool,
    ) -> BlockVectorConfig {
        let mut heap_flags = class.map_or(HeapFlags::NONE, |c| c.heap_flags());
        if not_zeroed {
            heap_flags |= HeapFlags::CREATE_NOT_ZEROED;
        }
        // A pool that can receive MSAA render targets needs the large heap
        // alignment.
        let may_hold_msaa = !msaa_always_committed
            && class.map_or(true, |c| c == ResourceClass::RtDsTexture);
        BlockVectorConfig {
            heap_type,
            heap_flags,
            preferred_block_size,
            min_block_count: 0,
            max_block_count: usize::MAX,
            explicit_block_size: false,
            min_allocation_alignment: DEFAULT_ALIGNMENT,
            linear_algorithm: false,
            heap_alignment: if may_hold_msaa {
                MSAA_HEAP_ALIGNMENT
            } else {
                DEFAULT_HEAP_ALIGNMENT
            },
            residency_priority: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.inner.device
    }

    pub fn feature_info(&self) -> FeatureInfo {
        self.inner.features
    }

    pub fn set_current_frame_index(&self, frame: u32) {
        self.inner.current_frame.store(frame, Ordering::Relaxed);
    }

    pub fn current_frame_index(&self) -> u32 {
        self.inner.current_frame.load(Ordering::Relaxed)
    }

    /// The segment group a heap type maps to; collapses to Local on UMA.
    pub fn memory_segment_group(&self, heap_type: HeapType) -> MemorySegmentGroup {
        self.inner.segment_group(heap_type)
    }

    // ---- resources & memory ------------------------------------------------

    /// Create a resource backed by memory this allocator chooses: a
    /// suballocation of an existing heap when possible, a committed resource
    /// when preferable or forced.
    pub fn create_resource(
        &self,
        alloc_desc: &AllocationDesc<'_, D>,
        resource_desc: &ResourceDesc,
    ) -> Result<Allocation> {
        let mut resource_desc = resource_desc.clone();
        let info = self.get_resource_allocation_info(&mut resource_desc);
        if info.size == 0 {
            return Err(Error::InvalidArgument("resource size must not be zero"));
        }
        let params = self.calc_allocation_params(alloc_desc, info.size, Some(&resource_desc))?;
        self.allocate_internal(&params, &info, Some(&resource_desc))
    }

    /// Like [`Self::create_resource`] but naming the formats the resource may
    /// later be cast to. A non-empty list is not supported by the
    /// allocation-info path and reports [`Error::Unsupported`].
    pub fn create_resource_with_castable_formats(
        &self,
        alloc_desc: &AllocationDesc<'_, D>,
        resource_desc: &ResourceDesc,
        castable_formats: &[Format],
    ) -> Result<Allocation> {
        if !castable_formats.is_empty() {
            return Err(Error::Unsupported("castable formats in allocation info"));
        }
        self.create_resource(alloc_desc, resource_desc)
    }

    /// Allocate memory without creating any resource. The allocation is
    /// either a suballocation or a dedicated heap.
    pub fn allocate_memory(
        &self,
        alloc_desc: &AllocationDesc<'_, D>,
        info: &ResourceAllocationInfo,
    ) -> Result<Allocation> {
        if info.size == 0 {
            return Err(Error::InvalidArgument("allocation size must not be zero"));
        }
        if info.size % 4 != 0 {
            return Err(Error::InvalidArgument(
                "allocation size must be a multiple of 4",
            ));
        }
        if !info.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(
                "allocation alignment must be a power of two",
            ));
        }
        let params = self.calc_allocation_params(alloc_desc, info.size, None)?;
        self.allocate_internal(&params, info, None)
    }

    /// Batch form of [`Self::allocate_memory`]: all pages succeed or none do.
    pub fn allocate_memory_pages(
        &self,
        alloc_desc: &AllocationDesc<'_, D>,
        info: &ResourceAllocationInfo,
        count: usize,
    ) -> Result<Vec<Allocation>> {
        let mut done = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_memory(alloc_desc, info) {
                Ok(a) => done.push(a),
                Err(e) => {
                    for a in done.drain(..) {
                        let _ = self.free_allocation(a);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Create another resource placed inside an existing allocation at
    /// `local_offset` bytes from its start.
    pub fn create_aliasing_resource(
        &self,
        allocation: Allocation,
        local_offset: u64,
        resource_desc: &ResourceDesc,
    ) -> Result<D::Resource> {
        let info = self.inner.device.resource_allocation_info(resource_desc);
        let (heap, base_offset, size) = self.inner.objects.with(allocation, |data| {
            (data.heap(), data.offset(), data.size)
        })?;
        let heap = heap.ok_or(Error::InvalidArgument(
            "committed allocations have no heap to alias into",
        ))?;
        let end = local_offset
            .checked_add(info.size)
            .ok_or(Error::InvalidArgument(
                "aliasing resource does not fit inside the allocation",
            ))?;
        if end > size {
            return Err(Error::InvalidArgument(
                "aliasing resource does not fit inside the allocation",
            ));
        }
        self.inner
            .device
            .create_placed_resource(&heap, base_offset + local_offset, resource_desc)
    }

    /// Release an allocation, its resource, and its memory.
    pub fn free_allocation(&self, allocation: Allocation) -> Result<()> {
        self.inner.free_allocation_inner(allocation)
    }

    // ---- allocation accessors ---------------------------------------------

    pub fn allocation_offset(&self, allocation: Allocation) -> Result<u64> {
        self.inner.objects.with(allocation, |d| d.offset())
    }

    pub fn allocation_size(&self, allocation: Allocation) -> Result<u64> {
        self.inner.objects.with(allocation, |d| d.size)
    }

    pub fn allocation_alignment(&self, allocation: Allocation) -> Result<u64> {
        self.inner.objects.with(allocation, |d| d.alignment)
    }

    /// The heap the allocation lives in; `None` for committed resources,
    /// whose heap is implicit.
    pub fn allocation_heap(&self, allocation: Allocation) -> Result<Option<Arc<D::Heap>>> {
        self.inner.objects.with(allocation, |d| d.heap())
    }

    pub fn allocation_resource(&self, allocation: Allocation) -> Result<Option<Arc<D::Resource>>> {
        self.inner.objects.with(allocation, |d| d.resource.clone())
    }

    pub fn set_allocation_name(&self, allocation: Allocation, name: Option<&str>) -> Result<()> {
        self.inner
            .objects
            .with_mut(allocation, |d| d.name = name.map(str::to_owned))
    }

    pub fn allocation_name(&self, allocation: Allocation) -> Result<Option<String>> {
        self.inner.objects.with(allocation, |d| d.name.clone())
    }

    pub fn set_allocation_private_data(&self, allocation: Allocation, data: u64) -> Result<()> {
        self.inner.objects.with_mut(allocation, |d| d.private_data = data)
    }

    pub fn allocation_private_data(&self, allocation: Allocation) -> Result<u64> {
        self.inner.objects.with(allocation, |d| d.private_data)
    }

    // ---- budget & statistics ----------------------------------------------

    /// Budgets of the Local and NonLocal segment groups.
    pub fn get_budget(&self) -> Result<(Budget, Budget)> {
        let local = self
            .inner
            .budget
            .get_budget(&self.inner.device, MemorySegmentGroup::Local)?;
        let nonlocal = self
            .inner
            .budget
            .get_budget(&self.inner.device, MemorySegmentGroup::NonLocal)?;
        Ok((local, nonlocal))
    }

    /// Exhaustive statistics over every pool, block, and dedicated
    /// allocation.
    pub fn calculate_statistics(&self) -> TotalStatistics {
        let mut total = TotalStatistics::default();
        let inner = &self.inner;
        for heap_type in HeapType::ALL {
            let mut detailed = DetailedStatistics::default();
            for vector in inner.default_pools_of(heap_type) {
                vector.add_detailed_statistics(&mut detailed);
            }
            inner.committed_lists[heap_type as usize]
                .add_detailed_statistics(&inner.objects, &mut detailed);
            for pool in inner.pools_of(heap_type) {
                pool.block_vector.add_detailed_statistics(&mut detailed);
                pool.committed
                    .add_detailed_statistics(&inner.objects, &mut detailed);
            }
            total.add_to_heap_type(heap_type, inner.segment_group(heap_type), &detailed);
        }
        total
    }

    /// Serialize allocator state to a JSON document (UTF-8 with a BOM
    /// prefix). With `detailed`, includes per-block suballocation maps and
    /// dedicated-allocation lists.
    pub fn build_stats_string(&self, detailed: bool) -> Result<String> {
        let inner = &self.inner;
        let total = self.calculate_statistics();
        let (local, nonlocal) = self.get_budget()?;

        let mut out = String::from('\u{feff}');
        let mut json = JsonWriter::new(&mut out);
        json.begin_object();

        json.write_key("General");
        json.begin_object();
        json.write_key("API");
        json.write_string("heapalloc");
        json.write_key("Version");
        json.write_string(env!("CARGO_PKG_VERSION"));
        json.write_key("UMA");
        json.write_bool(inner.features.uma);
        json.write_key("CacheCoherentUMA");
        json.write_bool(inner.features.cache_coherent_uma);
        json.write_key("UnifiedResourceHeaps");
        json.write_bool(inner.features.unified_resource_heaps);
        json.write_key("GpuUploadHeapSupported");
        json.write_bool(inner.features.gpu_upload_heap_supported);
        json.write_key("TightAlignmentSupported");
        json.write_bool(inner.features.tight_alignment_supported);
        json.write_key("LocalMemorySize");
        json.write_u64(inner.features.local_memory_size);
        json.write_key("NonLocalMemorySize");
        json.write_u64(inner.features.nonlocal_memory_size);
        json.end_object();

        json.write_key("Total");
        total.total.write_json(&mut json);

        json.write_key("MemoryInfo");
        json.begin_object();
        for (label, budget, group) in [
            ("L0", &local, MemorySegmentGroup::Local),
            ("L1", &nonlocal, MemorySegmentGroup::NonLocal),
        ] {
            json.write_key(label);
            json.begin_object();
            json.write_key("Budget");
            json.begin_object();
            json.write_key("BudgetBytes");
            json.write_u64(budget.budget_bytes);
            json.write_key("UsageBytes");
            json.write_u64(budget.usage_bytes);
            json.end_object();
            json.write_key("Stats");
            total.memory_segment_group[group as usize].write_json(&mut json);
            json.end_object();
        }
        json.end_object();

        if detailed {
            let objects = &inner.objects;
            let extra: &dyn Fn(&mut JsonWriter<'_>, u64) = &|json: &mut JsonWriter<'_>, user_data: u64| {
                let allocation = unpack_allocation(user_data);
                let _ = objects.with(allocation, |data| {
                    if let Some(name) = &data.name {
                        json.write_key("Name");
                        json.write_string(name);
                    }
                    if data.private_data != 0 {
                        json.write_key("PrivateData");
                        json.write_u64(data.private_data);
                    }
                });
            };

            json.write_key("DefaultPools");
            json.begin_object();
            for heap_type in HeapType::ALL {
                let named = inner.named_default_pools_of(heap_type);
                if named.is_empty() {
                    continue;
                }
                for (name, vector) in named {
                    json.write_key(&name);
                    json.begin_object();
                    json.write_key("PreferredBlockSize");
                    json.write_u64(vector.config.preferred_block_size);
                    json.write_key("Blocks");
                    vector.write_blocks_json(&mut json, extra);
                    json.end_object();
                }
                json.write_key(&format!(
                    "{} - DedicatedAllocations",
                    heap_type_name(heap_type)
                ));
                inner.committed_lists[heap_type as usize].write_json(&inner.objects, &mut json);
            }
            json.end_object();

            json.write_key("CustomPools");
            json.begin_object();
            for heap_type in HeapType::ALL {
                let pools = inner.pools_of(heap_type);
                if pools.is_empty() {
                    continue;
                }
                json.write_key(heap_type_name(heap_type));
                json.begin_array();
                for pool in pools {
                    json.begin_object();
                    if let Some(name) = pool.name() {
                        json.write_key("Name");
                        json.write_string(&name);
                    }
                    json.write_key("Flags");
                    json.write_u32(pool.flags.bits());
                    json.write_key("PreferredBlockSize");
                    json.write_u64(pool.block_vector.config.preferred_block_size);
                    json.write_key("Blocks");
                    pool.block_vector.write_blocks_json(&mut json, extra);
                    json.write_key("DedicatedAllocations");
                    pool.committed.write_json(&inner.objects, &mut json);
                    json.end_object();
                }
                json.end_array();
            }
            json.end_object();
        }

        json.end_object();
        drop(json);
        Ok(out)
    }

    // ---- internals ---------------------------------------------------------

    /// Resolve size and alignment for a resource, trying the small-resource
    /// placement alignment for textures that qualify.
    fn get_resource_allocation_info(&self, desc: &mut ResourceDesc) -> ResourceAllocationInfo {
        if desc.alignment == 0
            && !desc.is_buffer()
            && !desc.is_msaa()
            && !desc
                .flags
                .intersects(crate::device::ResourceFlags::ALLOW_RENDER_TARGET
                    | crate::device::ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            desc.alignment = SMALL_RESOURCE_PLACEMENT_ALIGNMENT;
            let info = self.inner.device.resource_allocation_info(desc);
            if info.alignment <= SMALL_RESOURCE_PLACEMENT_ALIGNMENT {
                return info;
            }
            // The device refused the small alignment; retry with the default.
            desc.alignment = 0;
        }
        self.inner.device.resource_allocation_info(desc)
    }

    pub(crate) fn calc_allocation_params(
        &self,
        desc: &AllocationDesc<'_, D>,
        size: u64,
        resource: Option<&ResourceDesc>,
    ) -> Result<AllocationParams<D>> {
        let inner = &self.inner;
        let flags = desc.flags;
        let strategy = decode_strategy(flags);
        let upper_address = flags.contains(AllocationFlags::UPPER_ADDRESS);

        let mut block_vector: Option<Arc<BlockVector<D>>> = None;
        let committed_params;
        let mut prefer_committed = false;
        let msaa_always_committed;

        if let Some(pool) = desc.pool {
            let pool = pool.inner();
            msaa_always_committed = pool.msaa_always_committed;
            if !pool.always_committed {
                block_vector = Some(Arc::clone(&pool.block_vector));
            }
            committed_params = CommittedParams {
                heap_type: pool.block_vector.config.heap_type,
                heap_flags: pool.block_vector.config.heap_flags,
                list: Arc::clone(&pool.committed),
                priority: pool.block_vector.config.residency_priority,
            };
            if let Some(vector) = &block_vector {
                if size > vector.config.preferred_block_size {
                    block_vector = None;
                } else if size > vector.config.preferred_block_size / 2 {
                    prefer_committed = true;
                }
            }
        } else {
            if desc.heap_type == HeapType::GpuUpload && !inner.features.gpu_upload_heap_supported {
                return Err(Error::Unsupported("GPU upload heap"));
            }
            msaa_always_committed = inner
                .flags
                .contains(AllocatorFlags::MSAA_TEXTURES_ALWAYS_COMMITTED);
            let resource_class = match resource {
                Some(r) => Some(r.resource_class()),
                None => heap_flags_to_resource_class(desc.extra_heap_flags),
            };
            committed_params = CommittedParams {
                heap_type: desc.heap_type,
                heap_flags: desc.extra_heap_flags,
                list: Arc::clone(&inner.committed_lists[desc.heap_type as usize]),
                priority: None,
            };
            if let Some(index) = inner.default_pool_index(desc.heap_type, resource_class) {
                block_vector = inner.default_pools[index].clone();
            }
            if let Some(vector) = &block_vector {
                if size > vector.config.preferred_block_size {
                    block_vector = None;
                } else if size > vector.config.preferred_block_size / 2 {
                    // Large allocations fragment blocks badly; prefer a
                    // dedicated resource.
                    prefer_committed = true;
                }
            }
            // Extra heap flags beyond resource-class restrictions force the
            // allocation out of the shared default pools.
            let extra = desc.extra_heap_flags & !resource_class_heap_flags();
            if !extra.is_empty() {
                block_vector = None;
            }
        }

        if flags.contains(AllocationFlags::COMMITTED)
            || inner.flags.contains(AllocatorFlags::ALWAYS_COMMITTED)
        {
            block_vector = None;
        }
        if let Some(r) = resource {
            if r.is_msaa() && msaa_always_committed {
                block_vector = None;
            }
            if r.is_buffer()
                && size <= SMALL_BUFFER_COMMITTED_SIZE
                && !inner
                    .flags
                    .contains(AllocatorFlags::DONT_PREFER_SMALL_BUFFERS_COMMITTED)
                && !inner.flags.contains(AllocatorFlags::ALWAYS_COMMITTED)
            {
                // Many tiny buffers as committed resources keep the big
                // blocks contiguous.
                prefer_committed = true;
            }
        }

        if upper_address {
            // Only the linear algorithm knows an upper-address stack.
            match &block_vector {
                Some(vector) if vector.config.linear_algorithm => {}
                _ => {
                    return Err(Error::InvalidArgument(
                        "upper-address allocation requires a linear pool",
                    ))
                }
            }
        }

        let never_allocate = flags.contains(AllocationFlags::NEVER_ALLOCATE);
        let committed = if never_allocate {
            None
        } else {
            Some(committed_params)
        };
        if block_vector.is_none() && committed.is_none() {
            // Both paths forbidden by the flag combination.
            return Err(Error::OutOfMemory);
        }
        Ok(AllocationParams {
            block_vector,
            committed,
            prefer_committed,
            strategy,
            upper_address,
            within_budget: flags.contains(AllocationFlags::WITHIN_BUDGET),
            never_allocate,
        })
    }

    pub(crate) fn allocate_internal(
        &self,
        params: &AllocationParams<D>,
        info: &ResourceAllocationInfo,
        resource: Option<&ResourceDesc>,
    ) -> Result<Allocation> {
        let mut last_error = Error::OutOfMemory;
        if params.prefer_committed {
            match self.allocate_committed(params, info, resource) {
                Ok(allocation) => return Ok(allocation),
                Err(e) => last_error = e,
            }
        }
        if let Some(vector) = &params.block_vector {
            let vector_params = VectorAllocParams {
                strategy: params.strategy,
                upper_address: params.upper_address,
                never_allocate: params.never_allocate,
                within_budget: params.within_budget,
                committed_allowed: params.committed.is_some(),
            };
            let ctx = self.inner.vector_ctx(vector);
            match vector.allocate(&ctx, info.size, info.alignment, &vector_params, 1) {
                Ok(mut placed) => {
                    let block_allocation = placed.remove(0);
                    return self.finish_placed(vector, block_allocation, info, resource);
                }
                Err(e) => last_error = e,
            }
        }
        if !params.prefer_committed && params.committed.is_some() {
            match self.allocate_committed(params, info, resource) {
                Ok(allocation) => return Ok(allocation),
                Err(e) => last_error = e,
            }
        }
        crate::debug_log!("allocation of {} bytes failed: {}", info.size, last_error);
        Err(last_error)
    }

    fn finish_placed(
        &self,
        vector: &Arc<BlockVector<D>>,
        block_allocation: crate::core::block::BlockAllocation<D>,
        info: &ResourceAllocationInfo,
        resource: Option<&ResourceDesc>,
    ) -> Result<Allocation> {
        let inner = &self.inner;
        let resource_handle = match resource {
            Some(resource_desc) => {
                match inner.device.create_placed_resource(
                    &block_allocation.heap,
                    block_allocation.offset,
                    resource_desc,
                ) {
                    Ok(r) => Some(Arc::new(r)),
                    Err(e) => {
                        let ctx = inner.vector_ctx(vector);
                        vector.free(&ctx, block_allocation.block_id, block_allocation.handle);
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        let allocation = inner.objects.insert(AllocationData {
            size: info.size,
            alignment: info.alignment,
            resource: resource_handle,
            name: None,
            private_data: 0,
            is_defrag_tmp: false,
            place: Place::Placed {
                vector: Arc::clone(vector),
                block_id: block_allocation.block_id,
                handle: block_allocation.handle,
                offset: block_allocation.offset,
                heap: block_allocation.heap,
            },
        });
        vector.set_allocation_user_data(
            block_allocation.block_id,
            block_allocation.handle,
            pack_allocation(allocation),
        );
        let group = inner.segment_group(vector.config.heap_type);
        inner.budget.add_allocation(group, info.size);
        Ok(allocation)
    }

    fn allocate_committed(
        &self,
        params: &AllocationParams<D>,
        info: &ResourceAllocationInfo,
        resource: Option<&ResourceDesc>,
    ) -> Result<Allocation> {
        let inner = &self.inner;
        let committed = params.committed.as_ref().ok_or(Error::OutOfMemory)?;
        let group = inner.segment_group(committed.heap_type);
        if params.within_budget && !inner.new_allocation_within_budget(group, info.size)? {
            return Err(Error::OutOfMemory);
        }

        let (heap, resource_handle) = match resource {
            Some(resource_desc) => {
                let r = inner.device.create_committed_resource(
                    committed.heap_type,
                    committed.heap_flags,
                    resource_desc,
                )?;
                if let Some(priority) = committed.priority {
                    inner.device.set_resource_residency_priority(&r, priority)?;
                }
                (None, Some(Arc::new(r)))
            }
            None => {
                let heap = inner.device.create_heap(&HeapDesc {
                    size: info.size,
                    heap_type: committed.heap_type,
                    alignment: if info.alignment > DEFAULT_HEAP_ALIGNMENT {
                        MSAA_HEAP_ALIGNMENT
                    } else {
                        DEFAULT_HEAP_ALIGNMENT
                    },
                    flags: committed.heap_flags,
                })?;
                if let Some(priority) = committed.priority {
                    inner.device.set_heap_residency_priority(&heap, priority)?;
                }
                (Some(Arc::new(heap)), None)
            }
        };

        let allocation = inner.objects.insert(AllocationData {
            size: info.size,
            alignment: info.alignment,
            resource: resource_handle,
            name: None,
            private_data: 0,
            is_defrag_tmp: false,
            place: Place::Dedicated {
                heap,
                heap_type: committed.heap_type,
                list: Arc::clone(&committed.list),
                prev: u32::MAX,
                next: u32::MAX,
            },
        });
        committed.list.register(&inner.objects, allocation);
        inner.budget.add_block(group, info.size);
        inner.budget.add_allocation(group, info.size);
        crate::debug_log!("committed allocation of {} bytes", info.size);
        Ok(allocation)
    }
}

impl<D: Device> AllocatorInner<D> {
    pub(crate) fn segment_group(&self, heap_type: HeapType) -> MemorySegmentGroup {
        if self.features.uma {
            return MemorySegmentGroup::Local;
        }
        match heap_type {
            HeapType::Default | HeapType::GpuUpload => MemorySegmentGroup::Local,
            HeapType::Upload | HeapType::Readback => MemorySegmentGroup::NonLocal,
        }
    }

    pub(crate) fn vector_ctx<'a>(&'a self, vector: &BlockVector<D>) -> VectorCtx<'a, D> {
        VectorCtx {
            device: &self.device,
            budget: &self.budget,
            segment_group: self.segment_group(vector.config.heap_type),
        }
    }

    fn default_pool_index(
        &self,
        heap_type: HeapType,
        class: Option<ResourceClass>,
    ) -> Option<usize> {
        if self.features.unified_resource_heaps {
            Some(heap_type as usize)
        } else {
            class.map(|c| heap_type as usize * 3 + c as usize)
        }
    }

    pub(crate) fn default_pools_of(&self, heap_type: HeapType) -> Vec<Arc<BlockVector<D>>> {
        let per_type = self.default_pools.len() / HEAP_TYPE_COUNT;
        let start = heap_type as usize * per_type;
        self.default_pools[start..start + per_type]
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn named_default_pools_of(&self, heap_type: HeapType) -> Vec<(String, Arc<BlockVector<D>>)> {
        let per_type = self.default_pools.len() / HEAP_TYPE_COUNT;
        let start = heap_type as usize * per_type;
        let base = heap_type_name(heap_type);
        self.default_pools[start..start + per_type]
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let vector = v.as_ref()?;
                let name = if per_type == 1 {
                    base.to_owned()
                } else {
                    let suffix = match i {
                        0 => " - Buffers",
                        1 => " - Textures",
                        _ => " - RT DS Textures",
                    };
                    format!("{}{}", base, suffix)
                };
                Some((name, Arc::clone(vector)))
            })
            .collect()
    }

    pub(crate) fn pools_of(&self, heap_type: HeapType) -> Vec<Arc<PoolInner<D>>> {
        self.pool_lists[heap_type as usize]
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn new_allocation_within_budget(
        &self,
        group: MemorySegmentGroup,
        size: u64,
    ) -> Result<bool> {
        let budget = self.budget.get_budget(&self.device, group)?;
        Ok(budget.usage_bytes + size <= budget.budget_bytes)
    }

    pub(crate) fn free_allocation_inner(&self, allocation: Allocation) -> Result<()> {
        enum Kind {
            Dedicated,
            Placed,
        }
        let kind = self.objects.with(allocation, |data| match data.place {
            Place::Dedicated { .. } => Kind::Dedicated,
            Place::Placed { .. } => Kind::Placed,
        })?;
        match kind {
            Kind::Dedicated => {
                let list = self.objects.with(allocation, |data| match &data.place {
                    Place::Dedicated { list, .. } => Arc::clone(list),
                    Place::Placed { .. } => unreachable!(),
                })?;
                list.unregister(&self.objects, allocation);
                let data = self.objects.remove(allocation)?;
                let (heap_type, size) = match &data.place {
                    Place::Dedicated { heap_type, .. } => (*heap_type, data.size),
                    Place::Placed { .. } => unreachable!(),
                };
                let group = self.segment_group(heap_type);
                self.budget.remove_allocation(group, size);
                self.budget.remove_block(group, size);
            }
            Kind::Placed => {
                let data = self.objects.remove(allocation)?;
                let (vector, block_id, handle) = match &data.place {
                    Place::Placed {
                        vector,
                        block_id,
                        handle,
                        ..
                    } => (Arc::clone(vector), *block_id, *handle),
                    Place::Dedicated { .. } => unreachable!(),
                };
                let group = self.segment_group(vector.config.heap_type);
                self.budget.remove_allocation(group, data.size);
                drop(data);
                let ctx = self.vector_ctx(&vector);
                vector.free(&ctx, block_id, handle);
            }
        }
        Ok(())
    }
}

fn decode_strategy(flags: AllocationFlags) -> Strategy {
    if flags.contains(AllocationFlags::STRATEGY_MIN_TIME) {
        Strategy::MinTime
    } else if flags.contains(AllocationFlags::STRATEGY_MIN_MEMORY) {
        Strategy::MinMemory
    } else if flags.contains(AllocationFlags::STRATEGY_MIN_OFFSET) {
        Strategy::MinOffset
    } else {
        Strategy::Default
    }
}

pub(crate) fn heap_type_name(heap_type: HeapType) -> &'static str {
    match heap_type {
        HeapType::Default => "DEFAULT",
        HeapType::Upload => "UPLOAD",
        HeapType::Readback => "READBACK",
        HeapType::GpuUpload => "GPU_UPLOAD",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    fn allocator() -> Allocator<MockDevice> {
        Allocator::new(MockDevice::new(), &AllocatorDesc::default()).unwrap()
    }

    #[test]
    fn test_strategy_decode() {
        assert_eq!(decode_strategy(AllocationFlags::NONE), Strategy::Default);
        assert_eq!(
            decode_strategy(AllocationFlags::STRATEGY_MIN_OFFSET),
            Strategy::MinOffset
        );
    }

    #[test]
    fn test_default_pool_layout_tier2() {
        let a = allocator();
        // Unified resource heaps: one pool per heap type, GPU upload absent.
        assert_eq!(a.inner.default_pools.len(), HEAP_TYPE_COUNT);
        assert!(a.inner.default_pools[HeapType::Default as usize].is_some());
        assert!(a.inner.default_pools[HeapType::GpuUpload as usize].is_none());
    }

    #[test]
    fn test_default_pool_layout_tier1() {
        let mut device = MockDevice::new();
        device.features.unified_resource_heaps = false;
        let a = Allocator::new(device, &AllocatorDesc::default()).unwrap();
        assert_eq!(a.inner.default_pools.len(), HEAP_TYPE_COUNT * 3);
        // Resource class picks the sub-pool.
        let buffer_index = a
            .inner
            .default_pool_index(HeapType::Upload, Some(ResourceClass::Buffer))
            .unwrap();
        assert_eq!(buffer_index, HeapType::Upload as usize * 3);
    }

    #[test]
    fn test_segment_groups() {
        let a = allocator();
        assert_eq!(
            a.memory_segment_group(HeapType::Default),
            MemorySegmentGroup::Local
        );
        assert_eq!(
            a.memory_segment_group(HeapType::Upload),
            MemorySegmentGroup::NonLocal
        );

        let mut device = MockDevice::new();
        device.features.uma = true;
        let uma = Allocator::new(device, &AllocatorDesc::default()).unwrap();
        assert_eq!(
            uma.memory_segment_group(HeapType::Upload),
            MemorySegmentGroup::Local
        );
    }

    #[test]
    fn test_gpu_upload_requires_support() {
        let a = allocator();
        let desc = AllocationDesc::new(HeapType::GpuUpload);
        let err = a
            .allocate_memory(
                &desc,
                &ResourceAllocationInfo {
                    size: 65536,
                    alignment: 65536,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_allocate_memory_validation() {
        let a = allocator();
        let desc = AllocationDesc::new(HeapType::Default);
        let bad_size = ResourceAllocationInfo {
            size: 0,
            alignment: 65536,
        };
        assert!(matches!(
            a.allocate_memory(&desc, &bad_size),
            Err(Error::InvalidArgument(_))
        ));
        let odd_size = ResourceAllocationInfo {
            size: 65537,
            alignment: 65536,
        };
        assert!(matches!(
            a.allocate_memory(&desc, &odd_size),
            Err(Error::InvalidArgument(_))
        ));
        let bad_alignment = ResourceAllocationInfo {
            size: 65536,
            alignment: 3,
        };
        assert!(matches!(
            a.allocate_memory(&desc, &bad_alignment),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_never_allocate_and_committed_conflict() {
        let a = allocator();
        let desc = AllocationDesc::new(HeapType::Default)
            .with_flags(AllocationFlags::COMMITTED | AllocationFlags::NEVER_ALLOCATE);
        let err = a
            .allocate_memory(
                &desc,
                &ResourceAllocationInfo {
                    size: 65536,
                    alignment: 65536,
                },
            )
            .unwrap_err();
        assert_eq!(err, Error::OutOfMemory);
    }
}
