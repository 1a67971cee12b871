//! The device contract.
//!
//! The allocator never talks to a concrete graphics API. Everything it needs
//! from the outside world - heap creation, committed/placed resources,
//! allocation-info queries, memory budgets, residency priorities - goes
//! through the [`Device`] trait, so any backend exposing explicit heaps can
//! plug in underneath.

use crate::error::Result;

/// Number of standard heap types.
pub const HEAP_TYPE_COUNT: usize = 4;

/// Standard heap types of an explicit graphics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local memory for GPU-read-heavy resources.
    Default = 0,
    /// Host-visible memory for CPU-to-GPU transfers.
    Upload = 1,
    /// Host-visible, cached memory for GPU-to-CPU readback.
    Readback = 2,
    /// Device-local memory the CPU can also write directly (when supported).
    GpuUpload = 3,
}

impl HeapType {
    pub(crate) const ALL: [HeapType; HEAP_TYPE_COUNT] = [
        HeapType::Default,
        HeapType::Upload,
        HeapType::Readback,
        HeapType::GpuUpload,
    ];
}

/// Partition of device memory for budget purposes. On UMA devices everything
/// lives in the Local group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySegmentGroup {
    Local = 0,
    NonLocal = 1,
}

/// Residency priority hint forwarded to the device for freshly created heaps
/// and committed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResidencyPriority {
    Minimum,
    Low,
    Normal,
    High,
    Maximum,
}

bitflags! {
    /// Heap creation flags.
    ///
    /// The ALLOW_ONLY_* bits matter on devices without unified resource heaps
    /// (heap tier 1), where a heap may only host one resource class.
    pub struct HeapFlags: u32 {
        const NONE = 0;
        const ALLOW_ONLY_BUFFERS = 0x1;
        const ALLOW_ONLY_NON_RT_DS_TEXTURES = 0x2;
        const ALLOW_ONLY_RT_DS_TEXTURES = 0x4;
        /// Skip zero-initialization of the heap contents.
        const CREATE_NOT_ZEROED = 0x8;
    }
}

bitflags! {
    /// Resource usage flags relevant to placement decisions.
    pub struct ResourceFlags: u32 {
        const NONE = 0;
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
    }
}

/// Resource dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
}

/// Opaque format tag passed through to the device (castable-formats lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format(pub u32);

/// Description of a buffer or texture, carrying exactly the fields the
/// allocator's placement policy looks at. Backends are expected to translate
/// their native descriptions into this and back.
#[derive(Debug, Clone)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    /// Requested placement alignment; 0 means the device default. The
    /// allocator may lower this to the small-resource alignment when the
    /// device grants it.
    pub alignment: u64,
    /// Buffer length in bytes, or texture width in texels.
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    /// MSAA sample count; 1 for non-multisampled resources.
    pub sample_count: u32,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    /// Describe a plain buffer of `size` bytes.
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            alignment: 0,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            flags: ResourceFlags::NONE,
        }
    }

    /// Describe a 2D texture.
    pub fn texture_2d(width: u64, height: u32, flags: ResourceFlags) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            alignment: 0,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            sample_count: 1,
            flags,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn is_msaa(&self) -> bool {
        self.sample_count > 1
    }

    pub(crate) fn resource_class(&self) -> ResourceClass {
        if self.is_buffer() {
            ResourceClass::Buffer
        } else if self
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            ResourceClass::RtDsTexture
        } else {
            ResourceClass::NonRtDsTexture
        }
    }
}

/// Resource classes a tier-1 heap can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceClass {
    Buffer = 0,
    NonRtDsTexture = 1,
    RtDsTexture = 2,
}

impl ResourceClass {
    pub(crate) fn heap_flags(self) -> HeapFlags {
        match self {
            ResourceClass::Buffer => HeapFlags::ALLOW_ONLY_BUFFERS,
            ResourceClass::NonRtDsTexture => HeapFlags::ALLOW_ONLY_NON_RT_DS_TEXTURES,
            ResourceClass::RtDsTexture => HeapFlags::ALLOW_ONLY_RT_DS_TEXTURES,
        }
    }
}

/// Heap creation parameters.
#[derive(Debug, Clone)]
pub struct HeapDesc {
    pub size: u64,
    pub heap_type: HeapType,
    /// 64 KiB normally, 4 MiB when the heap may hold MSAA textures.
    pub alignment: u64,
    pub flags: HeapFlags,
}

/// Size and alignment the device wants for a resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceAllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

/// Budget snapshot for one memory segment group.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoMemoryInfo {
    pub current_usage_bytes: u64,
    pub budget_bytes: u64,
}

/// Device capabilities queried once at allocator creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureInfo {
    /// Unified memory architecture: one physical memory pool.
    pub uma: bool,
    /// UMA with CPU-cache-coherent access from the GPU.
    pub cache_coherent_uma: bool,
    /// Heaps may mix buffers and all texture kinds (heap tier 2).
    pub unified_resource_heaps: bool,
    /// The GpuUpload heap type exists.
    pub gpu_upload_heap_supported: bool,
    /// Device can report tighter-than-default allocation sizes.
    pub tight_alignment_supported: bool,
    /// Heaps can skip zero-initialization.
    pub create_not_zeroed_supported: bool,
    /// Adapter-reported memory sizes per segment group.
    pub local_memory_size: u64,
    pub nonlocal_memory_size: u64,
}

/// The raw device underneath the allocator.
///
/// All methods take `&self`; implementations are expected to be internally
/// synchronized the way real graphics devices are.
pub trait Device: Send + Sync {
    /// Device heap handle. Dropping the last clone of the `Arc` the allocator
    /// wraps it in must release the device memory.
    type Heap: Send + Sync;
    /// Resource handle (buffer or texture).
    type Resource: Send + Sync;

    fn query_feature_info(&self) -> FeatureInfo;

    fn create_heap(&self, desc: &HeapDesc) -> Result<Self::Heap>;

    /// Create a resource with its own implicit heap.
    fn create_committed_resource(
        &self,
        heap_type: HeapType,
        heap_flags: HeapFlags,
        desc: &ResourceDesc,
    ) -> Result<Self::Resource>;

    /// Create a resource placed into an existing heap at `offset`.
    fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: u64,
        desc: &ResourceDesc,
    ) -> Result<Self::Resource>;

    /// Size and alignment required for `desc`. A nonzero `desc.alignment` is
    /// a request; the device answers with the alignment it actually grants.
    fn resource_allocation_info(&self, desc: &ResourceDesc) -> ResourceAllocationInfo;

    fn query_video_memory_info(&self, group: MemorySegmentGroup) -> Result<VideoMemoryInfo>;

    fn set_heap_residency_priority(
        &self,
        heap: &Self::Heap,
        priority: ResidencyPriority,
    ) -> Result<()>;

    fn set_resource_residency_priority(
        &self,
        resource: &Self::Resource,
        priority: ResidencyPriority,
    ) -> Result<()>;
}
