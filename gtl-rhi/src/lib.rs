//! gtl-rhi: a handle-based compute + ray-tracing GPU abstraction layer.
//!
//! One backend is linked per build: Vulkan 1.1 + ray-tracing extensions on
//! desktop (default), Metal 4 on macOS (`metal` feature). The application
//! talks exclusively in opaque 64-bit handles; all entry points live on
//! [`Context`].

mod error;
mod handle_store;
mod limits;
pub mod reflection;

#[cfg(feature = "vulkan")]
mod vulkan;

#[cfg(all(feature = "metal", target_os = "macos"))]
mod metal;

pub use error::{GpuError, GpuResult};
pub use limits::{
    SbtLayout, SbtRegion, BUFFER_BASE_ALIGNMENT, MAX_DESCRIPTOR_SET_COUNT,
    MAX_PUSH_CONSTANTS_SIZE, MAX_TIMESTAMP_QUERIES, WHOLE_SIZE,
};

#[cfg(all(feature = "metal", target_os = "macos"))]
pub use metal::Context;
#[cfg(all(feature = "vulkan", not(all(feature = "metal", target_os = "macos"))))]
pub use vulkan::Context;

use bitflags::bitflags;

/// Declares an opaque handle type: `(version << 32) | slot_index`, with 0
/// reserved as the always-invalid null handle.
macro_rules! define_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub const NULL: Self = Self(crate::handle_store::NULL_HANDLE);

            pub fn is_null(&self) -> bool {
                self.0 == crate::handle_store::NULL_HANDLE
            }
        }
    };
}

define_handle!(Buffer);
define_handle!(Image);
define_handle!(Shader);
define_handle!(Pipeline);
define_handle!(Semaphore);
define_handle!(CommandBuffer);
define_handle!(Sampler);
define_handle!(Blas);
define_handle!(Tlas);
define_handle!(BindSet);

bitflags! {
    /// Buffer usage flags (Vulkan bit values).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM = 0x0000_0010;
        const STORAGE = 0x0000_0020;
        const SHADER_BINDING_TABLE = 0x0000_0400;
        const SHADER_DEVICE_ADDRESS = 0x0002_0000;
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 0x0008_0000;
        const ACCELERATION_STRUCTURE_STORAGE = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const HOST_VISIBLE = 0x0000_0002;
        const HOST_COHERENT = 0x0000_0004;
        const HOST_CACHED = 0x0000_0008;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const SAMPLED = 0x0000_0004;
        const STORAGE = 0x0000_0008;
    }
}

bitflags! {
    /// Memory access flags for explicit barriers (Vulkan bit values).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MemoryAccess: u32 {
        const UNIFORM_READ = 0x0000_0008;
        const SHADER_READ = 0x0000_0020;
        const SHADER_WRITE = 0x0000_0040;
        const TRANSFER_READ = 0x0000_0800;
        const TRANSFER_WRITE = 0x0000_1000;
        const HOST_READ = 0x0000_2000;
        const HOST_WRITE = 0x0000_4000;
        const MEMORY_READ = 0x0000_8000;
        const MEMORY_WRITE = 0x0001_0000;
        const ACCELERATION_STRUCTURE_READ = 0x0020_0000;
        const ACCELERATION_STRUCTURE_WRITE = 0x0040_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ShaderStage: u32 {
        const COMPUTE = 0x0000_0020;
        const RAYGEN = 0x0000_0100;
        const ANY_HIT = 0x0000_0200;
        const CLOSEST_HIT = 0x0000_0400;
        const MISS = 0x0000_0800;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PipelineStage: u32 {
        const COMPUTE_SHADER = 0x0000_0800;
        const TRANSFER = 0x0000_1000;
        const HOST = 0x0000_4000;
        const RAY_TRACING_SHADER = 0x0020_0000;
        const ACCELERATION_STRUCTURE_BUILD = 0x0200_0000;
    }
}

/// Image formats, passed through to the backend with Vulkan's numbering.
/// The Metal backend supports a closed subset and aborts on anything else.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    Undefined = 0,
    R4g4UnormPack8 = 1,
    R4g4b4a4UnormPack16 = 2,
    B4g4r4a4UnormPack16 = 3,
    R5g6b5UnormPack16 = 4,
    B5g6r5UnormPack16 = 5,
    R5g5b5a1UnormPack16 = 6,
    B5g5r5a1UnormPack16 = 7,
    A1r5g5b5UnormPack16 = 8,
    R8Unorm = 9,
    R8Snorm = 10,
    R8Uscaled = 11,
    R8Sscaled = 12,
    R8Uint = 13,
    R8Sint = 14,
    R8Srgb = 15,
    R8g8Unorm = 16,
    R8g8Snorm = 17,
    R8g8Uscaled = 18,
    R8g8Sscaled = 19,
    R8g8Uint = 20,
    R8g8Sint = 21,
    R8g8Srgb = 22,
    R8g8b8Unorm = 23,
    R8g8b8Snorm = 24,
    R8g8b8Uscaled = 25,
    R8g8b8Sscaled = 26,
    R8g8b8Uint = 27,
    R8g8b8Sint = 28,
    R8g8b8Srgb = 29,
    B8g8r8Unorm = 30,
    B8g8r8Snorm = 31,
    B8g8r8Uscaled = 32,
    B8g8r8Sscaled = 33,
    B8g8r8Uint = 34,
    B8g8r8Sint = 35,
    B8g8r8Srgb = 36,
    R8g8b8a8Unorm = 37,
    R8g8b8a8Snorm = 38,
    R8g8b8a8Uscaled = 39,
    R8g8b8a8Sscaled = 40,
    R8g8b8a8Uint = 41,
    R8g8b8a8Sint = 42,
    R8g8b8a8Srgb = 43,
    B8g8r8a8Unorm = 44,
    B8g8r8a8Snorm = 45,
    B8g8r8a8Uscaled = 46,
    B8g8r8a8Sscaled = 47,
    B8g8r8a8Uint = 48,
    B8g8r8a8Sint = 49,
    B8g8r8a8Srgb = 50,
    A8b8g8r8UnormPack32 = 51,
    A8b8g8r8SnormPack32 = 52,
    A8b8g8r8UscaledPack32 = 53,
    A8b8g8r8SscaledPack32 = 54,
    A8b8g8r8UintPack32 = 55,
    A8b8g8r8SintPack32 = 56,
    A8b8g8r8SrgbPack32 = 57,
    A2r10g10b10UnormPack32 = 58,
    A2r10g10b10SnormPack32 = 59,
    A2r10g10b10UscaledPack32 = 60,
    A2r10g10b10SscaledPack32 = 61,
    A2r10g10b10UintPack32 = 62,
    A2r10g10b10SintPack32 = 63,
    A2b10g10r10UnormPack32 = 64,
    A2b10g10r10SnormPack32 = 65,
    A2b10g10r10UscaledPack32 = 66,
    A2b10g10r10SscaledPack32 = 67,
    A2b10g10r10UintPack32 = 68,
    A2b10g10r10SintPack32 = 69,
    R16Unorm = 70,
    R16Snorm = 71,
    R16Uscaled = 72,
    R16Sscaled = 73,
    R16Uint = 74,
    R16Sint = 75,
    R16Sfloat = 76,
    R16g16Unorm = 77,
    R16g16Snorm = 78,
    R16g16Uscaled = 79,
    R16g16Sscaled = 80,
    R16g16Uint = 81,
    R16g16Sint = 82,
    R16g16Sfloat = 83,
    R16g16b16Unorm = 84,
    R16g16b16Snorm = 85,
    R16g16b16Uscaled = 86,
    R16g16b16Sscaled = 87,
    R16g16b16Uint = 88,
    R16g16b16Sint = 89,
    R16g16b16Sfloat = 90,
    R16g16b16a16Unorm = 91,
    R16g16b16a16Snorm = 92,
    R16g16b16a16Uscaled = 93,
    R16g16b16a16Sscaled = 94,
    R16g16b16a16Uint = 95,
    R16g16b16a16Sint = 96,
    R16g16b16a16Sfloat = 97,
    R32Uint = 98,
    R32Sint = 99,
    R32Sfloat = 100,
    R32g32Uint = 101,
    R32g32Sint = 102,
    R32g32Sfloat = 103,
    R32g32b32Uint = 104,
    R32g32b32Sint = 105,
    R32g32b32Sfloat = 106,
    R32g32b32a32Uint = 107,
    R32g32b32a32Sint = 108,
    R32g32b32a32Sfloat = 109,
    R64Uint = 110,
    R64Sint = 111,
    R64Sfloat = 112,
    R64g64Uint = 113,
    R64g64Sint = 114,
    R64g64Sfloat = 115,
    R64g64b64Uint = 116,
    R64g64b64Sint = 117,
    R64g64b64Sfloat = 118,
    R64g64b64a64Uint = 119,
    R64g64b64a64Sint = 120,
    R64g64b64a64Sfloat = 121,
    B10g11r11UfloatPack32 = 122,
    E5b9g9r9UfloatPack32 = 123,
    D16Unorm = 124,
    X8D24UnormPack32 = 125,
    D32Sfloat = 126,
    S8Uint = 127,
    D16UnormS8Uint = 128,
    D24UnormS8Uint = 129,
    D32SfloatS8Uint = 130,
    Bc7UnormBlock = 145,
    Bc7SrgbBlock = 146,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerAddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
    /// Emulates MDL's clip wrap mode: clamp-to-border with opaque black.
    ClampToBlack,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferCreateInfo<'a> {
    pub usage: BufferUsage,
    pub memory_properties: MemoryProperties,
    pub size: u64,
    pub debug_name: Option<&'a str>,
    /// 0 means no explicit alignment.
    pub alignment: u32,
}

impl Default for BufferCreateInfo<'_> {
    fn default() -> Self {
        Self {
            usage: BufferUsage::empty(),
            memory_properties: MemoryProperties::empty(),
            size: 0,
            debug_name: None,
            alignment: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageCreateInfo<'a> {
    pub width: u32,
    pub height: u32,
    pub is_3d: bool,
    pub depth: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
    pub debug_name: Option<&'a str>,
}

impl Default for ImageCreateInfo<'_> {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            is_3d: false,
            depth: 1,
            format: ImageFormat::R8g8b8a8Unorm,
            usage: ImageUsage::TRANSFER_DST.union(ImageUsage::SAMPLED),
            debug_name: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ShaderCreateInfo<'a> {
    /// SPIR-V bytes.
    pub source: &'a [u8],
    pub stage_flags: ShaderStage,
    pub debug_name: Option<&'a str>,
    /// RT shaders only; must be at least the reflected payload size.
    pub max_ray_payload_size: u32,
    /// RT shaders only; must be at least the reflected attribute size.
    pub max_ray_hit_attribute_size: u32,
}

impl Default for ShaderCreateInfo<'_> {
    fn default() -> Self {
        Self {
            source: &[],
            stage_flags: ShaderStage::COMPUTE,
            debug_name: None,
            max_ray_payload_size: 0,
            max_ray_hit_attribute_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerCreateInfo {
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
}

#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineCreateInfo<'a> {
    pub shader: Shader,
    pub debug_name: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RtHitGroup {
    /// Optional; null handle leaves the slot unused.
    pub closest_hit_shader: Shader,
    /// Optional; null handle leaves the slot unused.
    pub any_hit_shader: Shader,
}

#[derive(Clone, Copy, Debug)]
pub struct RtPipelineCreateInfo<'a> {
    pub rgen_shader: Shader,
    pub miss_shaders: &'a [Shader],
    pub hit_groups: &'a [RtHitGroup],
    pub debug_name: Option<&'a str>,
    pub max_ray_payload_size: u32,
    pub max_ray_hit_attribute_size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct BlasCreateInfo<'a> {
    /// R32G32B32 float positions, 12 byte stride.
    pub vertex_buffer: Buffer,
    /// uint32 indices.
    pub index_buffer: Buffer,
    pub max_vertex: u32,
    pub triangle_count: u32,
    pub is_opaque: bool,
    pub debug_name: Option<&'a str>,
}

#[derive(Clone, Copy, Debug)]
pub struct BlasInstance {
    pub blas: Blas,
    pub hit_group_index: u32,
    /// Must fit into 24 bits.
    pub instance_custom_index: u32,
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
}

#[derive(Clone, Copy, Debug)]
pub struct TlasCreateInfo<'a> {
    pub instances: &'a [BlasInstance],
    pub debug_name: Option<&'a str>,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferBinding {
    pub binding: u32,
    pub buffer: Buffer,
    /// Array element for arrayed bindings.
    pub index: u32,
    pub offset: u64,
    /// [`WHOLE_SIZE`] binds from `offset` to the end of the buffer.
    pub size: u64,
}

impl Default for BufferBinding {
    fn default() -> Self {
        Self {
            binding: 0,
            buffer: Buffer::NULL,
            index: 0,
            offset: 0,
            size: WHOLE_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageBinding {
    pub binding: u32,
    pub image: Image,
    pub index: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerBinding {
    pub binding: u32,
    pub sampler: Sampler,
    pub index: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TlasBinding {
    pub binding: u32,
    pub tlas: Tlas,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Bindings<'a> {
    pub buffers: &'a [BufferBinding],
    pub images: &'a [ImageBinding],
    pub samplers: &'a [SamplerBinding],
    pub tlases: &'a [TlasBinding],
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryBarrier {
    pub src_stage_mask: PipelineStage,
    pub src_access_mask: MemoryAccess,
    pub dst_stage_mask: PipelineStage,
    pub dst_access_mask: MemoryAccess,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferMemoryBarrier {
    pub buffer: Buffer,
    pub src_stage_mask: PipelineStage,
    pub src_access_mask: MemoryAccess,
    pub dst_stage_mask: PipelineStage,
    pub dst_access_mask: MemoryAccess,
    pub offset: u64,
    pub size: u64,
}

/// The source access mask is taken from the image's tracked state; layouts
/// are preserved (transitions happen in the dedicated calls).
#[derive(Clone, Copy, Debug)]
pub struct ImageMemoryBarrier {
    pub image: Image,
    pub src_stage_mask: PipelineStage,
    pub dst_stage_mask: PipelineStage,
    pub access_mask: MemoryAccess,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineBarrier<'a> {
    pub memory_barriers: &'a [MemoryBarrier],
    pub buffer_barriers: &'a [BufferMemoryBarrier],
    pub image_barriers: &'a [ImageMemoryBarrier],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferImageCopyDesc {
    pub buffer_offset: u64,
    pub texel_offset: [i32; 3],
    pub texel_extent: [u32; 3],
}

#[derive(Clone, Copy, Debug)]
pub struct WaitSemaphoreInfo {
    pub semaphore: Semaphore,
    pub value: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SignalSemaphoreInfo {
    pub semaphore: Semaphore,
    pub value: u64,
}

/// Optional capabilities negotiated at device selection time.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceFeatures {
    pub debug_printf: bool,
    pub ray_tracing_invocation_reorder: bool,
    pub shader_clock: bool,
    /// Device-local memory is host-visible (UMA or ReBAR); host uploads skip
    /// the staging copy.
    pub shared_memory: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceProperties {
    pub max_compute_shared_memory_size: u32,
    pub max_push_constants_size: u32,
    pub max_ray_hit_attribute_size: u32,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub subgroup_size: u32,
    pub timestamp_period: f32,
}
