//! Vulkan backend (Vulkan 1.1 + ray-tracing extension set).

mod acceleration;
mod bind_set;
mod buffer;
mod command;
mod device;
mod image;
mod pipeline;
mod sampler;
mod shader;
mod sync;

use ash::vk;

use crate::error::GpuResult;
use crate::handle_store::ResourceStore;
use crate::{DeviceFeatures, DeviceProperties, ShaderStage};

pub(crate) use buffer::BufferRecord;
pub(crate) use device::Device;
pub(crate) use image::ImageRecord;
pub(crate) use pipeline::PipelineRecord;
pub(crate) use shader::ShaderRecord;

pub(crate) struct SemaphoreRecord {
    pub semaphore: vk::Semaphore,
}

pub(crate) struct CommandBufferRecord {
    pub command_buffer: vk::CommandBuffer,
}

pub(crate) struct SamplerRecord {
    pub sampler: vk::Sampler,
}

pub(crate) struct BlasRecord {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub address: u64,
    pub buffer: BufferRecord,
    pub is_opaque: bool,
}

pub(crate) struct TlasRecord {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: BufferRecord,
}

pub(crate) struct BindSetRecord {
    pub layout_bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    pub descriptor_set: vk::DescriptorSet,
}

/// Resolves a handle or aborts; dangling handles are a programming bug, not
/// a recoverable state.
macro_rules! resolve {
    ($ctx:expr, $store:ident, $handle:expr) => {
        match $ctx.$store.get($handle.0) {
            Some(record) => record,
            None => crate::error::fatal!("invalid handle!"),
        }
    };
}

macro_rules! resolve_mut {
    ($ctx:expr, $store:ident, $handle:expr) => {
        match $ctx.$store.get_mut($handle.0) {
            Some(record) => record,
            None => crate::error::fatal!("invalid handle!"),
        }
    };
}

pub(crate) use resolve;
pub(crate) use resolve_mut;

/// The per-process GPU context: instance, device, and one handle store per
/// entity type. Not thread-safe; callers serialize all entry points.
pub struct Context {
    pub(crate) device: Device,

    pub(crate) buffers: ResourceStore<BufferRecord>,
    pub(crate) images: ResourceStore<ImageRecord>,
    pub(crate) shaders: ResourceStore<ShaderRecord>,
    pub(crate) pipelines: ResourceStore<PipelineRecord>,
    pub(crate) semaphores: ResourceStore<SemaphoreRecord>,
    pub(crate) command_buffers: ResourceStore<CommandBufferRecord>,
    pub(crate) samplers: ResourceStore<SamplerRecord>,
    pub(crate) blases: ResourceStore<BlasRecord>,
    pub(crate) tlases: ResourceStore<TlasRecord>,
    pub(crate) bind_sets: ResourceStore<BindSetRecord>,

    pub(crate) debug_utils_enabled: bool,
}

impl Context {
    /// Creates the instance, selects a physical device, and brings up the
    /// logical device with its allocator and pools.
    pub fn initialize(
        app_name: &str,
        version_major: u32,
        version_minor: u32,
        version_patch: u32,
    ) -> GpuResult<Context> {
        let (device, debug_utils_enabled) =
            device::create_device(app_name, version_major, version_minor, version_patch)?;

        Ok(Context {
            device,
            buffers: ResourceStore::new(16),
            images: ResourceStore::new(128),
            shaders: ResourceStore::new(32),
            pipelines: ResourceStore::new(8),
            semaphores: ResourceStore::new(16),
            command_buffers: ResourceStore::new(16),
            samplers: ResourceStore::new(8),
            blases: ResourceStore::new(1024),
            tlases: ResourceStore::new(1),
            bind_sets: ResourceStore::new(32),
            debug_utils_enabled,
        })
    }

    pub fn device_features(&self) -> &DeviceFeatures {
        &self.device.features
    }

    pub fn device_properties(&self) -> &DeviceProperties {
        &self.device.properties
    }

    pub(crate) fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = &self.device.debug_utils else {
            return;
        };
        if !self.debug_utils_enabled {
            return;
        }
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let mut info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(&name);
        info.object_type = object_type;
        info.object_handle = handle;
        let _ = unsafe { debug_utils.set_debug_utils_object_name(&info) };
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            // Callers are responsible for queue-ordering destroys; at
            // teardown we only have to wait once for everything.
            let _ = self.device.device.device_wait_idle();
        }

        let command_buffers: Vec<_> = self.command_buffers.drain().collect();
        for record in command_buffers {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.device.command_pool, &[record.command_buffer]);
            }
        }
        // Bind set memory is owned by the pipeline descriptor pools.
        for _ in self.bind_sets.drain() {}
        let pipelines: Vec<_> = self.pipelines.drain().collect();
        for record in pipelines {
            pipeline::destroy_pipeline_record(&mut self.device, record);
        }
        let blases: Vec<_> = self.blases.drain().collect();
        for record in blases {
            unsafe {
                self.device
                    .acceleration_structure
                    .destroy_acceleration_structure(record.acceleration_structure, None);
            }
            buffer::destroy_internal_buffer(&mut self.device, record.buffer);
        }
        let tlases: Vec<_> = self.tlases.drain().collect();
        for record in tlases {
            unsafe {
                self.device
                    .acceleration_structure
                    .destroy_acceleration_structure(record.acceleration_structure, None);
            }
            buffer::destroy_internal_buffer(&mut self.device, record.buffer);
        }
        let shaders: Vec<_> = self.shaders.drain().collect();
        for record in shaders {
            shader::destroy_shader_record(&self.device, record);
        }
        let samplers: Vec<_> = self.samplers.drain().collect();
        for record in samplers {
            unsafe { self.device.device.destroy_sampler(record.sampler, None) };
        }
        let images: Vec<_> = self.images.drain().collect();
        for record in images {
            image::destroy_image_record(&mut self.device, record);
        }
        let buffers: Vec<_> = self.buffers.drain().collect();
        for record in buffers {
            buffer::destroy_internal_buffer(&mut self.device, record);
        }
        let semaphores: Vec<_> = self.semaphores.drain().collect();
        for record in semaphores {
            unsafe { self.device.device.destroy_semaphore(record.semaphore, None) };
        }

        self.device.destroy();
    }
}

/// Maps API shader stages onto the backend stage mask used for barriers and
/// push constants.
pub(crate) fn pipeline_stages_for_shader_stages(stages: ShaderStage) -> vk::PipelineStageFlags2 {
    let mut flags = vk::PipelineStageFlags2::NONE;

    if stages.contains(ShaderStage::COMPUTE) {
        flags |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    if stages.intersects(
        ShaderStage::RAYGEN | ShaderStage::ANY_HIT | ShaderStage::CLOSEST_HIT | ShaderStage::MISS,
    ) {
        flags |= vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
    }

    debug_assert_ne!(flags, vk::PipelineStageFlags2::NONE);
    flags
}

pub(crate) fn shader_stage_flags(stages: ShaderStage) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

pub(crate) const RT_PIPELINE_STAGE_FLAGS: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

pub(crate) const SHADER_ENTRY_POINT: &std::ffi::CStr = c"main";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_stage_maps_to_compute_shader() {
        assert_eq!(
            pipeline_stages_for_shader_stages(ShaderStage::COMPUTE),
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
    }

    #[test]
    fn rt_stages_map_to_ray_tracing_shader() {
        for stage in [
            ShaderStage::RAYGEN,
            ShaderStage::ANY_HIT,
            ShaderStage::CLOSEST_HIT,
            ShaderStage::MISS,
        ] {
            assert_eq!(
                pipeline_stages_for_shader_stages(stage),
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
            );
        }
    }

    #[test]
    fn api_stage_bits_match_backend_bits() {
        assert_eq!(
            shader_stage_flags(ShaderStage::COMPUTE),
            vk::ShaderStageFlags::COMPUTE
        );
        assert_eq!(
            shader_stage_flags(ShaderStage::RAYGEN | ShaderStage::MISS),
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::MISS_KHR
        );
    }
}
