//! Metal 4 backend (macOS).
//!
//! SPIR-V modules are cross-compiled to MSL; ray tracing dispatches through
//! per-payload function tables instead of a shader binding table. Residency
//! sets keep referenced allocations resident while work runs.

mod acceleration;
mod bind_set;
mod command;
mod device;
mod pipeline;
mod resource;
mod shader;
mod sync;

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal as mtl;

use crate::error::GpuResult;
use crate::handle_store::ResourceStore;
use crate::{DeviceFeatures, DeviceProperties};

pub(crate) use bind_set::BindSetRecord;
pub(crate) use command::CommandBufferRecord;
pub(crate) use device::Device;
pub(crate) use pipeline::PipelineRecord;
pub(crate) use resource::{BufferRecord, ImageRecord, SamplerRecord};
pub(crate) use shader::ShaderRecord;

pub(crate) struct SemaphoreRecord {
    pub event: Retained<ProtocolObject<dyn mtl::MTLSharedEvent>>,
}

pub(crate) struct BlasRecord {
    pub acceleration_structure: Retained<ProtocolObject<dyn mtl::MTLAccelerationStructure>>,
    pub is_opaque: bool,
}

pub(crate) struct TlasRecord {
    pub acceleration_structure: Retained<ProtocolObject<dyn mtl::MTLAccelerationStructure>>,
    /// Referenced bottom-level structures, kept for residency tracking.
    pub blases: Vec<Retained<ProtocolObject<dyn mtl::MTLAccelerationStructure>>>,
}

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

/// The per-process GPU context. Not thread-safe; callers serialize all entry
/// points.
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
}

impl Context {
    pub fn initialize(
        app_name: &str,
        _version_major: u32,
        _version_minor: u32,
        _version_patch: u32,
    ) -> GpuResult<Context> {
        let device = device::create_device(app_name)?;

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
        })
    }

    pub fn device_features(&self) -> &DeviceFeatures {
        &self.device.features
    }

    pub fn device_properties(&self) -> &DeviceProperties {
        &self.device.properties
    }
}
