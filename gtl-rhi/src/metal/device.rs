//! Metal device bring-up.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal as mtl;
use objc2_metal::{MTL4CommandQueue, MTLDevice, MTLResidencySet};

use crate::error::{recoverable, GpuError, GpuResult};
use crate::{DeviceFeatures, DeviceProperties};

// See the Apple feature-set tables.
const METAL_DEVICE_FEATURES: DeviceFeatures = DeviceFeatures {
    debug_printf: true,
    ray_tracing_invocation_reorder: false,
    shader_clock: false,
    shared_memory: true,
};

const METAL_DEVICE_PROPERTIES: DeviceProperties = DeviceProperties {
    max_compute_shared_memory_size: 32 * 1024,
    max_push_constants_size: 4096,
    max_ray_hit_attribute_size: u32::MAX,
    min_storage_buffer_offset_alignment: 4,
    min_uniform_buffer_offset_alignment: 4,
    subgroup_size: 32,
    timestamp_period: 1.0,
};

pub(crate) struct Device {
    pub device: Retained<ProtocolObject<dyn mtl::MTLDevice>>,
    pub command_queue: Retained<ProtocolObject<dyn mtl::MTL4CommandQueue>>,
    /// Keeps shader-device-address buffers resident queue-wide.
    pub residency_set: Retained<ProtocolObject<dyn mtl::MTLResidencySet>>,

    pub features: DeviceFeatures,
    pub properties: DeviceProperties,
}

pub(crate) fn create_residency_set(
    device: &ProtocolObject<dyn mtl::MTLDevice>,
    initial_capacity: usize,
) -> GpuResult<Retained<ProtocolObject<dyn mtl::MTLResidencySet>>> {
    let descriptor = unsafe { mtl::MTLResidencySetDescriptor::new() };
    unsafe { descriptor.setInitialCapacity(initial_capacity) };

    match unsafe { device.newResidencySetWithDescriptor_error(&descriptor) } {
        Ok(set) => Ok(set),
        Err(err) => recoverable!(
            GpuError::CreationFailed("residency set"),
            "failed to create residency set: {err}"
        ),
    }
}

pub(crate) fn create_device(app_name: &str) -> GpuResult<Device> {
    let Some(device) = mtl::MTLCreateSystemDefaultDevice() else {
        recoverable!(GpuError::NoSuitableGpu, "no Metal device found");
    };

    log::info!("Selected device:");
    log::info!("> name: {}", unsafe { device.name() });
    log::info!("> app: {app_name}");

    if !device.supportsRaytracing() {
        recoverable!(GpuError::NoSuitableGpu, "device does not support ray tracing");
    }

    let Some(command_queue) = (unsafe { device.newMTL4CommandQueue() }) else {
        recoverable!(
            GpuError::CreationFailed("command queue"),
            "failed to create command queue"
        );
    };

    let residency_set = create_residency_set(&device, 256)?;
    unsafe { command_queue.addResidencySet(&residency_set) };

    Ok(Device {
        device,
        command_queue,
        residency_set,
        features: METAL_DEVICE_FEATURES,
        properties: METAL_DEVICE_PROPERTIES,
    })
}

impl Device {
    /// Tracks a newly created allocation in the device-wide residency set.
    pub fn make_resident(&self, allocation: &ProtocolObject<dyn mtl::MTLAllocation>) {
        unsafe {
            self.residency_set.addAllocation(allocation);
            self.residency_set.commit();
        }
    }

    pub fn evict(&self, allocation: &ProtocolObject<dyn mtl::MTLAllocation>) {
        unsafe {
            self.residency_set.removeAllocation(allocation);
            self.residency_set.commit();
        }
    }
}
