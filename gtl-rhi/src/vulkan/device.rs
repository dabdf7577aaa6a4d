//! Physical-device selection, capability negotiation, and logical-device
//! bring-up.

use std::ffi::{CStr, CString};
use std::sync::Mutex;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::error::{recoverable, GpuError, GpuResult};
use crate::limits::{
    resolve_device_index_override, score_device, vendor_name, AdapterKind,
    MAX_TIMESTAMP_QUERIES, VENDOR_ID_NVIDIA,
};
use crate::{DeviceFeatures, DeviceProperties};

const MIN_VK_API_VERSION: u32 = vk::API_VERSION_1_1;

const REQUIRED_EXTENSIONS: [&CStr; 14] = [
    ash::khr::acceleration_structure::NAME,
    ash::ext::descriptor_indexing::NAME, // required by VK_KHR_acceleration_structure
    ash::khr::buffer_device_address::NAME, // required by VK_KHR_acceleration_structure
    ash::khr::deferred_host_operations::NAME, // required by VK_KHR_acceleration_structure
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::spirv_1_4::NAME, // required by VK_KHR_ray_tracing_pipeline
    ash::khr::shader_float_controls::NAME, // required by VK_KHR_spirv_1_4
    ash::khr::shader_float16_int8::NAME,
    ash::khr::synchronization2::NAME,
    ash::khr::timeline_semaphore::NAME,
    ash::khr::maintenance5::NAME,
    ash::khr::dynamic_rendering::NAME, // required by VK_KHR_maintenance5
    ash::khr::depth_stencil_resolve::NAME, // required by VK_KHR_dynamic_rendering
    ash::khr::create_renderpass2::NAME, // required by VK_KHR_depth_stencil_resolve
];

/// Capabilities the runtime uses internally but does not expose.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct InternalFeatures {
    pub driver_properties: bool,
    pub maintenance4: bool,
    pub pageable_device_local_memory: bool,
    pub pipeline_libraries: bool,
    pub ray_tracing_validation: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct InternalProperties {
    pub min_acceleration_structure_scratch_offset_alignment: u32,
    pub min_memory_map_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub shader_group_base_alignment: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_handle_size: u32,
}

pub(crate) struct Device {
    #[allow(dead_code)]
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
    pub pipeline_cache: vk::PipelineCache,
    pub timestamp_pool: vk::QueryPool,
    pub allocator: Option<Allocator>,

    pub features: DeviceFeatures,
    pub internal_features: InternalFeatures,
    pub properties: DeviceProperties,
    pub internal_properties: InternalProperties,

    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub synchronization2: ash::khr::synchronization2::Device,
    pub timeline_semaphore: ash::khr::timeline_semaphore::Device,
    pub buffer_device_address: ash::khr::buffer_device_address::Device,
    pub debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl Device {
    pub fn destroy(&mut self) {
        // The allocator has to go before the logical device.
        self.allocator = None;

        unsafe {
            self.device.destroy_query_pool(self.timestamp_pool, None);
            if self.pipeline_cache != vk::PipelineCache::null() {
                self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// The loader is refcounted across contexts; concurrent context creation is
// the one cross-thread entry point.
static LOADER: Mutex<Option<ash::Entry>> = Mutex::new(None);

fn load_entry() -> GpuResult<ash::Entry> {
    let mut guard = LOADER.lock().unwrap();

    if let Some(entry) = guard.as_ref() {
        return Ok(entry.clone());
    }

    let entry = match unsafe { ash::Entry::load() } {
        Ok(entry) => entry,
        Err(err) => recoverable!(
            GpuError::RuntimeUnavailable(err.to_string()),
            "failed to load the Vulkan loader: {err}"
        ),
    };

    *guard = Some(entry.clone());
    Ok(entry)
}

struct DeviceCandidate {
    physical_device: vk::PhysicalDevice,
    name: String,
    api_version: u32,
    vendor_id: u32,
    queue_family_index: u32,
    score: u32,
    /// Non-empty means the device is unsuitable.
    errors: Vec<String>,
    enabled_extensions: Vec<&'static CStr>,

    features: DeviceFeatures,
    internal_features: InternalFeatures,
    properties: DeviceProperties,
    internal_properties: InternalProperties,

    driver_name: Option<String>,
    driver_info: Option<String>,
}

fn cstr_field_to_string(field: &[std::ffi::c_char]) -> String {
    unsafe { CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn find_extension(name: &CStr, extensions: &[vk::ExtensionProperties]) -> bool {
    extensions.iter().any(|properties| {
        (unsafe { CStr::from_ptr(properties.extension_name.as_ptr()) }) == name
    })
}

fn query_device_candidate(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    debug_utils_enabled: bool,
) -> DeviceCandidate {
    let mut errors = Vec::new();

    // queue family: compute + transfer
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut queue_family_index = u32::MAX;
    for (index, family) in queue_families.iter().enumerate() {
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER) {
            queue_family_index = index as u32;
        }
    }
    if queue_family_index == u32::MAX {
        errors.push("no suitable queue family".to_string());
    }

    // memory: find the largest device-local heap and whether it is also
    // host-visible (UMA or ReBAR)
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    let mut largest_device_local_heap = 0u64;
    let mut heap_host_accessible = false;
    for memory_type in &memory_properties.memory_types[..memory_properties.memory_type_count as usize]
    {
        let heap_size = memory_properties.memory_heaps[memory_type.heap_index as usize].size;
        if !memory_type.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            || heap_size < largest_device_local_heap
        {
            continue;
        }
        largest_device_local_heap = heap_size;
        if memory_type.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            heap_host_accessible = true;
        }
    }

    // extensions
    let extensions = unsafe {
        instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
    };

    let mut enabled_extensions: Vec<&'static CStr> = Vec::with_capacity(24);
    for extension in REQUIRED_EXTENSIONS {
        if !find_extension(extension, &extensions) {
            errors.push(format!("extension {} missing", extension.to_string_lossy()));
        }
        enabled_extensions.push(extension);
    }

    let has_extension = |name: &CStr| find_extension(name, &extensions);

    // properties
    let mut driver = vk::PhysicalDeviceDriverProperties::default();
    let mut acceleration_structure = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut ray_tracing_pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();

    let driver_properties = has_extension(ash::khr::driver_properties::NAME);

    let mut properties2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut acceleration_structure)
        .push_next(&mut ray_tracing_pipeline)
        .push_next(&mut subgroup);
    if driver_properties {
        properties2 = properties2.push_next(&mut driver);
    }
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };

    let device_properties = properties2.properties;
    let limits = &device_properties.limits;

    let api_version = device_properties.api_version;
    if api_version < MIN_VK_API_VERSION {
        errors.push(format!(
            "outdated Vulkan API {}.{}.{}",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version)
        ));
    }

    // features
    let mut maintenance4 = vk::PhysicalDeviceMaintenance4Features::default();
    let mut group_handles = vk::PhysicalDevicePipelineLibraryGroupHandlesFeaturesEXT::default();
    let mut memory_priority = vk::PhysicalDeviceMemoryPriorityFeaturesEXT::default();
    let mut pageable = vk::PhysicalDevicePageableDeviceLocalMemoryFeaturesEXT::default();
    let mut shader_clock = vk::PhysicalDeviceShaderClockFeaturesKHR::default();
    let mut invocation_reorder = vk::PhysicalDeviceRayTracingInvocationReorderFeaturesNV::default();
    let mut ray_tracing_validation = vk::PhysicalDeviceRayTracingValidationFeaturesNV::default();
    let mut maintenance5 = vk::PhysicalDeviceMaintenance5FeaturesKHR::default();
    let mut timeline_semaphore = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
    let mut synchronization2 = vk::PhysicalDeviceSynchronization2Features::default();
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut buffer_device_address = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut descriptor_indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
    let mut shader_float16_int8 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
    let mut storage_16bit = vk::PhysicalDevice16BitStorageFeatures::default();

    let maintenance4_present = has_extension(ash::khr::maintenance4::NAME);
    // issues on AMD and Intel
    let pipeline_libraries_present = device_properties.vendor_id == VENDOR_ID_NVIDIA
        && has_extension(ash::khr::pipeline_library::NAME)
        && has_extension(ash::ext::pipeline_library_group_handles::NAME);
    let memory_priority_present = has_extension(ash::ext::memory_priority::NAME)
        && has_extension(ash::ext::pageable_device_local_memory::NAME);
    let shader_clock_present =
        cfg!(debug_assertions) && has_extension(ash::khr::shader_clock::NAME);
    let invocation_reorder_present =
        cfg!(debug_assertions) && has_extension(ash::nv::ray_tracing_invocation_reorder::NAME);
    let ray_tracing_validation_present = cfg!(debug_assertions)
        && debug_utils_enabled
        && has_extension(ash::nv::ray_tracing_validation::NAME);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut maintenance5)
        .push_next(&mut timeline_semaphore)
        .push_next(&mut synchronization2)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_pipeline_features)
        .push_next(&mut buffer_device_address)
        .push_next(&mut descriptor_indexing)
        .push_next(&mut shader_float16_int8)
        .push_next(&mut storage_16bit);
    if maintenance4_present {
        features2 = features2.push_next(&mut maintenance4);
    }
    if pipeline_libraries_present {
        features2 = features2.push_next(&mut group_handles);
    }
    if memory_priority_present {
        features2 = features2.push_next(&mut memory_priority).push_next(&mut pageable);
    }
    if shader_clock_present {
        features2 = features2.push_next(&mut shader_clock);
    }
    if invocation_reorder_present {
        features2 = features2.push_next(&mut invocation_reorder);
    }
    if ray_tracing_validation_present {
        features2 = features2.push_next(&mut ray_tracing_validation);
    }
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    let core_features = features2.features;

    let mut require_feature = |present: vk::Bool32, name: &str| {
        if present == vk::FALSE {
            errors.push(format!("feature {name} missing"));
        }
    };

    require_feature(maintenance5.maintenance5, "maintenance5");
    require_feature(timeline_semaphore.timeline_semaphore, "timelineSemaphore");
    require_feature(synchronization2.synchronization2, "synchronization2");
    require_feature(
        acceleration_structure_features.acceleration_structure,
        "accelerationStructure",
    );
    require_feature(ray_tracing_pipeline_features.ray_tracing_pipeline, "rayTracingPipeline");
    require_feature(buffer_device_address.buffer_device_address, "bufferDeviceAddress");
    require_feature(
        descriptor_indexing.shader_sampled_image_array_non_uniform_indexing,
        "shaderSampledImageArrayNonUniformIndexing",
    );
    require_feature(
        descriptor_indexing.descriptor_binding_partially_bound,
        "descriptorBindingPartiallyBound",
    );
    require_feature(descriptor_indexing.runtime_descriptor_array, "runtimeDescriptorArray");
    require_feature(shader_float16_int8.shader_float16, "shaderFloat16");
    require_feature(storage_16bit.storage_buffer16_bit_access, "storageBuffer16BitAccess");
    require_feature(
        core_features.shader_sampled_image_array_dynamic_indexing,
        "shaderSampledImageArrayDynamicIndexing",
    );
    require_feature(core_features.shader_int16, "shaderInt16");
    require_feature(core_features.shader_int64, "shaderInt64");

    let pageable_device_local_memory = memory_priority_present
        && memory_priority.memory_priority == vk::TRUE
        && pageable.pageable_device_local_memory == vk::TRUE;

    let features = DeviceFeatures {
        debug_printf: has_extension(ash::khr::shader_non_semantic_info::NAME),
        ray_tracing_invocation_reorder: invocation_reorder_present
            && invocation_reorder.ray_tracing_invocation_reorder == vk::TRUE,
        shader_clock: shader_clock_present && shader_clock.shader_subgroup_clock == vk::TRUE,
        shared_memory: heap_host_accessible, // UMA or ReBAR
    };

    let internal_features = InternalFeatures {
        driver_properties,
        maintenance4: maintenance4_present && maintenance4.maintenance4 == vk::TRUE,
        pageable_device_local_memory,
        pipeline_libraries: pipeline_libraries_present
            && group_handles.pipeline_library_group_handles == vk::TRUE,
        ray_tracing_validation: ray_tracing_validation_present
            && ray_tracing_validation.ray_tracing_validation == vk::TRUE,
    };

    if features.debug_printf {
        enabled_extensions.push(ash::khr::shader_non_semantic_info::NAME);
    }
    if features.ray_tracing_invocation_reorder {
        enabled_extensions.push(ash::nv::ray_tracing_invocation_reorder::NAME);
    }
    if features.shader_clock {
        enabled_extensions.push(ash::khr::shader_clock::NAME);
    }
    if internal_features.driver_properties {
        enabled_extensions.push(ash::khr::driver_properties::NAME);
    }
    if internal_features.maintenance4 {
        enabled_extensions.push(ash::khr::maintenance4::NAME);
    }
    if internal_features.pageable_device_local_memory {
        enabled_extensions.push(ash::ext::memory_priority::NAME);
        enabled_extensions.push(ash::ext::pageable_device_local_memory::NAME);
    }
    if internal_features.pipeline_libraries {
        enabled_extensions.push(ash::khr::pipeline_library::NAME);
        enabled_extensions.push(ash::ext::pipeline_library_group_handles::NAME);
    }
    if internal_features.ray_tracing_validation {
        enabled_extensions.push(ash::nv::ray_tracing_validation::NAME);
    }

    let adapter_kind = match device_properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        _ => AdapterKind::Other,
    };

    let score = score_device(adapter_kind, largest_device_local_heap, !errors.is_empty());

    DeviceCandidate {
        physical_device,
        name: cstr_field_to_string(&device_properties.device_name),
        api_version,
        vendor_id: device_properties.vendor_id,
        queue_family_index,
        score,
        errors,
        enabled_extensions,
        features,
        internal_features,
        properties: DeviceProperties {
            max_compute_shared_memory_size: limits.max_compute_shared_memory_size,
            max_push_constants_size: limits.max_push_constants_size,
            max_ray_hit_attribute_size: ray_tracing_pipeline.max_ray_hit_attribute_size,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            subgroup_size: subgroup.subgroup_size,
            timestamp_period: limits.timestamp_period,
        },
        internal_properties: InternalProperties {
            min_acceleration_structure_scratch_offset_alignment: acceleration_structure
                .min_acceleration_structure_scratch_offset_alignment,
            min_memory_map_alignment: limits.min_memory_map_alignment as u64,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            shader_group_base_alignment: ray_tracing_pipeline.shader_group_base_alignment,
            shader_group_handle_alignment: ray_tracing_pipeline.shader_group_handle_alignment,
            shader_group_handle_size: ray_tracing_pipeline.shader_group_handle_size,
        },
        driver_name: driver_properties.then(|| cstr_field_to_string(&driver.driver_name)),
        driver_info: driver_properties.then(|| cstr_field_to_string(&driver.driver_info)),
    }
}

fn log_enabled_features(features: &DeviceFeatures, internal: &InternalFeatures) {
    log::info!("Optional features:");

    macro_rules! print_feature {
        ($struct:expr, $field:ident) => {
            if $struct.$field {
                log::info!("- {}", stringify!($field));
            }
        };
    }

    print_feature!(features, debug_printf);
    print_feature!(internal, driver_properties);
    print_feature!(internal, maintenance4);
    print_feature!(internal, pageable_device_local_memory);
    print_feature!(internal, pipeline_libraries);
    print_feature!(features, ray_tracing_invocation_reorder);
    print_feature!(internal, ray_tracing_validation);
    print_feature!(features, shader_clock);
    print_feature!(features, shared_memory);
}

pub(crate) fn create_device(
    app_name: &str,
    version_major: u32,
    version_minor: u32,
    version_patch: u32,
) -> GpuResult<(Device, bool)> {
    let entry = load_entry()?;

    let instance_version =
        unsafe { entry.try_enumerate_instance_version() }.ok().flatten().unwrap_or(vk::API_VERSION_1_0);
    log::info!("Vulkan instance:");
    log::info!(
        "> version {}.{}.{}",
        vk::api_version_major(instance_version),
        vk::api_version_minor(instance_version),
        vk::api_version_patch(instance_version)
    );

    if instance_version < MIN_VK_API_VERSION {
        recoverable!(GpuError::NoSuitableGpu, "Vulkan instance version below minimum of 1.1");
    }

    let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();
    let mut enabled_extensions: Vec<*const std::ffi::c_char> = Vec::new();
    let mut debug_utils_enabled = false;

    #[cfg(debug_assertions)]
    {
        const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

        let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let has_validation = layers.iter().any(|properties| {
            (unsafe { CStr::from_ptr(properties.layer_name.as_ptr()) }) == VALIDATION_LAYER
        });
        if has_validation {
            enabled_layers.push(VALIDATION_LAYER.as_ptr());
            log::info!("> layers: {}", VALIDATION_LAYER.to_string_lossy());
        }

        let extensions =
            unsafe { entry.enumerate_instance_extension_properties(None) }.unwrap_or_default();
        if find_extension(ash::ext::debug_utils::NAME, &extensions) {
            enabled_extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            debug_utils_enabled = true;
        }
    }

    let app_name = CString::new(app_name).unwrap_or_default();
    let app_version = vk::make_api_version(0, version_major, version_minor, version_patch);
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(app_version)
        .engine_name(&app_name)
        .engine_version(app_version)
        .api_version(MIN_VK_API_VERSION);

    let instance_create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&enabled_layers)
        .enabled_extension_names(&enabled_extensions);

    let instance = match unsafe { entry.create_instance(&instance_create_info, None) } {
        Ok(instance) => instance,
        Err(err) => recoverable!(
            GpuError::RuntimeUnavailable(err.to_string()),
            "failed to create Vulkan instance (code: {err})"
        ),
    };

    match create_logical_device(&entry, &instance, debug_utils_enabled) {
        Ok(device) => Ok((device, debug_utils_enabled)),
        Err(err) => {
            unsafe { instance.destroy_instance(None) };
            Err(err)
        }
    }
}

fn create_logical_device(
    entry: &ash::Entry,
    instance: &ash::Instance,
    debug_utils_enabled: bool,
) -> GpuResult<Device> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }.unwrap_or_default();
    if physical_devices.is_empty() {
        recoverable!(GpuError::NoSuitableGpu, "no GPUs found");
    }

    let mut candidates: Vec<DeviceCandidate> = physical_devices
        .iter()
        .map(|pd| query_device_candidate(instance, *pd, debug_utils_enabled))
        .collect();
    candidates.sort_by(|a, b| b.score.cmp(&a.score));

    let mut device_index = 0usize;
    if let Ok(override_value) = std::env::var("GTL_DEVICE_INDEX_OVERRIDE") {
        device_index = resolve_device_index_override(&override_value, candidates.len());
    }

    log::info!("Device list:");
    for (index, candidate) in candidates.iter().enumerate() {
        let index_str =
            if index == device_index { "x".to_string() } else { index.to_string() };
        log::info!("[{}] ({}) {}", index_str, candidate.score, candidate.name);
        for message in &candidate.errors {
            log::info!("  - {message}");
        }
    }

    if candidates[device_index].score == 0 {
        recoverable!(GpuError::NoSuitableGpu, "GPU not suitable");
    }

    let candidate = &candidates[device_index];

    log::info!("Selected device {device_index}:");
    log::info!(
        "> API version: {}.{}.{}",
        vk::api_version_major(candidate.api_version),
        vk::api_version_minor(candidate.api_version),
        vk::api_version_patch(candidate.api_version)
    );
    log::info!("> name: {}", candidate.name);
    match vendor_name(candidate.vendor_id) {
        Some(vendor) => log::info!("> vendor: {vendor}"),
        None => log::info!("> vendor: Unknown ({:#08x})", candidate.vendor_id),
    }
    if let (Some(name), Some(info)) = (&candidate.driver_name, &candidate.driver_info) {
        log::info!("> driver: {name} ({info})");
    }
    log_enabled_features(&candidate.features, &candidate.internal_features);

    // Enable the full required feature set plus the negotiated optional one.
    let mut maintenance5 = vk::PhysicalDeviceMaintenance5FeaturesKHR::default().maintenance5(true);
    let mut timeline_semaphore =
        vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
    let mut synchronization2 =
        vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut buffer_device_address =
        vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
    let mut descriptor_indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default()
        .shader_sampled_image_array_non_uniform_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true);
    let mut shader_float16_int8 =
        vk::PhysicalDeviceShaderFloat16Int8Features::default().shader_float16(true);
    let mut storage_16bit =
        vk::PhysicalDevice16BitStorageFeatures::default().storage_buffer16_bit_access(true);
    let mut maintenance4 = vk::PhysicalDeviceMaintenance4Features::default().maintenance4(true);
    let mut group_handles = vk::PhysicalDevicePipelineLibraryGroupHandlesFeaturesEXT::default()
        .pipeline_library_group_handles(true);
    let mut memory_priority =
        vk::PhysicalDeviceMemoryPriorityFeaturesEXT::default().memory_priority(true);
    let mut pageable = vk::PhysicalDevicePageableDeviceLocalMemoryFeaturesEXT::default()
        .pageable_device_local_memory(true);
    let mut shader_clock =
        vk::PhysicalDeviceShaderClockFeaturesKHR::default().shader_subgroup_clock(true);
    let mut invocation_reorder = vk::PhysicalDeviceRayTracingInvocationReorderFeaturesNV::default()
        .ray_tracing_invocation_reorder(true);
    let mut ray_tracing_validation =
        vk::PhysicalDeviceRayTracingValidationFeaturesNV::default().ray_tracing_validation(true);

    let core_features = vk::PhysicalDeviceFeatures::default()
        .shader_sampled_image_array_dynamic_indexing(true)
        .shader_int16(true)
        .shader_int64(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(core_features)
        .push_next(&mut maintenance5)
        .push_next(&mut timeline_semaphore)
        .push_next(&mut synchronization2)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_pipeline_features)
        .push_next(&mut buffer_device_address)
        .push_next(&mut descriptor_indexing)
        .push_next(&mut shader_float16_int8)
        .push_next(&mut storage_16bit);
    if candidate.internal_features.maintenance4 {
        features2 = features2.push_next(&mut maintenance4);
    }
    if candidate.internal_features.pipeline_libraries {
        features2 = features2.push_next(&mut group_handles);
    }
    if candidate.internal_features.pageable_device_local_memory {
        features2 = features2.push_next(&mut memory_priority).push_next(&mut pageable);
    }
    if candidate.features.shader_clock {
        features2 = features2.push_next(&mut shader_clock);
    }
    if candidate.features.ray_tracing_invocation_reorder {
        features2 = features2.push_next(&mut invocation_reorder);
    }
    if candidate.internal_features.ray_tracing_validation {
        features2 = features2.push_next(&mut ray_tracing_validation);
    }

    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(candidate.queue_family_index)
        .queue_priorities(&queue_priorities);

    let extension_pointers: Vec<*const std::ffi::c_char> =
        candidate.enabled_extensions.iter().map(|name| name.as_ptr()).collect();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_pointers)
        .push_next(&mut features2);

    let device = match unsafe {
        instance.create_device(candidate.physical_device, &device_create_info, None)
    } {
        Ok(device) => device,
        Err(err) => recoverable!(
            GpuError::CreationFailed("device"),
            "failed to create device: {err}"
        ),
    };

    let queue = unsafe { device.get_device_queue(candidate.queue_family_index, 0) };

    let pool_create_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(candidate.queue_family_index);
    let command_pool = match unsafe { device.create_command_pool(&pool_create_info, None) } {
        Ok(pool) => pool,
        Err(err) => {
            unsafe { device.destroy_device(None) };
            recoverable!(
                GpuError::CreationFailed("command pool"),
                "failed to create command pool: {err}"
            );
        }
    };

    let allocator = match Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device: candidate.physical_device,
        debug_settings: Default::default(),
        buffer_device_address: true,
        allocation_sizes: Default::default(),
    }) {
        Ok(allocator) => allocator,
        Err(err) => {
            unsafe {
                device.destroy_command_pool(command_pool, None);
                device.destroy_device(None);
            }
            recoverable!(
                GpuError::CreationFailed("allocator"),
                "failed to create device allocator: {err}"
            );
        }
    };

    let cache_create_info = vk::PipelineCacheCreateInfo::default();
    let pipeline_cache = match unsafe { device.create_pipeline_cache(&cache_create_info, None) } {
        Ok(cache) => cache,
        Err(_) => {
            log::warn!("{}:{}: failed to create pipeline cache", file!(), line!());
            vk::PipelineCache::null()
        }
    };

    let timestamp_pool_create_info = vk::QueryPoolCreateInfo::default()
        .query_type(vk::QueryType::TIMESTAMP)
        .query_count(MAX_TIMESTAMP_QUERIES);
    let timestamp_pool =
        match unsafe { device.create_query_pool(&timestamp_pool_create_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                drop(allocator);
                unsafe {
                    if pipeline_cache != vk::PipelineCache::null() {
                        device.destroy_pipeline_cache(pipeline_cache, None);
                    }
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                recoverable!(
                    GpuError::CreationFailed("timestamp query pool"),
                    "failed to create timestamp query pool: {err}"
                );
            }
        };

    let acceleration_structure =
        ash::khr::acceleration_structure::Device::new(instance, &device);
    let ray_tracing_pipeline = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
    let synchronization2 = ash::khr::synchronization2::Device::new(instance, &device);
    let timeline_semaphore = ash::khr::timeline_semaphore::Device::new(instance, &device);
    let buffer_device_address = ash::khr::buffer_device_address::Device::new(instance, &device);
    let debug_utils = debug_utils_enabled
        .then(|| ash::ext::debug_utils::Device::new(instance, &device));

    Ok(Device {
        entry: entry.clone(),
        instance: instance.clone(),
        physical_device: candidate.physical_device,
        device,
        queue,
        command_pool,
        pipeline_cache,
        timestamp_pool,
        allocator: Some(allocator),
        features: candidate.features,
        internal_features: candidate.internal_features,
        properties: candidate.properties,
        internal_properties: candidate.internal_properties,
        acceleration_structure,
        ray_tracing_pipeline,
        synchronization2,
        timeline_semaphore,
        buffer_device_address,
        debug_utils,
    })
}
