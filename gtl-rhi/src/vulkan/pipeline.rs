//! Compute and ray-tracing pipeline compilation, descriptor layouts, and the
//! shader binding table.

use ash::vk;

use super::device::Device;
use super::{resolve, Context, RT_PIPELINE_STAGE_FLAGS, SHADER_ENTRY_POINT};
use crate::error::fatal;
use crate::limits::{compute_sbt_layout, MAX_DESCRIPTOR_SET_COUNT};
use crate::reflection::{DescriptorType, ShaderReflection};
use crate::{
    Buffer, BufferCreateInfo, BufferUsage, ComputePipelineCreateInfo, MemoryProperties, Pipeline,
    RtPipelineCreateInfo, Shader, SignalSemaphoreInfo, WaitSemaphoreInfo,
};

pub(crate) enum PipelineKind {
    Compute,
    RayTracing {
        sbt_rgen: vk::StridedDeviceAddressRegionKHR,
        sbt_miss: vk::StridedDeviceAddressRegionKHR,
        sbt_hit: vk::StridedDeviceAddressRegionKHR,
        sbt: Buffer,
    },
}

pub(crate) struct PipelineRecord {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub layout_bindings: Vec<Vec<vk::DescriptorSetLayoutBinding<'static>>>,
    pub kind: PipelineKind,
}

impl PipelineRecord {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
            PipelineKind::RayTracing { .. } => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

/// Uniform buffers are always bound through dynamic offsets.
pub(crate) fn translate_descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        other => vk::DescriptorType::from_raw(other as u32 as i32),
    }
}

/// One descriptor set layout per reflected set. Image bindings are created
/// partially bound so unused array slots stay legal.
pub(crate) fn create_descriptor_set_layouts(
    device: &ash::Device,
    reflection: &ShaderReflection,
    stage_flags: vk::ShaderStageFlags,
) -> (
    Vec<vk::DescriptorSetLayout>,
    Vec<Vec<vk::DescriptorSetLayoutBinding<'static>>>,
) {
    let set_count = reflection.descriptor_sets.len();
    if set_count > MAX_DESCRIPTOR_SET_COUNT as usize {
        fatal!("max descriptor set count exceeded");
    }

    let mut layouts = Vec::with_capacity(set_count);
    let mut all_bindings = Vec::with_capacity(set_count);

    for set in &reflection.descriptor_sets {
        let mut bindings: Vec<vk::DescriptorSetLayoutBinding<'static>> =
            Vec::with_capacity(set.bindings.len());
        let mut binding_flags: Vec<vk::DescriptorBindingFlags> =
            vec![vk::DescriptorBindingFlags::empty(); set.bindings.len()];

        for (index, reflected) in set.bindings.iter().enumerate() {
            let descriptor_type = translate_descriptor_type(reflected.descriptor_type);

            if matches!(
                descriptor_type,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    | vk::DescriptorType::SAMPLED_IMAGE
                    | vk::DescriptorType::STORAGE_IMAGE
            ) {
                binding_flags[index] = vk::DescriptorBindingFlags::PARTIALLY_BOUND;
            }

            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(reflected.binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(reflected.count)
                    .stage_flags(stage_flags),
            );
        }

        let mut flags_create_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);

        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .push_next(&mut flags_create_info);

        let layout = match unsafe { device.create_descriptor_set_layout(&create_info, None) } {
            Ok(layout) => layout,
            Err(err) => fatal!("failed to create descriptor set layout: {err}"),
        };

        layouts.push(layout);
        all_bindings.push(bindings);
    }

    (layouts, all_bindings)
}

pub(crate) fn create_pipeline_layout(
    device: &ash::Device,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
    push_constants_size: u32,
    stage_flags: vk::ShaderStageFlags,
) -> vk::PipelineLayout {
    let push_constant_range = vk::PushConstantRange::default()
        .stage_flags(stage_flags)
        .offset(0)
        .size(push_constants_size);

    let mut create_info =
        vk::PipelineLayoutCreateInfo::default().set_layouts(descriptor_set_layouts);
    if push_constants_size > 0 {
        create_info = create_info.push_constant_ranges(std::slice::from_ref(&push_constant_range));
    }

    match unsafe { device.create_pipeline_layout(&create_info, None) } {
        Ok(layout) => layout,
        Err(err) => fatal!("failed to create pipeline layout: {err}"),
    }
}

/// Pool sized exactly to the reflected descriptor counts.
fn create_descriptor_pool(device: &ash::Device, reflection: &ShaderReflection) -> vk::DescriptorPool {
    let mut uniform_buffers = 0;
    let mut storage_buffers = 0;
    let mut storage_images = 0;
    let mut sampled_images = 0;
    let mut samplers = 0;
    let mut acceleration_structures = 0;

    for set in &reflection.descriptor_sets {
        for binding in &set.bindings {
            match binding.descriptor_type {
                DescriptorType::UniformBuffer => uniform_buffers += binding.count,
                DescriptorType::StorageBuffer => storage_buffers += binding.count,
                DescriptorType::StorageImage => storage_images += binding.count,
                DescriptorType::SampledImage => sampled_images += binding.count,
                DescriptorType::CombinedImageSampler => sampled_images += binding.count,
                DescriptorType::Sampler => samplers += binding.count,
                DescriptorType::AccelerationStructure => {
                    acceleration_structures += binding.count
                }
            }
        }
    }

    let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::with_capacity(6);
    let mut push_size = |ty: vk::DescriptorType, count: u32| {
        if count > 0 {
            pool_sizes.push(vk::DescriptorPoolSize::default().ty(ty).descriptor_count(count));
        }
    };
    // All uniform buffers are bound dynamic.
    push_size(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, uniform_buffers);
    push_size(vk::DescriptorType::STORAGE_BUFFER, storage_buffers);
    push_size(vk::DescriptorType::STORAGE_IMAGE, storage_images);
    push_size(vk::DescriptorType::SAMPLED_IMAGE, sampled_images);
    push_size(vk::DescriptorType::SAMPLER, samplers);
    push_size(
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        acceleration_structures,
    );

    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(MAX_DESCRIPTOR_SET_COUNT)
        .pool_sizes(&pool_sizes);

    match unsafe { device.create_descriptor_pool(&create_info, None) } {
        Ok(pool) => pool,
        Err(err) => fatal!("failed to create descriptor pool: {err}"),
    }
}

/// Layouts, pool, and pipeline layout shared by the compute and RT paths.
fn create_pipeline_descriptors(
    device: &Device,
    reflection: &ShaderReflection,
    stage_flags: vk::ShaderStageFlags,
) -> (
    Vec<vk::DescriptorSetLayout>,
    Vec<Vec<vk::DescriptorSetLayoutBinding<'static>>>,
    vk::DescriptorPool,
    vk::PipelineLayout,
) {
    let (set_layouts, layout_bindings) =
        create_descriptor_set_layouts(&device.device, reflection, stage_flags);
    let descriptor_pool = create_descriptor_pool(&device.device, reflection);
    let pipeline_layout = create_pipeline_layout(
        &device.device,
        &set_layouts,
        reflection.push_constants_size,
        stage_flags,
    );

    (set_layouts, layout_bindings, descriptor_pool, pipeline_layout)
}

pub(crate) fn destroy_pipeline_record(device: &mut Device, record: PipelineRecord) {
    unsafe {
        device.device.destroy_descriptor_pool(record.descriptor_pool, None);
        device.device.destroy_pipeline(record.pipeline, None);
        device.device.destroy_pipeline_layout(record.layout, None);
        for layout in record.descriptor_set_layouts {
            device.device.destroy_descriptor_set_layout(layout, None);
        }
    }
}

impl Context {
    pub fn create_compute_pipeline(&mut self, create_info: &ComputePipelineCreateInfo) -> Pipeline {
        let (reflection, module) = {
            let shader = resolve!(self, shaders, create_info.shader);
            (shader.reflection.clone(), shader.module)
        };

        let (set_layouts, layout_bindings, descriptor_pool, pipeline_layout) =
            create_pipeline_descriptors(
                &self.device,
                &reflection,
                vk::ShaderStageFlags::COMPUTE,
            );

        let stage_create_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(SHADER_ENTRY_POINT);

        let pipeline_create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_create_info)
            .layout(pipeline_layout);

        let pipeline = match unsafe {
            self.device.device.create_compute_pipelines(
                self.device.pipeline_cache,
                &[pipeline_create_info],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => fatal!("failed to create compute pipeline: {err}"),
        };

        if let Some(name) = create_info.debug_name {
            self.set_object_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(pipeline), name);
        }

        let handle = self.pipelines.allocate();
        self.pipelines.insert(
            handle,
            PipelineRecord {
                pipeline,
                layout: pipeline_layout,
                descriptor_pool,
                descriptor_set_layouts: set_layouts,
                layout_bindings,
                kind: PipelineKind::Compute,
            },
        );

        Pipeline(handle)
    }

    pub fn create_rt_pipeline(&mut self, create_info: &RtPipelineCreateInfo) -> Pipeline {
        let miss_count = create_info.miss_shaders.len() as u32;
        let hit_group_count = create_info.hit_groups.len() as u32;
        let group_count = 1 + miss_count + hit_group_count;

        // Gather groups: one ray-gen, then miss shaders, then triangle hit
        // groups whose closest-hit/any-hit slots are stage indices or UNUSED.
        let mut groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> = (0..group_count)
            .map(|i| {
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(i)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR)
            })
            .collect();

        let hit_stage_and_group_offset = 1 + miss_count;
        let mut hit_shader_stage_index = hit_stage_and_group_offset;
        for (i, hit_group) in create_info.hit_groups.iter().enumerate() {
            let group = &mut groups[(hit_stage_and_group_offset + i as u32) as usize];
            group.ty = vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP;
            group.general_shader = vk::SHADER_UNUSED_KHR;

            if !hit_group.closest_hit_shader.is_null() {
                group.closest_hit_shader = hit_shader_stage_index;
                hit_shader_stage_index += 1;
            }
            if !hit_group.any_hit_shader.is_null() {
                group.any_hit_shader = hit_shader_stage_index;
                hit_shader_stage_index += 1;
            }
        }

        // Descriptor backing and pipeline layout come from the ray-gen
        // shader; all stages must agree on the layout.
        let rgen_reflection = {
            let shader = resolve!(self, shaders, create_info.rgen_shader);
            shader.reflection.clone()
        };

        let (set_layouts, layout_bindings, descriptor_pool, pipeline_layout) =
            create_pipeline_descriptors(&self.device, &rgen_reflection, RT_PIPELINE_STAGE_FLAGS);

        // Collect pipeline libraries OR stage create infos.
        let pipeline_libraries = self.device.internal_features.pipeline_libraries;
        let mut libraries: Vec<vk::Pipeline> = Vec::new();
        let mut stage_modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)> = Vec::new();

        let mut push_shader = |ctx: &Context, shader: Shader| {
            let record = resolve!(ctx, shaders, shader);
            if pipeline_libraries {
                let library = record
                    .pipeline_library
                    .as_ref()
                    .unwrap_or_else(|| fatal!("shader has no pipeline library"));
                libraries.push(library.pipeline);
            } else {
                assert_ne!(record.module, vk::ShaderModule::null());
                stage_modules
                    .push((super::shader_stage_flags(record.stage_flags), record.module));
            }
        };

        push_shader(self, create_info.rgen_shader);
        for miss_shader in create_info.miss_shaders {
            push_shader(self, *miss_shader);
        }
        for hit_group in create_info.hit_groups {
            if !hit_group.closest_hit_shader.is_null() {
                push_shader(self, hit_group.closest_hit_shader);
            }
            if !hit_group.any_hit_shader.is_null() {
                push_shader(self, hit_group.any_hit_shader);
            }
        }

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_modules
            .iter()
            .map(|(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(*module)
                    .name(SHADER_ENTRY_POINT)
            })
            .collect();

        assert!(create_info.max_ray_payload_size > 0);
        assert!(create_info.max_ray_hit_attribute_size > 0);

        let library_create_info =
            vk::PipelineLibraryCreateInfoKHR::default().libraries(&libraries);
        let interface_create_info = vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(create_info.max_ray_payload_size)
            .max_pipeline_ray_hit_attribute_size(create_info.max_ray_hit_attribute_size);

        let mut pipeline_create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(pipeline_layout);
        if pipeline_libraries {
            pipeline_create_info = pipeline_create_info
                .library_info(&library_create_info)
                .library_interface(&interface_create_info);
        }

        let pipeline = match unsafe {
            self.device.ray_tracing_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                self.device.pipeline_cache,
                &[pipeline_create_info],
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err(_) => fatal!("failed to create RT pipeline"),
        };

        let (sbt, sbt_rgen, sbt_miss, sbt_hit) =
            self.create_rt_pipeline_sbt(pipeline, group_count, miss_count, hit_group_count);

        if let Some(name) = create_info.debug_name {
            self.set_object_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(pipeline), name);
        }

        let handle = self.pipelines.allocate();
        self.pipelines.insert(
            handle,
            PipelineRecord {
                pipeline,
                layout: pipeline_layout,
                descriptor_pool,
                descriptor_set_layouts: set_layouts,
                layout_bindings,
                kind: PipelineKind::RayTracing {
                    sbt_rgen,
                    sbt_miss,
                    sbt_hit,
                    sbt,
                },
            },
        );

        Pipeline(handle)
    }

    /// Builds the SBT in host memory and uploads it through an internal
    /// one-shot submit.
    fn create_rt_pipeline_sbt(
        &mut self,
        pipeline: vk::Pipeline,
        group_count: u32,
        miss_count: u32,
        hit_group_count: u32,
    ) -> (
        Buffer,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
    ) {
        let properties = &self.device.internal_properties;
        let handle_size = properties.shader_group_handle_size;

        let layout = compute_sbt_layout(
            handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            miss_count,
            hit_group_count,
        );

        let handle_data = match unsafe {
            self.device.ray_tracing_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (handle_size * group_count) as usize,
            )
        } {
            Ok(data) => data,
            Err(err) => fatal!("failed to fetch SBT handles: {err}"),
        };

        let sbt_create_info = BufferCreateInfo {
            usage: BufferUsage::TRANSFER_DST
                | BufferUsage::SHADER_DEVICE_ADDRESS
                | BufferUsage::SHADER_BINDING_TABLE,
            memory_properties: MemoryProperties::DEVICE_LOCAL,
            size: layout.buffer_size,
            debug_name: Some("[SBT]"),
            alignment: properties.shader_group_base_alignment,
        };

        let sbt = match self.create_buffer(&sbt_create_info) {
            Ok(buffer) => buffer,
            Err(err) => fatal!("failed to create SBT buffer: {err}"),
        };

        let sbt_address = self.get_buffer_gpu_address(sbt);
        let regions = [
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(sbt_address)
                .stride(layout.rgen.stride)
                .size(layout.rgen.size),
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(sbt_address + layout.miss.offset)
                .stride(layout.miss.stride)
                .size(layout.miss.size),
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(sbt_address + layout.hit.offset)
                .stride(layout.hit.stride)
                .size(layout.hit.size),
        ];

        let mut sbt_memory = vec![0u8; layout.buffer_size as usize];
        let mut handle_index = 0usize;
        let mut copy_handle = |dst_offset: usize, handle_index: usize| {
            let src = &handle_data
                [handle_index * handle_size as usize..(handle_index + 1) * handle_size as usize];
            sbt_memory[dst_offset..dst_offset + handle_size as usize].copy_from_slice(src);
        };

        copy_handle(0, handle_index);
        handle_index += 1;
        for i in 0..miss_count as usize {
            copy_handle(
                layout.miss.offset as usize + i * layout.miss.stride as usize,
                handle_index,
            );
            handle_index += 1;
        }
        for i in 0..hit_group_count as usize {
            copy_handle(
                layout.hit.offset as usize + i * layout.hit.stride as usize,
                handle_index,
            );
            handle_index += 1;
        }

        if self.copy_memory_to_buffer(&sbt_memory, sbt).is_err() {
            fatal!("failed to copy to SBT buffer");
        }

        (sbt, regions[0], regions[1], regions[2])
    }

    /// Uploads host memory through an internal one-shot command buffer and a
    /// synchronous semaphore wait.
    pub(crate) fn copy_memory_to_buffer(
        &mut self,
        data: &[u8],
        dst: Buffer,
    ) -> crate::GpuResult<()> {
        use crate::error::{recoverable, GpuError};
        use crate::limits::MAX_BUFFER_UPDATE_SIZE;

        if data.len() as u64 > MAX_BUFFER_UPDATE_SIZE {
            recoverable!(
                GpuError::CreationFailed("buffer update"),
                "buffer size too large!"
            );
        }

        let command_buffer = self.create_command_buffer()?;
        self.begin_command_buffer(command_buffer)?;
        self.cmd_update_buffer(command_buffer, data, dst, 0);
        self.end_command_buffer(command_buffer);

        let semaphore = self.create_semaphore(0)?;
        self.submit_command_buffer(
            command_buffer,
            &[SignalSemaphoreInfo { semaphore, value: 1 }],
            &[],
        );
        let wait_result =
            self.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], u64::MAX);

        self.destroy_semaphore(semaphore);
        self.destroy_command_buffer(command_buffer);

        wait_result
    }

    pub fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        let Some(record) = self.pipelines.free(pipeline.0) else {
            fatal!("invalid handle!");
        };

        if let PipelineKind::RayTracing { sbt, .. } = &record.kind {
            let sbt = *sbt;
            self.destroy_buffer(sbt);
        }

        destroy_pipeline_record(&mut self.device, record);
    }
}
