//! Shader modules and the per-shader RT pipeline libraries.

use ash::vk;
use rayon::prelude::*;

use super::device::Device;
use super::{pipeline, resolve, Context, RT_PIPELINE_STAGE_FLAGS, SHADER_ENTRY_POINT};
use crate::error::{fatal, GpuResult};
use crate::reflection::{reflect_shader, ShaderReflection};
use crate::{Shader, ShaderCreateInfo, ShaderStage};

/// Single-stage RT pipeline compiled with the LIBRARY flag, linked into full
/// RT pipelines later. Only built when the device supports pipeline-library
/// group handles and the stage is not compute.
pub(crate) struct PipelineLibrary {
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

pub(crate) struct ShaderRecord {
    /// Null when the RT pipeline library carries the compiled code instead.
    pub module: vk::ShaderModule,
    pub reflection: ShaderReflection,
    pub stage_flags: ShaderStage,
    pub pipeline_library: Option<PipelineLibrary>,
}

/// Everything shader compilation touches; shareable across worker threads.
pub(crate) struct ShaderCompiler<'a> {
    pub device: &'a ash::Device,
    pub ray_tracing_pipeline: &'a ash::khr::ray_tracing_pipeline::Device,
    pub pipeline_cache: vk::PipelineCache,
    pub pipeline_libraries: bool,
}

impl<'a> ShaderCompiler<'a> {
    pub fn from_device(device: &'a Device) -> Self {
        Self {
            device: &device.device,
            ray_tracing_pipeline: &device.ray_tracing_pipeline,
            pipeline_cache: device.pipeline_cache,
            pipeline_libraries: device.internal_features.pipeline_libraries,
        }
    }
}

fn create_rt_pipeline_library(
    compiler: &ShaderCompiler,
    spirv: &[u8],
    reflection: &ShaderReflection,
    stage: vk::ShaderStageFlags,
    max_ray_payload_size: u32,
    max_ray_hit_attribute_size: u32,
) -> PipelineLibrary {
    let (descriptor_set_layouts, _) = pipeline::create_descriptor_set_layouts(
        compiler.device,
        reflection,
        RT_PIPELINE_STAGE_FLAGS,
    );

    let layout = pipeline::create_pipeline_layout(
        compiler.device,
        &descriptor_set_layouts,
        reflection.push_constants_size,
        RT_PIPELINE_STAGE_FLAGS,
    );

    // maintenance5 lets the module create info ride the stage chain.
    let words = spirv_words(spirv);
    let mut module_create_info = vk::ShaderModuleCreateInfo::default().code(&words);

    let stage_create_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(stage)
        .name(SHADER_ENTRY_POINT)
        .push_next(&mut module_create_info);

    let interface_create_info = vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
        .max_pipeline_ray_payload_size(max_ray_payload_size)
        .max_pipeline_ray_hit_attribute_size(max_ray_hit_attribute_size);

    let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .flags(vk::PipelineCreateFlags::LIBRARY_KHR)
        .stages(std::slice::from_ref(&stage_create_info))
        .max_pipeline_ray_recursion_depth(1)
        .library_interface(&interface_create_info)
        .layout(layout);

    let pipeline = match unsafe {
        compiler.ray_tracing_pipeline.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            compiler.pipeline_cache,
            &[create_info],
            None,
        )
    } {
        Ok(pipelines) => pipelines[0],
        Err(_) => fatal!("failed to create RT pipeline library"),
    };

    PipelineLibrary {
        descriptor_set_layouts,
        layout,
        pipeline,
    }
}

/// SPIR-V words of a byte span; borrows when the span is already aligned.
fn spirv_words(spirv: &[u8]) -> std::borrow::Cow<'_, [u32]> {
    debug_assert_eq!(spirv.len() % 4, 0);
    if spirv.as_ptr().align_offset(std::mem::align_of::<u32>()) == 0 {
        std::borrow::Cow::Borrowed(unsafe {
            std::slice::from_raw_parts(spirv.as_ptr().cast(), spirv.len() / 4)
        })
    } else {
        std::borrow::Cow::Owned(
            spirv
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

pub(crate) fn compile_shader(
    compiler: &ShaderCompiler,
    create_info: &ShaderCreateInfo,
) -> GpuResult<ShaderRecord> {
    let reflection = reflect_shader(create_info.source)?;

    #[cfg(debug_assertions)]
    if create_info.stage_flags != ShaderStage::COMPUTE {
        debug_assert!(create_info.max_ray_payload_size > 0);
        debug_assert!(create_info.max_ray_hit_attribute_size > 0);
        debug_assert!(reflection.max_ray_payload_size <= create_info.max_ray_payload_size);
        debug_assert!(
            reflection.max_ray_hit_attribute_size <= create_info.max_ray_hit_attribute_size
        );
    }

    if !compiler.pipeline_libraries || create_info.stage_flags == ShaderStage::COMPUTE {
        let words = spirv_words(create_info.source);
        let module_create_info = vk::ShaderModuleCreateInfo::default().code(&words);

        let module = match unsafe {
            compiler.device.create_shader_module(&module_create_info, None)
        } {
            Ok(module) => module,
            Err(err) => fatal!("failed to create shader module: {err}"),
        };

        Ok(ShaderRecord {
            module,
            reflection,
            stage_flags: create_info.stage_flags,
            pipeline_library: None,
        })
    } else {
        let library = create_rt_pipeline_library(
            compiler,
            create_info.source,
            &reflection,
            super::shader_stage_flags(create_info.stage_flags),
            create_info.max_ray_payload_size,
            create_info.max_ray_hit_attribute_size,
        );

        Ok(ShaderRecord {
            module: vk::ShaderModule::null(),
            reflection,
            stage_flags: create_info.stage_flags,
            pipeline_library: Some(library),
        })
    }
}

pub(crate) fn destroy_shader_record(device: &Device, record: ShaderRecord) {
    if let Some(library) = record.pipeline_library {
        unsafe {
            device.device.destroy_pipeline(library.pipeline, None);
            device.device.destroy_pipeline_layout(library.layout, None);
            for layout in library.descriptor_set_layouts {
                device.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    if record.module != vk::ShaderModule::null() {
        unsafe { device.device.destroy_shader_module(record.module, None) };
    }
}

impl Context {
    pub fn create_shader(&mut self, create_info: &ShaderCreateInfo) -> GpuResult<Shader> {
        let compiler = ShaderCompiler::from_device(&self.device);
        let record = compile_shader(&compiler, create_info)?;

        if let Some(name) = create_info.debug_name {
            if record.module != vk::ShaderModule::null() {
                self.set_object_name(
                    vk::ObjectType::SHADER_MODULE,
                    vk::Handle::as_raw(record.module),
                    name,
                );
            }
        }

        let handle = self.shaders.allocate();
        self.shaders.insert(handle, record);

        Ok(Shader(handle))
    }

    /// Compiles a batch of shaders on a worker pool. Slots are allocated up
    /// front on the calling thread; any per-shader failure frees the whole
    /// batch.
    pub fn create_shaders_parallel(
        &mut self,
        create_infos: &[ShaderCreateInfo],
    ) -> GpuResult<Vec<Shader>> {
        let handles: Vec<u64> =
            create_infos.iter().map(|_| self.shaders.allocate()).collect();

        let compiler = ShaderCompiler::from_device(&self.device);
        let mut results: Vec<GpuResult<ShaderRecord>> = create_infos
            .par_iter()
            .map(|create_info| compile_shader(&compiler, create_info))
            .collect();

        if results.iter().any(|result| result.is_err()) {
            let mut first_error = None;
            for (handle, result) in handles.iter().zip(results.drain(..)) {
                match result {
                    Ok(record) => destroy_shader_record(&self.device, record),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
                self.shaders.free(*handle);
            }
            return Err(first_error.expect("at least one failure"));
        }

        Ok(handles
            .into_iter()
            .zip(results)
            .map(|(handle, result)| {
                self.shaders.insert(handle, result.expect("checked above"));
                Shader(handle)
            })
            .collect())
    }

    pub fn destroy_shader(&mut self, shader: Shader) {
        let Some(record) = self.shaders.free(shader.0) else {
            fatal!("invalid handle!");
        };
        destroy_shader_record(&self.device, record);
    }

    /// Reflected metadata of a live shader.
    pub fn shader_reflection(&self, shader: Shader) -> &ShaderReflection {
        let record = resolve!(self, shaders, shader);
        &record.reflection
    }
}
