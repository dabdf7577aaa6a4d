//! Shader creation: SPIR-V is cross-compiled to MSL and compiled into a
//! per-shader library.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal as mtl;
use objc2_metal::{MTLDevice, MTLLibrary};
use rayon::prelude::*;

use super::{resolve, Context};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::reflection::{reflect_shader, ShaderReflection};
use crate::{Shader, ShaderCreateInfo, ShaderStage};

const MSL_VERSION: (u8, u8) = (3, 2);

pub(crate) struct ShaderRecord {
    pub library: Retained<ProtocolObject<dyn mtl::MTLLibrary>>,
    pub reflection: ShaderReflection,
    pub stage_flags: ShaderStage,
    pub entry_point: Retained<NSString>,
}

/// Cross-compiles a SPIR-V module and returns the MSL source plus the entry
/// point's translated name.
fn cross_compile(spirv: &[u8]) -> GpuResult<(String, String)> {
    let module = match naga::front::spv::parse_u8_slice(
        spirv,
        &naga::front::spv::Options::default(),
    ) {
        Ok(module) => module,
        Err(err) => recoverable!(
            GpuError::ReflectionFailed("SPIR-V front end"),
            "failed to parse SPIR-V: {err}"
        ),
    };

    let info = match naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    {
        Ok(info) => info,
        Err(err) => recoverable!(
            GpuError::ReflectionFailed("SPIR-V validation"),
            "failed to validate module: {err}"
        ),
    };

    let options = naga::back::msl::Options {
        lang_version: MSL_VERSION,
        // Bindings are assigned at encode time through the argument table.
        fake_missing_bindings: true,
        ..Default::default()
    };

    let (source, translation_info) = match naga::back::msl::write_string(
        &module,
        &info,
        &options,
        &naga::back::msl::PipelineOptions::default(),
    ) {
        Ok(result) => result,
        Err(err) => fatal!("failed to cross-compile shader to MSL: {err}"),
    };

    let entry_point = match translation_info.entry_point_names.first() {
        Some(Ok(name)) => name.clone(),
        _ => fatal!("cross-compiled module has no entry point"),
    };

    if std::env::var("GTL_DUMP_MSL").is_ok() {
        log::info!("cross-compiled MSL source:\n{source}");
    }

    Ok((source, entry_point))
}

pub(crate) fn compile_shader(
    device: &ProtocolObject<dyn mtl::MTLDevice>,
    create_info: &ShaderCreateInfo,
) -> GpuResult<ShaderRecord> {
    let reflection = reflect_shader(create_info.source)?;

    #[cfg(debug_assertions)]
    if create_info.stage_flags != ShaderStage::COMPUTE {
        debug_assert!(reflection.max_ray_payload_size <= create_info.max_ray_payload_size);
        debug_assert!(
            reflection.max_ray_hit_attribute_size <= create_info.max_ray_hit_attribute_size
        );
    }

    let (source, entry_point) = cross_compile(create_info.source)?;

    let library = match unsafe {
        device.newLibraryWithSource_options_error(&NSString::from_str(&source), None)
    } {
        Ok(library) => library,
        Err(err) => fatal!("failed to compile MSL library: {err}"),
    };

    if let Some(name) = create_info.debug_name {
        unsafe { library.setLabel(Some(&NSString::from_str(name))) };
    }

    Ok(ShaderRecord {
        library,
        reflection,
        stage_flags: create_info.stage_flags,
        entry_point: NSString::from_str(&entry_point),
    })
}

impl Context {
    pub fn create_shader(&mut self, create_info: &ShaderCreateInfo) -> GpuResult<Shader> {
        let record = compile_shader(&self.device.device, create_info)?;

        let handle = self.shaders.allocate();
        self.shaders.insert(handle, record);

        Ok(Shader(handle))
    }

    /// Parallel compilation; slots are allocated up front and the whole
    /// batch is freed if any shader fails.
    pub fn create_shaders_parallel(
        &mut self,
        create_infos: &[ShaderCreateInfo],
    ) -> GpuResult<Vec<Shader>> {
        let handles: Vec<u64> =
            create_infos.iter().map(|_| self.shaders.allocate()).collect();

        let device = &self.device.device;
        let mut results: Vec<GpuResult<ShaderRecord>> = create_infos
            .par_iter()
            .map(|create_info| compile_shader(device, create_info))
            .collect();

        if results.iter().any(|result| result.is_err()) {
            let mut first_error = None;
            for (handle, result) in handles.iter().zip(results.drain(..)) {
                if let Err(err) = result {
                    first_error.get_or_insert(err);
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
        if self.shaders.free(shader.0).is_none() {
            fatal!("invalid handle!");
        }
    }

    pub fn shader_reflection(&self, shader: Shader) -> &ShaderReflection {
        let record = resolve!(self, shaders, shader);
        &record.reflection
    }
}
