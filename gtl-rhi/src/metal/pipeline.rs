//! Compute and ray-tracing pipelines. RT dispatch goes through one function
//! table group per distinct ray payload; there is no SBT on this backend.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSArray;
use objc2_metal as mtl;
use objc2_metal::{
    MTLComputePipelineState, MTLDevice, MTLIntersectionFunctionTable, MTLLibrary,
    MTLVisibleFunctionTable,
};

use super::{resolve, Context};
use crate::error::fatal;
use crate::limits::MAX_DESCRIPTOR_SET_COUNT;
use crate::reflection::ShaderReflection;
use crate::{ComputePipelineCreateInfo, Pipeline, RtPipelineCreateInfo, Shader};

/// Argument-table slot where the per-payload function table triples start.
pub(crate) const RT_FUNCTION_TABLES_BUFFER_INDEX: usize = 24;

/// Intersection + miss + closest-hit tables for one ray payload.
pub(crate) struct RtFunctionTables {
    pub intersection_table: Retained<ProtocolObject<dyn mtl::MTLIntersectionFunctionTable>>,
    pub miss_table: Retained<ProtocolObject<dyn mtl::MTLVisibleFunctionTable>>,
    pub closest_hit_table: Retained<ProtocolObject<dyn mtl::MTLVisibleFunctionTable>>,
}

pub(crate) struct PipelineRecord {
    pub state: Retained<ProtocolObject<dyn mtl::MTLComputePipelineState>>,
    pub threads_per_threadgroup: mtl::MTLSize,
    pub argument_table: Retained<ProtocolObject<dyn mtl::MTL4ArgumentTable>>,
    pub reflection: ShaderReflection,
    /// One entry per distinct ray payload; empty for compute pipelines.
    pub function_tables: Vec<RtFunctionTables>,
}

fn create_argument_table(
    device: &super::Device,
    reflection: &ShaderReflection,
    function_table_count: usize,
) -> Retained<ProtocolObject<dyn mtl::MTL4ArgumentTable>> {
    if reflection.descriptor_sets.len() > MAX_DESCRIPTOR_SET_COUNT as usize {
        fatal!("max descriptor set count exceeded");
    }

    // One argument buffer per descriptor set, plus the function table slots.
    let buffer_count = RT_FUNCTION_TABLES_BUFFER_INDEX + function_table_count * 3;

    let descriptor = unsafe { mtl::MTL4ArgumentTableDescriptor::new() };
    unsafe {
        descriptor.setMaxBufferBindCount(buffer_count);
        descriptor.setMaxTextureBindCount(0);
        descriptor.setMaxSamplerStateBindCount(0);
    }

    match unsafe { device.device.newArgumentTableWithDescriptor_error(&descriptor) } {
        Ok(table) => table,
        Err(err) => fatal!("failed to create argument table: {err}"),
    }
}

fn pipeline_state_for_function(
    device: &super::Device,
    library: &ProtocolObject<dyn mtl::MTLLibrary>,
    entry_point: &objc2_foundation::NSString,
    linked_functions: Option<&NSArray<ProtocolObject<dyn mtl::MTLFunction>>>,
) -> Retained<ProtocolObject<dyn mtl::MTLComputePipelineState>> {
    let Some(function) = (unsafe { library.newFunctionWithName(entry_point) }) else {
        fatal!("entry point not found in library");
    };

    let descriptor = unsafe { mtl::MTLComputePipelineDescriptor::new() };
    unsafe {
        descriptor.setComputeFunction(Some(&function));

        if let Some(functions) = linked_functions {
            let linked = mtl::MTLLinkedFunctions::new();
            linked.setFunctions(Some(functions));
            descriptor.setLinkedFunctions(Some(&linked));
        }
    }

    match unsafe {
        device.device.newComputePipelineStateWithDescriptor_options_reflection_error(
            &descriptor,
            mtl::MTLPipelineOption::empty(),
            None,
        )
    } {
        Ok(state) => state,
        Err(err) => fatal!("failed to create compute pipeline state: {err}"),
    }
}

fn threads_per_threadgroup(reflection: &ShaderReflection) -> mtl::MTLSize {
    mtl::MTLSize {
        width: reflection.workgroup_size[0].max(1) as usize,
        height: reflection.workgroup_size[1].max(1) as usize,
        depth: reflection.workgroup_size[2].max(1) as usize,
    }
}

impl Context {
    pub fn create_compute_pipeline(&mut self, create_info: &ComputePipelineCreateInfo) -> Pipeline {
        let (state, reflection) = {
            let shader = resolve!(self, shaders, create_info.shader);
            (
                pipeline_state_for_function(
                    &self.device,
                    &shader.library,
                    &shader.entry_point,
                    None,
                ),
                shader.reflection.clone(),
            )
        };

        let argument_table = create_argument_table(&self.device, &reflection, 0);
        let threads = threads_per_threadgroup(&reflection);

        let handle = self.pipelines.allocate();
        self.pipelines.insert(
            handle,
            PipelineRecord {
                state,
                threads_per_threadgroup: threads,
                argument_table,
                reflection,
                function_tables: Vec::new(),
            },
        );

        Pipeline(handle)
    }

    pub fn create_rt_pipeline(&mut self, create_info: &RtPipelineCreateInfo) -> Pipeline {
        let rgen_reflection = {
            let shader = resolve!(self, shaders, create_info.rgen_shader);
            shader.reflection.clone()
        };

        // All miss and hit-group functions become visible functions linked
        // into the ray-gen kernel.
        let mut linked: Vec<Retained<ProtocolObject<dyn mtl::MTLFunction>>> = Vec::new();
        let mut miss_functions: Vec<Retained<ProtocolObject<dyn mtl::MTLFunction>>> = Vec::new();
        let mut hit_functions: Vec<Retained<ProtocolObject<dyn mtl::MTLFunction>>> = Vec::new();

        let mut collect_function = |ctx: &Context, shader: Shader| {
            let record = resolve!(ctx, shaders, shader);
            let Some(function) =
                (unsafe { record.library.newFunctionWithName(&record.entry_point) })
            else {
                fatal!("entry point not found in library");
            };
            function
        };

        for miss_shader in create_info.miss_shaders {
            let function = collect_function(self, *miss_shader);
            linked.push(function.clone());
            miss_functions.push(function);
        }
        for hit_group in create_info.hit_groups {
            if !hit_group.closest_hit_shader.is_null() {
                let function = collect_function(self, hit_group.closest_hit_shader);
                linked.push(function.clone());
                hit_functions.push(function);
            }
            if !hit_group.any_hit_shader.is_null() {
                let function = collect_function(self, hit_group.any_hit_shader);
                linked.push(function.clone());
                hit_functions.push(function);
            }
        }

        let linked_array = NSArray::from_retained_slice(&linked);

        let state = {
            let shader = resolve!(self, shaders, create_info.rgen_shader);
            pipeline_state_for_function(
                &self.device,
                &shader.library,
                &shader.entry_point,
                Some(&linked_array),
            )
        };

        // One (intersection, miss, closest-hit) triple per distinct payload;
        // each table takes every payload-stride-th function starting at the
        // payload's index.
        let payload_count = rgen_reflection.payload_count.max(1) as usize;
        let mut function_tables = Vec::with_capacity(payload_count);

        for payload in 0..payload_count {
            let intersection_descriptor =
                unsafe { mtl::MTLIntersectionFunctionTableDescriptor::new() };
            unsafe {
                intersection_descriptor
                    .setFunctionCount(hit_functions.len().div_ceil(payload_count).max(1));
            }
            let Some(intersection_table) = (unsafe {
                state.newIntersectionFunctionTableWithDescriptor(&intersection_descriptor)
            }) else {
                fatal!("failed to create intersection function table");
            };

            let miss_descriptor = unsafe { mtl::MTLVisibleFunctionTableDescriptor::new() };
            unsafe {
                miss_descriptor
                    .setFunctionCount(miss_functions.len().div_ceil(payload_count).max(1));
            }
            let Some(miss_table) =
                (unsafe { state.newVisibleFunctionTableWithDescriptor(&miss_descriptor) })
            else {
                fatal!("failed to create miss function table");
            };

            let hit_descriptor = unsafe { mtl::MTLVisibleFunctionTableDescriptor::new() };
            unsafe {
                hit_descriptor
                    .setFunctionCount(hit_functions.len().div_ceil(payload_count).max(1));
            }
            let Some(closest_hit_table) =
                (unsafe { state.newVisibleFunctionTableWithDescriptor(&hit_descriptor) })
            else {
                fatal!("failed to create closest-hit function table");
            };

            for (slot, function) in miss_functions
                .iter()
                .skip(payload)
                .step_by(payload_count)
                .enumerate()
            {
                let Some(handle) = (unsafe { state.functionHandleWithFunction(function) }) else {
                    fatal!("missing function handle");
                };
                unsafe { miss_table.setFunction_atIndex(Some(&handle), slot) };
            }
            for (slot, function) in hit_functions
                .iter()
                .skip(payload)
                .step_by(payload_count)
                .enumerate()
            {
                let Some(handle) = (unsafe { state.functionHandleWithFunction(function) }) else {
                    fatal!("missing function handle");
                };
                unsafe { closest_hit_table.setFunction_atIndex(Some(&handle), slot) };
                unsafe { intersection_table.setFunction_atIndex(Some(&handle), slot) };
            }

            function_tables.push(RtFunctionTables {
                intersection_table,
                miss_table,
                closest_hit_table,
            });
        }

        let argument_table =
            create_argument_table(&self.device, &rgen_reflection, function_tables.len());
        let threads = threads_per_threadgroup(&rgen_reflection);

        let handle = self.pipelines.allocate();
        self.pipelines.insert(
            handle,
            PipelineRecord {
                state,
                threads_per_threadgroup: threads,
                argument_table,
                reflection: rgen_reflection,
                function_tables,
            },
        );

        Pipeline(handle)
    }

    pub fn destroy_pipeline(&mut self, pipeline: Pipeline) {
        if self.pipelines.free(pipeline.0).is_none() {
            fatal!("invalid handle!");
        }
    }
}
