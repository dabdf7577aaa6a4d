//! Command recording over MTL4 command buffers. Each recorded command opens
//! its own compute encoder; bound pipeline and bind-set state is re-applied
//! per encoder.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_metal as mtl;
use objc2_metal::{
    MTL4ArgumentTable, MTL4CommandAllocator, MTL4CommandBuffer, MTL4CommandEncoder,
    MTL4ComputeCommandEncoder, MTLBuffer, MTLDevice, MTLResidencySet, MTLResource,
};

use super::device::create_residency_set;
use super::pipeline::RT_FUNCTION_TABLES_BUFFER_INDEX;
use super::{resolve, resolve_mut, Context};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::limits::{MAX_PUSH_CONSTANTS_SIZE, WHOLE_SIZE};
use crate::{
    BindSet, Buffer, BufferImageCopyDesc, CommandBuffer, Image, ImageBinding, ImageFormat,
    Pipeline, PipelineBarrier, Shader,
};

/// Argument-table slot of the push-constant buffer.
const PUSH_CONSTANTS_BUFFER_INDEX: usize = 23;

pub(crate) struct CommandBufferRecord {
    pub command_buffer: Retained<ProtocolObject<dyn mtl::MTL4CommandBuffer>>,
    pub command_allocator: Retained<ProtocolObject<dyn mtl::MTL4CommandAllocator>>,
    /// Accumulates transient references made during recording.
    pub aux_residency_set: Retained<ProtocolObject<dyn mtl::MTLResidencySet>>,
    pub residency_sets: Vec<Retained<ProtocolObject<dyn mtl::MTLResidencySet>>>,
    pub bound_pipeline: Option<Pipeline>,
    pub bound_bind_sets: Vec<BindSet>,
    pub push_constants: Retained<ProtocolObject<dyn mtl::MTLBuffer>>,
}

fn image_format_bytes_per_pixel(format: ImageFormat) -> usize {
    match format {
        ImageFormat::R8g8b8a8Unorm => 4,
        ImageFormat::R16g16b16a16Sfloat => 8,
        ImageFormat::R32Sfloat => 4,
        _ => fatal!("unsupported image format"),
    }
}

impl Context {
    pub fn create_command_buffer(&mut self) -> GpuResult<CommandBuffer> {
        let device = &self.device.device;

        let Some(command_buffer) = (unsafe { device.newCommandBuffer() }) else {
            recoverable!(
                GpuError::CreationFailed("command buffer"),
                "failed to create command buffer"
            );
        };
        let Some(command_allocator) = (unsafe { device.newCommandAllocator() }) else {
            recoverable!(
                GpuError::CreationFailed("command buffer"),
                "failed to create command allocator"
            );
        };
        let aux_residency_set = create_residency_set(device, 64)?;
        let Some(push_constants) = (unsafe {
            device.newBufferWithLength_options(
                MAX_PUSH_CONSTANTS_SIZE as usize,
                mtl::MTLResourceOptions::MTLResourceStorageModeShared,
            )
        }) else {
            recoverable!(
                GpuError::CreationFailed("command buffer"),
                "failed to create push constant buffer"
            );
        };

        let handle = self.command_buffers.allocate();
        self.command_buffers.insert(
            handle,
            CommandBufferRecord {
                command_buffer,
                command_allocator,
                aux_residency_set,
                residency_sets: Vec::new(),
                bound_pipeline: None,
                bound_bind_sets: Vec::new(),
                push_constants,
            },
        );

        Ok(CommandBuffer(handle))
    }

    pub fn destroy_command_buffer(&mut self, command_buffer: CommandBuffer) {
        if self.command_buffers.free(command_buffer.0).is_none() {
            fatal!("invalid handle!");
        }
    }

    pub fn begin_command_buffer(&mut self, command_buffer: CommandBuffer) -> GpuResult<()> {
        // Recording starts from a clean transient-reference set.
        let aux_residency_set = create_residency_set(&self.device.device, 64)?;

        let record = resolve_mut!(self, command_buffers, command_buffer);
        record.aux_residency_set = aux_residency_set;

        unsafe { record.command_allocator.reset() };
        unsafe {
            record
                .command_buffer
                .beginCommandBufferWithAllocator(&record.command_allocator);
            record.command_buffer.useResidencySet(&record.aux_residency_set);
        }
        record.residency_sets.clear();
        record.bound_pipeline = None;
        record.bound_bind_sets.clear();

        Ok(())
    }

    pub fn end_command_buffer(&mut self, command_buffer: CommandBuffer) {
        let record = resolve_mut!(self, command_buffers, command_buffer);
        unsafe {
            record.aux_residency_set.commit();
            record.command_buffer.endCommandBuffer();
        }
        record.bound_pipeline = None;
    }

    /// Records the bound state; the state is applied when the next encoder
    /// opens. For each dynamic-uniform buffer, the argument buffer is
    /// re-encoded with its base plus the matching dynamic offset.
    pub fn cmd_bind_pipeline(
        &mut self,
        command_buffer: CommandBuffer,
        pipeline: Pipeline,
        bind_sets: &[BindSet],
        dynamic_offsets: &[u32],
    ) {
        {
            let record = resolve!(self, pipelines, pipeline);
            if record.reflection.descriptor_sets.len() != bind_sets.len() {
                fatal!("descriptor set count mismatch");
            }
        }

        let mut offset_iter = dynamic_offsets.iter();
        for bind_set in bind_sets {
            let dynamic_buffers = {
                let record = resolve!(self, bind_sets, *bind_set);
                record.dynamic_buffers.clone()
            };
            for dynamic in &dynamic_buffers {
                let Some(offset) = offset_iter.next() else {
                    fatal!("missing dynamic offset");
                };
                let buffer = {
                    let record = resolve!(self, buffers, dynamic.buffer);
                    record.buffer.clone()
                };
                let record = resolve_mut!(self, bind_sets, *bind_set);
                unsafe {
                    record.argument_encoder.setBuffer_offset_atIndex(
                        Some(&buffer),
                        dynamic.offset + *offset as u64,
                        (dynamic.binding + dynamic.index) as usize,
                    );
                }
            }
        }

        let record = resolve_mut!(self, command_buffers, command_buffer);
        record.bound_pipeline = Some(pipeline);
        record.bound_bind_sets = bind_sets.to_vec();

        let bind_set_residency: Vec<_> = bind_sets.to_vec();
        for bind_set in bind_set_residency {
            let set = resolve!(self, bind_sets, bind_set).residency_set.clone();
            let record = resolve_mut!(self, command_buffers, command_buffer);
            unsafe { record.command_buffer.useResidencySet(&set) };
            record.residency_sets.push(set);
        }
    }

    /// Metal tracks image layouts itself; nothing to transition.
    pub fn cmd_transition_shader_image_layouts(
        &mut self,
        _command_buffer: CommandBuffer,
        _shader: Shader,
        _descriptor_set_index: u32,
        _images: &[ImageBinding],
    ) {
    }

    /// Opens a compute encoder with the currently bound pipeline state and
    /// argument table applied.
    fn begin_compute_encoder(
        &mut self,
        command_buffer: CommandBuffer,
    ) -> Retained<ProtocolObject<dyn mtl::MTL4ComputeCommandEncoder>> {
        let (mtl_command_buffer, bound_pipeline, bind_sets, push_constants) = {
            let record = resolve!(self, command_buffers, command_buffer);
            (
                record.command_buffer.clone(),
                record.bound_pipeline,
                record.bound_bind_sets.clone(),
                record.push_constants.clone(),
            )
        };

        let Some(encoder) = (unsafe { mtl_command_buffer.computeCommandEncoder() }) else {
            fatal!("failed to create compute encoder");
        };

        if let Some(pipeline) = bound_pipeline {
            let (state, argument_table, function_table_count) = {
                let record = resolve!(self, pipelines, pipeline);
                (
                    record.state.clone(),
                    record.argument_table.clone(),
                    record.function_tables.len(),
                )
            };

            unsafe {
                encoder.setComputePipelineState(&state);

                for (set_index, bind_set) in bind_sets.iter().enumerate() {
                    let record = resolve!(self, bind_sets, *bind_set);
                    argument_table.setAddress_atIndex(
                        record.argument_buffer.gpuAddress(),
                        set_index,
                    );
                }

                argument_table
                    .setAddress_atIndex(push_constants.gpuAddress(), PUSH_CONSTANTS_BUFFER_INDEX);

                if function_table_count > 0 {
                    let record = resolve!(self, pipelines, pipeline);
                    for (i, tables) in record.function_tables.iter().enumerate() {
                        let base = RT_FUNCTION_TABLES_BUFFER_INDEX + i * 3;
                        argument_table
                            .setResource_atBufferIndex(tables.intersection_table.gpuResourceID(), base);
                        argument_table
                            .setResource_atBufferIndex(tables.miss_table.gpuResourceID(), base + 1);
                        argument_table
                            .setResource_atBufferIndex(tables.closest_hit_table.gpuResourceID(), base + 2);
                    }
                }

                encoder.setArgumentTable(Some(&argument_table));
            }
        }

        encoder
    }

    /// Inline updates are unavailable on this backend; use a copy instead.
    pub fn cmd_update_buffer(
        &mut self,
        _command_buffer: CommandBuffer,
        _data: &[u8],
        _dst_buffer: Buffer,
        _dst_offset: u64,
    ) {
        fatal!("cmd_update_buffer is not supported on the Metal backend");
    }

    pub fn cmd_copy_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        src_buffer: Buffer,
        src_offset: u64,
        dst_buffer: Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        let (src, src_size) = {
            let record = resolve!(self, buffers, src_buffer);
            (record.buffer.clone(), record.size)
        };
        let dst = resolve!(self, buffers, dst_buffer).buffer.clone();
        let copy_size = if size == WHOLE_SIZE { src_size } else { size };

        {
            let record = resolve!(self, command_buffers, command_buffer);
            unsafe {
                record.aux_residency_set.addAllocation(src.as_ref().as_ref());
                record.aux_residency_set.addAllocation(dst.as_ref().as_ref());
            }
        }

        let encoder = self.begin_compute_encoder(command_buffer);
        unsafe {
            encoder.copyFromBuffer_sourceOffset_toBuffer_destinationOffset_size(
                &src,
                src_offset as usize,
                &dst,
                dst_offset as usize,
                copy_size as usize,
            );
            encoder.endEncoding();
        }
    }

    pub fn cmd_copy_buffer_to_image(
        &mut self,
        command_buffer: CommandBuffer,
        buffer: Buffer,
        image: Image,
        desc: &BufferImageCopyDesc,
    ) {
        let src = resolve!(self, buffers, buffer).buffer.clone();
        let (texture, format) = {
            let record = resolve!(self, images, image);
            (record.texture.clone(), record.format)
        };

        let bytes_per_pixel = image_format_bytes_per_pixel(format);
        let bytes_per_row = desc.texel_extent[0] as usize * bytes_per_pixel;
        let bytes_per_image = bytes_per_row * desc.texel_extent[1] as usize;

        {
            let record = resolve!(self, command_buffers, command_buffer);
            unsafe {
                record.aux_residency_set.addAllocation(src.as_ref().as_ref());
                record.aux_residency_set.addAllocation(texture.as_ref().as_ref());
            }
        }

        let encoder = self.begin_compute_encoder(command_buffer);
        unsafe {
            encoder.copyFromBuffer_sourceOffset_sourceBytesPerRow_sourceBytesPerImage_sourceSize_toTexture_destinationSlice_destinationLevel_destinationOrigin(
                &src,
                desc.buffer_offset as usize,
                bytes_per_row,
                bytes_per_image,
                mtl::MTLSize {
                    width: desc.texel_extent[0] as usize,
                    height: desc.texel_extent[1] as usize,
                    depth: desc.texel_extent[2].max(1) as usize,
                },
                &texture,
                0,
                0,
                mtl::MTLOrigin {
                    x: desc.texel_offset[0] as usize,
                    y: desc.texel_offset[1] as usize,
                    z: desc.texel_offset[2] as usize,
                },
            );
            encoder.endEncoding();
        }
    }

    pub fn cmd_push_constants(
        &mut self,
        command_buffer: CommandBuffer,
        _pipeline: Pipeline,
        data: &[u8],
    ) {
        if data.len() > MAX_PUSH_CONSTANTS_SIZE as usize {
            fatal!("push constant range too large");
        }

        let record = resolve!(self, command_buffers, command_buffer);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                record.push_constants.contents().as_ptr() as *mut u8,
                data.len(),
            );
        }
    }

    pub fn cmd_dispatch(&mut self, command_buffer: CommandBuffer, x: u32, y: u32, z: u32) {
        let threads_per_threadgroup = {
            let Some(pipeline) = resolve!(self, command_buffers, command_buffer).bound_pipeline
            else {
                fatal!("no pipeline bound");
            };
            resolve!(self, pipelines, pipeline).threads_per_threadgroup
        };

        let encoder = self.begin_compute_encoder(command_buffer);
        unsafe {
            encoder.dispatchThreadgroups_threadsPerThreadgroup(
                mtl::MTLSize {
                    width: x as usize,
                    height: y as usize,
                    depth: z as usize,
                },
                threads_per_threadgroup,
            );
            encoder.endEncoding();
        }
    }

    /// Function selection already happens through the function tables, so a
    /// trace is a dispatch over width x height threads.
    pub fn cmd_trace_rays(
        &mut self,
        command_buffer: CommandBuffer,
        pipeline: Pipeline,
        width: u32,
        height: u32,
    ) {
        let threads = {
            let record = resolve!(self, pipelines, pipeline);
            record.threads_per_threadgroup
        };

        let groups_x = (width as usize).div_ceil(threads.width);
        let groups_y = (height as usize).div_ceil(threads.height);
        self.cmd_dispatch(command_buffer, groups_x as u32, groups_y as u32, 1);
    }

    pub fn cmd_pipeline_barrier(
        &mut self,
        command_buffer: CommandBuffer,
        _barrier: &PipelineBarrier,
    ) {
        // A full dispatch barrier; Metal resolves the access scopes itself.
        let encoder = self.begin_compute_encoder(command_buffer);
        unsafe {
            encoder.barrierAfterStages_beforeQueueStages_visibilityOptions(
                mtl::MTLStages::Dispatch,
                mtl::MTLStages::Dispatch,
                mtl::MTL4VisibilityOptions::Device,
            );
            encoder.endEncoding();
        }
    }

    pub fn cmd_fill_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        buffer: Buffer,
        dst_offset: u64,
        size: u64,
        data: u8,
    ) {
        let (dst, dst_size) = {
            let record = resolve!(self, buffers, buffer);
            (record.buffer.clone(), record.size)
        };
        let fill_size = if size == WHOLE_SIZE { dst_size } else { size };

        {
            let record = resolve!(self, command_buffers, command_buffer);
            unsafe { record.aux_residency_set.addAllocation(dst.as_ref().as_ref()) };
        }

        let encoder = self.begin_compute_encoder(command_buffer);
        unsafe {
            encoder.fillBuffer_range_value(
                &dst,
                objc2_foundation::NSRange::new(dst_offset as usize, fill_size as usize),
                data,
            );
            encoder.endEncoding();
        }
    }

    pub fn cmd_reset_timestamps(&mut self, _command_buffer: CommandBuffer, _offset: u32, _count: u32) {
        fatal!("timestamp queries are not implemented on the Metal backend");
    }

    pub fn cmd_write_timestamp(&mut self, _command_buffer: CommandBuffer, _timestamp_index: u32) {
        fatal!("timestamp queries are not implemented on the Metal backend");
    }

    pub fn cmd_copy_timestamps(
        &mut self,
        _command_buffer: CommandBuffer,
        _buffer: Buffer,
        _offset: u32,
        _count: u32,
        _wait_until_available: bool,
    ) {
        fatal!("timestamp queries are not implemented on the Metal backend");
    }
}
