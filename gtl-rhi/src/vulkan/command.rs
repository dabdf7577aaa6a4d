//! Command buffer recording: binds, copies, barriers, dispatches, traces,
//! and timestamps.

use ash::vk;

use super::image::IMAGE_SUBRESOURCE_RANGE;
use super::pipeline::PipelineKind;
use super::{
    pipeline_stages_for_shader_stages, resolve, resolve_mut, CommandBufferRecord, Context,
    RT_PIPELINE_STAGE_FLAGS,
};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::limits::{MAX_BUFFER_UPDATE_SIZE, MAX_TIMESTAMP_QUERIES, WHOLE_SIZE};
use crate::reflection::DescriptorType;
use crate::{
    BindSet, Buffer, BufferImageCopyDesc, CommandBuffer, Image, ImageBinding, Pipeline,
    PipelineBarrier, Shader,
};

impl Context {
    pub fn create_command_buffer(&mut self) -> GpuResult<CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer =
            match unsafe { self.device.device.allocate_command_buffers(&allocate_info) } {
                Ok(buffers) => buffers[0],
                Err(err) => recoverable!(
                    GpuError::CreationFailed("command buffer"),
                    "failed to allocate command buffer: {err}"
                ),
            };

        let handle = self.command_buffers.allocate();
        self.command_buffers.insert(handle, CommandBufferRecord { command_buffer });

        Ok(CommandBuffer(handle))
    }

    pub fn destroy_command_buffer(&mut self, command_buffer: CommandBuffer) {
        let Some(record) = self.command_buffers.free(command_buffer.0) else {
            fatal!("invalid handle!");
        };
        unsafe {
            self.device
                .device
                .free_command_buffers(self.device.command_pool, &[record.command_buffer]);
        }
    }

    pub fn begin_command_buffer(&mut self, command_buffer: CommandBuffer) -> GpuResult<()> {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        if let Err(err) =
            unsafe { self.device.device.begin_command_buffer(command_buffer, &begin_info) }
        {
            recoverable!(
                GpuError::CreationFailed("command buffer"),
                "failed to begin command buffer: {err}"
            );
        }
        Ok(())
    }

    pub fn end_command_buffer(&mut self, command_buffer: CommandBuffer) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        if let Err(err) = unsafe { self.device.device.end_command_buffer(command_buffer) } {
            fatal!("failed to end command buffer: {err}");
        }
    }

    /// Binds the pipeline and all of its bind sets. `dynamic_offsets` carries
    /// one offset per dynamic-uniform buffer across all sets, in set order.
    pub fn cmd_bind_pipeline(
        &mut self,
        command_buffer: CommandBuffer,
        pipeline: Pipeline,
        bind_sets: &[BindSet],
        dynamic_offsets: &[u32],
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let (vk_pipeline, layout, bind_point, set_count) = {
            let record = resolve!(self, pipelines, pipeline);
            (
                record.pipeline,
                record.layout,
                record.bind_point(),
                record.descriptor_set_layouts.len(),
            )
        };

        if bind_sets.len() != set_count {
            fatal!("descriptor set count mismatch");
        }

        let descriptor_sets: Vec<vk::DescriptorSet> = bind_sets
            .iter()
            .map(|bind_set| resolve!(self, bind_sets, *bind_set).descriptor_set)
            .collect();

        unsafe {
            self.device.device.cmd_bind_pipeline(command_buffer, bind_point, vk_pipeline);
            self.device.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                0,
                &descriptor_sets,
                dynamic_offsets,
            );
        }
    }

    /// Transitions the images the shader will sample to read-only-optimal
    /// and the ones it writes to general, batching all barriers into a
    /// single dependency. Only layout changes emit barriers.
    pub fn cmd_transition_shader_image_layouts(
        &mut self,
        command_buffer: CommandBuffer,
        shader: Shader,
        descriptor_set_index: u32,
        images: &[ImageBinding],
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let (stage_mask, bindings) = {
            let record = resolve!(self, shaders, shader);
            let sets = &record.reflection.descriptor_sets;
            if descriptor_set_index as usize >= sets.len() {
                fatal!("descriptor set index out of bounds");
            }
            (
                pipeline_stages_for_shader_stages(record.stage_flags),
                sets[descriptor_set_index as usize].bindings.clone(),
            )
        };

        let mut barriers: Vec<vk::ImageMemoryBarrier2> = Vec::with_capacity(64);

        for binding in &bindings {
            let new_layout = match binding.descriptor_type {
                DescriptorType::SampledImage => vk::ImageLayout::READ_ONLY_OPTIMAL,
                DescriptorType::StorageImage => vk::ImageLayout::GENERAL,
                _ => continue,
            };

            for element in 0..binding.count {
                let Some(image_binding) = images
                    .iter()
                    .find(|i| i.binding == binding.binding && i.index == element)
                else {
                    continue;
                };

                let record = resolve_mut!(self, images, image_binding.image);

                let old_layout = record.layout;
                if new_layout == old_layout {
                    continue;
                }

                let mut access_mask = vk::AccessFlags2::NONE;
                if binding.read_access {
                    access_mask = vk::AccessFlags2::SHADER_READ;
                }
                if binding.write_access {
                    access_mask = vk::AccessFlags2::SHADER_WRITE;
                }

                barriers.push(
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(stage_mask)
                        .src_access_mask(record.access_mask)
                        .dst_stage_mask(stage_mask)
                        .dst_access_mask(access_mask)
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .image(record.image)
                        .subresource_range(IMAGE_SUBRESOURCE_RANGE),
                );

                record.access_mask = access_mask;
                record.layout = new_layout;
            }
        }

        if !barriers.is_empty() {
            let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe {
                self.device
                    .synchronization2
                    .cmd_pipeline_barrier2(command_buffer, &dependency_info);
            }
        }
    }

    /// Inline update of up to 64 KiB; larger uploads go through a staging
    /// copy.
    pub fn cmd_update_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        data: &[u8],
        dst_buffer: Buffer,
        dst_offset: u64,
    ) {
        if data.len() as u64 > MAX_BUFFER_UPDATE_SIZE {
            fatal!("buffer update too large");
        }

        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let dst = resolve!(self, buffers, dst_buffer).buffer;

        unsafe {
            self.device.device.cmd_update_buffer(command_buffer, dst, dst_offset, data);
        }
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
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let src = resolve!(self, buffers, src_buffer);
        let src_size = src.size;
        let src = src.buffer;
        let dst = resolve!(self, buffers, dst_buffer).buffer;

        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(if size == WHOLE_SIZE { src_size } else { size });

        unsafe {
            self.device.device.cmd_copy_buffer(command_buffer, src, dst, &[region]);
        }
    }

    pub fn cmd_copy_buffer_to_image(
        &mut self,
        command_buffer: CommandBuffer,
        buffer: Buffer,
        image: Image,
        desc: &BufferImageCopyDesc,
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let vk_buffer = resolve!(self, buffers, buffer).buffer;
        let record = resolve_mut!(self, images, image);

        if record.layout != vk::ImageLayout::GENERAL {
            let access_mask = record.access_mask | vk::AccessFlags2::MEMORY_WRITE;
            // Boundary-crossing transfer: an over-broad stage mask is fine.
            let stage_mask = vk::PipelineStageFlags2::COMPUTE_SHADER
                | vk::PipelineStageFlags2::TRANSFER
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;

            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(stage_mask)
                .src_access_mask(record.access_mask)
                .dst_stage_mask(stage_mask)
                .dst_access_mask(access_mask)
                .old_layout(record.layout)
                .new_layout(vk::ImageLayout::GENERAL)
                .image(record.image)
                .subresource_range(IMAGE_SUBRESOURCE_RANGE);

            let dependency_info =
                vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
            unsafe {
                self.device
                    .synchronization2
                    .cmd_pipeline_barrier2(command_buffer, &dependency_info);
            }

            record.layout = vk::ImageLayout::GENERAL;
            record.access_mask = access_mask;
        }

        // Tightly packed rows; color aspect, mip 0, layer 0.
        let region = vk::BufferImageCopy::default()
            .buffer_offset(desc.buffer_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D {
                x: desc.texel_offset[0],
                y: desc.texel_offset[1],
                z: desc.texel_offset[2],
            })
            .image_extent(vk::Extent3D {
                width: desc.texel_extent[0],
                height: desc.texel_extent[1],
                depth: desc.texel_extent[2],
            });

        unsafe {
            self.device.device.cmd_copy_buffer_to_image(
                command_buffer,
                vk_buffer,
                record.image,
                record.layout,
                &[region],
            );
        }
    }

    /// Stage flags follow the bound pipeline's bind point.
    pub fn cmd_push_constants(
        &mut self,
        command_buffer: CommandBuffer,
        pipeline: Pipeline,
        data: &[u8],
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let record = resolve!(self, pipelines, pipeline);

        let stage_flags = match record.kind {
            PipelineKind::Compute => vk::ShaderStageFlags::COMPUTE,
            PipelineKind::RayTracing { .. } => RT_PIPELINE_STAGE_FLAGS,
        };

        unsafe {
            self.device.device.cmd_push_constants(
                command_buffer,
                record.layout,
                stage_flags,
                0,
                data,
            );
        }
    }

    pub fn cmd_dispatch(&mut self, command_buffer: CommandBuffer, x: u32, y: u32, z: u32) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        unsafe { self.device.device.cmd_dispatch(command_buffer, x, y, z) };
    }

    /// Explicit barrier groups. Image barriers take their source access from
    /// the tracked image state and leave layouts untouched.
    pub fn cmd_pipeline_barrier(&mut self, command_buffer: CommandBuffer, barrier: &PipelineBarrier) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;

        let memory_barriers: Vec<vk::MemoryBarrier2> = barrier
            .memory_barriers
            .iter()
            .map(|b| {
                vk::MemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::from_raw(b.src_stage_mask.bits() as u64))
                    .src_access_mask(vk::AccessFlags2::from_raw(b.src_access_mask.bits() as u64))
                    .dst_stage_mask(vk::PipelineStageFlags2::from_raw(b.dst_stage_mask.bits() as u64))
                    .dst_access_mask(vk::AccessFlags2::from_raw(b.dst_access_mask.bits() as u64))
            })
            .collect();

        let buffer_barriers: Vec<vk::BufferMemoryBarrier2> = barrier
            .buffer_barriers
            .iter()
            .map(|b| {
                let buffer = resolve!(self, buffers, b.buffer).buffer;
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::from_raw(b.src_stage_mask.bits() as u64))
                    .src_access_mask(vk::AccessFlags2::from_raw(b.src_access_mask.bits() as u64))
                    .dst_stage_mask(vk::PipelineStageFlags2::from_raw(b.dst_stage_mask.bits() as u64))
                    .dst_access_mask(vk::AccessFlags2::from_raw(b.dst_access_mask.bits() as u64))
                    .buffer(buffer)
                    .offset(b.offset)
                    .size(if b.size == WHOLE_SIZE { vk::WHOLE_SIZE } else { b.size })
            })
            .collect();

        let mut image_barriers: Vec<vk::ImageMemoryBarrier2> =
            Vec::with_capacity(barrier.image_barriers.len());
        for b in barrier.image_barriers {
            let record = resolve_mut!(self, images, b.image);
            let access_mask = vk::AccessFlags2::from_raw(b.access_mask.bits() as u64);

            image_barriers.push(
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::from_raw(b.src_stage_mask.bits() as u64))
                    .src_access_mask(record.access_mask)
                    .dst_stage_mask(vk::PipelineStageFlags2::from_raw(b.dst_stage_mask.bits() as u64))
                    .dst_access_mask(access_mask)
                    .old_layout(record.layout)
                    .new_layout(record.layout)
                    .image(record.image)
                    .subresource_range(IMAGE_SUBRESOURCE_RANGE),
            );

            record.access_mask = access_mask;
        }

        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(&memory_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);

        unsafe {
            self.device
                .synchronization2
                .cmd_pipeline_barrier2(command_buffer, &dependency_info);
        }
    }

    pub fn cmd_reset_timestamps(&mut self, command_buffer: CommandBuffer, offset: u32, count: u32) {
        if offset + count > MAX_TIMESTAMP_QUERIES {
            fatal!("timestamp query range out of bounds");
        }
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        unsafe {
            self.device.device.cmd_reset_query_pool(
                command_buffer,
                self.device.timestamp_pool,
                offset,
                count,
            );
        }
    }

    pub fn cmd_write_timestamp(&mut self, command_buffer: CommandBuffer, timestamp_index: u32) {
        if timestamp_index >= MAX_TIMESTAMP_QUERIES {
            fatal!("timestamp query index out of bounds");
        }
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        unsafe {
            self.device.device.cmd_write_timestamp(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                self.device.timestamp_pool,
                timestamp_index,
            );
        }
    }

    /// Copies `count` 64-bit timestamps starting at query `offset` into the
    /// buffer. With `wait_until_available` the device waits for the queries
    /// instead of reporting availability.
    pub fn cmd_copy_timestamps(
        &mut self,
        command_buffer: CommandBuffer,
        buffer: Buffer,
        offset: u32,
        count: u32,
        wait_until_available: bool,
    ) {
        if offset + count > MAX_TIMESTAMP_QUERIES {
            fatal!("timestamp query range out of bounds");
        }

        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let vk_buffer = resolve!(self, buffers, buffer).buffer;

        let wait_flag = if wait_until_available {
            vk::QueryResultFlags::WAIT
        } else {
            vk::QueryResultFlags::WITH_AVAILABILITY
        };

        unsafe {
            self.device.device.cmd_copy_query_pool_results(
                command_buffer,
                self.device.timestamp_pool,
                offset,
                count,
                vk_buffer,
                0,
                std::mem::size_of::<u64>() as u64,
                vk::QueryResultFlags::TYPE_64 | wait_flag,
            );
        }
    }

    pub fn cmd_trace_rays(
        &mut self,
        command_buffer: CommandBuffer,
        pipeline: Pipeline,
        width: u32,
        height: u32,
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let record = resolve!(self, pipelines, pipeline);

        let PipelineKind::RayTracing { sbt_rgen, sbt_miss, sbt_hit, .. } = &record.kind else {
            fatal!("pipeline has no shader binding table");
        };
        let (sbt_rgen, sbt_miss, sbt_hit) = (*sbt_rgen, *sbt_miss, *sbt_hit);

        let callable_region = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.device.ray_tracing_pipeline.cmd_trace_rays(
                command_buffer,
                &sbt_rgen,
                &sbt_miss,
                &sbt_hit,
                &callable_region,
                width,
                height,
                1,
            );
        }
    }

    /// Fills `[dst_offset, dst_offset + size)` with a repeated byte. The
    /// 32 byte creation padding guarantees whole-buffer fills stay a
    /// multiple of 4.
    pub fn cmd_fill_buffer(
        &mut self,
        command_buffer: CommandBuffer,
        buffer: Buffer,
        dst_offset: u64,
        size: u64,
        data: u8,
    ) {
        let command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        let record = resolve!(self, buffers, buffer);

        let range_size = if size == WHOLE_SIZE { record.size } else { size };
        let word = u32::from_ne_bytes([data; 4]);

        unsafe {
            self.device.device.cmd_fill_buffer(
                command_buffer,
                record.buffer,
                dst_offset,
                range_size,
                word,
            );
        }
    }
}
