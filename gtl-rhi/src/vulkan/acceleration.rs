//! Bottom- and top-level acceleration structure builds.
//!
//! Builds run on an internal one-shot command buffer and block on a fresh
//! timeline semaphore; the caller never sees the intermediate objects.

use ash::vk;

use super::buffer::{create_internal_buffer, destroy_internal_buffer, BufferRecord};
use super::{resolve, BlasRecord, Context, TlasRecord};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::limits::all_opaque;
use crate::{
    Blas, BlasCreateInfo, BufferUsage, MemoryProperties, SignalSemaphoreInfo, Tlas,
    TlasCreateInfo, WaitSemaphoreInfo,
};

impl Context {
    /// Shared build path: query sizes, allocate backing and scratch, record a
    /// single build command, submit, and wait. Partial resources are torn
    /// down on failure.
    fn create_top_or_bottom_as(
        &mut self,
        as_type: vk::AccelerationStructureTypeKHR,
        geometry: &vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> GpuResult<(vk::AccelerationStructureKHR, BufferRecord)> {
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(as_type)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(geometry));

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.device.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut size_info,
            );
        }

        let as_buffer = create_internal_buffer(
            &mut self.device,
            BufferUsage::SHADER_DEVICE_ADDRESS | BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            MemoryProperties::DEVICE_LOCAL,
            size_info.acceleration_structure_size,
            0,
            Some("[AS buffer]"),
            0,
        )?;

        let as_create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(as_buffer.buffer)
            .size(size_info.acceleration_structure_size)
            .ty(as_type);

        let acceleration_structure = match unsafe {
            self.device
                .acceleration_structure
                .create_acceleration_structure(&as_create_info, None)
        } {
            Ok(acceleration_structure) => acceleration_structure,
            Err(err) => {
                destroy_internal_buffer(&mut self.device, as_buffer);
                recoverable!(
                    GpuError::CreationFailed("acceleration structure"),
                    "failed to create acceleration structure object: {err}"
                );
            }
        };

        let scratch_alignment = self
            .device
            .internal_properties
            .min_acceleration_structure_scratch_offset_alignment
            as u64;

        // Scratch memory carries the dedicated AS-scratch alignment.
        let scratch_buffer = match create_internal_buffer(
            &mut self.device,
            BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            MemoryProperties::DEVICE_LOCAL,
            size_info.build_scratch_size,
            scratch_alignment,
            Some("[AS scratch buffer]"),
            scratch_alignment,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                unsafe {
                    self.device
                        .acceleration_structure
                        .destroy_acceleration_structure(acceleration_structure, None);
                }
                destroy_internal_buffer(&mut self.device, as_buffer);
                return Err(err);
            }
        };

        build_info.dst_acceleration_structure = acceleration_structure;
        build_info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch_buffer.gpu_address,
        };

        let range_info = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count);

        let mut cleanup = |ctx: &mut Context, scratch: BufferRecord| {
            unsafe {
                ctx.device
                    .acceleration_structure
                    .destroy_acceleration_structure(acceleration_structure, None);
            }
            destroy_internal_buffer(&mut ctx.device, scratch);
        };

        let command_buffer = match self.create_command_buffer() {
            Ok(command_buffer) => command_buffer,
            Err(err) => {
                cleanup(self, scratch_buffer);
                destroy_internal_buffer(&mut self.device, as_buffer);
                return Err(err);
            }
        };

        if let Err(err) = self.begin_command_buffer(command_buffer) {
            self.destroy_command_buffer(command_buffer);
            cleanup(self, scratch_buffer);
            destroy_internal_buffer(&mut self.device, as_buffer);
            return Err(err);
        }

        let vk_command_buffer = resolve!(self, command_buffers, command_buffer).command_buffer;
        unsafe {
            self.device.acceleration_structure.cmd_build_acceleration_structures(
                vk_command_buffer,
                &[build_info],
                &[&[range_info]],
            );
        }
        self.end_command_buffer(command_buffer);

        let semaphore = match self.create_semaphore(0) {
            Ok(semaphore) => semaphore,
            Err(err) => {
                self.destroy_command_buffer(command_buffer);
                cleanup(self, scratch_buffer);
                destroy_internal_buffer(&mut self.device, as_buffer);
                return Err(err);
            }
        };

        self.submit_command_buffer(
            command_buffer,
            &[SignalSemaphoreInfo { semaphore, value: 1 }],
            &[],
        );
        let wait_result =
            self.wait_semaphores(&[WaitSemaphoreInfo { semaphore, value: 1 }], u64::MAX);

        self.destroy_semaphore(semaphore);
        self.destroy_command_buffer(command_buffer);
        destroy_internal_buffer(&mut self.device, scratch_buffer);

        if let Err(err) = wait_result {
            unsafe {
                self.device
                    .acceleration_structure
                    .destroy_acceleration_structure(acceleration_structure, None);
            }
            destroy_internal_buffer(&mut self.device, as_buffer);
            return Err(err);
        }

        Ok((acceleration_structure, as_buffer))
    }

    pub fn create_blas(&mut self, create_info: &BlasCreateInfo) -> GpuResult<Blas> {
        let vertex_address = {
            let record = resolve!(self, buffers, create_info.vertex_buffer);
            record.gpu_address
        };
        let index_address = {
            let record = resolve!(self, buffers, create_info.index_buffer);
            record.gpu_address
        };

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_address,
            })
            .vertex_stride(std::mem::size_of::<f32>() as u64 * 3)
            .max_vertex(create_info.max_vertex)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_address,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(if create_info.is_opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            });

        let (acceleration_structure, as_buffer) = match self.create_top_or_bottom_as(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometry,
            create_info.triangle_count,
        ) {
            Ok(result) => result,
            Err(err) => {
                log::error!("{}:{}: failed to build BLAS", file!(), line!());
                return Err(err);
            }
        };

        if let Some(name) = create_info.debug_name {
            self.set_object_name(
                vk::ObjectType::ACCELERATION_STRUCTURE_KHR,
                vk::Handle::as_raw(acceleration_structure),
                name,
            );
        }

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure);
        let address = unsafe {
            self.device
                .acceleration_structure
                .get_acceleration_structure_device_address(&address_info)
        };

        let handle = self.blases.allocate();
        self.blases.insert(
            handle,
            BlasRecord {
                acceleration_structure,
                address,
                buffer: as_buffer,
                is_opaque: create_info.is_opaque,
            },
        );

        Ok(Blas(handle))
    }

    pub fn create_tlas(&mut self, create_info: &TlasCreateInfo) -> GpuResult<Tlas> {
        let instance_count = create_info.instances.len();
        let instance_stride = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

        // An empty TLAS still gets a minimal one-element instance buffer.
        let instance_buffer = create_internal_buffer(
            &mut self.device,
            BufferUsage::SHADER_DEVICE_ADDRESS | BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
            MemoryProperties::HOST_VISIBLE,
            (instance_count.max(1) * instance_stride) as u64,
            16, // required by the API
            create_info.debug_name,
            0,
        )?;

        let mut blas_opacity = Vec::with_capacity(instance_count);
        for (i, instance) in create_info.instances.iter().enumerate() {
            let (blas_address, blas_opaque) = {
                let record = resolve!(self, blases, instance.blas);
                (record.address, record.is_opaque)
            };
            blas_opacity.push(blas_opaque);

            if instance.instance_custom_index & 0xff00_0000 != 0 {
                fatal!("instance custom index must be smaller than 2^24");
            }

            let mut transform = [0.0f32; 12];
            for row in 0..3 {
                transform[row * 4..row * 4 + 4].copy_from_slice(&instance.transform[row]);
            }

            let vk_instance = vk::AccelerationStructureInstanceKHR {
                transform: vk::TransformMatrixKHR { matrix: transform },
                instance_custom_index_and_mask: vk::Packed24_8::new(
                    instance.instance_custom_index,
                    0xff,
                ),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    instance.hit_group_index,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: blas_address,
                },
            };

            unsafe {
                std::ptr::write_unaligned(
                    instance_buffer
                        .cpu_ptr
                        .add(i * instance_stride)
                        .cast::<vk::AccelerationStructureInstanceKHR>(),
                    vk_instance,
                );
            }
        }

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default().data(
                    vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer.gpu_address,
                    },
                ),
            })
            .flags(if all_opaque(&blas_opacity) {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            });

        let result = self.create_top_or_bottom_as(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            instance_count as u32,
        );

        destroy_internal_buffer(&mut self.device, instance_buffer);

        let (acceleration_structure, as_buffer) = match result {
            Ok(result) => result,
            Err(err) => {
                log::error!("{}:{}: failed to build TLAS", file!(), line!());
                return Err(err);
            }
        };

        if let Some(name) = create_info.debug_name {
            self.set_object_name(
                vk::ObjectType::ACCELERATION_STRUCTURE_KHR,
                vk::Handle::as_raw(acceleration_structure),
                name,
            );
        }

        let handle = self.tlases.allocate();
        self.tlases.insert(
            handle,
            TlasRecord {
                acceleration_structure,
                buffer: as_buffer,
            },
        );

        Ok(Tlas(handle))
    }

    pub fn destroy_blas(&mut self, blas: Blas) {
        let Some(record) = self.blases.free(blas.0) else {
            fatal!("invalid handle!");
        };
        unsafe {
            self.device
                .acceleration_structure
                .destroy_acceleration_structure(record.acceleration_structure, None);
        }
        destroy_internal_buffer(&mut self.device, record.buffer);
    }

    pub fn destroy_tlas(&mut self, tlas: Tlas) {
        let Some(record) = self.tlases.free(tlas.0) else {
            fatal!("invalid handle!");
        };
        unsafe {
            self.device
                .acceleration_structure
                .destroy_acceleration_structure(record.acceleration_structure, None);
        }
        destroy_internal_buffer(&mut self.device, record.buffer);
    }
}
