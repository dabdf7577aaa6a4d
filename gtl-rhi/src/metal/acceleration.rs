//! Acceleration structure builds. Builds run on an internal command buffer
//! and block until completion.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSArray;
use objc2_metal as mtl;
use objc2_metal::{
    MTLAccelerationStructureCommandEncoder, MTLBuffer, MTLCommandBuffer, MTLCommandEncoder,
    MTLCommandQueue, MTLDevice,
};

use super::{resolve, BlasRecord, Context, TlasRecord};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::{Blas, BlasCreateInfo, Tlas, TlasCreateInfo};

impl Context {
    /// Builds an acceleration structure synchronously on a transient queue.
    fn build_acceleration_structure(
        &mut self,
        descriptor: &mtl::MTLAccelerationStructureDescriptor,
    ) -> GpuResult<Retained<ProtocolObject<dyn mtl::MTLAccelerationStructure>>> {
        let device = &self.device.device;

        let sizes = unsafe { device.accelerationStructureSizesWithDescriptor(descriptor) };

        let Some(acceleration_structure) = (unsafe {
            device.newAccelerationStructureWithSize(sizes.accelerationStructureSize)
        }) else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create acceleration structure"
            );
        };

        let Some(scratch_buffer) = (unsafe {
            device.newBufferWithLength_options(
                sizes.buildScratchBufferSize,
                mtl::MTLResourceOptions::MTLResourceStorageModePrivate,
            )
        }) else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create AS scratch buffer"
            );
        };

        let Some(queue) = device.newCommandQueue() else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create AS build queue"
            );
        };
        let Some(command_buffer) = queue.commandBuffer() else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create AS build command buffer"
            );
        };
        let Some(encoder) = command_buffer.accelerationStructureCommandEncoder() else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create AS build encoder"
            );
        };

        unsafe {
            encoder.buildAccelerationStructure_descriptor_scratchBuffer_scratchBufferOffset(
                &acceleration_structure,
                descriptor,
                &scratch_buffer,
                0,
            );
        }
        encoder.endEncoding();
        command_buffer.commit();
        unsafe { command_buffer.waitUntilCompleted() };

        Ok(acceleration_structure)
    }

    pub fn create_blas(&mut self, create_info: &BlasCreateInfo) -> GpuResult<Blas> {
        let (vertex_buffer, index_buffer) = {
            let vertex = resolve!(self, buffers, create_info.vertex_buffer).buffer.clone();
            let index = resolve!(self, buffers, create_info.index_buffer).buffer.clone();
            (vertex, index)
        };

        let geometry = unsafe { mtl::MTLAccelerationStructureTriangleGeometryDescriptor::new() };
        unsafe {
            geometry.setVertexBuffer(Some(&vertex_buffer));
            geometry.setVertexFormat(mtl::MTLAttributeFormat::Float3);
            geometry.setVertexStride(std::mem::size_of::<f32>() * 3);
            geometry.setIndexBuffer(Some(&index_buffer));
            geometry.setIndexType(mtl::MTLIndexType::UInt32);
            geometry.setTriangleCount(create_info.triangle_count as usize);
            geometry.setOpaque(create_info.is_opaque);
        }

        let descriptor = unsafe { mtl::MTLPrimitiveAccelerationStructureDescriptor::new() };
        unsafe {
            descriptor.setGeometryDescriptors(&NSArray::from_retained_slice(&[
                Retained::into_super(geometry),
            ]));
        }

        let acceleration_structure = self.build_acceleration_structure(&descriptor)?;

        let handle = self.blases.allocate();
        self.blases.insert(
            handle,
            BlasRecord {
                acceleration_structure,
                is_opaque: create_info.is_opaque,
            },
        );

        Ok(Blas(handle))
    }

    pub fn create_tlas(&mut self, create_info: &TlasCreateInfo) -> GpuResult<Tlas> {
        let instance_count = create_info.instances.len();
        let instance_stride =
            std::mem::size_of::<mtl::MTLAccelerationStructureInstanceDescriptor>();

        let Some(instance_buffer) = (unsafe {
            self.device.device.newBufferWithLength_options(
                instance_count.max(1) * instance_stride,
                mtl::MTLResourceOptions::MTLResourceStorageModeShared,
            )
        }) else {
            recoverable!(
                GpuError::CreationFailed("acceleration structure"),
                "failed to create TLAS instance buffer"
            );
        };

        let mut blases = Vec::with_capacity(instance_count);
        let instance_ptr =
            instance_buffer.contents().as_ptr() as *mut mtl::MTLAccelerationStructureInstanceDescriptor;

        for (i, instance) in create_info.instances.iter().enumerate() {
            if instance.instance_custom_index & 0xff00_0000 != 0 {
                fatal!("instance custom index must be smaller than 2^24");
            }

            let blas = {
                let record = resolve!(self, blases, instance.blas);
                record.acceleration_structure.clone()
            };

            // Column-major 4x3 from the row-major 3x4 input.
            let mut columns = [[0.0f32; 3]; 4];
            for row in 0..3 {
                for column in 0..4 {
                    columns[column][row] = instance.transform[row][column];
                }
            }

            let descriptor = mtl::MTLAccelerationStructureInstanceDescriptor {
                transformationMatrix: mtl::MTLPackedFloat4x3 {
                    columns: columns.map(|c| mtl::MTLPackedFloat3 {
                        x: c[0],
                        y: c[1],
                        z: c[2],
                    }),
                },
                options: mtl::MTLAccelerationStructureInstanceOptions::DisableTriangleCulling,
                mask: 0xff,
                intersectionFunctionTableOffset: instance.hit_group_index,
                accelerationStructureIndex: i as u32,
            };

            unsafe { std::ptr::write_unaligned(instance_ptr.add(i), descriptor) };

            blases.push(blas);
        }

        let descriptor = unsafe { mtl::MTLInstanceAccelerationStructureDescriptor::new() };
        unsafe {
            descriptor.setInstancedAccelerationStructures(Some(&NSArray::from_retained_slice(
                &blases,
            )));
            descriptor.setInstanceCount(instance_count);
            descriptor.setInstanceDescriptorBuffer(Some(&instance_buffer));
        }

        let acceleration_structure = self.build_acceleration_structure(&descriptor)?;

        let handle = self.tlases.allocate();
        self.tlases.insert(
            handle,
            TlasRecord {
                acceleration_structure,
                blases,
            },
        );

        Ok(Tlas(handle))
    }

    pub fn destroy_blas(&mut self, blas: Blas) {
        if self.blases.free(blas.0).is_none() {
            fatal!("invalid handle!");
        }
    }

    pub fn destroy_tlas(&mut self, tlas: Tlas) {
        if self.tlases.free(tlas.0).is_none() {
            fatal!("invalid handle!");
        }
    }
}
