//! Bind sets as argument buffers with per-set residency sets.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSArray;
use objc2_metal as mtl;
use objc2_metal::{MTLArgumentEncoder, MTLDevice, MTLResidencySet};

use super::device::create_residency_set;
use super::{resolve, resolve_mut, Context};
use crate::error::fatal;
use crate::reflection::{DescriptorType, ReflectionBinding};
use crate::{BindSet, Bindings, BufferBinding, Pipeline};

pub(crate) struct BindSetRecord {
    pub argument_encoder: Retained<ProtocolObject<dyn mtl::MTLArgumentEncoder>>,
    pub argument_buffer: Retained<ProtocolObject<dyn mtl::MTLBuffer>>,
    pub residency_set: Retained<ProtocolObject<dyn mtl::MTLResidencySet>>,
    pub bindings: Vec<ReflectionBinding>,
    /// Dynamic-uniform buffers, re-encoded with offsets at bind time.
    pub dynamic_buffers: Vec<BufferBinding>,
}

fn argument_descriptor(
    binding: &ReflectionBinding,
) -> Retained<mtl::MTLArgumentDescriptor> {
    let descriptor = unsafe { mtl::MTLArgumentDescriptor::new() };
    unsafe {
        descriptor.setIndex(binding.binding as usize);
        descriptor.setArrayLength(binding.count.max(1) as usize);
        descriptor.setDataType(match binding.descriptor_type {
            DescriptorType::UniformBuffer | DescriptorType::StorageBuffer => {
                mtl::MTLDataType::Pointer
            }
            DescriptorType::SampledImage
            | DescriptorType::StorageImage
            | DescriptorType::CombinedImageSampler => mtl::MTLDataType::Texture,
            DescriptorType::Sampler => mtl::MTLDataType::Sampler,
            DescriptorType::AccelerationStructure => {
                mtl::MTLDataType::InstanceAccelerationStructure
            }
        });
    }
    descriptor
}

impl Context {
    pub fn create_bind_sets(&mut self, pipeline: Pipeline, count: u32) -> Vec<BindSet> {
        let sets = {
            let record = resolve!(self, pipelines, pipeline);
            if record.reflection.descriptor_sets.len() != count as usize {
                fatal!("descriptor set count mismatch");
            }
            record.reflection.descriptor_sets.clone()
        };

        sets.iter()
            .map(|set| {
                let descriptors: Vec<Retained<mtl::MTLArgumentDescriptor>> =
                    set.bindings.iter().map(argument_descriptor).collect();
                let descriptor_array = NSArray::from_retained_slice(&descriptors);

                let Some(argument_encoder) = (unsafe {
                    self.device.device.newArgumentEncoderWithArguments(&descriptor_array)
                }) else {
                    fatal!("failed to create argument encoder");
                };

                let length = unsafe { argument_encoder.encodedLength() };
                let Some(argument_buffer) = (unsafe {
                    self.device.device.newBufferWithLength_options(
                        length,
                        mtl::MTLResourceOptions::MTLResourceStorageModeShared,
                    )
                }) else {
                    fatal!("failed to create argument buffer");
                };

                let residency_set = match create_residency_set(
                    &self.device.device,
                    set.bindings.len().max(1),
                ) {
                    Ok(set) => set,
                    Err(_) => fatal!("failed to create bind set residency set"),
                };

                let handle = self.bind_sets.allocate();
                self.bind_sets.insert(
                    handle,
                    BindSetRecord {
                        argument_encoder,
                        argument_buffer,
                        residency_set,
                        bindings: set.bindings.clone(),
                        dynamic_buffers: Vec::new(),
                    },
                );
                BindSet(handle)
            })
            .collect()
    }

    pub fn destroy_bind_sets(&mut self, bind_sets: &[BindSet]) {
        for bind_set in bind_sets {
            if self.bind_sets.free(bind_set.0).is_none() {
                fatal!("invalid handle!");
            }
        }
    }

    pub fn update_bind_set(&mut self, bind_set: BindSet, bindings: &Bindings) {
        let layout_bindings = {
            let record = resolve_mut!(self, bind_sets, bind_set);
            unsafe {
                record
                    .argument_encoder
                    .setArgumentBuffer_offset(Some(&record.argument_buffer), 0);
            }
            record.dynamic_buffers.clear();
            record.bindings.clone()
        };

        for layout_binding in &layout_bindings {
            match layout_binding.descriptor_type {
                DescriptorType::UniformBuffer | DescriptorType::StorageBuffer => {
                    for buffer_binding in bindings.buffers {
                        if buffer_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if buffer_binding.index >= layout_binding.count {
                            fatal!("descriptor binding out of range");
                        }

                        let buffer = {
                            let record = resolve!(self, buffers, buffer_binding.buffer);
                            record.buffer.clone()
                        };

                        let record = resolve_mut!(self, bind_sets, bind_set);
                        unsafe {
                            record.argument_encoder.setBuffer_offset_atIndex(
                                Some(&buffer),
                                buffer_binding.offset,
                                (layout_binding.binding + buffer_binding.index) as usize,
                            );
                            record.residency_set.addAllocation(buffer.as_ref().as_ref());
                        }

                        if layout_binding.descriptor_type == DescriptorType::UniformBuffer {
                            record.dynamic_buffers.push(*buffer_binding);
                        }
                    }
                }
                DescriptorType::SampledImage
                | DescriptorType::StorageImage
                | DescriptorType::CombinedImageSampler => {
                    for image_binding in bindings.images {
                        if image_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if image_binding.index >= layout_binding.count {
                            fatal!("descriptor binding out of range");
                        }

                        let texture = {
                            let record = resolve!(self, images, image_binding.image);
                            record.texture.clone()
                        };

                        let record = resolve_mut!(self, bind_sets, bind_set);
                        unsafe {
                            record.argument_encoder.setTexture_atIndex(
                                Some(&texture),
                                (layout_binding.binding + image_binding.index) as usize,
                            );
                            record.residency_set.addAllocation(texture.as_ref().as_ref());
                        }
                    }
                }
                DescriptorType::Sampler => {
                    for sampler_binding in bindings.samplers {
                        if sampler_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if sampler_binding.index >= layout_binding.count {
                            fatal!("descriptor binding out of range");
                        }

                        let sampler = {
                            let record = resolve!(self, samplers, sampler_binding.sampler);
                            record.sampler.clone()
                        };

                        let record = resolve_mut!(self, bind_sets, bind_set);
                        unsafe {
                            record.argument_encoder.setSamplerState_atIndex(
                                Some(&sampler),
                                (layout_binding.binding + sampler_binding.index) as usize,
                            );
                        }
                    }
                }
                DescriptorType::AccelerationStructure => {
                    for tlas_binding in bindings.tlases {
                        if tlas_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if tlas_binding.index >= layout_binding.count {
                            fatal!("descriptor binding out of range");
                        }

                        let (acceleration_structure, blases) = {
                            let record = resolve!(self, tlases, tlas_binding.tlas);
                            (record.acceleration_structure.clone(), record.blases.clone())
                        };

                        let record = resolve_mut!(self, bind_sets, bind_set);
                        unsafe {
                            record.argument_encoder.setAccelerationStructure_atIndex(
                                Some(&acceleration_structure),
                                (layout_binding.binding + tlas_binding.index) as usize,
                            );
                            record
                                .residency_set
                                .addAllocation(acceleration_structure.as_ref().as_ref());
                            for blas in &blases {
                                record.residency_set.addAllocation(blas.as_ref().as_ref());
                            }
                        }
                    }
                }
            }
        }

        let record = resolve_mut!(self, bind_sets, bind_set);
        unsafe { record.residency_set.commit() };
    }
}
