//! Bind sets: descriptor sets allocated from a pipeline's pool and updated
//! from resource bindings.

use ash::vk;

use super::{resolve, BindSetRecord, Context};
use crate::error::fatal;
use crate::limits::{MAX_DESCRIPTOR_SET_COUNT, WHOLE_SIZE};
use crate::{BindSet, Bindings, Pipeline};

enum WritePayload {
    Buffer(usize),
    Image(usize),
    Sampler(usize),
    Tlas(usize),
}

struct PendingWrite {
    binding: u32,
    array_element: u32,
    descriptor_type: vk::DescriptorType,
    payload: WritePayload,
}

impl Context {
    /// Allocates one bind set per descriptor set of the pipeline, in set
    /// order. `count` must equal the pipeline's reflected set count.
    pub fn create_bind_sets(&mut self, pipeline: Pipeline, count: u32) -> Vec<BindSet> {
        let (descriptor_pool, set_layouts, layout_bindings) = {
            let record = resolve!(self, pipelines, pipeline);
            if record.descriptor_set_layouts.len() != count as usize {
                fatal!("descriptor set count mismatch");
            }
            (
                record.descriptor_pool,
                record.descriptor_set_layouts.clone(),
                record.layout_bindings.clone(),
            )
        };

        debug_assert!(count <= MAX_DESCRIPTOR_SET_COUNT);

        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);

        let descriptor_sets =
            match unsafe { self.device.device.allocate_descriptor_sets(&allocate_info) } {
                Ok(sets) => sets,
                Err(err) => fatal!("failed to allocate descriptor sets: {err}"),
            };

        descriptor_sets
            .into_iter()
            .zip(layout_bindings)
            .map(|(descriptor_set, bindings)| {
                let handle = self.bind_sets.allocate();
                self.bind_sets.insert(
                    handle,
                    BindSetRecord {
                        layout_bindings: bindings,
                        descriptor_set,
                    },
                );
                BindSet(handle)
            })
            .collect()
    }

    /// Descriptor set memory is owned by the pipeline's pool; only the
    /// handles are retired here.
    pub fn destroy_bind_sets(&mut self, bind_sets: &[BindSet]) {
        for bind_set in bind_sets {
            if self.bind_sets.free(bind_set.0).is_none() {
                fatal!("invalid handle!");
            }
        }
    }

    /// Walks the set's layout bindings and writes every matching input
    /// binding, matched on `(binding, index)`.
    pub fn update_bind_set(&mut self, bind_set: BindSet, bindings: &Bindings) {
        let (descriptor_set, layout_bindings) = {
            let record = resolve!(self, bind_sets, bind_set);
            (record.descriptor_set, record.layout_bindings.clone())
        };

        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        let mut tlas_handles: Vec<vk::AccelerationStructureKHR> = Vec::new();
        let mut pending: Vec<PendingWrite> = Vec::new();

        for layout_binding in &layout_bindings {
            let descriptor_type = layout_binding.descriptor_type;

            match descriptor_type {
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER => {
                    for buffer_binding in bindings.buffers {
                        if buffer_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if buffer_binding.index >= layout_binding.descriptor_count {
                            fatal!("descriptor binding out of range");
                        }

                        let record = resolve!(self, buffers, buffer_binding.buffer);
                        let range = if buffer_binding.size == WHOLE_SIZE {
                            record.size - buffer_binding.offset
                        } else {
                            buffer_binding.size
                        };

                        buffer_infos.push(
                            vk::DescriptorBufferInfo::default()
                                .buffer(record.buffer)
                                .offset(buffer_binding.offset)
                                .range(range),
                        );
                        pending.push(PendingWrite {
                            binding: layout_binding.binding,
                            array_element: buffer_binding.index,
                            descriptor_type,
                            payload: WritePayload::Buffer(buffer_infos.len() - 1),
                        });
                    }
                }
                vk::DescriptorType::STORAGE_IMAGE | vk::DescriptorType::SAMPLED_IMAGE => {
                    for image_binding in bindings.images {
                        if image_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if image_binding.index >= layout_binding.descriptor_count {
                            fatal!("descriptor binding out of range");
                        }

                        let record = resolve!(self, images, image_binding.image);
                        image_infos.push(
                            vk::DescriptorImageInfo::default()
                                .image_view(record.image_view)
                                .image_layout(record.layout),
                        );
                        pending.push(PendingWrite {
                            binding: layout_binding.binding,
                            array_element: image_binding.index,
                            descriptor_type,
                            payload: WritePayload::Image(image_infos.len() - 1),
                        });
                    }
                }
                vk::DescriptorType::SAMPLER => {
                    for sampler_binding in bindings.samplers {
                        if sampler_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if sampler_binding.index >= layout_binding.descriptor_count {
                            fatal!("descriptor binding out of range");
                        }

                        let record = resolve!(self, samplers, sampler_binding.sampler);
                        image_infos.push(
                            vk::DescriptorImageInfo::default()
                                .sampler(record.sampler)
                                .image_layout(vk::ImageLayout::UNDEFINED),
                        );
                        pending.push(PendingWrite {
                            binding: layout_binding.binding,
                            array_element: sampler_binding.index,
                            descriptor_type,
                            payload: WritePayload::Sampler(image_infos.len() - 1),
                        });
                    }
                }
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
                    for tlas_binding in bindings.tlases {
                        if tlas_binding.binding != layout_binding.binding {
                            continue;
                        }
                        if tlas_binding.index >= layout_binding.descriptor_count {
                            fatal!("descriptor binding out of range");
                        }

                        let record = resolve!(self, tlases, tlas_binding.tlas);
                        tlas_handles.push(record.acceleration_structure);
                        pending.push(PendingWrite {
                            binding: tlas_binding.binding,
                            array_element: tlas_binding.index,
                            descriptor_type,
                            payload: WritePayload::Tlas(tlas_handles.len() - 1),
                        });
                    }
                }
                _ => fatal!("invalid descriptor type"),
            }
        }

        // The info arrays are complete; writes can now borrow into them.
        let mut tlas_write_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = pending
            .iter()
            .filter_map(|write| match write.payload {
                WritePayload::Tlas(index) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(std::slice::from_ref(&tlas_handles[index])),
                ),
                _ => None,
            })
            .collect();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(pending.len());
        let mut tlas_write_iter = tlas_write_infos.iter_mut();

        for write in &pending {
            let descriptor_write = vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(write.binding)
                .dst_array_element(write.array_element)
                .descriptor_type(write.descriptor_type);

            let descriptor_write = match write.payload {
                WritePayload::Buffer(index) => descriptor_write
                    .buffer_info(std::slice::from_ref(&buffer_infos[index])),
                WritePayload::Image(index) | WritePayload::Sampler(index) => {
                    descriptor_write.image_info(std::slice::from_ref(&image_infos[index]))
                }
                WritePayload::Tlas(_) => {
                    let tlas_info = tlas_write_iter.next().expect("one info per tlas write");
                    let mut descriptor_write = descriptor_write.push_next(tlas_info);
                    descriptor_write.descriptor_count = 1;
                    descriptor_write
                }
            };

            writes.push(descriptor_write);
        }

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
    }
}
