//! Buffer creation and the memory-allocator wrapper.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::device::Device;
use super::{resolve, Context};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::limits::{align_up, BUFFER_BASE_ALIGNMENT, WHOLE_SIZE};
use crate::{Buffer, BufferCreateInfo, BufferUsage, MemoryProperties};

pub(crate) struct BufferRecord {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub cpu_ptr: *mut u8,
    pub gpu_address: u64,
}

fn memory_location(memory_properties: MemoryProperties) -> MemoryLocation {
    if memory_properties.contains(MemoryProperties::HOST_VISIBLE) {
        if memory_properties.contains(MemoryProperties::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    } else {
        MemoryLocation::GpuOnly
    }
}

/// Creates a buffer record without allocating a handle; also used for the
/// internal buffers backing acceleration structures and the SBT.
///
/// `scratch_alignment` carries the AS-scratch minimum allocation alignment
/// for scratch buffers; everything else passes 0.
pub(crate) fn create_internal_buffer(
    device: &mut Device,
    usage: BufferUsage,
    mut memory_properties: MemoryProperties,
    size: u64,
    alignment: u64,
    debug_name: Option<&str>,
    scratch_alignment: u64,
) -> GpuResult<BufferRecord> {
    // Padding the size up keeps the whole range coverable by fill_buffer.
    let padded_size = align_up(size, BUFFER_BASE_ALIGNMENT);

    if device.features.shared_memory {
        // Host uploads skip the staging copy on UMA/ReBAR hardware.
        memory_properties |= MemoryProperties::HOST_VISIBLE;
    }

    let host_visible = memory_properties.contains(MemoryProperties::HOST_VISIBLE);

    let buffer_info = vk::BufferCreateInfo::default()
        .size(padded_size)
        .usage(vk::BufferUsageFlags::from_raw(usage.bits()))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = match unsafe { device.device.create_buffer(&buffer_info, None) } {
        Ok(buffer) => buffer,
        Err(err) => recoverable!(
            GpuError::CreationFailed("buffer"),
            "failed to create buffer: {err}"
        ),
    };

    let mut alignment = alignment;
    if host_visible && alignment < device.internal_properties.min_memory_map_alignment {
        alignment = device.internal_properties.min_memory_map_alignment;
    }
    let alignment = align_up(alignment, BUFFER_BASE_ALIGNMENT).max(scratch_alignment);

    let mut requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    requirements.alignment = requirements.alignment.max(alignment);

    let allocator = device.allocator.as_mut().expect("allocator alive");
    let allocation = match allocator.allocate(&AllocationCreateDesc {
        name: debug_name.unwrap_or(""),
        requirements,
        location: memory_location(memory_properties),
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
        Ok(allocation) => allocation,
        Err(err) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            recoverable!(
                GpuError::AllocationFailed(err.to_string()),
                "failed to allocate buffer memory: {err}"
            );
        }
    };

    if let Err(err) = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    } {
        let _ = device.allocator.as_mut().expect("allocator alive").free(allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        recoverable!(
            GpuError::CreationFailed("buffer"),
            "failed to bind buffer memory: {err}"
        );
    }

    let gpu_address = if usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
        let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { device.buffer_device_address.get_buffer_device_address(&address_info) }
    } else {
        0
    };

    let cpu_ptr = if host_visible {
        match allocation.mapped_ptr() {
            Some(ptr) => ptr.as_ptr() as *mut u8,
            None => {
                let record = BufferRecord {
                    buffer,
                    allocation: Some(allocation),
                    size: padded_size,
                    cpu_ptr: std::ptr::null_mut(),
                    gpu_address,
                };
                destroy_internal_buffer(device, record);
                recoverable!(
                    GpuError::CreationFailed("buffer"),
                    "failed to map buffer memory"
                );
            }
        }
    } else {
        std::ptr::null_mut()
    };

    Ok(BufferRecord {
        buffer,
        allocation: Some(allocation),
        size: padded_size,
        cpu_ptr,
        gpu_address,
    })
}

pub(crate) fn destroy_internal_buffer(device: &mut Device, mut record: BufferRecord) {
    if let Some(allocation) = record.allocation.take() {
        let _ = device.allocator.as_mut().expect("allocator alive").free(allocation);
    }
    unsafe { device.device.destroy_buffer(record.buffer, None) };
}

impl Context {
    pub fn create_buffer(&mut self, create_info: &BufferCreateInfo) -> GpuResult<Buffer> {
        assert!(create_info.size > 0);

        let record = create_internal_buffer(
            &mut self.device,
            create_info.usage,
            create_info.memory_properties,
            create_info.size,
            create_info.alignment as u64,
            create_info.debug_name,
            0,
        )?;

        if let Some(name) = create_info.debug_name {
            self.set_object_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(record.buffer), name);
        }

        let handle = self.buffers.allocate();
        self.buffers.insert(handle, record);

        Ok(Buffer(handle))
    }

    pub fn destroy_buffer(&mut self, buffer: Buffer) {
        let Some(record) = self.buffers.free(buffer.0) else {
            fatal!("invalid handle!");
        };
        destroy_internal_buffer(&mut self.device, record);
    }

    /// Persistently mapped pointer of a host-visible buffer; null otherwise.
    pub fn get_buffer_cpu_ptr(&self, buffer: Buffer) -> *mut u8 {
        let record = resolve!(self, buffers, buffer);
        record.cpu_ptr
    }

    /// Cached GPU address; 0 unless the buffer was created with
    /// [`BufferUsage::SHADER_DEVICE_ADDRESS`].
    pub fn get_buffer_gpu_address(&self, buffer: Buffer) -> u64 {
        let record = resolve!(self, buffers, buffer);
        record.gpu_address
    }

    pub fn get_buffer_size(&self, buffer: Buffer) -> u64 {
        let record = resolve!(self, buffers, buffer);
        record.size
    }

    pub fn flush_mapped_memory(&self, buffer: Buffer, offset: u64, size: u64) -> GpuResult<()> {
        let range = self.mapped_memory_range(buffer, offset, size);
        if let Err(err) = unsafe { self.device.device.flush_mapped_memory_ranges(&[range]) } {
            recoverable!(
                GpuError::AllocationFailed(err.to_string()),
                "failed to flush mapped memory: {err}"
            );
        }
        Ok(())
    }

    pub fn invalidate_mapped_memory(
        &self,
        buffer: Buffer,
        offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        let range = self.mapped_memory_range(buffer, offset, size);
        if let Err(err) = unsafe { self.device.device.invalidate_mapped_memory_ranges(&[range]) } {
            recoverable!(
                GpuError::AllocationFailed(err.to_string()),
                "failed to invalidate mapped memory: {err}"
            );
        }
        Ok(())
    }

    fn mapped_memory_range(&self, buffer: Buffer, offset: u64, size: u64) -> vk::MappedMemoryRange {
        let record = resolve!(self, buffers, buffer);
        let allocation = record.allocation.as_ref().expect("allocation alive");

        let atom = self.device.internal_properties.non_coherent_atom_size.max(1);
        let begin = allocation.offset() + offset;
        let aligned_begin = begin & !(atom - 1);

        let range_size = if size == WHOLE_SIZE || size >= record.size.saturating_sub(offset) {
            vk::WHOLE_SIZE
        } else {
            align_up(begin + size - aligned_begin, atom)
        };

        vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(aligned_begin)
            .size(range_size)
    }
}
