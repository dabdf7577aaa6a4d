//! Image creation and per-image layout/access tracking.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::device::Device;
use super::Context;
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::{Image, ImageCreateInfo, ImageUsage};

pub(crate) struct ImageRecord {
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Tracked for implicit transitions; the client never manages layouts.
    pub layout: vk::ImageLayout,
    pub access_mask: vk::AccessFlags2,
}

pub(crate) const IMAGE_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub(crate) fn destroy_image_record(device: &mut Device, mut record: ImageRecord) {
    unsafe { device.device.destroy_image_view(record.image_view, None) };
    if let Some(allocation) = record.allocation.take() {
        let _ = device.allocator.as_mut().expect("allocator alive").free(allocation);
    }
    unsafe { device.device.destroy_image(record.image, None) };
}

impl Context {
    pub fn create_image(&mut self, create_info: &ImageCreateInfo) -> GpuResult<Image> {
        let device = &mut self.device;

        let format = vk::Format::from_raw(create_info.format as i32);

        let mut tiling = vk::ImageTiling::OPTIMAL;
        if !create_info.is_3d
            && create_info
                .usage
                .intersects(ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST)
        {
            tiling = vk::ImageTiling::LINEAR;
        }

        let depth = if create_info.is_3d { create_info.depth } else { 1 };

        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(if create_info.is_3d {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(format)
            .extent(vk::Extent3D {
                width: create_info.width,
                height: create_info.height,
                depth,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(vk::ImageUsageFlags::from_raw(create_info.usage.bits()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = match unsafe { device.device.create_image(&image_create_info, None) } {
            Ok(image) => image,
            Err(err) => recoverable!(
                GpuError::CreationFailed("image"),
                "failed to create image: {err}"
            ),
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocator = device.allocator.as_mut().expect("allocator alive");
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: create_info.debug_name.unwrap_or(""),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.device.destroy_image(image, None) };
                recoverable!(
                    GpuError::AllocationFailed(err.to_string()),
                    "failed to allocate image memory: {err}"
                );
            }
        };

        if let Err(err) = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            let _ = device.allocator.as_mut().expect("allocator alive").free(allocation);
            unsafe { device.device.destroy_image(image, None) };
            recoverable!(
                GpuError::CreationFailed("image"),
                "failed to bind image memory: {err}"
            );
        }

        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(if create_info.is_3d {
                vk::ImageViewType::TYPE_3D
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(IMAGE_SUBRESOURCE_RANGE);

        let image_view = match unsafe { device.device.create_image_view(&view_create_info, None) } {
            Ok(view) => view,
            Err(err) => {
                let _ = device.allocator.as_mut().expect("allocator alive").free(allocation);
                unsafe { device.device.destroy_image(image, None) };
                recoverable!(
                    GpuError::CreationFailed("image view"),
                    "failed to create image view: {err}"
                );
            }
        };

        if let Some(name) = create_info.debug_name {
            self.set_object_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(image), name);
        }

        let handle = self.images.allocate();
        self.images.insert(
            handle,
            ImageRecord {
                image,
                image_view,
                allocation: Some(allocation),
                width: create_info.width,
                height: create_info.height,
                depth,
                layout: vk::ImageLayout::UNDEFINED,
                access_mask: vk::AccessFlags2::NONE,
            },
        );

        Ok(Image(handle))
    }

    pub fn destroy_image(&mut self, image: Image) {
        let Some(record) = self.images.free(image.0) else {
            fatal!("invalid handle!");
        };
        destroy_image_record(&mut self.device, record);
    }
}
