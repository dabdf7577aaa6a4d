//! Buffers, images, and samplers over direct Metal allocations.

use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::NSString;
use objc2_metal as mtl;
use objc2_metal::{MTLBuffer, MTLDevice, MTLResource, MTLTexture};

use super::{resolve, Context};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::limits::{align_up, BUFFER_BASE_ALIGNMENT};
use crate::{
    Buffer, BufferCreateInfo, Image, ImageCreateInfo, ImageFormat, ImageUsage, Sampler,
    SamplerAddressMode, SamplerCreateInfo,
};

pub(crate) struct BufferRecord {
    pub buffer: Retained<ProtocolObject<dyn mtl::MTLBuffer>>,
    pub size: u64,
}

pub(crate) struct ImageRecord {
    pub texture: Retained<ProtocolObject<dyn mtl::MTLTexture>>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: ImageFormat,
}

pub(crate) struct SamplerRecord {
    pub sampler: Retained<ProtocolObject<dyn mtl::MTLSamplerState>>,
}

/// Closed format subset; anything else is unsupported by this backend.
pub(crate) fn translate_image_format(format: ImageFormat) -> mtl::MTLPixelFormat {
    match format {
        ImageFormat::R8g8b8a8Unorm => mtl::MTLPixelFormat::RGBA8Unorm,
        ImageFormat::R16g16b16a16Sfloat => mtl::MTLPixelFormat::RGBA16Float,
        ImageFormat::R32Sfloat => mtl::MTLPixelFormat::R32Float,
        _ => fatal!("unsupported image format"),
    }
}

fn translate_address_mode(mode: SamplerAddressMode) -> mtl::MTLSamplerAddressMode {
    match mode {
        SamplerAddressMode::ClampToEdge => mtl::MTLSamplerAddressMode::ClampToEdge,
        SamplerAddressMode::Repeat => mtl::MTLSamplerAddressMode::Repeat,
        SamplerAddressMode::MirrorRepeat => mtl::MTLSamplerAddressMode::MirrorRepeat,
        SamplerAddressMode::ClampToBlack => mtl::MTLSamplerAddressMode::ClampToBorderColor,
    }
}

pub(crate) fn create_internal_buffer(
    device: &super::Device,
    size: u64,
    debug_name: Option<&str>,
) -> GpuResult<BufferRecord> {
    let padded_size = align_up(size, BUFFER_BASE_ALIGNMENT);

    // Unified memory: every buffer is shared and persistently mapped.
    let options = mtl::MTLResourceOptions::MTLResourceStorageModeShared;
    let Some(buffer) = (unsafe {
        device.device.newBufferWithLength_options(padded_size as usize, options)
    }) else {
        recoverable!(
            GpuError::CreationFailed("buffer"),
            "failed to create buffer"
        );
    };

    if let Some(name) = debug_name {
        buffer.setLabel(Some(&NSString::from_str(name)));
    }

    device.make_resident(buffer.as_ref().as_ref());

    Ok(BufferRecord {
        buffer,
        size: padded_size,
    })
}

impl Context {
    pub fn create_buffer(&mut self, create_info: &BufferCreateInfo) -> GpuResult<Buffer> {
        assert!(create_info.size > 0);

        let record =
            create_internal_buffer(&self.device, create_info.size, create_info.debug_name)?;

        let handle = self.buffers.allocate();
        self.buffers.insert(handle, record);

        Ok(Buffer(handle))
    }

    pub fn destroy_buffer(&mut self, buffer: Buffer) {
        let Some(record) = self.buffers.free(buffer.0) else {
            fatal!("invalid handle!");
        };
        self.device.evict(record.buffer.as_ref().as_ref());
    }

    pub fn get_buffer_cpu_ptr(&self, buffer: Buffer) -> *mut u8 {
        let record = resolve!(self, buffers, buffer);
        record.buffer.contents().as_ptr() as *mut u8
    }

    pub fn get_buffer_gpu_address(&self, buffer: Buffer) -> u64 {
        let record = resolve!(self, buffers, buffer);
        unsafe { record.buffer.gpuAddress() }
    }

    pub fn get_buffer_size(&self, buffer: Buffer) -> u64 {
        let record = resolve!(self, buffers, buffer);
        record.size
    }

    /// Shared storage mode is always coherent.
    pub fn flush_mapped_memory(&self, _buffer: Buffer, _offset: u64, _size: u64) -> GpuResult<()> {
        Ok(())
    }

    pub fn invalidate_mapped_memory(
        &self,
        _buffer: Buffer,
        _offset: u64,
        _size: u64,
    ) -> GpuResult<()> {
        Ok(())
    }

    pub fn create_image(&mut self, create_info: &ImageCreateInfo) -> GpuResult<Image> {
        let descriptor = unsafe { mtl::MTLTextureDescriptor::new() };
        let depth = if create_info.is_3d { create_info.depth } else { 1 };

        unsafe {
            descriptor.setTextureType(if create_info.is_3d {
                mtl::MTLTextureType::Type3D
            } else {
                mtl::MTLTextureType::Type2D
            });
            descriptor.setPixelFormat(translate_image_format(create_info.format));
            descriptor.setWidth(create_info.width as usize);
            descriptor.setHeight(create_info.height as usize);
            descriptor.setDepth(depth as usize);
            descriptor.setMipmapLevelCount(1);
            descriptor.setArrayLength(1);
            descriptor.setStorageMode(mtl::MTLStorageMode::Private);

            let mut usage = mtl::MTLTextureUsage::empty();
            if create_info.usage.contains(ImageUsage::SAMPLED) {
                usage |= mtl::MTLTextureUsage::ShaderRead;
            }
            if create_info.usage.contains(ImageUsage::STORAGE) {
                usage |= mtl::MTLTextureUsage::ShaderRead | mtl::MTLTextureUsage::ShaderWrite;
            }
            descriptor.setUsage(usage);
        }

        let Some(texture) = (unsafe { self.device.device.newTextureWithDescriptor(&descriptor) })
        else {
            recoverable!(
                GpuError::CreationFailed("image"),
                "failed to create texture"
            );
        };

        if let Some(name) = create_info.debug_name {
            texture.setLabel(Some(&NSString::from_str(name)));
        }

        self.device.make_resident(texture.as_ref().as_ref());

        let handle = self.images.allocate();
        self.images.insert(
            handle,
            ImageRecord {
                texture,
                width: create_info.width,
                height: create_info.height,
                depth,
                format: create_info.format,
            },
        );

        Ok(Image(handle))
    }

    pub fn destroy_image(&mut self, image: Image) {
        let Some(record) = self.images.free(image.0) else {
            fatal!("invalid handle!");
        };
        self.device.evict(record.texture.as_ref().as_ref());
    }

    pub fn create_sampler(&mut self, create_info: &SamplerCreateInfo) -> GpuResult<Sampler> {
        let clamp_to_black = create_info.address_mode_u == SamplerAddressMode::ClampToBlack
            || create_info.address_mode_v == SamplerAddressMode::ClampToBlack
            || create_info.address_mode_w == SamplerAddressMode::ClampToBlack;

        let descriptor = unsafe { mtl::MTLSamplerDescriptor::new() };
        unsafe {
            descriptor.setMinFilter(mtl::MTLSamplerMinMagFilter::Linear);
            descriptor.setMagFilter(mtl::MTLSamplerMinMagFilter::Linear);
            descriptor.setMipFilter(mtl::MTLSamplerMipFilter::Linear);
            descriptor.setSAddressMode(translate_address_mode(create_info.address_mode_u));
            descriptor.setTAddressMode(translate_address_mode(create_info.address_mode_v));
            descriptor.setRAddressMode(translate_address_mode(create_info.address_mode_w));
            descriptor.setBorderColor(if clamp_to_black {
                mtl::MTLSamplerBorderColor::OpaqueBlack
            } else {
                mtl::MTLSamplerBorderColor::TransparentBlack
            });
            descriptor.setNormalizedCoordinates(true);
            descriptor.setSupportArgumentBuffers(true);
        }

        let Some(sampler) =
            (unsafe { self.device.device.newSamplerStateWithDescriptor(&descriptor) })
        else {
            recoverable!(
                GpuError::CreationFailed("sampler"),
                "failed to create sampler"
            );
        };

        let handle = self.samplers.allocate();
        self.samplers.insert(handle, SamplerRecord { sampler });

        Ok(Sampler(handle))
    }

    pub fn destroy_sampler(&mut self, sampler: Sampler) {
        if self.samplers.free(sampler.0).is_none() {
            fatal!("invalid handle!");
        }
    }
}
