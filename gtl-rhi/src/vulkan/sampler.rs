//! Sampler creation.

use ash::vk;

use super::{Context, SamplerRecord};
use crate::error::{fatal, recoverable, GpuError, GpuResult};
use crate::{Sampler, SamplerAddressMode, SamplerCreateInfo};

fn translate_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToBlack => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

impl Context {
    pub fn create_sampler(&mut self, create_info: &SamplerCreateInfo) -> GpuResult<Sampler> {
        // Emulate MDL's clip wrap mode if necessary; use optimal mode
        // (according to ARM) if not.
        let clamp_to_black = create_info.address_mode_u == SamplerAddressMode::ClampToBlack
            || create_info.address_mode_v == SamplerAddressMode::ClampToBlack
            || create_info.address_mode_w == SamplerAddressMode::ClampToBlack;

        let sampler_create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(translate_address_mode(create_info.address_mode_u))
            .address_mode_v(translate_address_mode(create_info.address_mode_v))
            .address_mode_w(translate_address_mode(create_info.address_mode_w))
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .compare_enable(false)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(if clamp_to_black {
                vk::BorderColor::FLOAT_OPAQUE_BLACK
            } else {
                vk::BorderColor::FLOAT_TRANSPARENT_BLACK
            })
            .unnormalized_coordinates(false);

        let sampler = match unsafe {
            self.device.device.create_sampler(&sampler_create_info, None)
        } {
            Ok(sampler) => sampler,
            Err(err) => recoverable!(
                GpuError::CreationFailed("sampler"),
                "failed to create sampler: {err}"
            ),
        };

        let handle = self.samplers.allocate();
        self.samplers.insert(handle, SamplerRecord { sampler });

        Ok(Sampler(handle))
    }

    pub fn destroy_sampler(&mut self, sampler: Sampler) {
        let Some(record) = self.samplers.free(sampler.0) else {
            fatal!("invalid handle!");
        };
        unsafe { self.device.device.destroy_sampler(record.sampler, None) };
    }
}
