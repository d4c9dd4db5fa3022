// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::memory::find_memory_type;

pub const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn depth_format(dev: &DeviceContext) -> Result<vk::Format, VkError> {
    dev.find_supported_format(
        &DEPTH_CANDIDATES,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    )
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT
    )
}

/// floor(log2(max(w, h))) + 1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Mip generation blits with a linear filter; the format has to allow it.
pub fn check_linear_blit(
    format: vk::Format,
    props: vk::FormatProperties,
) -> Result<(), VkError> {
    if props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    {
        Ok(())
    } else {
        Err(VkError::UnsupportedBlitFormat { format })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// Device-local 2D image, its memory and a view over every mip level.
pub struct GpuImage {
    pub(crate) device: ash::Device,
    pub(crate) image: vk::Image,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) view: vk::ImageView,
    pub(crate) desc: ImageDesc,
}

impl GpuImage {
    pub fn new(dev: &DeviceContext, desc: ImageDesc) -> Result<Self> {
        let device = &dev.device;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&info, None) }.with_context(|| {
            format!(
                "create_image({}x{} {:?}, {} mips)",
                desc.extent.width, desc.extent.height, desc.format, desc.mip_levels
            )
        })?;

        let mut out = Self {
            device: device.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            desc,
        };

        let req = unsafe { device.get_image_memory_requirements(image) };
        let type_index = find_memory_type(
            &dev.memory_properties,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(type_index);
        out.memory = unsafe { device.allocate_memory(&alloc, None) }.with_context(|| {
            format!("allocate_memory({} bytes for {:?} image)", req.size, desc.format)
        })?;
        unsafe { device.bind_image_memory(image, out.memory, 0) }.context("bind_image_memory")?;

        out.view = create_view(device, image, desc.format, desc.aspect, desc.mip_levels)?;
        Ok(out)
    }

    pub fn depth(dev: &DeviceContext, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil_component(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        Self::new(
            dev,
            ImageDesc {
                extent,
                format,
                mip_levels: 1,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect,
            },
        )
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

pub(crate) fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&info, None) }.context("create_image_view")
}

/// Sampled texture: image with all mips in SHADER_READ_ONLY_OPTIMAL plus its sampler.
pub struct Texture {
    pub(crate) image: GpuImage,
    pub(crate) sampler: vk::Sampler,
}

impl Texture {
    pub(crate) fn new(dev: &DeviceContext, image: GpuImage) -> Result<Self> {
        let sampler = create_sampler(dev, image.mip_levels())?;
        Ok(Self { image, sampler })
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels()
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.image.device.destroy_sampler(self.sampler, None) };
    }
}

fn create_sampler(dev: &DeviceContext, mip_levels: u32) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(dev.max_anisotropy.is_some())
        .max_anisotropy(dev.max_anisotropy.unwrap_or(1.0))
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .mip_lod_bias(0.0);
    unsafe { dev.device.create_sampler(&info, None) }.context("create_sampler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_counts() {
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(300, 200), 9);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(1, 512), 10);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn blit_requires_linear_filter_support() {
        let ok = vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
            ..Default::default()
        };
        assert!(check_linear_blit(vk::Format::R8G8B8A8_SRGB, ok).is_ok());

        // linear tiling support does not count
        let linear_only = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
            ..Default::default()
        };
        let err = check_linear_blit(vk::Format::R8G8B8A8_SRGB, linear_only).unwrap_err();
        assert!(matches!(
            err,
            VkError::UnsupportedBlitFormat {
                format: vk::Format::R8G8B8A8_SRGB
            }
        ));
    }

    #[test]
    fn stencil_formats() {
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
        assert!(has_stencil_component(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
    }
}
