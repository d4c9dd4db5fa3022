// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, ensure, Context, Result};
use ash::util::read_spv;
use ash::vk;
use std::fs::File;
use std::io::Cursor;
use std::mem::{offset_of, size_of};
use std::path::Path;
use volcanic_math::FrameTransforms;
use volcanic_render::{ShaderBytecode, Vertex};

use crate::device::DeviceContext;
use crate::image::Texture;

/// Read a SPIR-V module from disk.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        File::open(path).with_context(|| format!("open shader {}", path.display()))?;
    read_spv(&mut file).with_context(|| format!("{} is not valid SPIR-V", path.display()))
}

pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    read_spv(&mut Cursor::new(bytes)).context("invalid SPIR-V")
}

pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 3] {
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, pos) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(Vertex, color) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 2,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(Vertex, tex_coord) as u32,
        },
    ]
}

fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref)
        .depth_stencil_attachment(&depth_ref)];

    // The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT, so the
    // layout transition has to wait there as well.
    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }.context("create_render_pass")
}

fn create_shader_module(device: &ash::Device, words: &[u32]) -> Result<vk::ShaderModule> {
    ensure!(!words.is_empty(), "empty shader module");
    let info = vk::ShaderModuleCreateInfo::default().code(words);
    unsafe { device.create_shader_module(&info, None) }.context("create_shader_module")
}

/// Render pass, pipeline layout and graphics pipeline for one swapchain
/// configuration. Viewport and scissor are baked in, so it is rebuilt with
/// the swapchain.
pub struct PipelineBundle {
    device: ash::Device,
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) pipeline: vk::Pipeline,
}

impl PipelineBundle {
    pub fn new(
        dev: &DeviceContext,
        color_format: vk::Format,
        depth_format: vk::Format,
        extent: vk::Extent2D,
        set_layout: vk::DescriptorSetLayout,
        shaders: &ShaderBytecode,
    ) -> Result<Self> {
        let device = &dev.device;
        let mut out = Self {
            device: device.clone(),
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };
        out.render_pass = create_render_pass(device, color_format, depth_format)?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        out.layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("create_pipeline_layout")?;

        // --- Shader modules (destroyed before return) ---
        let vs = create_shader_module(device, &shaders.vertex).context("vertex shader")?;
        let fs = match create_shader_module(device, &shaders.fragment) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_shader_module(vs, None) };
                return Err(e.context("fragment shader"));
            }
        };
        let res = out.create_pipeline(vs, fs, extent);
        unsafe {
            device.destroy_shader_module(vs, None);
            device.destroy_shader_module(fs, None);
        }
        out.pipeline = res?;
        Ok(out)
    }

    fn create_pipeline(
        &self,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
        extent: vk::Extent2D,
    ) -> Result<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs)
                .name(c"main"),
        ];

        // --- Fixed-function pipeline states ---
        let bindings = [vertex_binding()];
        let attributes = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
            blend_enable: vk::FALSE,
            ..Default::default()
        }];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .layout(self.layout)
            .render_pass(self.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;
        pipelines
            .into_iter()
            .next()
            .context("create_graphics_pipelines returned nothing")
    }
}

impl Drop for PipelineBundle {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Set layout (binding 0 uniform, binding 1 sampler), a pool and one set per frame slot.
/// Independent of the swapchain.
pub struct DescriptorBundle {
    device: ash::Device,
    pub(crate) layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub(crate) sets: Vec<vk::DescriptorSet>,
}

impl DescriptorBundle {
    pub fn new(dev: &DeviceContext, uniforms: &[vk::Buffer], texture: &Texture) -> Result<Self> {
        let device = &dev.device;
        let count = uniforms.len() as u32;
        ensure!(count > 0, "descriptor sets need at least one frame slot");

        let mut out = Self {
            device: device.clone(),
            layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
        };

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        out.layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .context("create_descriptor_set_layout")?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: count,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: count,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(count);
        out.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .context("create_descriptor_pool")?;

        let layouts = vec![out.layout; count as usize];
        let alloc = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(out.pool)
            .set_layouts(&layouts);
        out.sets = unsafe { device.allocate_descriptor_sets(&alloc) }
            .context("allocate_descriptor_sets")?;

        for (&set, &uniform) in out.sets.iter().zip(uniforms) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniform,
                offset: 0,
                range: size_of::<FrameTransforms>() as vk::DeviceSize,
            }];
            let image_info = [vk::DescriptorImageInfo {
                sampler: texture.sampler(),
                image_view: texture.view(),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let writes = [
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info),
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_info),
            ];
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
        Ok(out)
    }

    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot]
    }
}

impl Drop for DescriptorBundle {
    fn drop(&mut self) {
        unsafe {
            // Sets are freed with the pool.
            self.device.destroy_descriptor_pool(self.pool, None);
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_input_matches_vertex_struct() {
        let b = vertex_binding();
        assert_eq!(b.stride, 32);
        assert_eq!(b.input_rate, vk::VertexInputRate::VERTEX);

        let attrs = vertex_attributes();
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        assert_eq!(attrs[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attrs[2].format, vk::Format::R32G32_SFLOAT);
        assert!(attrs.iter().enumerate().all(|(i, a)| a.location == i as u32));
    }

    #[test]
    fn spirv_bytes_are_checked() {
        // magic number, little endian, followed by one word
        let ok = [0x03u8, 0x02, 0x23, 0x07, 0, 0, 1, 0];
        assert_eq!(spirv_from_bytes(&ok).unwrap(), vec![0x0723_0203, 0x0001_0000]);
        assert!(spirv_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn missing_shader_file_names_the_path() {
        let err = load_spirv(Path::new("/nonexistent/mesh.vert.spv")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/mesh.vert.spv"));
    }
}
