// SPDX-License-Identifier: CEPL-1.0
//! Staged uploads into device-local memory.
//!
//! Every upload follows the same protocol: fill a host-visible staging
//! buffer, record a one-shot command buffer, submit it with a fence, block on
//! the fence, then release the staging buffer. Nothing returns while the GPU
//! might still read staging memory.
//!
//! Buffer copies go to the transfer queue (a dedicated DMA family when the
//! device exposes one) and the destination is shared concurrently with the
//! graphics family. Image work stays on the graphics queue because layout
//! transitions to `SHADER_READ_ONLY_OPTIMAL` and linear blits need it.
use anyhow::{anyhow, Context, Result};
use ash::vk;
use std::time::Duration;
use tracing::{debug, info};
use volcanic_render::{MeshData, TextureData};

use crate::device::DeviceContext;
use crate::error::VkError;
use crate::image::{check_linear_blit, mip_level_count, GpuImage, ImageDesc, Texture};
use crate::memory::GpuBuffer;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lane {
    Transfer,
    Graphics,
}

pub struct MeshBuffers {
    pub vertex: GpuBuffer,
    pub index: GpuBuffer,
    pub index_count: u32,
}

/// Access masks and stages for the layout transitions uploads perform.
pub fn barrier_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Option<(
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
)> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;
    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            Some((A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER))
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            Some((A::TRANSFER_WRITE, A::TRANSFER_READ, S::TRANSFER, S::TRANSFER))
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some((
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        )),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some((
            A::TRANSFER_READ,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        )),
        _ => None,
    }
}

/// Size of mip `level`, never below one texel per side.
pub fn mip_dimensions(width: u32, height: u32, level: u32) -> (u32, u32) {
    (
        width.checked_shr(level).unwrap_or(0).max(1),
        height.checked_shr(level).unwrap_or(0).max(1),
    )
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    base_mip: u32,
    mip_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let (src_access, dst_access, src_stage, dst_stage) = barrier_masks(old, new)
        .ok_or_else(|| anyhow!("unsupported layout transition {old:?} -> {new:?}"))?;
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

// STRICT ORDER per level i >= 1:
// 1) level i-1 DST -> SRC
// 2) blit i-1 -> i (linear)
// 3) level i-1 SRC -> SHADER_READ
// then the last level DST -> SHADER_READ, since it was never a blit source.
fn record_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) -> Result<()> {
    use vk::ImageLayout as L;
    for level in 1..mip_levels {
        let (sw, sh) = mip_dimensions(width, height, level - 1);
        let (dw, dh) = mip_dimensions(width, height, level);

        transition(
            device,
            cmd,
            image,
            level - 1,
            1,
            L::TRANSFER_DST_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
        )?;

        let blit = vk::ImageBlit {
            src_subresource: color_layers(level - 1),
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: sw as i32,
                    y: sh as i32,
                    z: 1,
                },
            ],
            dst_subresource: color_layers(level),
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dw as i32,
                    y: dh as i32,
                    z: 1,
                },
            ],
        };
        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                L::TRANSFER_SRC_OPTIMAL,
                image,
                L::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        transition(
            device,
            cmd,
            image,
            level - 1,
            1,
            L::TRANSFER_SRC_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
        )?;
    }
    transition(
        device,
        cmd,
        image,
        mip_levels - 1,
        1,
        L::TRANSFER_DST_OPTIMAL,
        L::SHADER_READ_ONLY_OPTIMAL,
    )
}

/// One-shot command pools for the transfer and graphics queues.
pub struct TransferEngine {
    device: ash::Device,
    transfer_pool: vk::CommandPool,
    graphics_pool: vk::CommandPool,
    transfer_queue: vk::Queue,
    graphics_queue: vk::Queue,
    /// Families that may touch uploaded buffers.
    families: Vec<u32>,
    timeout_ns: u64,
}

impl TransferEngine {
    pub fn new(dev: &DeviceContext, timeout: Duration) -> Result<Self> {
        let graphics = dev
            .indices
            .graphics
            .context("transfer engine needs a graphics family")?;
        let transfer = dev.indices.transfer.unwrap_or(graphics);

        let mut engine = Self {
            device: dev.device.clone(),
            transfer_pool: vk::CommandPool::null(),
            graphics_pool: vk::CommandPool::null(),
            transfer_queue: dev.transfer_queue,
            graphics_queue: dev.graphics_queue,
            families: vec![graphics, transfer],
            timeout_ns: timeout.as_nanos().min(u64::MAX as u128) as u64,
        };
        engine.transfer_pool = engine.create_pool(transfer)?;
        engine.graphics_pool = engine.create_pool(graphics)?;
        debug!(
            "vk: transfer engine on families transfer={} graphics={}",
            transfer, graphics
        );
        Ok(engine)
    }

    fn create_pool(&self, family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&info, None) }
            .context("create_command_pool(transfer)")
    }

    fn lane(&self, lane: Lane) -> (vk::CommandPool, vk::Queue) {
        match lane {
            Lane::Transfer => (self.transfer_pool, self.transfer_queue),
            Lane::Graphics => (self.graphics_pool, self.graphics_queue),
        }
    }

    /// Record with `record`, submit, and block until the GPU is done with it.
    fn one_shot<F>(&self, lane: Lane, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let (pool, queue) = self.lane(lane);
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmds = unsafe { self.device.allocate_command_buffers(&alloc) }
            .context("allocate_command_buffers(one-shot)")?;

        let res = self.record_submit_wait(queue, cmds[0], record);
        unsafe { self.device.free_command_buffers(pool, &cmds) };
        res
    }

    fn record_submit_wait<F>(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin) }
            .context("begin_command_buffer(one-shot)")?;
        record(&self.device, cmd)?;
        unsafe { self.device.end_command_buffer(cmd) }.context("end_command_buffer(one-shot)")?;

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .context("create_fence(one-shot)")?;

        let cmd_list = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmd_list);
        let res = unsafe { self.device.queue_submit(queue, &[submit], fence) }
            .context("queue_submit(one-shot)")
            .and_then(|()| self.wait(fence));
        unsafe { self.device.destroy_fence(fence, None) };
        res
    }

    fn wait(&self, fence: vk::Fence) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, self.timeout_ns) } {
            Ok(()) => Ok(()),
            Err(e) => {
                // The copy may still be reading staging memory; drain before it is freed.
                unsafe { self.device.device_wait_idle() }.ok();
                if e == vk::Result::TIMEOUT {
                    Err(VkError::Timeout("upload fence").into())
                } else {
                    Err(e).context("wait_for_fences(one-shot)")
                }
            }
        }
    }

    /// Copy `bytes` into a new device-local buffer with `usage`.
    pub fn upload_buffer(
        &self,
        dev: &DeviceContext,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<GpuBuffer> {
        let size = bytes.len() as vk::DeviceSize;
        let staging = GpuBuffer::host_visible(dev, size, vk::BufferUsageFlags::TRANSFER_SRC)
            .context("staging buffer")?;
        staging.write_bytes(0, bytes)?;

        // TRANSFER_SRC keeps the contents readable back for verification.
        let dst = GpuBuffer::new(
            dev,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &self.families,
        )?;

        self.one_shot(Lane::Transfer, |device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { device.cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]) };
            Ok(())
        })?;
        debug!("vk: uploaded {} bytes ({:?})", size, usage);
        Ok(dst)
    }

    pub fn upload_mesh(&self, dev: &DeviceContext, mesh: &MeshData) -> Result<MeshBuffers> {
        mesh.validate().map_err(VkError::InvalidUpload)?;
        let vertex = self
            .upload_buffer(dev, mesh.vertex_bytes(), vk::BufferUsageFlags::VERTEX_BUFFER)
            .context("vertex buffer")?;
        let index = self
            .upload_buffer(dev, mesh.index_bytes(), vk::BufferUsageFlags::INDEX_BUFFER)
            .context("index buffer")?;
        info!(
            "vk: mesh uploaded ({} vertices, {} indices)",
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(MeshBuffers {
            vertex,
            index,
            index_count: mesh.indices.len() as u32,
        })
    }

    /// Upload RGBA8 sRGB pixels and leave every mip level shader-readable.
    pub fn upload_image(
        &self,
        dev: &DeviceContext,
        texture: &TextureData<'_>,
        generate_mips: bool,
    ) -> Result<Texture> {
        let pixels = texture.to_rgba8().map_err(VkError::from)?;
        let (width, height) = (texture.width, texture.height);
        let mip_levels = if generate_mips {
            mip_level_count(width, height)
        } else {
            1
        };
        if mip_levels > 1 {
            check_linear_blit(TEXTURE_FORMAT, dev.format_properties(TEXTURE_FORMAT))?;
        }

        let staging = GpuBuffer::host_visible(
            dev,
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )
        .context("texture staging buffer")?;
        staging.write_bytes(0, &pixels)?;

        let image = GpuImage::new(
            dev,
            ImageDesc {
                extent: vk::Extent2D { width, height },
                format: TEXTURE_FORMAT,
                mip_levels,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;

        self.one_shot(Lane::Graphics, |device, cmd| {
            use vk::ImageLayout as L;
            transition(
                device,
                cmd,
                image.image,
                0,
                mip_levels,
                L::UNDEFINED,
                L::TRANSFER_DST_OPTIMAL,
            )?;
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: color_layers(0),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    L::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            if mip_levels > 1 {
                record_mipmaps(device, cmd, image.image, width, height, mip_levels)
            } else {
                transition(
                    device,
                    cmd,
                    image.image,
                    0,
                    1,
                    L::TRANSFER_DST_OPTIMAL,
                    L::SHADER_READ_ONLY_OPTIMAL,
                )
            }
        })?;

        info!(
            "vk: texture uploaded {}x{} ({} mip levels)",
            width, height, mip_levels
        );
        Texture::new(dev, image)
    }

    /// Copy a device buffer back to host memory.
    pub fn download_buffer(&self, dev: &DeviceContext, src: &GpuBuffer) -> Result<Vec<u8>> {
        let size = src.size();
        let readback = GpuBuffer::host_visible(dev, size, vk::BufferUsageFlags::TRANSFER_DST)
            .context("readback buffer")?;
        self.one_shot(Lane::Transfer, |device, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { device.cmd_copy_buffer(cmd, src.buffer, readback.buffer, &[region]) };
            Ok(())
        })?;
        readback.read_bytes()
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.graphics_pool, None);
            self.device.destroy_command_pool(self.transfer_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_halves_down_to_one() {
        assert_eq!(mip_dimensions(300, 200, 0), (300, 200));
        assert_eq!(mip_dimensions(300, 200, 1), (150, 100));
        assert_eq!(mip_dimensions(300, 200, 7), (2, 1));
        assert_eq!(mip_dimensions(300, 200, 8), (1, 1));
        assert_eq!(mip_dimensions(1, 1, 40), (1, 1));
    }

    #[test]
    fn upload_transitions_are_known() {
        use vk::ImageLayout as L;
        for (old, new) in [
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
        ] {
            assert!(barrier_masks(old, new).is_some(), "{old:?} -> {new:?}");
        }
        assert!(barrier_masks(L::SHADER_READ_ONLY_OPTIMAL, L::UNDEFINED).is_none());
    }

    #[test]
    fn shader_read_waits_for_transfer_write() {
        let (src, dst, src_stage, dst_stage) = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
