// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use volcanic_math::FrameTransforms;
use volcanic_render::{FrameStatus, RenderSize, Renderer, SceneAssets, ShaderBytecode};

use crate::device::{probe_candidates, DeviceContext};
use crate::frame::FrameSynchronizer;
use crate::image::Texture;
use crate::instance::{InstanceContext, ValidationMode};
use crate::pipeline::{DescriptorBundle, PipelineBundle};
use crate::select::{select_device, DeviceRequirements};
use crate::swapchain::{Acquired, PresentPreference, SwapchainManager};
use crate::transfer::{MeshBuffers, TransferEngine};

#[derive(Clone, Debug)]
pub struct VkConfig {
    pub validation: ValidationMode,
    pub present: PresentPreference,
    pub frames_in_flight: usize,
    pub generate_mipmaps: bool,
    pub require_geometry_shader: bool,
    /// Bound on per-frame fence waits and image acquisition.
    pub fence_timeout: Duration,
    /// Bound on each startup upload.
    pub upload_timeout: Duration,
    pub clear_color: [f32; 4],
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            validation: ValidationMode::default(),
            present: PresentPreference::LowLatency,
            frames_in_flight: 2,
            generate_mipmaps: true,
            require_geometry_shader: false,
            fence_timeout: Duration::from_secs(1),
            upload_timeout: Duration::from_secs(10),
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

// STRICT TEARDOWN ORDER is the field order below:
// - frame slots (fences, semaphores, command pool, uniforms)
// - swapchain bundle (framebuffers, views, swapchain, depth)
// - pipeline + render pass
// - descriptors, texture, mesh, transfer pools
// - device, then surface + messenger + instance
// Drop only has to idle the device first.
pub struct VkRenderer {
    frames: FrameSynchronizer,
    swapchain: SwapchainManager,
    pipeline: Option<PipelineBundle>,
    descriptors: DescriptorBundle,
    texture: Texture,
    mesh: MeshBuffers,
    transfer: TransferEngine,
    device: DeviceContext,
    instance: InstanceContext,

    shaders: ShaderBytecode,
    clear: [f32; 4],
    paused: bool,
    started: Instant,
}

impl VkRenderer {
    pub fn with_config(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        assets: SceneAssets<'_>,
        cfg: VkConfig,
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) instance + surface
        // 2) pick device against THAT surface, then create it
        // 3) swapchain (needs the device's present queue family)
        // 4) uploads, frame slots, descriptors (swapchain independent)
        // 5) pipeline + framebuffers (need swapchain format/extent + descriptor layout)

        // --- Platform handles (can fail on some backends) ---
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();

        let instance = InstanceContext::with_surface(dh, wh, cfg.validation)?;

        // --- Device ---
        let candidates = probe_candidates(&instance)?;
        let req = DeviceRequirements::windowed(cfg.require_geometry_shader);
        let selected = select_device(&candidates, &req)?;
        let device = DeviceContext::new(&instance, &selected, &req)?;

        // --- Swapchain ---
        let mut swapchain = SwapchainManager::new(&instance, &device, size, cfg.present)
            .context("initial swapchain")?;

        // --- Resources ---
        let transfer = TransferEngine::new(&device, cfg.upload_timeout)?;
        let mesh = transfer.upload_mesh(&device, assets.mesh)?;
        let texture = transfer.upload_image(&device, &assets.texture, cfg.generate_mipmaps)?;

        let image_count = swapchain.bundle().map_or(0, |b| b.image_count());
        let frames =
            FrameSynchronizer::new(&device, cfg.frames_in_flight, image_count, cfg.fence_timeout)?;
        let descriptors = DescriptorBundle::new(&device, &frames.uniform_buffers(), &texture)?;

        // --- Pipeline + framebuffers ---
        let depth_format = swapchain.depth_format();
        let bundle = swapchain
            .bundle_mut()
            .context("swapchain missing after creation")?;
        let pipeline = PipelineBundle::new(
            &device,
            bundle.format(),
            depth_format,
            bundle.extent(),
            descriptors.layout,
            assets.shaders,
        )?;
        bundle.attach_framebuffers(pipeline.render_pass)?;

        info!(
            "vk: renderer ready on '{}' ({} frames in flight)",
            device.name(),
            cfg.frames_in_flight
        );

        Ok(Self {
            frames,
            swapchain,
            pipeline: Some(pipeline),
            descriptors,
            texture,
            mesh,
            transfer,
            device,
            instance,
            shaders: assets.shaders.clone(),
            clear: cfg.clear_color,
            paused: size.is_zero(),
            started: Instant::now(),
        })
    }

    pub fn set_present_preference(&mut self, preference: PresentPreference) {
        self.swapchain.set_preference(preference);
    }

    pub fn swapchain_rebuilds(&self) -> u64 {
        self.swapchain.lifecycle().rebuilds()
    }

    pub fn texture_mip_levels(&self) -> u32 {
        self.texture.mip_levels()
    }

    /// For uploads after startup.
    pub fn uploader(&self) -> (&TransferEngine, &DeviceContext) {
        (&self.transfer, &self.device)
    }

    // STRICT ORDER (recreate):
    // 1) device_wait_idle(): nothing may still use the old images
    // 2) framebuffers -> views -> swapchain (bundle drop)
    // 3) pipeline + render pass
    // 4) new swapchain (old_swapchain = null), views, depth
    // 5) new pipeline, then framebuffers against its render pass
    // 6) forget which slot owned which image
    fn rebuild_swapchain(&mut self) -> Result<bool> {
        self.device.wait_idle()?;
        self.swapchain.teardown();
        self.pipeline = None;

        // false: zero extent or a retryable creation failure; still Stale
        if !self.swapchain.build(&self.instance, &self.device)? {
            return Ok(false);
        }

        let depth_format = self.swapchain.depth_format();
        let bundle = self
            .swapchain
            .bundle_mut()
            .context("swapchain missing after rebuild")?;
        let pipeline = PipelineBundle::new(
            &self.device,
            bundle.format(),
            depth_format,
            bundle.extent(),
            self.descriptors.layout,
            &self.shaders,
        )?;
        bundle.attach_framebuffers(pipeline.render_pass)?;
        self.frames.reset_images(bundle.image_count());
        self.pipeline = Some(pipeline);

        info!(
            "vk: swapchain rebuilt (#{})",
            self.swapchain.lifecycle().rebuilds()
        );
        Ok(true)
    }

    fn rebuild_status(&mut self) -> Result<FrameStatus> {
        Ok(if self.rebuild_swapchain()? {
            FrameStatus::Recreated
        } else {
            FrameStatus::Skipped
        })
    }

    fn record(&self, cmd: vk::CommandBuffer, image_index: usize) -> Result<()> {
        let bundle = self.swapchain.bundle().context("no swapchain")?;
        let pipeline = self.pipeline.as_ref().context("no pipeline")?;
        let framebuffer = *bundle
            .framebuffers
            .get(image_index)
            .context("acquired image has no framebuffer")?;
        let d = &self.device.device;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(pipeline.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: bundle.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            d.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            d.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertex.handle()], &[0]);
            d.cmd_bind_index_buffer(cmd, self.mesh.index.handle(), 0, vk::IndexType::UINT32);
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[self.descriptors.set(self.frames.current_index())],
                &[],
            );
            d.cmd_draw_indexed(cmd, self.mesh.index_count, 1, 0, 0, 0);
            d.cmd_end_render_pass(cmd);
            d.end_command_buffer(cmd).context("end_command_buffer")?;
        }
        Ok(())
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        // Fields then drop in declaration order.
        unsafe { self.device.device.device_wait_idle() }.ok();
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        assets: SceneAssets<'_>,
    ) -> Result<Self> {
        Self::with_config(window, display, size, assets, VkConfig::default())
    }

    fn set_vsync(&mut self, on: bool) {
        self.set_present_preference(if on {
            PresentPreference::Fifo
        } else {
            PresentPreference::LowLatency
        });
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_zero() {
            if !self.paused {
                info!("vk: resize to {}x{} → paused=true", size.width, size.height);
            }
            self.paused = true;
            return Ok(());
        }
        if self.paused {
            info!(
                "vk: resize to {}x{} → paused=false",
                size.width, size.height
            );
        }
        self.paused = false;
        // Rebuilt lazily on the next frame; later resizes overwrite the size.
        self.swapchain.mark_stale(Some(size));
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        // Command buffers are re-recorded every frame.
        self.clear = rgba;
    }

    // STRICT PER-FRAME ORDER:
    // 1) wait current slot fence (timeout → skip)
    // 2) acquire with the slot's image-available semaphore
    // 3) wait on whichever slot last rendered into the acquired image
    // 4) write uniforms
    // 5) record
    // 6) reset fence, submit
    // 7) present, advance slot
    fn render(&mut self) -> Result<FrameStatus> {
        if self.paused {
            return Ok(FrameStatus::Skipped);
        }

        // 0) pending rebuild first
        if self.swapchain.lifecycle().is_stale() || self.swapchain.bundle().is_none() {
            return self.rebuild_status();
        }

        // 1)
        if !self.frames.wait_current()? {
            debug!("vk: frame slot {} still busy, skipping", self.frames.current_index());
            return Ok(FrameStatus::Skipped);
        }

        // 2)
        let signal = self.frames.current_slot().image_available;
        let (index, suboptimal) = match self.swapchain.acquire(signal, self.frames.timeout_ns())? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::Stale => return self.rebuild_status(),
        };

        // 3)
        self.frames.claim_image(index as usize)?;

        // 4)
        let extent = self
            .swapchain
            .bundle()
            .map(|b| b.extent())
            .context("no swapchain")?;
        let transforms = FrameTransforms::spinning(
            self.started.elapsed().as_secs_f32(),
            extent.width as f32 / extent.height.max(1) as f32,
        );
        self.frames.current_slot().write_transforms(&transforms)?;

        // 5)
        let cmd = self.frames.begin_recording()?;
        self.record(cmd, index as usize)?;

        // 6)
        self.frames.submit(self.device.graphics_queue, cmd)?;

        // 7)
        let wait = self.frames.current_slot().render_finished;
        let present_stale = self
            .swapchain
            .present(self.device.present_queue, wait, index)?;
        self.frames.advance();

        if present_stale || suboptimal {
            self.swapchain.mark_stale(None);
            return self.rebuild_status();
        }
        Ok(FrameStatus::Presented)
    }
}
