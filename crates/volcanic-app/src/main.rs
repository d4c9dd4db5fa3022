// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use volcanic_core::{init_tracing, FrameCounter};
use volcanic_platform::{create_window, framebuffer_size, to_render_size};
use volcanic_render::{
    FrameStatus, MeshData, RenderSize, Renderer, SceneAssets, ShaderBytecode, TextureData,
};
use volcanic_render_vk::VkRenderer;

use volcanic_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

mod assets;
mod config;
mod shaders;

use config::{load_cfg, AppCfg, Args};
use shaders::load_shaders;

const TEXTURE_SIZE: u32 = 256;

struct App {
    cfg: AppCfg,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,

    mesh: MeshData,
    pixels: Vec<u8>,
    shaders: ShaderBytecode,

    exiting: bool,
    paused: bool,
    occluded: bool,
    fps: FrameCounter,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(cfg: AppCfg, shaders: ShaderBytecode) -> Self {
        Self {
            cfg,
            window: None,
            renderer: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            mesh: assets::textured_cube(),
            pixels: assets::checkerboard(TEXTURE_SIZE, 8),
            shaders,
            exiting: false,
            paused: false,
            occluded: false,
            fps: FrameCounter::new(Duration::from_secs(1)),
            fatal: None,
        }
    }

    /// Stop the loop; `main` returns the error once `run_app` is done.
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("fatal: {err:#}");
        self.fatal = Some(err);
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn update_paused(&mut self) {
        let now_paused = self.occluded || self.render_size.is_zero();
        if self.paused != now_paused {
            self.paused = now_paused;
            self.fps.reset(Instant::now());
            info!("paused={}", self.paused);
        }
    }

    fn create_renderer(&self, window: &Window) -> Result<VkRenderer> {
        let assets = SceneAssets {
            mesh: &self.mesh,
            texture: TextureData::rgba(&self.pixels, TEXTURE_SIZE, TEXTURE_SIZE),
            shaders: &self.shaders,
        };
        VkRenderer::with_config(
            window,
            window,
            self.render_size,
            assets,
            self.cfg.vk_config(),
        )
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match create_window(event_loop, &self.cfg.window_spec()) {
                Ok(w) => w,
                Err(e) => return self.fail(event_loop, e),
            };
            self.render_size = framebuffer_size(&window);

            match self.create_renderer(&window) {
                Ok(r) => self.renderer = Some(r),
                Err(e) => return self.fail(event_loop, e.context("vk init")),
            }
            info!(
                "resumed → {}x{} vsync_mode={:?}",
                self.render_size.width, self.render_size.height, self.cfg.render.vsync_mode
            );
            self.window = Some(window);
        }

        event_loop.set_control_flow(ControlFlow::Wait);
        self.update_paused();
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                // renderer before window: the surface refers to the window
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = to_render_size(new_size);
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                self.update_paused();

                let size = self.render_size;
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(size) {
                        return self.fail(event_loop, e);
                    }
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                self.occluded = occluded;
                info!("Occluded={occluded}");
                self.update_paused();
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let Some(r) = &mut self.renderer else {
                    return;
                };
                match r.render() {
                    // count only frames that reached the screen
                    Ok(FrameStatus::Presented) => self.fps.frame(),
                    Ok(FrameStatus::Recreated) => debug!("frame → swapchain recreated"),
                    Ok(FrameStatus::Skipped) => {}
                    Err(e) => self.fail(event_loop, e.context("render")),
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        event_loop.set_control_flow(ControlFlow::Wait);
        if self.paused {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }
        if let Some(fps) = self.fps.poll(Instant::now()) {
            info!("fps ~ {fps:.0}");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    cfg.apply_args(&args);

    let shaders = load_shaders(&cfg.shaders)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, shaders);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
