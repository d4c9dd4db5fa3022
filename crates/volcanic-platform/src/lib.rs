// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use anyhow::{Context, Result};
use volcanic_render::RenderSize;
use winit::{dpi::PhysicalSize, event_loop::ActiveEventLoop, window::Window};

#[derive(Clone, Debug)]
pub struct WindowSpec {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            title: "Volcanic Engine".to_string(),
            width: 800,
            height: 600,
        }
    }
}

pub fn create_window(event_loop: &ActiveEventLoop, spec: &WindowSpec) -> Result<Window> {
    let attrs = Window::default_attributes()
        .with_title(spec.title.clone())
        .with_inner_size(PhysicalSize::new(spec.width.max(1), spec.height.max(1)));
    let window = event_loop.create_window(attrs).context("create_window")?;
    tracing::info!(
        "window '{}' requested {}x{}",
        spec.title,
        spec.width,
        spec.height
    );
    Ok(window)
}

/// Current drawable size in pixels; zero while minimized on some platforms.
pub fn framebuffer_size(window: &Window) -> RenderSize {
    to_render_size(window.inner_size())
}

pub fn to_render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}
