// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod mesh;
mod texture;

pub use mesh::{MeshBuilder, MeshData, Vertex};
pub use texture::{AssetError, TextureData};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// What a call to [`Renderer::render`] ended up doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The swapchain was rebuilt during this call.
    Recreated,
    /// Paused, or the frame slot was still busy when the wait timed out.
    Skipped,
}

/// SPIR-V words for the two programmable stages.
#[derive(Clone, Debug, Default)]
pub struct ShaderBytecode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

/// Everything a backend needs uploaded before the first frame.
#[derive(Clone, Copy, Debug)]
pub struct SceneAssets<'a> {
    pub mesh: &'a MeshData,
    pub texture: TextureData<'a>,
    pub shaders: &'a ShaderBytecode,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        assets: SceneAssets<'_>,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<FrameStatus>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}
