// SPDX-License-Identifier: CEPL-1.0
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use volcanic_platform::WindowSpec;
use volcanic_render_vk::{PresentPreference, ValidationMode, VkConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "volcanic.toml")]
    pub config: PathBuf,
    /// Validation layer: off | auto | required
    #[arg(long, value_enum)]
    pub validation: Option<ValidationCfg>,
    #[arg(long)]
    pub frames_in_flight: Option<usize>,
    /// Present mode: fifo | mailbox
    #[arg(long, value_enum)]
    pub vsync_mode: Option<VsyncMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCfg {
    Off,
    Auto,
    Required,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowCfg {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    #[serde(default)]
    pub vsync_mode: VsyncMode,
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// Unset means on in debug builds, off in release.
    #[serde(default)]
    pub validation: Option<ValidationCfg>,
    #[serde(default = "default_true")]
    pub mipmaps: bool,
    #[serde(default)]
    pub require_geometry_shader: bool,
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
}

/// SPIR-V files that replace the built-in shaders, per stage.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ShaderCfg {
    #[serde(default)]
    pub vertex: Option<PathBuf>,
    #[serde(default)]
    pub fragment: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub window: WindowCfg,
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub shaders: ShaderCfg,
}

impl Default for WindowCfg {
    fn default() -> Self {
        let spec = WindowSpec::default();
        WindowCfg {
            title: spec.title,
            width: spec.width,
            height: spec.height,
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync_mode: VsyncMode::Mailbox,
            frames_in_flight: default_frames_in_flight(),
            validation: None,
            mipmaps: true,
            require_geometry_shader: false,
            fence_timeout_ms: default_fence_timeout_ms(),
        }
    }
}

fn default_title() -> String {
    WindowSpec::default().title
}
fn default_width() -> u32 {
    WindowSpec::default().width
}
fn default_height() -> u32 {
    WindowSpec::default().height
}
fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}
fn default_frames_in_flight() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_fence_timeout_ms() -> u64 {
    1000
}

pub fn parse_cfg(src: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(src)
}

/// A missing file means defaults; a broken one is reported and also means defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config ← {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("config {} ignored: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("no {}, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("config {} unreadable: {e}", path.display());
            AppCfg::default()
        }
    }
}

impl AppCfg {
    /// Command-line flags win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(v) = args.validation {
            self.render.validation = Some(v);
        }
        if let Some(n) = args.frames_in_flight {
            self.render.frames_in_flight = n;
        }
        if let Some(m) = args.vsync_mode {
            self.render.vsync_mode = m;
        }
    }

    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
        }
    }

    pub fn vk_config(&self) -> VkConfig {
        let r = &self.render;
        if r.frames_in_flight == 0 {
            warn!("frames_in_flight = 0 → 1");
        }
        VkConfig {
            validation: match r.validation {
                None => ValidationMode::default(),
                Some(ValidationCfg::Off) => ValidationMode::Off,
                Some(ValidationCfg::Auto) => ValidationMode::Auto,
                Some(ValidationCfg::Required) => ValidationMode::Required,
            },
            present: match r.vsync_mode {
                VsyncMode::Fifo => PresentPreference::Fifo,
                VsyncMode::Mailbox => PresentPreference::LowLatency,
            },
            frames_in_flight: r.frames_in_flight.max(1),
            generate_mipmaps: r.mipmaps,
            require_geometry_shader: r.require_geometry_shader,
            fence_timeout: Duration::from_millis(r.fence_timeout_ms.max(1)),
            clear_color: r.clear_color,
            ..VkConfig::default()
        }
    }
}
