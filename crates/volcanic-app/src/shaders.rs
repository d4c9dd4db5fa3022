// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use volcanic_render::ShaderBytecode;
use volcanic_render_vk::{load_spirv, spirv_from_bytes};

use crate::config::ShaderCfg;

const VERTEX_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
const FRAGMENT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));

/// Built-in SPIR-V per stage unless the config names a file for it.
pub fn load_shaders(cfg: &ShaderCfg) -> Result<ShaderBytecode> {
    Ok(ShaderBytecode {
        vertex: stage(cfg.vertex.as_deref(), VERTEX_SPV, "vertex")?,
        fragment: stage(cfg.fragment.as_deref(), FRAGMENT_SPV, "fragment")?,
    })
}

fn stage(file: Option<&Path>, builtin: &[u8], name: &str) -> Result<Vec<u32>> {
    match file {
        Some(path) => {
            info!("{name} shader ← {}", path.display());
            load_spirv(path)
        }
        None => spirv_from_bytes(builtin).with_context(|| format!("built-in {name} shader")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn defaults_use_built_in_shaders() {
        let sh = load_shaders(&ShaderCfg::default()).unwrap();
        assert_eq!(sh.vertex.first(), Some(&SPIRV_MAGIC));
        assert_eq!(sh.fragment.first(), Some(&SPIRV_MAGIC));
        assert_ne!(sh.vertex, sh.fragment);
    }

    #[test]
    fn missing_override_is_an_error() {
        let cfg = ShaderCfg {
            vertex: None,
            fragment: Some(PathBuf::from("definitely/not/here/mesh.frag.spv")),
        };
        let err = load_shaders(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains("mesh.frag.spv"));
    }
}
