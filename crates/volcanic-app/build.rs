use std::error::Error;
use std::{env, fs, path::PathBuf};

fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);
    let dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("shaders");

    let comp = shaderc::Compiler::new().map_err(|e| e.to_string())?;
    let mut opts = shaderc::CompileOptions::new().map_err(|e| e.to_string())?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (name, kind) in [
        ("mesh.vert", shaderc::ShaderKind::Vertex),
        ("mesh.frag", shaderc::ShaderKind::Fragment),
    ] {
        let path = dir.join(name);
        println!("cargo:rerun-if-changed={}", path.display());
        let src = fs::read_to_string(&path)?;
        let spv = comp
            .compile_into_spirv(&src, kind, name, "main", Some(&opts))
            .map_err(|e| format!("{name}: {e}"))?;
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
