use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: &[&str] = &["rgen", "rchit", "rmiss", "rint", "rahit"];

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=GLSLANG_VALIDATOR");

    if std::env::var_os("CARGO_FEATURE_VULKAN").is_none() {
        return;
    }

    let compiler = std::env::var("GLSLANG_VALIDATOR").unwrap_or_else(|_| "glslangValidator".to_string());
    let available = Command::new(&compiler)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !available {
        println!("cargo:warning={compiler} not found; shaders load from RenderSettings::shader_dir at runtime");
        return;
    }

    let out_dir = match std::env::var_os("OUT_DIR") {
        Some(dir) => PathBuf::from(dir).join("spv"),
        None => return,
    };
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        println!("cargo:warning=cannot create {}: {e}", out_dir.display());
        return;
    }

    let sources = match shader_sources(Path::new("shaders")) {
        Ok(s) => s,
        Err(e) => {
            println!("cargo:warning=cannot list shaders: {e}");
            return;
        }
    };

    let mut failed = false;
    for source in &sources {
        let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let target = out_dir.join(format!("{name}.spv"));
        let status = Command::new(&compiler)
            .args(["--target-env", "vulkan1.2", "-V"])
            .arg(source)
            .arg("-o")
            .arg(&target)
            .status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                println!("cargo:warning={name}: {compiler} exited with {s}");
                failed = true;
            }
            Err(e) => {
                println!("cargo:warning={name}: {e}");
                failed = true;
            }
        }
    }

    if !failed {
        println!("cargo:rustc-env=PHOTON_BEAM_SPV_DIR={}", out_dir.display());
    }
}

fn shader_sources(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let stage = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if STAGES.contains(&stage) {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}
