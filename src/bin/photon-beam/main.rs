//! photon-beam CLI - render frames and inspect derived parameters.

use anyhow::{bail, Context, Result};
use photon_beam::optics::derive_optical_state;
use photon_beam::scene::cornell_box;
use photon_beam::{create_renderer, Backend, FrameInputs, RenderSettings};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Frames are spaced as if played back at this rate.
const PLAYBACK_FPS: f32 = 30.0;

#[cfg(feature = "trace")]
type TraceGuard = Option<tracing_chrome::FlushGuard>;
#[cfg(not(feature = "trace"))]
type TraceGuard = ();

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_logging(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "render" | "r" => RenderArgs::parse(&filtered_args[1..]).and_then(|a| cmd_render(&a)),
        "derive" | "d" => config_arg(&filtered_args[1..]).and_then(|c| cmd_derive(c.as_deref())),
        "budget" | "b" => config_arg(&filtered_args[1..]).and_then(|c| cmd_budget(c.as_deref())),
        "help" | "h" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) -> TraceGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);

    #[cfg(feature = "trace")]
    {
        let (chrome, guard) = if std::env::var("PHOTON_BEAM_TRACE").ok().as_deref() == Some("1") {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };
        let _ = tracing_subscriber::registry().with(filter).with(fmt).with(chrome).try_init();
        guard
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
    }
}

fn print_help() {
    println!("photon-beam - photon beam renderer for participating media");
    println!();
    println!("USAGE:");
    println!("    photon-beam [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    r, render [--config f] [--frames n] [--backend host|vulkan] [-o out.hdr]");
    println!("                                  Render frames of the built-in scene");
    println!("    d, derive [--config f]        Print the derived optical state");
    println!("    b, budget [--config f]        Print buffer capacities and byte sizes");
    println!("    h, help                       Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show errors");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Overrides the log filter");
    println!("    PHOTON_BEAM_TRACE=1  Write a Chrome trace to trace.json (feature `trace`)");
    println!();
    println!("EXAMPLES:");
    println!("    photon-beam render --backend host -o frame.hdr");
    println!("    photon-beam render --frames 8 -o anim.exr     # anim_0000.exr ...");
    println!("    photon-beam -v budget --config settings.json");
}

#[derive(Debug, Default)]
struct RenderArgs {
    config: Option<PathBuf>,
    frames: u32,
    backend: Option<Backend>,
    output: PathBuf,
}

impl RenderArgs {
    fn parse(args: &[&str]) -> Result<Self> {
        let mut out = Self {
            frames: 1,
            output: PathBuf::from("frame.hdr"),
            ..Self::default()
        };
        let mut it = args.iter();
        while let Some(&arg) = it.next() {
            match arg {
                "--config" | "-c" => out.config = Some(PathBuf::from(value(&mut it, arg)?)),
                "--frames" | "-n" => {
                    let v = value(&mut it, arg)?;
                    out.frames = v.parse().with_context(|| format!("invalid frame count '{v}'"))?;
                }
                "--backend" | "-b" => out.backend = Some(value(&mut it, arg)?.parse()?),
                "--output" | "-o" => out.output = PathBuf::from(value(&mut it, arg)?),
                other => bail!("unexpected argument '{other}'"),
            }
        }
        if out.frames == 0 {
            bail!("--frames must be at least 1");
        }
        Ok(out)
    }
}

fn value<'a>(it: &mut std::slice::Iter<'_, &'a str>, flag: &str) -> Result<&'a str> {
    it.next().copied().with_context(|| format!("missing value for {flag}"))
}

fn config_arg(args: &[&str]) -> Result<Option<PathBuf>> {
    match args {
        [] => Ok(None),
        ["--config" | "-c", path] => Ok(Some(PathBuf::from(path))),
        _ => bail!("expected [--config <file>]"),
    }
}

fn load_settings(path: Option<&Path>) -> Result<RenderSettings> {
    let settings = RenderSettings::load(path)?;
    if let Some(p) = path {
        tracing::debug!(path = %p.display(), "settings loaded");
    }
    Ok(settings)
}

/// `anim.exr` -> `anim_0003.exr` when more than one frame is written.
fn frame_path(base: &Path, index: u32, frames: u32) -> PathBuf {
    if frames <= 1 {
        return base.to_path_buf();
    }
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("frame");
    let ext = base.extension().and_then(|e| e.to_str()).unwrap_or("hdr");
    base.with_file_name(format!("{stem}_{index:04}.{ext}"))
}

fn cmd_render(args: &RenderArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    settings.collect_stats = true;

    let scene = cornell_box()?;
    let mut renderer = create_renderer(&settings, &scene).context("creating renderer")?;
    tracing::info!(
        backend = renderer.name(),
        width = settings.width,
        height = settings.height,
        frames = args.frames,
        "rendering"
    );

    for index in 0..args.frames {
        let started = std::time::Instant::now();
        let inputs = FrameInputs::new(&settings, index, index as f32 / PLAYBACK_FPS);
        let output = renderer
            .render_frame(&inputs)
            .with_context(|| format!("frame {index}"))?;

        let path = frame_path(&args.output, index, args.frames);
        output
            .image
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;

        if let Some(stats) = output.stats {
            tracing::info!(
                frame = index,
                beams = stats.header.beam_count,
                sub_beams = stats.header.sub_beam_count,
                dropped = stats.header.dropped_beams + stats.header.dropped_sub_beams,
                ms = started.elapsed().as_secs_f32() * 1000.0,
                path = %path.display(),
                "frame written"
            );
        }
    }
    Ok(())
}

fn cmd_derive(config: Option<&Path>) -> Result<()> {
    let settings = load_settings(config)?;
    let optics = derive_optical_state(&settings.volume);

    println!("Volume:");
    println!("  near color:          {:?}", settings.volume.near_color);
    println!("  unit distance color: {:?}", settings.volume.unit_distance_color);
    println!("  intensity:           {}", settings.volume.intensity);
    println!("  air albedo:          {}", settings.volume.air_albedo);
    println!();
    println!("Optical state:");
    println!("  extinction:          {}", optics.extinction);
    println!("  mean extinction:     {}", optics.mean_extinction());
    println!("  scattering:          {}", optics.scattering);
    println!("  source radiance:     {}", optics.source_radiance);
    println!("  clamped unit color:  {}", optics.unit_distance_color);
    println!("  clear medium:        {}", optics.is_clear());
    Ok(())
}

fn cmd_budget(config: Option<&Path>) -> Result<()> {
    let settings = load_settings(config)?;
    let budget = &settings.capacity;
    let sizes = budget.sizes();

    println!("Capacity budget:");
    println!("  max beam samples:    {}", budget.max_beam_samples);
    println!("  max photon samples:  {}", budget.max_photon_samples);
    println!("  beams per sample:    {}", budget.beams_per_sample);
    println!("  sub-beams per beam sample: {}", budget.sub_beams_per_beam_sample);
    println!();
    println!("Derived:");
    println!("  max beams:           {}", budget.max_num_beams());
    println!("  max sub-beams:       {}", budget.max_num_sub_beams());
    println!("  record buffer:       {} bytes ({:.1} MiB)", sizes.record_buffer, mib(sizes.record_buffer));
    println!("  instance buffer:     {} bytes ({:.1} MiB)", sizes.instance_buffer, mib(sizes.instance_buffer));
    println!();
    println!("Active this frame:");
    println!("  beam samples:        {}", settings.volume.active_beam_samples());
    println!("  photon samples:      {}", settings.volume.active_photon_samples());
    Ok(())
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_args() {
        let args = RenderArgs::parse(&["--frames", "3", "--backend", "host", "-o", "out.exr"]).unwrap();
        assert_eq!(args.frames, 3);
        assert_eq!(args.backend, Some(Backend::Host));
        assert_eq!(args.output, PathBuf::from("out.exr"));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_parse_render_args_rejects() {
        assert!(RenderArgs::parse(&["--frames"]).is_err());
        assert!(RenderArgs::parse(&["--frames", "0"]).is_err());
        assert!(RenderArgs::parse(&["--backend", "metal"]).is_err());
        assert!(RenderArgs::parse(&["extra"]).is_err());
    }

    #[test]
    fn test_frame_path() {
        let base = Path::new("out/anim.exr");
        assert_eq!(frame_path(base, 0, 1), PathBuf::from("out/anim.exr"));
        assert_eq!(frame_path(base, 7, 8), PathBuf::from("out/anim_0007.exr"));
    }

    #[test]
    fn test_config_arg() {
        assert_eq!(config_arg(&[]).unwrap(), None);
        assert_eq!(config_arg(&["-c", "a.json"]).unwrap(), Some(PathBuf::from("a.json")));
        assert!(config_arg(&["a.json"]).is_err());
    }
}
