use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use planescale_core::backend::BackendKind;
use planescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use planescale_core::engine::EngineConfig;
use planescale_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use planescale_core::model_inspect::{inspect, ModelInspection};
use planescale_core::model_registry::ModelRegistry;
use planescale_core::pipeline::{Pipeline, PipelineOptions, ProcessMode};
use planescale_core::resize::ResizeAlgorithm;
use planescale_core::Plane;

#[derive(Parser)]
#[command(
    name = "planescale",
    about = "Tiled CNN noise reduction and upscaling for luminance images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Denoise and/or upscale one or more frames.
    Convert(ConvertArgs),
    /// Print the layer structure of a weight file.
    Inspect(InspectArgs),
    /// List weight files in the models directory.
    Models(ModelsArgs),
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(
        short = 'i',
        long = "input",
        required = true,
        num_args = 1..,
        help = "Input frame(s)"
    )]
    inputs: Vec<PathBuf>,
    #[arg(
        short = 'o',
        long,
        help = "Output file, or directory when several inputs are given"
    )]
    output: PathBuf,
    #[arg(
        short = 'm',
        long,
        default_value = "noise_scale",
        value_parser = parse_mode,
        help = "noise, scale or noise_scale"
    )]
    mode: ProcessMode,
    #[arg(long, alias = "noise_level", default_value_t = 1, help = "Noise reduction level (1 or 2)")]
    noise_level: u8,
    #[arg(long, alias = "scale_ratio", default_value_t = 2.0, help = "Custom scale ratio")]
    scale_ratio: f64,
    #[arg(
        long,
        default_value = "bilinear",
        value_parser = parse_shrink_filter,
        help = "Filter for the final shrink of non power-of-two ratios: bilinear or nearest"
    )]
    shrink_filter: ResizeAlgorithm,
    #[arg(long, alias = "model_dir", help = "Directory holding noise{N}_model.bin and scale2.0x_model.bin")]
    model_dir: Option<PathBuf>,
    #[arg(short = 'j', long, help = "Tiles processed concurrently")]
    jobs: Option<usize>,
    #[arg(short = 'b', long = "block-size", alias = "block_size", help = "Maximum tile edge (0 = whole frame)")]
    block_size: Option<usize>,
    #[arg(long, help = "Convolution backend: parallel or scalar")]
    backend: Option<String>,
    #[arg(long, help = "Fail instead of falling back to the scalar backend")]
    strict_backend: bool,
}

#[derive(Args)]
struct InspectArgs {
    model: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, alias = "model_dir")]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

fn parse_shrink_filter(raw: &str) -> std::result::Result<ResizeAlgorithm, String> {
    Ok(ResizeAlgorithm::from_str_lossy(raw))
}

fn parse_mode(raw: &str) -> std::result::Result<ProcessMode, String> {
    ProcessMode::parse(raw).map_err(|e| e.to_string())
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Convert(args) => run_convert(args, &resolved_data_dir),
        Commands::Inspect(args) => run_inspect(&args),
        Commands::Models(args) => run_models(&args, &resolved_data_dir),
    }
}

#[cfg(test)]
fn select_log_filter(rust_log_env: Option<&str>, verbose: u8, cli_log_filter: Option<&str>) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).effective_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: crash report hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted."
        );
    }

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Crash report hook unavailable"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Startup"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Config values with command-line overrides applied.
fn engine_config(base: EngineConfig, args: &ConvertArgs) -> EngineConfig {
    EngineConfig {
        tile_size: args.block_size.unwrap_or(base.tile_size),
        backend: args
            .backend
            .as_deref()
            .map(BackendKind::from_str_lossy)
            .unwrap_or(base.backend),
        jobs: args.jobs.unwrap_or(base.jobs),
        backend_threads: base.backend_threads,
    }
}

fn run_convert(args: ConvertArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let engine_config = engine_config(config.engine, &args);
    let models_dir = args
        .model_dir
        .clone()
        .unwrap_or_else(|| config.models_dir(data_dir));
    let registry =
        ModelRegistry::new(models_dir).with_checksums(config.models.checksums.clone());

    let options = PipelineOptions {
        mode: args.mode,
        noise_level: args.noise_level,
        scale_ratio: args.scale_ratio,
        shrink_filter: args.shrink_filter,
    };
    info!(
        mode = %options.mode,
        noise_level = options.noise_level,
        scale_ratio = options.scale_ratio,
        tile_size = engine_config.tile_size,
        backend = %engine_config.backend,
        jobs = engine_config.jobs,
        models_dir = %registry.models_dir().display(),
        "Preparing pipeline"
    );
    let pipeline = Pipeline::from_registry(&registry, options, engine_config, args.strict_backend)
        .context("failed to prepare conversion pipeline")?;

    let targets = output_targets(&args.inputs, &args.output)?;
    let total = targets.len() as u64;
    let started = Instant::now();
    let mut fps_started: Option<Instant> = None;

    for (index, (input, output)) in targets.iter().enumerate() {
        let plane = load_luma(input)?;
        let (width, height) = (plane.width(), plane.height());
        let result = pipeline
            .process(plane)
            .with_context(|| format!("failed to process {}", input.display()))?;
        save_luma(output, &result)?;
        info!(
            input = %input.display(),
            output = %output.display(),
            from = %format!("{width}x{height}"),
            to = %format!("{}x{}", result.width(), result.height()),
            "Frame written"
        );

        let done = index as u64 + 1;
        if fps_started.is_none() && done > FPS_WARMUP_FRAMES {
            fps_started = Some(Instant::now());
        }
        let fps_elapsed = fps_started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        print_progress(done, total, started.elapsed().as_secs_f64(), fps_elapsed);
    }
    eprintln!();

    info!(
        frames = total,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Conversion complete"
    );
    Ok(())
}

/// Pair each input with its output path. A single input writes to `output` unless it
/// names an existing directory; several inputs always write into `output` as a
/// directory, keeping their file names.
fn output_targets(inputs: &[PathBuf], output: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    if inputs.is_empty() {
        bail!("no input frames given");
    }
    if inputs.len() == 1 && !output.is_dir() {
        return Ok(vec![(inputs[0].clone(), output.to_path_buf())]);
    }

    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory: {}", output.display()))?;
    inputs
        .iter()
        .map(|input| {
            let name = input
                .file_name()
                .with_context(|| format!("input has no file name: {}", input.display()))?;
            Ok((input.clone(), output.join(name)))
        })
        .collect()
}

fn load_luma(path: &Path) -> Result<Plane> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?
        .to_luma8();
    let (width, height) = image.dimensions();
    let samples = image
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();
    Ok(Plane::from_vec(width as usize, height as usize, samples)?)
}

fn quantize(sample: f32) -> u8 {
    (sample * 255.0).round().clamp(0.0, 255.0) as u8
}

fn save_luma(path: &Path, plane: &Plane) -> Result<()> {
    let pixels = plane.to_vec().into_iter().map(quantize).collect();
    let image = image::GrayImage::from_raw(plane.width() as u32, plane.height() as u32, pixels)
        .context("output plane does not match its dimensions")?;
    image
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let inspection = inspect(&args.model)
        .with_context(|| format!("failed to inspect {}", args.model.display()))?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&inspection).context("failed to serialize inspection")?
        );
    } else {
        print!("{}", render_inspection(&inspection));
    }
    Ok(())
}

fn render_inspection(inspection: &ModelInspection) -> String {
    let mut out = format!(
        "format: {}\nlayers: {}\nkernel: {k}x{k}\nhalo: {}\nparameters: {}\n",
        inspection.format,
        inspection.layers.len(),
        inspection.halo,
        inspection.param_count,
        k = inspection.kernel_size,
    );
    for (index, layer) in inspection.layers.iter().enumerate() {
        out.push_str(&format!(
            "  #{index:<3} {:>4} -> {:<4} {}x{} {:?} ({} params)\n",
            layer.input_channels,
            layer.output_channels,
            layer.kernel_size,
            layer.kernel_size,
            layer.activation,
            layer.param_count
        ));
    }
    out
}

fn run_models(args: &ModelsArgs, data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir);
    let models_dir = args
        .model_dir
        .clone()
        .unwrap_or_else(|| config.models_dir(data_dir));
    let found = ModelRegistry::new(models_dir.clone()).discover()?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&found).context("failed to serialize model list")?
        );
        return Ok(());
    }
    if found.is_empty() {
        println!("No weight files in {}", models_dir.display());
    }
    for model in found {
        let verified = match config.models.checksums.get(&model.filename) {
            Some(expected) if expected.eq_ignore_ascii_case(&model.sha256) => "verified",
            Some(_) => "CHECKSUM MISMATCH",
            None => "unverified",
        };
        println!(
            "{:<28} {:>10} bytes  {}  {verified}",
            model.filename, model.size_bytes, model.sha256
        );
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 2;

fn print_progress(done: u64, total: u64, total_elapsed: f64, fps_elapsed: f64) {
    let fps = compute_fps(done, fps_elapsed);
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar: String = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let eta = if fps > 0.0 {
        format!(
            " | ETA: {}",
            format_duration(total.saturating_sub(done) as f64 / fps)
        )
    } else {
        String::new()
    };

    eprint!(
        "\r[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        done,
        total,
        fps,
        format_duration(total_elapsed),
        eta,
    );
}

/// Frames per second, ignoring the first frames while caches and pools warm up.
fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }

    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}
