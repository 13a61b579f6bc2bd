//! ionflow CLI entrypoint.
//!
//! ```bash
//! ionflow run --codec h264 --width 1280 --height 720 --frames 120
//! ionflow run --config pipeline.json --scale-width iw/2 --scale-height -2
//! ionflow validate --config pipeline.json
//! ionflow formats
//! ```
//!
//! Every command prints exactly one JSON object on stdout; logs go to stderr.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use ionflow_core::context::DEVICE_FORMATS;
use ionflow_core::error::{EngineError, Result};
use ionflow_core::types::PixelFormat;
use ionflow_decode::codec::CodecKind;
use ionflow_decode::pump::DecoderConfig;
use ionflow_pipeline::{Pipeline, PipelineConfig, SyntheticPacketSource, run_soft};
use ionflow_scale::expr::{Expr, evaluate_dimensions};
use ionflow_scale::scale::ScaleConfig;
use ionflow_scale::soft::DEFAULT_LIMITS;

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "ionflow",
    version,
    about = "Hardware video buffer pool, decode pump and zero-copy scale",
    arg_required_else_help = true,
    after_help = "Examples:\n  ionflow formats\n  ionflow validate --config pipeline.json\n  ionflow run --codec hevc --width 1920 --height 1080 --frames 120\n  ionflow run --config pipeline.json --scale-width iw/2 --scale-height -2"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode synthetic packets through the in-process engines.
    Run(RunArgs),
    /// List pixel formats and codecs known to the engines.
    Formats,
    /// Check a pipeline configuration and preview the scale geometry.
    Validate(ValidateArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Formats => "formats",
            Self::Validate(_) => "validate",
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// JSON pipeline configuration; flags below override it.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Codec (h264, hevc, mpeg2, vp9, mpeg4, ...).
    #[arg(long = "codec")]
    codec: Option<String>,

    /// Container codec tag, e.g. DIV3.
    #[arg(long = "codec-tag")]
    codec_tag: Option<String>,

    /// Coded width.
    #[arg(long = "width")]
    width: Option<u32>,

    /// Coded height.
    #[arg(long = "height")]
    height: Option<u32>,

    /// Framerate numerator.
    #[arg(long = "fps-num")]
    fps_num: Option<u32>,

    /// Framerate denominator.
    #[arg(long = "fps-den")]
    fps_den: Option<u32>,

    /// Decoder output buffers.
    #[arg(long = "pool-capacity")]
    pool_capacity: Option<usize>,

    /// Decoder output format: nv21 or nv12.
    #[arg(long = "output-format")]
    output_format: Option<String>,

    /// Scale width expression (enables scaling).
    #[arg(long = "scale-width")]
    scale_width: Option<String>,

    /// Scale height expression (enables scaling).
    #[arg(long = "scale-height")]
    scale_height: Option<String>,

    /// Scale output format (enables scaling).
    #[arg(long = "scale-format")]
    scale_format: Option<String>,

    /// Device memory limit in MiB (0 = unlimited).
    #[arg(long = "memory-limit")]
    memory_limit_mb: Option<usize>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Synthetic packets to feed.
    #[arg(short = 'n', long = "frames", default_value_t = 60)]
    frames: u64,

    /// Keyframe interval of the synthetic stream.
    #[arg(long = "gop", default_value_t = 12)]
    gop: u64,

    /// Stop after this many frames reach the sink.
    #[arg(long = "max-frames")]
    max_frames: Option<u64>,

    /// Cancel the run after this many milliseconds.
    #[arg(long = "cancel-after-ms")]
    cancel_after_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    #[command(flatten)]
    session: SessionArgs,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let command = cli.command.name();
    let result = match cli.command {
        Commands::Run(args) => {
            let rt = build_runtime();
            rt.block_on(run_pipeline(args))
        }
        Commands::Formats => Ok(formats_json()),
        Commands::Validate(args) => run_validate(args),
    };

    match result {
        Ok(body) => {
            println!("{}", success_json(command, body));
            std::process::exit(0);
        }
        Err(err) => {
            tracing::error!(error = %err, code = err.error_code(), "Command failed");
            println!("{}", command_error_json(command, &err));
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

// ─── Configuration ──────────────────────────────────────────────────────────

fn resolve_config(args: &SessionArgs) -> Result<PipelineConfig> {
    let codec = args.codec.as_deref().map(str::parse::<CodecKind>).transpose()?;
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::new(DecoderConfig::new(
            codec.unwrap_or(CodecKind::H264),
            args.width.unwrap_or(1280),
            args.height.unwrap_or(720),
        )),
    };

    let decoder = &mut config.decoder;
    if let Some(codec) = codec {
        decoder.codec = codec;
    }
    if let Some(tag) = &args.codec_tag {
        decoder.codec_tag = Some(tag.clone());
    }
    if let Some(width) = args.width {
        decoder.width = width;
    }
    if let Some(height) = args.height {
        decoder.height = height;
    }
    if let Some(num) = args.fps_num {
        decoder.fps_num = num;
    }
    if let Some(den) = args.fps_den {
        decoder.fps_den = den;
    }
    if let Some(capacity) = args.pool_capacity {
        decoder.pool_capacity = capacity;
    }
    if let Some(format) = &args.output_format {
        decoder.output_format = format.parse::<PixelFormat>()?;
    }

    if args.scale_width.is_some() || args.scale_height.is_some() || args.scale_format.is_some() {
        let scale = config.scale.get_or_insert_with(ScaleConfig::default);
        if let Some(width) = &args.scale_width {
            scale.width = width.clone();
        }
        if let Some(height) = &args.scale_height {
            scale.height = height.clone();
        }
        if let Some(format) = &args.scale_format {
            scale.format = Some(format.parse::<PixelFormat>()?);
        }
    }
    if let Some(mb) = args.memory_limit_mb {
        config.memory_limit_bytes = mb * 1024 * 1024;
    }

    config.validate()?;
    Ok(config)
}

// ─── Commands ───────────────────────────────────────────────────────────────

async fn run_pipeline(args: RunArgs) -> Result<Value> {
    let mut config = resolve_config(&args.session)?;
    if args.max_frames.is_some() {
        config.max_frames = args.max_frames;
    }
    let pipeline = Pipeline::new(config)?;

    if let Some(ms) = args.cancel_after_ms {
        let cancel = pipeline.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            tracing::info!(after_ms = ms, "Cancelling run");
            cancel.cancel();
        });
    }

    let decoder = &pipeline.config().decoder;
    let mut source =
        SyntheticPacketSource::new(args.frames, decoder.fps_num, decoder.fps_den).with_gop(args.gop);
    let run = run_soft(&pipeline, &mut source).await?;
    serde_json::to_value(&run)
        .map_err(|err| EngineError::Pipeline(format!("Failed to serialize run report: {err}")))
}

fn formats_json() -> Value {
    let pixel_formats: Vec<Value> = PixelFormat::ALL
        .iter()
        .map(|format| {
            let engine_code = DEVICE_FORMATS
                .iter()
                .find(|e| e.format == *format)
                .map(|e| e.engine_code);
            json!({
                "name": format.name(),
                "planes": format.planes().len(),
                "engine_code": engine_code,
                "decode_output": matches!(format, PixelFormat::Nv12 | PixelFormat::Nv21),
            })
        })
        .collect();
    let codecs: Vec<Value> = CodecKind::ALL
        .iter()
        .map(|codec| {
            json!({
                "name": codec.name(),
                "stream_type": codec.stream_type(),
                "stream_format": codec.default_format(),
            })
        })
        .collect();
    json!({ "pixel_formats": pixel_formats, "codecs": codecs })
}

fn run_validate(args: ValidateArgs) -> Result<Value> {
    let config = resolve_config(&args.session)?;
    let decoder = &config.decoder;

    let scale = match &config.scale {
        // Size comes from the stream header; nothing to preview yet.
        Some(_) if decoder.width == 0 || decoder.height == 0 => Value::Null,
        Some(scale) => {
            let (width, height) = evaluate_dimensions(
                &Expr::parse(&scale.width)?,
                &Expr::parse(&scale.height)?,
                decoder.width,
                decoder.height,
                decoder.output_format,
            )?;
            DEFAULT_LIMITS.check(width, height)?;
            let format = scale.format.unwrap_or(decoder.output_format);
            for needed in [decoder.output_format, format] {
                if !DEVICE_FORMATS.iter().any(|e| e.format == needed) {
                    return Err(EngineError::UnsupportedFormat(needed));
                }
            }
            json!({ "width": width, "height": height, "format": format.name() })
        }
        None => Value::Null,
    };

    Ok(json!({
        "config_schema_version": config.config_schema_version,
        "codec": decoder.codec.name(),
        "width": decoder.width,
        "height": decoder.height,
        "output_format": decoder.output_format.name(),
        "pool_capacity": decoder.pool_capacity,
        "scale": scale,
    }))
}

// ─── JSON envelopes ─────────────────────────────────────────────────────────

fn success_json(command: &str, body: Value) -> Value {
    let mut out = json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": true,
    });
    if let (Some(fields), Value::Object(extra)) = (out.as_object_mut(), body) {
        fields.extend(extra);
    }
    out
}

fn command_error_json(command: &str, err: &EngineError) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}
