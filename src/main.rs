use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use webpdeep::cancel::CancelToken;
use webpdeep::config::{Config, GlobMatcher};
use webpdeep::eventbus::Bus;
use webpdeep::imagex::Registry;
use webpdeep::monitor::{Monitor, RunLog};
use webpdeep::options::{self, AlphaFilter, EncodeOptions, ImageHint, Preset};
use webpdeep::scanner::PathScanner;
use webpdeep::transfer::{Job, Transfer};

const JOB_QUEUE_CAP: usize = 1024;

#[derive(Parser, Debug)]
#[command(
    name = "webpdeep",
    about = "Batch image to WebP converter for directory trees and ZIP archives",
    disable_version_flag = true
)]
struct Cli {
    /// Input image, directory or archive
    input: Option<PathBuf>,

    /// Scan input directory recursively
    #[arg(short, long)]
    recursive: bool,

    /// Convert glob pattern in batch mode
    #[arg(short, long, default_value = "*.png|*.jpg|*.bmp|*.tiff")]
    pattern: String,

    /// Copy glob pattern in batch mode (bare --copy copies everything)
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "*")]
    copy: Option<String>,

    /// Archive glob pattern in batch mode
    #[arg(long, default_value = "*.zip|*.cbz")]
    archive: String,

    /// Copy file metadata (mode, mtime)
    #[arg(long = "file_meta")]
    file_meta: bool,

    /// Copy image metadata (ICC profile, EXIF, XMP)
    #[arg(long = "image_meta")]
    image_meta: bool,

    /// Check output image in lossless mode
    #[arg(long = "check_image")]
    check_image: bool,

    /// Max worker thread number (0 or less selects the logical CPU count)
    #[arg(long = "max_go", default_value_t = 0)]
    max_go: i32,

    /// Output path, can be omitted in single image mode
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log file directory
    #[arg(long)]
    log: Option<PathBuf>,

    /// Quality factor (0:small..100:big)
    #[arg(short, long)]
    quality: Option<f32>,

    /// Preset setting
    #[arg(long, value_enum, default_value_t = Preset::Default)]
    preset: Preset,

    /// Encode image losslessly
    #[arg(long)]
    lossless: bool,

    /// Compression method (0=fast, 6=slowest)
    #[arg(short, long)]
    method: Option<i32>,

    /// Activate lossless preset with given level [0:fast..9:slowest]
    #[arg(short = 'z', num_args = 0..=1, require_equals = true,
          default_missing_value = "6")]
    z: Option<i32>,

    /// Number of segments to use (1..4)
    #[arg(long)]
    segments: Option<i32>,

    /// Target size (in bytes)
    #[arg(long)]
    size: Option<i32>,

    /// Target PSNR (in dB, typically 42)
    #[arg(long)]
    psnr: Option<f32>,

    /// Spatial noise shaping (0:off, 100:max)
    #[arg(long)]
    sns: Option<i32>,

    /// Filter strength (0=off..100)
    #[arg(short = 'f', long)]
    strength: Option<i32>,

    /// Filter sharpness (0:most..7:least sharp)
    #[arg(long)]
    sharpness: Option<i32>,

    /// Use strong filter instead of simple (--strong=false for simple)
    #[arg(long, num_args = 0..=1, require_equals = true, default_value_t = true,
          default_missing_value = "true", action = ArgAction::Set)]
    strong: bool,

    /// Use sharper (and slower) RGB->YUV conversion
    #[arg(long = "sharp_yuv")]
    sharp_yuv: bool,

    /// Limit quality to fit the 512k limit on the first partition (0..100)
    #[arg(long = "partition_limit")]
    partition_limit: Option<i32>,

    /// Analysis pass number (1..10)
    #[arg(long)]
    pass: Option<i32>,

    /// Use multi-threading if available
    #[arg(long)]
    mt: bool,

    /// Reduce memory usage (slower encoding)
    #[arg(long = "low_memory")]
    low_memory: bool,

    /// Transparency-compression method (0..1)
    #[arg(long = "alpha_method")]
    alpha_method: Option<i32>,

    /// Predictive filtering for alpha plane
    #[arg(long = "alpha_filter", value_enum)]
    alpha_filter: Option<AlphaFilter>,

    /// Preserve RGB values in transparent area
    #[arg(long)]
    exact: bool,

    /// Use near-lossless image preprocessing (0..100=off)
    #[arg(long = "near_lossless")]
    near_lossless: Option<i32>,

    /// Specify image characteristics hint
    #[arg(long, value_enum)]
    hint: Option<ImageHint>,

    /// Roughly match expected JPEG size (experimental)
    #[arg(long = "jpeg_like")]
    jpeg_like: bool,

    /// Auto-adjust filter strength (experimental)
    #[arg(long)]
    af: bool,

    /// Pre-processing filter (experimental)
    #[arg(long)]
    pre: Option<i32>,

    /// Print WebP encoder version
    #[arg(short = 'v', long)]
    version: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if cli.version {
        println!("WebP encoder version: v{}", options::encoder_version());
        return;
    }

    if let Err(err) = run(cli) {
        eprintln!("webpdeep: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let opts = setup_encode_options(&cli)?;
    let (mut config, log_dir) = setup_config(&cli, opts)?;

    fs::create_dir_all(&log_dir)
        .with_context(|| format!("can not make log directory <{}>", log_dir.display()))?;
    let log_path = log_dir.join(format!(
        "webpdeep-{}.log",
        Local::now().format("%Y-%m-%dT%H.%M.%S%z")
    ));
    let run_log = RunLog::create(&log_path)?;
    config.log_path = log_path;
    let config = Arc::new(config);

    let registry = Arc::new(Registry::with_defaults());
    let bus = Bus::new();
    let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(JOB_QUEUE_CAP);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("can not install signal handler")?;
    }

    // Transfer and monitor subscribe on construction, ahead of any scanner
    // event.
    let transfer = Transfer::new(bus.clone(), Arc::clone(&registry), job_rx, config.max_go);
    let monitor = Monitor::new(bus.clone(), run_log);
    let scanner = PathScanner::new(bus.clone(), Arc::clone(&config), job_tx);

    print_banner();

    let transfer_handle = {
        let cancel = cancel.clone();
        thread::spawn(move || transfer.start(cancel))
    };
    let scanner_handle = {
        let cancel = cancel.clone();
        thread::spawn(move || scanner.scan(&cancel))
    };

    monitor.start(&cancel);
    let _ = transfer_handle.join();
    let _ = scanner_handle.join();

    println!("\nDone.");
    Ok(())
}

fn setup_config(cli: &Cli, opts: EncodeOptions) -> Result<(Config, PathBuf)> {
    let convert_match = GlobMatcher::new(&cli.pattern)
        .with_context(|| format!("invalid convert pattern: {}", cli.pattern))?;
    let copy_match = match &cli.copy {
        Some(pattern) => Some(
            GlobMatcher::new(pattern)
                .with_context(|| format!("invalid copy pattern: {pattern}"))?,
        ),
        None => None,
    };
    let archive_match = GlobMatcher::new(&cli.archive)
        .with_context(|| format!("invalid archive pattern: {}", cli.archive))?;

    let max_go = if cli.max_go <= 0 {
        num_cpus::get()
    } else {
        cli.max_go as usize
    };

    let Some(src) = &cli.input else {
        bail!("input not specified");
    };
    let src = clean_path(src);
    let stat = fs::metadata(&src).ok();

    let dest = match &cli.output {
        Some(output) => clean_path(output),
        None => match &stat {
            Some(stat) if !stat.is_dir() => src.with_extension("webp"),
            _ => bail!("output not specified"),
        },
    };

    let log_dir = match &cli.log {
        Some(log) => clean_path(log),
        None => match &stat {
            Some(stat) if stat.is_dir() => dest.clone(),
            _ => dest
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        },
    };

    let config = Config {
        src,
        dest,
        recursive: cli.recursive,
        convert_match,
        copy_match,
        archive_match,
        copy_file_meta: cli.file_meta,
        copy_image_meta: cli.image_meta,
        check_image: cli.check_image,
        max_go,
        log_path: PathBuf::new(), // filled in once the log file exists
        opts,
    };
    Ok((config, log_dir))
}

fn setup_encode_options(cli: &Cli) -> Result<EncodeOptions> {
    let quality = cli.quality.unwrap_or(if cli.lossless {
        options::LOSSLESS_DEFAULT_QUALITY
    } else {
        options::LOSSY_DEFAULT_QUALITY
    });
    let mut opts = EncodeOptions::new(cli.preset, quality)
        .with_context(|| format!("invalid preset or quality <{quality}>"))?;

    opts.config.lossless = i32::from(cli.lossless);
    if let Some(method) = cli.method {
        opts.config.method = method;
    }
    if let Some(level) = cli.z {
        opts.setup_lossless_preset(level)
            .context("invalid lossless preset (z option)")?;
    }

    let c = &mut opts.config;
    if let Some(v) = cli.segments {
        c.segments = v;
    }
    if let Some(v) = cli.size {
        c.target_size = v;
    }
    if let Some(v) = cli.psnr {
        c.target_PSNR = v;
    }
    if let Some(v) = cli.sns {
        c.sns_strength = v;
    }
    if let Some(v) = cli.strength {
        c.filter_strength = v;
    }
    if let Some(v) = cli.sharpness {
        c.filter_sharpness = v;
    }
    c.filter_type = i32::from(cli.strong);
    if cli.sharp_yuv {
        c.use_sharp_yuv = 1;
    }
    if let Some(v) = cli.partition_limit {
        c.partition_limit = v;
    }
    if let Some(v) = cli.pass {
        c.pass = v;
    }
    if cli.mt {
        c.thread_level = 1;
    }
    if cli.low_memory {
        c.low_memory = 1;
    }
    if let Some(v) = cli.alpha_method {
        c.alpha_compression = v;
    }
    if let Some(filter) = cli.alpha_filter {
        c.alpha_filtering = filter.value();
    }
    if cli.exact {
        c.exact = 1;
    }
    if let Some(v) = cli.near_lossless {
        c.near_lossless = v;
    }
    if let Some(hint) = cli.hint {
        c.image_hint = hint.value();
    }
    if cli.jpeg_like {
        c.emulate_jpeg_size = 1;
    }
    if cli.af {
        c.autofilter = 1;
    }
    if let Some(v) = cli.pre {
        c.preprocessing = v;
    }

    opts.validate()?;
    Ok(opts)
}

/// Lexical cleanup: drops `.` components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn print_banner() {
    println!("webpdeep | libwebp v{}", options::encoder_version());
    println!("==================================================");
}
