//! Command line front end of deconv3d.
//!
//! Usage:
//! ```text
//! deconv3d image.npy psf.npy
//! deconv3d image.npy psf.npy --iter 50 --method rl --out result.npy
//! deconv3d big.npy psf.npy --tilesize 512 --tilepad 30 --float
//! ```

use clap::{Parser, ValueEnum};
use deconv3d::config::{
    BorderQuality, DeconvConfig, IterationPolicy, MethodKind, MetricKind, OutputFormat,
};
use deconv3d::error::Result;
use deconv3d::io::NpyStore;
use deconv3d::pipeline;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMethod {
    Identity,
    Rl,
    Shb,
    Ave,
    Eve,
}

impl From<CliMethod> for MethodKind {
    fn from(method: CliMethod) -> Self {
        match method {
            CliMethod::Identity => MethodKind::Identity,
            CliMethod::Rl => MethodKind::RichardsonLucy,
            CliMethod::Shb => MethodKind::HeavyBall,
            CliMethod::Ave => MethodKind::Ave,
            CliMethod::Eve => MethodKind::Eve,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMetric {
    Mse,
    Idiv,
}

#[derive(Parser)]
#[command(name = "deconv3d")]
#[command(about = "Richardson-Lucy deconvolution of 3D microscopy volumes")]
#[command(version)]
struct Args {
    /// Image to deconvolve, a 3D .npy array of shape (P, N, M)
    image: PathBuf,

    /// Point spread function, a 3D .npy array with odd extents
    psf: PathBuf,

    /// Output file (default: dw_<image> next to the image)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// JSON settings file, individual options below take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run exactly this many iterations
    #[arg(short = 'n', long = "iter", value_name = "N")]
    iterations: Option<usize>,

    /// Stop when the relative change of the error drops below this value
    #[arg(long = "relerror", value_name = "TOL", conflicts_with_all = ["iterations", "absolute_error"])]
    relative_error: Option<f64>,

    /// Stop when the error drops below this value
    #[arg(long = "abserror", value_name = "TOL", conflicts_with = "iterations")]
    absolute_error: Option<f64>,

    /// Upper bound for --relerror and --abserror
    #[arg(long = "maxiter")]
    max_iterations: Option<usize>,

    #[arg(long, value_enum)]
    method: Option<CliMethod>,

    /// Acceleration level 0 to 3 of ave and eve
    #[arg(long)]
    acceleration: Option<u8>,

    #[arg(long, value_enum)]
    metric: Option<CliMetric>,

    /// Lower bound of the estimate
    #[arg(long = "bg")]
    background: Option<f32>,

    /// Allow values below the background level
    #[arg(long)]
    no_positivity: bool,

    /// 0: periodic, 1: half PSF padding, 2: full PSF padding
    #[arg(long = "bq")]
    border_quality: Option<u8>,

    /// Largest tile size in x and y, enables tiling of larger images
    #[arg(long = "tilesize")]
    tile_max_size: Option<usize>,

    /// Halo around every tile
    #[arg(long = "tilepad")]
    tile_padding: Option<usize>,

    /// Fraction of the PSF energy that the XY crop may remove, 0 to disable
    #[arg(long = "xycropfactor")]
    xy_crop_factor: Option<f64>,

    /// Added to the central PSF voxel
    #[arg(long)]
    relax: Option<f32>,

    /// Sigma of a Gaussian pre-filter of image and PSF
    #[arg(long = "psigma")]
    prefilter_sigma: Option<f32>,

    /// Write 32 bit floats instead of 16 bit integers
    #[arg(long)]
    float: bool,

    /// Search this far beyond the minimal work size for faster transforms
    #[arg(long)]
    lookahead: Option<usize>,

    /// Overwrite an existing output
    #[arg(long)]
    overwrite: bool,

    /// Pad the PSF to odd extents and center its maximum in z
    #[arg(long)]
    psf_recenter: bool,

    #[arg(short, long)]
    threads: Option<usize>,

    /// 2D correction image every plane is divided by
    #[arg(long)]
    flatfield: Option<PathBuf>,

    /// Transform timing cache (default: ~/.config/deconv3d/wisdom.json)
    #[arg(long)]
    wisdom: Option<PathBuf>,

    /// Do not write <out>.log.txt
    #[arg(long)]
    no_log: bool,
}

impl Args {
    fn output_path(&self) -> PathBuf {
        if let Some(out) = &self.out {
            return out.clone();
        }
        let name = self
            .image
            .file_name()
            .map(|n| format!("dw_{}", n.to_string_lossy()))
            .unwrap_or_else(|| "dw_output.npy".to_string());
        self.image.with_file_name(name)
    }

    fn to_config(&self) -> Result<DeconvConfig> {
        let mut config = match &self.config {
            Some(path) => DeconvConfig::load(path)?,
            None => DeconvConfig::default(),
        };
        if let Some(n) = self.iterations {
            config.policy = IterationPolicy::Fixed(n);
        }
        if let Some(tol) = self.relative_error {
            config.policy = IterationPolicy::Relative(tol);
        }
        if let Some(tol) = self.absolute_error {
            config.policy = IterationPolicy::Absolute(tol);
        }
        if let Some(n) = self.max_iterations {
            config.max_iterations = n;
        }
        if let Some(method) = self.method {
            config.method = method.into();
        }
        if let Some(level) = self.acceleration {
            config.acceleration = level;
        }
        if let Some(metric) = self.metric {
            config.metric = match metric {
                CliMetric::Mse => MetricKind::Mse,
                CliMetric::Idiv => MetricKind::IDivergence,
            };
        }
        if let Some(bg) = self.background {
            config.background = bg;
        }
        if self.no_positivity {
            config.positivity = false;
        }
        if let Some(level) = self.border_quality {
            config.border_quality = BorderQuality::try_from(level)?;
        }
        if self.tile_max_size.is_some() {
            config.tile_max_size = self.tile_max_size;
        }
        if let Some(padding) = self.tile_padding {
            config.tile_padding = padding;
        }
        if let Some(factor) = self.xy_crop_factor {
            config.xy_crop_factor = factor;
        }
        if let Some(relax) = self.relax {
            config.relax = relax;
        }
        if let Some(sigma) = self.prefilter_sigma {
            config.prefilter_sigma = sigma;
        }
        if self.float {
            config.output_format = OutputFormat::F32;
        }
        if let Some(lookahead) = self.lookahead {
            config.lookahead = lookahead;
        }
        config.overwrite |= self.overwrite;
        config.psf_recenter |= self.psf_recenter;
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if self.flatfield.is_some() {
            config.flatfield = self.flatfield.clone();
        }
        if self.wisdom.is_some() {
            config.wisdom_path = self.wisdom.clone();
        }
        if self.no_log {
            config.write_log = false;
        }
        Ok(config)
    }
}

fn run(args: &Args, output: &Path) -> Result<()> {
    let config = args.to_config()?;
    pipeline::run(&args.image, &args.psf, output, &config, &NpyStore)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let output = args.output_path();

    match run(&args, &output) {
        Ok(()) => {
            log::info!("Wrote {output:?}");
            ExitCode::SUCCESS
        }
        Err(err) if err.is_already_exists() => {
            log::info!("{output:?} already exists, skipping (use --overwrite to replace it)");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
