//! Settings of a deconvolution run.

use crate::error::{DeconvError, Result};
use preferences::Preferences;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::path::{Path, PathBuf};

/// When the iteration loop stops.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum IterationPolicy {
    /// Exactly this many iterations.
    Fixed(usize),
    /// Stop once the relative change of the error drops below the tolerance.
    Relative(f64),
    /// Stop once the error drops below the tolerance.
    Absolute(f64),
}

/// Update rule of the deconvolution loop.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    #[serde(rename = "identity")]
    Identity,
    #[serde(rename = "rl")]
    RichardsonLucy,
    #[serde(rename = "shb")]
    HeavyBall,
    #[serde(rename = "ave")]
    Ave,
    #[serde(rename = "eve")]
    Eve,
}

impl Display for MethodKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodKind::Identity => write!(f, "Identity"),
            MethodKind::RichardsonLucy => write!(f, "Richardson-Lucy"),
            MethodKind::HeavyBall => write!(f, "Scaled Heavy Ball"),
            MethodKind::Ave => write!(f, "Biggs-Andrews AVE"),
            MethodKind::Eve => write!(f, "Biggs-Andrews EVE"),
        }
    }
}

/// Error measure between the simulated and the observed image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Mse,
    #[serde(rename = "idiv")]
    IDivergence,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Mse => write!(f, "MSE"),
            MetricKind::IDivergence => write!(f, "Idiv"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    U16,
    F32,
}

/// How much padding the work domain gets around the image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BorderQuality {
    /// No padding beyond the PSF size, periodic artifacts at the edges.
    Periodic,
    /// Half a PSF of padding.
    Compromise,
    /// A full PSF of padding, no wrap-around at all.
    Full,
}

impl TryFrom<u8> for BorderQuality {
    type Error = DeconvError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(BorderQuality::Periodic),
            1 => Ok(BorderQuality::Compromise),
            2 => Ok(BorderQuality::Full),
            _ => Err(DeconvError::Configuration(format!(
                "border quality must be 0, 1 or 2, got {level}"
            ))),
        }
    }
}

/// All settings of one run. Loadable from and storable to JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeconvConfig {
    pub policy: IterationPolicy,
    /// Upper bound for the relative and absolute policies.
    pub max_iterations: usize,
    pub method: MethodKind,
    /// Acceleration level of AVE/EVE, 0 (off) to 3.
    pub acceleration: u8,
    pub metric: MetricKind,
    /// Lower bound of the estimate when `positivity` is on.
    pub background: f32,
    pub positivity: bool,
    pub border_quality: BorderQuality,
    /// Tile the image in x and y when it is larger than this.
    pub tile_max_size: Option<usize>,
    /// Halo added around every tile interior.
    pub tile_padding: usize,
    pub xy_crop_factor: f64,
    /// Added to the central PSF voxel before renormalisation. 0 disables.
    pub relax: f32,
    /// Sigma of the Gaussian pre-filter applied to image and PSF. 0 disables.
    pub prefilter_sigma: f32,
    pub output_format: OutputFormat,
    /// Largest enlargement of a work axis considered when searching fast transform sizes.
    pub lookahead: usize,
    pub overwrite: bool,
    pub psf_recenter: bool,
    pub threads: usize,
    /// 2D correction image every z plane is divided by.
    pub flatfield: Option<PathBuf>,
    /// Where transform timings are cached. `None` uses the default location.
    pub wisdom_path: Option<PathBuf>,
    /// Write `<out>.log.txt` next to the output.
    pub write_log: bool,
}

impl Default for DeconvConfig {
    fn default() -> Self {
        DeconvConfig {
            policy: IterationPolicy::Relative(0.02),
            max_iterations: 250,
            method: MethodKind::HeavyBall,
            acceleration: 1,
            metric: MetricKind::IDivergence,
            background: 1e-5,
            positivity: true,
            border_quality: BorderQuality::Full,
            tile_max_size: None,
            tile_padding: 20,
            xy_crop_factor: 0.001,
            relax: 0.0,
            prefilter_sigma: 0.0,
            output_format: OutputFormat::U16,
            lookahead: 0,
            overwrite: false,
            psf_recenter: false,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            flatfield: None,
            wisdom_path: None,
            write_log: true,
        }
    }
}

impl DeconvConfig {
    /// Rejects settings that can not lead to a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(DeconvError::Configuration(msg));
        match self.policy {
            IterationPolicy::Fixed(_) => {}
            IterationPolicy::Relative(tol) | IterationPolicy::Absolute(tol) => {
                if !(tol.is_finite() && tol > 0.0) {
                    return fail(format!("tolerance must be positive, got {tol}"));
                }
                if self.max_iterations == 0 {
                    return fail("max_iterations must be at least 1".to_string());
                }
            }
        }
        if self.acceleration > 3 {
            return fail(format!(
                "acceleration level must be 0 to 3, got {}",
                self.acceleration
            ));
        }
        if !(self.background.is_finite() && self.background >= 0.0) {
            return fail(format!("background must be >= 0, got {}", self.background));
        }
        if self.tile_max_size == Some(0) {
            return fail("tile_max_size must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.xy_crop_factor) {
            return fail(format!(
                "xy_crop_factor must be in [0, 1), got {}",
                self.xy_crop_factor
            ));
        }
        if !(self.relax.is_finite() && self.relax >= 0.0) {
            return fail(format!("relax must be >= 0, got {}", self.relax));
        }
        if !(self.prefilter_sigma.is_finite() && self.prefilter_sigma >= 0.0) {
            return fail(format!(
                "prefilter_sigma must be >= 0, got {}",
                self.prefilter_sigma
            ));
        }
        if self.threads == 0 {
            return fail("at least one thread is needed".to_string());
        }
        Ok(())
    }

    /// Number of iterations the loop may run at most.
    pub fn iteration_limit(&self) -> usize {
        match self.policy {
            IterationPolicy::Fixed(n) => n,
            _ => self.max_iterations,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|err| DeconvError::io(path, err))?;
        DeconvConfig::load_from(&mut file).map_err(|err| DeconvError::format(path, format!("{err:?}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path).map_err(|err| DeconvError::io(path, err))?;
        self.save_to(&mut file)
            .map_err(|err| DeconvError::format(path, format!("{err:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeconvConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.iteration_limit(), 250);
        assert_eq!(config.method, MethodKind::HeavyBall);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let cases: Vec<Box<dyn Fn(&mut DeconvConfig)>> = vec![
            Box::new(|c| c.policy = IterationPolicy::Relative(0.0)),
            Box::new(|c| c.policy = IterationPolicy::Absolute(f64::NAN)),
            Box::new(|c| c.max_iterations = 0),
            Box::new(|c| c.acceleration = 4),
            Box::new(|c| c.background = -1.0),
            Box::new(|c| c.tile_max_size = Some(0)),
            Box::new(|c| c.xy_crop_factor = 1.0),
            Box::new(|c| c.relax = -0.1),
            Box::new(|c| c.prefilter_sigma = f32::INFINITY),
            Box::new(|c| c.threads = 0),
        ];
        for mutate in cases {
            let mut config = DeconvConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(DeconvError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_fixed_policy_sets_limit() {
        let config = DeconvConfig {
            policy: IterationPolicy::Fixed(7),
            max_iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.iteration_limit(), 7);
    }

    #[test]
    fn test_border_quality_levels() {
        assert_eq!(BorderQuality::try_from(0).unwrap(), BorderQuality::Periodic);
        assert_eq!(BorderQuality::try_from(2).unwrap(), BorderQuality::Full);
        assert!(BorderQuality::try_from(3).is_err());
    }

    #[test]
    fn test_config_file_round_trip_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let config = DeconvConfig {
            policy: IterationPolicy::Fixed(12),
            method: MethodKind::Eve,
            tile_max_size: Some(512),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(DeconvConfig::load(&path).unwrap(), config);

        let partial = dir.path().join("partial.json");
        std::fs::write(&partial, r#"{"method": "rl", "metric": "mse"}"#).unwrap();
        let loaded = DeconvConfig::load(&partial).unwrap();
        assert_eq!(loaded.method, MethodKind::RichardsonLucy);
        assert_eq!(loaded.metric, MetricKind::Mse);
        assert_eq!(loaded.tile_padding, 20);
    }
}
