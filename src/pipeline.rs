//! Run controller: reads the inputs, prepares image and PSF, deconvolves the whole volume
//! or tile by tile, and writes the result.
//!
//! The result is first written to `<out>.partial` and renamed once complete, so the output
//! path never holds a partial result.

use crate::config::DeconvConfig;
use crate::context::ExecutionContext;
use crate::engine::wisdom::default_wisdom_path;
use crate::error::{DeconvError, Result};
use crate::io::{RawScratch, VolumeStore};
use crate::math_tools::{background_fraction, flatfield_correct, gaussian_smooth, sanitize};
use crate::methods::deconvolve;
use crate::psf;
use crate::tiling::{partition, run_tiled, tile_psf};
use crate::volume::{voxel_count, Volume};
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub elapsed: Duration,
    /// Peak resident memory in KiB, where the platform reports it.
    pub peak_memory_kib: Option<u64>,
    /// Fraction of output voxels at the background level.
    pub background_fraction: f64,
    /// Number of tiles, 0 for a whole-volume run.
    pub tiles: usize,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Took {:.2} s", self.elapsed.as_secs_f64())?;
        if let Some(kib) = self.peak_memory_kib {
            write!(f, ", peak memory {:.1} MiB", kib as f64 / 1024.0)?;
        }
        if self.tiles > 0 {
            write!(f, ", {} tiles", self.tiles)?;
        }
        write!(
            f,
            ", {:.2}% of the voxels at the background level",
            100.0 * self.background_fraction
        )
    }
}

/// Peak resident set size (`VmHWM`) of this process in KiB, Linux only.
pub fn peak_memory_kib() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.split_whitespace().next()?.parse().ok())
}

/// `path` with `suffix` appended to its file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where the run log of `output` goes.
pub fn log_path(output: &Path) -> PathBuf {
    with_suffix(output, ".log.txt")
}

fn not_centered() -> DeconvError {
    DeconvError::Psf(
        "the PSF is not centered, crop it or enable psf_recenter".to_string(),
    )
}

/// Deconvolves the image at `image_path` with the PSF at `psf_path` and writes the result
/// to `output`.
///
/// # Arguments
/// - `store`: Reads the inputs and writes the output.
///
/// # Returns
/// The run summary, or `Err(DeconvError::AlreadyExists)` without doing anything if
/// `output` exists and `config.overwrite` is off.
pub fn run(
    image_path: &Path,
    psf_path: &Path,
    output: &Path,
    config: &DeconvConfig,
    store: &dyn VolumeStore,
) -> Result<RunSummary> {
    let started = Instant::now();
    config.validate()?;
    if output.exists() && !config.overwrite {
        return Err(DeconvError::AlreadyExists(output.to_path_buf()));
    }

    let mut exec = ExecutionContext::new(config.threads)?;
    if let Some(wisdom) = config.wisdom_path.clone().or_else(default_wisdom_path) {
        exec = exec.with_wisdom_file(wisdom);
    }
    if config.write_log {
        exec = exec.with_run_log(&log_path(output))?;
    }
    exec.info(&format!("image: {image_path:?}"));
    exec.info(&format!("psf: {psf_path:?}"));
    exec.info(&format!("output: {output:?}"));
    exec.info(&format!("{config:?}"));
    exec.info(&format!(
        "{} threads, at most {} iterations",
        exec.threads(),
        config.iteration_limit()
    ));

    let psf = store.read_volume(psf_path)?;
    let dims = store.dims(image_path)?;
    let partial = with_suffix(output, ".partial");

    let outcome = match config.tile_max_size {
        Some(max) if dims[0] > max || dims[1] > max => {
            process_tiled(image_path, psf, &partial, max, config, store, &exec)
        }
        _ => process_whole(image_path, psf, &partial, config, store, &exec).map(|bg| (bg, 0)),
    };
    let (background, tiles) = match outcome {
        Ok(done) => done,
        Err(err) => {
            if partial.exists() {
                if let Err(rm) = std::fs::remove_file(&partial) {
                    log::warn!("could not remove {partial:?}: {rm}");
                }
            }
            exec.warn(&format!("run failed: {err}"));
            return Err(err);
        }
    };
    std::fs::rename(&partial, output).map_err(|err| DeconvError::io(output, err))?;
    exec.save_wisdom();

    let summary = RunSummary {
        elapsed: started.elapsed(),
        peak_memory_kib: peak_memory_kib(),
        background_fraction: background,
        tiles,
    };
    exec.info(&summary.to_string());
    Ok(summary)
}

/// Deconvolves the image in memory.
///
/// # Returns
/// The background fraction of the result.
fn process_whole(
    image_path: &Path,
    psf: Volume,
    partial: &Path,
    config: &DeconvConfig,
    store: &dyn VolumeStore,
    exec: &ExecutionContext,
) -> Result<f64> {
    let mut image = store.read_volume(image_path)?;
    sanitize(&mut image, exec);
    if let Some(flatfield) = &config.flatfield {
        exec.info(&format!("applying flat field correction using {flatfield:?}"));
        flatfield_correct(&mut image, &store.read_volume(flatfield)?)?;
    }
    let mut psf = psf;
    if config.prefilter_sigma > 0.0 {
        gaussian_smooth(&mut image, config.prefilter_sigma, exec)?;
        gaussian_smooth(&mut psf, config.prefilter_sigma, exec)?;
    }
    let psf = psf::prepare(psf, image.dims(), config, exec)?;
    let result = deconvolve(&image, &psf, config, exec)?.ok_or_else(not_centered)?;
    store.write_volume(partial, &result, config.output_format)?;
    Ok(background_fraction(&result, config.background))
}

/// Deconvolves the image tile by tile through raw scratch files next to the output.
///
/// # Returns
/// The background fraction of the result and the number of tiles.
fn process_tiled(
    image_path: &Path,
    psf: Volume,
    partial: &Path,
    max_size: usize,
    config: &DeconvConfig,
    store: &dyn VolumeStore,
    exec: &ExecutionContext,
) -> Result<(f64, usize)> {
    if config.flatfield.is_some() {
        exec.warn("flat field correction is not available when tiling, ignoring it");
    }
    let dims = store.dims(image_path)?;
    let tiles = partition(dims, max_size, config.tile_padding)?;
    exec.info(&format!(
        "Tiling {dims:?} into {} tiles of at most {max_size} + {} padding",
        tiles.len(),
        config.tile_padding
    ));
    let mut psf = psf;
    if config.prefilter_sigma > 0.0 {
        gaussian_smooth(&mut psf, config.prefilter_sigma, exec)?;
    }
    let psf = psf::prepare(psf, dims, config, exec)?;

    let mut source = store.to_raw(image_path, &with_suffix(partial, ".image.raw"))?;
    let mut output = match RawScratch::create_zeroed(&with_suffix(partial, ".result.raw"), dims) {
        Ok(output) => output,
        Err(err) => {
            source.remove();
            return Err(err);
        }
    };
    let mut at_background = 0usize;
    let outcome = run_tiled(&tiles, &mut source, &mut output, exec, |tile, mut block| {
        if config.prefilter_sigma > 0.0 {
            gaussian_smooth(&mut block, config.prefilter_sigma, exec)?;
        }
        let psf = tile_psf(&psf, tile, exec)?;
        let result = deconvolve(&block, &psf, config, exec)?.ok_or_else(not_centered)?;
        at_background += result
            .cuboid(tile.interior_offset(), tile.interior_extent)
            .count_equal(config.background);
        Ok(result)
    })
    .and_then(|_| store.from_raw(&mut output, partial, config.output_format));
    source.remove();
    output.remove();
    outcome?;
    log::debug!(
        "{} tiles used {} transform plans",
        tiles.len(),
        exec.cached_plans()
    );
    Ok((
        at_background as f64 / voxel_count(dims).max(1) as f64,
        tiles.len(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IterationPolicy, MethodKind, OutputFormat};
    use crate::io::NpyStore;
    use approx::assert_relative_eq;
    use std::fs;

    fn test_config(dir: &Path) -> DeconvConfig {
        DeconvConfig {
            output_format: OutputFormat::F32,
            wisdom_path: Some(dir.join("wisdom.json")),
            threads: 2,
            ..Default::default()
        }
    }

    fn write_inputs(dir: &Path, image: &Volume) -> (PathBuf, PathBuf) {
        let mut psf = Volume::from_fn([5, 5, 3], |x, y, z| {
            let d2 = (x as f32 - 2.0).powi(2) + (y as f32 - 2.0).powi(2);
            (-d2 / 2.0 - (z as f32 - 1.0).powi(2)).exp()
        });
        psf.normalize_sum1();
        let image_path = dir.join("image.npy");
        let psf_path = dir.join("psf.npy");
        NpyStore
            .write_volume(&image_path, image, OutputFormat::F32)
            .unwrap();
        NpyStore
            .write_volume(&psf_path, &psf, OutputFormat::F32)
            .unwrap();
        (image_path, psf_path)
    }

    fn blobs(dims: [usize; 3]) -> Volume {
        Volume::from_fn(dims, |x, y, z| {
            let d2 = (x as f32 - 8.0).powi(2) + (y as f32 - 7.0).powi(2) + (z as f32 - 1.0).powi(2);
            50.0 + 1000.0 * (-d2 / 6.0).exp()
        })
    }

    #[test]
    fn test_existing_output_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let (image, psf) = write_inputs(dir.path(), &blobs([16, 14, 3]));
        let output = dir.path().join("out.npy");
        fs::write(&output, "keep me").unwrap();

        let err = run(&image, &psf, &output, &test_config(dir.path()), &NpyStore).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(fs::read_to_string(&output).unwrap(), "keep me");
        assert!(!log_path(&output).exists());
    }

    #[test]
    fn test_identity_run_writes_input_back() {
        let dir = tempfile::tempdir().unwrap();
        let image = blobs([16, 14, 3]);
        let (image_path, psf_path) = write_inputs(dir.path(), &image);
        let output = dir.path().join("out.npy");
        let config = DeconvConfig {
            method: MethodKind::Identity,
            ..test_config(dir.path())
        };

        let summary = run(&image_path, &psf_path, &output, &config, &NpyStore).unwrap();
        assert_eq!(NpyStore.read_volume(&output).unwrap(), image);
        assert_eq!(summary.tiles, 0);
        assert_eq!(summary.background_fraction, 0.0);
        assert!(!with_suffix(&output, ".partial").exists());
        let log = fs::read_to_string(log_path(&output)).unwrap();
        assert!(log.contains("background level"));
    }

    #[test]
    fn test_negative_images_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let image = Volume::from_fn([6, 5, 3], |x, y, _| x as f32 - y as f32);
        let (image_path, psf_path) = write_inputs(dir.path(), &image);
        let output = dir.path().join("out.npy");
        let config = DeconvConfig {
            method: MethodKind::Identity,
            write_log: false,
            ..test_config(dir.path())
        };

        run(&image_path, &psf_path, &output, &config, &NpyStore).unwrap();
        let result = NpyStore.read_volume(&output).unwrap();
        assert_eq!(result.min(), 0.0);
        assert_relative_eq!(result.max(), 1000.0, max_relative = 1e-6);
        assert!(!log_path(&output).exists());
    }

    #[test]
    fn test_uncentered_psf_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let (image_path, _) = write_inputs(dir.path(), &blobs([16, 14, 3]));
        let psf_path = dir.path().join("even.npy");
        let mut psf = Volume::constant([4, 4, 2], 0.1);
        psf[[3, 3, 1]] = 1.0;
        NpyStore
            .write_volume(&psf_path, &psf, OutputFormat::F32)
            .unwrap();
        let output = dir.path().join("out.npy");
        let config = DeconvConfig {
            method: MethodKind::RichardsonLucy,
            policy: IterationPolicy::Fixed(2),
            ..test_config(dir.path())
        };

        let err = run(&image_path, &psf_path, &output, &config, &NpyStore).unwrap_err();
        assert!(matches!(err, DeconvError::Psf(_)));
        assert!(!output.exists());
        assert!(!with_suffix(&output, ".partial").exists());
    }

    #[test]
    fn test_tiled_run_cleans_up_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = blobs([24, 20, 3]);
        let (image_path, psf_path) = write_inputs(dir.path(), &image);
        let output = dir.path().join("out.npy");
        let config = DeconvConfig {
            method: MethodKind::RichardsonLucy,
            policy: IterationPolicy::Fixed(2),
            tile_max_size: Some(12),
            tile_padding: 8,
            ..test_config(dir.path())
        };

        let summary = run(&image_path, &psf_path, &output, &config, &NpyStore).unwrap();
        assert_eq!(summary.tiles, 4);
        let result = NpyStore.read_volume(&output).unwrap();
        assert_eq!(result.dims(), [24, 20, 3]);
        assert!(result.all_finite());
        assert!(result.min() > 0.0);

        let partial = with_suffix(&output, ".partial");
        assert!(!with_suffix(&partial, ".image.raw").exists());
        assert!(!with_suffix(&partial, ".result.raw").exists());
        assert!(!partial.exists());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeconvConfig {
            acceleration: 7,
            ..test_config(dir.path())
        };
        let missing = dir.path().join("missing.npy");
        let err = run(&missing, &missing, &dir.path().join("out.npy"), &config, &NpyStore)
            .unwrap_err();
        assert!(matches!(err, DeconvError::Configuration(_)));
    }
}
