//! Point spread function preparation.
//!
//! Measured or generated PSFs are usually larger than needed and not always perfectly
//! centered. Before the kernels are built the PSF is normalised, checked and cropped, which
//! keeps the work domain, and with it every transform, as small as possible.

use crate::config::DeconvConfig;
use crate::context::ExecutionContext;
use crate::engine::work_domain::fastest_length;
use crate::error::{DeconvError, Result};
use crate::volume::{Dims, Volume};

/// Returns `true` if all extents are odd and the central voxel is the maximum.
///
/// Voxels equal to the center value are allowed, so a constant PSF is centered.
pub fn is_centered(psf: &Volume) -> bool {
    let dims = psf.dims();
    if psf.is_empty() || dims.iter().any(|d| d % 2 == 0) {
        return false;
    }
    let peak = psf[psf.center()];
    peak >= psf.max()
}

/// Logs a warning if the PSF is not centered.
pub fn check_centering(psf: &Volume, ctx: &ExecutionContext) -> bool {
    let centered = is_centered(psf);
    if !centered {
        ctx.warn(&format!(
            "the PSF of {:?} is not centered, its extents must be odd and the maximum in the middle",
            psf.dims()
        ));
    }
    centered
}

/// Scales the PSF to unit sum.
///
/// # Returns
/// `Err(DeconvError::Psf)` for empty PSFs and PSFs without positive mass.
pub fn normalize(psf: &mut Volume) -> Result<()> {
    let sum = psf.sum();
    if psf.is_empty() || !sum.is_finite() || sum <= 0.0 {
        return Err(DeconvError::Psf(format!(
            "cannot normalise a PSF of {:?} with sum {sum}",
            psf.dims()
        )));
    }
    psf.normalize_sum1();
    Ok(())
}

/// Crops the PSF to at most `2 (X - 1) + 1` voxels along each axis of an image of `image` dims.
///
/// A larger PSF only adds padding without changing the result. The crop is symmetric, so
/// a centered PSF stays centered.
pub fn autocrop_by_image(psf: Volume, image: Dims, ctx: &ExecutionContext) -> Volume {
    let dims = psf.dims();
    let optimal = image.map(|x| 2 * x.saturating_sub(1) + 1);
    if dims[2] < optimal[2] {
        ctx.warn(&format!(
            "the PSF has only {} slices, {} would be better",
            dims[2], optimal[2]
        ));
    }
    if (0..3).all(|a| dims[a] <= optimal[a]) {
        return psf;
    }
    let extent = [0, 1, 2].map(|a| dims[a].min(optimal[a]));
    let origin = [0, 1, 2].map(|a| (dims[a] - extent[a]) / 2);
    let cropped = psf.cuboid(origin, extent);
    ctx.info(&format!("PSF crop by image size {dims:?} -> {extent:?}"));
    cropped
}

/// Sum of every YZ plane, indexed by x.
fn yz_plane_sums(psf: &Volume) -> Vec<f64> {
    let [m, n, p] = psf.dims();
    let mut sums = vec![0.0f64; m];
    for z in 0..p {
        for y in 0..n {
            let row = psf.offset(0, y, z);
            for (x, sum) in sums.iter_mut().enumerate() {
                *sum += psf.as_slice()[row + x] as f64;
            }
        }
    }
    sums
}

/// Removes outer X and Y planes that carry almost no signal.
///
/// # Arguments
/// - `psf`: The PSF, ideally centered.
/// - `image`: Dims of the image to deconvolve.
/// - `factor`: Planes are removed while their accumulated sum stays below
///   `factor` times the sum of the strongest YZ plane. 0 disables cropping.
/// - `lookahead`: If positive, up to `lookahead / 2` of the removable planes per side are
///   kept again when the resulting transform length is faster.
/// - `ctx`: Used for the transform timings and the log.
///
/// # Returns
/// The cropped PSF, never cropped past its central plane.
pub fn autocrop_xy(
    psf: Volume,
    image: Dims,
    factor: f64,
    lookahead: usize,
    ctx: &ExecutionContext,
) -> Volume {
    let [m, n, p] = psf.dims();
    if m == 0 || n == 0 {
        return psf;
    }
    let sums = yz_plane_sums(&psf);
    let peak = sums.iter().cloned().fold(0.0, f64::max);
    let threshold = factor * peak;
    let limit = ((m - 1) / 2).min((n - 1) / 2);

    let mut first = 0;
    let mut accumulated = 0.0;
    while first < limit && accumulated + sums[first] < threshold {
        accumulated += sums[first];
        first += 1;
    }
    if first == 0 {
        log::debug!("PSF XY-crop: not cropping");
        return psf;
    }

    if lookahead > 0 {
        let full = image[0] + m - 1;
        let smallest = full - 2 * first;
        let largest = full.min(smallest + lookahead);
        let candidates: Vec<usize> = (smallest..=largest).step_by(2).collect();
        let best = fastest_length(&candidates, ctx);
        let keep = (best - smallest) / 2;
        ctx.info(&format!(
            "lookahead: job size {best} instead of {smallest}, keeping {keep} more planes"
        ));
        first -= keep;
    }

    let extent = [m - 2 * first, n - 2 * first, p];
    let cropped = psf.cuboid([first, first, 0], extent);
    ctx.info(&format!("PSF XY-crop [{m} x {n} x {p}] -> {extent:?}"));
    cropped
}

/// Adds `amount` to the central voxel and renormalises.
pub fn relax(psf: &mut Volume, amount: f32) -> Result<()> {
    let center = psf.center();
    psf[center] += amount;
    normalize(psf)
}

/// Pads even extents to the next odd number, keeping the data at the origin.
pub fn make_odd(psf: Volume) -> Volume {
    let dims = psf.dims();
    let odd = dims.map(|d| d | 1);
    if odd == dims {
        psf
    } else {
        log::debug!("PSF padded from {dims:?} to {odd:?}");
        psf.expand(odd)
    }
}

/// Keeps the Z planes around the brightest plane on the central axis, so that the
/// maximum along the axis ends up in the middle plane.
pub fn center_z(psf: Volume, ctx: &ExecutionContext) -> Volume {
    let [m, n, p] = psf.dims();
    if psf.is_empty() {
        return psf;
    }
    let [cx, cy, cz] = psf.center();
    let mut brightest = 0;
    for z in 1..p {
        if psf[[cx, cy, z]] > psf[[cx, cy, brightest]] {
            brightest = z;
        }
    }
    if brightest == cz {
        log::debug!("PSF is Z-centered");
        return psf;
    }
    let half = brightest.min(p - 1 - brightest);
    let first = brightest - half;
    let planes = 2 * half + 1;
    ctx.info(&format!(
        "PSF brightest at plane {brightest}, selecting Z-planes {first} -- {}",
        first + planes - 1
    ));
    psf.cuboid([0, 0, first], [m, n, planes])
}

/// Runs the complete preparation for an image of `image` dims.
///
/// Normalises, checks the centering, optionally recenters, crops by image size and by
/// signal, relaxes and normalises again.
pub fn prepare(
    psf: Volume,
    image: Dims,
    config: &DeconvConfig,
    ctx: &ExecutionContext,
) -> Result<Volume> {
    let mut psf = psf;
    normalize(&mut psf)?;
    if config.psf_recenter {
        psf = center_z(make_odd(psf), ctx);
        normalize(&mut psf)?;
    }
    check_centering(&psf, ctx);
    psf = autocrop_by_image(psf, image, ctx);
    psf = autocrop_xy(psf, image, config.xy_crop_factor, config.lookahead, ctx);
    if config.relax > 0.0 {
        relax(&mut psf, config.relax)?;
    }
    normalize(&mut psf)?;
    Ok(psf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian(dims: Dims, sigma: [f32; 3]) -> Volume {
        let c = dims.map(|d| ((d - 1) / 2) as f32);
        Volume::from_fn(dims, |x, y, z| {
            let d = [x as f32 - c[0], y as f32 - c[1], z as f32 - c[2]];
            (-(0..3).map(|a| d[a] * d[a] / (2.0 * sigma[a] * sigma[a])).sum::<f32>()).exp()
        })
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(1).unwrap()
    }

    #[test]
    fn test_centering_validation() {
        assert!(is_centered(&gaussian([5, 7, 3], [1.0, 1.0, 1.0])));
        assert!(is_centered(&Volume::constant([3, 3, 3], 0.5)));
        assert!(!is_centered(&gaussian([4, 5, 5], [1.0, 1.0, 1.0])));
        let mut shifted = gaussian([5, 5, 5], [1.0, 1.0, 1.0]);
        shifted[[0, 0, 0]] = 2.0;
        assert!(!is_centered(&shifted));
    }

    #[test]
    fn test_normalize_rejects_empty_mass() {
        let mut psf = gaussian([3, 3, 3], [1.0, 1.0, 1.0]);
        normalize(&mut psf).unwrap();
        assert_abs_diff_eq!(psf.sum(), 1.0, epsilon = 1e-6);
        let mut zero = Volume::zeros([3, 3, 3]);
        assert!(matches!(normalize(&mut zero), Err(DeconvError::Psf(_))));
    }

    #[test]
    fn test_autocrop_by_image_is_symmetric() {
        let psf = gaussian([41, 41, 41], [3.0, 3.0, 5.0]);
        let cropped = autocrop_by_image(psf, [10, 12, 30], &ctx());
        assert_eq!(cropped.dims(), [19, 23, 41]);
        assert!(is_centered(&cropped));

        let small = gaussian([5, 5, 5], [1.0, 1.0, 1.0]);
        assert_eq!(autocrop_by_image(small.clone(), [10, 10, 10], &ctx()), small);
    }

    #[test]
    fn test_autocrop_xy_removes_empty_planes() {
        let mut psf = gaussian([31, 31, 5], [1.5, 1.5, 1.0]);
        psf.normalize_sum1();
        let cropped = autocrop_xy(psf.clone(), [100, 100, 20], 0.001, 0, &ctx());
        let [m, n, p] = cropped.dims();
        assert!(m < 31 && m % 2 == 1);
        assert_eq!(m, n);
        assert_eq!(p, 5);
        assert!(is_centered(&cropped));
        // almost all of the mass is kept
        assert!(cropped.sum() > 0.995 * psf.sum());

        let untouched = autocrop_xy(psf.clone(), [100, 100, 20], 0.0, 0, &ctx());
        assert_eq!(untouched, psf);
    }

    #[test]
    fn test_autocrop_xy_never_crops_past_center() {
        // everything is concentrated in one voxel
        let mut psf = Volume::zeros([9, 9, 3]);
        psf[[4, 4, 1]] = 1.0;
        let cropped = autocrop_xy(psf, [50, 50, 10], 0.5, 0, &ctx());
        assert_eq!(cropped.dims(), [1, 1, 3]);
        assert_eq!(cropped[[0, 0, 1]], 1.0);
    }

    #[test]
    fn test_autocrop_xy_with_lookahead_stays_in_range() {
        let psf = gaussian([31, 31, 5], [1.5, 1.5, 1.0]);
        let plain = autocrop_xy(psf.clone(), [64, 64, 10], 0.001, 0, &ctx());
        let tuned = autocrop_xy(psf, [64, 64, 10], 0.001, 6, &ctx());
        assert!(tuned.dims()[0] >= plain.dims()[0]);
        assert!(tuned.dims()[0] <= plain.dims()[0] + 6);
        assert!(is_centered(&tuned));
    }

    #[test]
    fn test_relax_raises_center() {
        let mut psf = gaussian([5, 5, 5], [1.0, 1.0, 1.0]);
        normalize(&mut psf).unwrap();
        let before = psf[[2, 2, 2]];
        relax(&mut psf, 0.1).unwrap();
        assert!(psf[[2, 2, 2]] > before);
        assert_abs_diff_eq!(psf.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_make_odd_pads_at_the_end() {
        let psf = Volume::constant([4, 5, 6], 1.0);
        let odd = make_odd(psf);
        assert_eq!(odd.dims(), [5, 5, 7]);
        assert_eq!(odd[[3, 4, 5]], 1.0);
        assert_eq!(odd[[4, 4, 6]], 0.0);
    }

    #[test]
    fn test_center_z_selects_planes_around_peak() {
        let mut psf = Volume::zeros([3, 3, 9]);
        for z in 0..9 {
            psf[[1, 1, z]] = 1.0 / (1.0 + (z as f32 - 3.0).abs());
        }
        let centered = center_z(psf, &ctx());
        assert_eq!(centered.dims(), [3, 3, 7]);
        assert_eq!(centered[[1, 1, 3]], 1.0);
        assert!(is_centered(&centered));
    }

    #[test]
    fn test_prepare_produces_normalised_centered_psf() {
        let psf = gaussian([41, 41, 21], [2.0, 2.0, 2.0]);
        let config = DeconvConfig {
            relax: 0.05,
            ..Default::default()
        };
        let prepared = prepare(psf, [12, 12, 20], &config, &ctx()).unwrap();
        let [m, n, p] = prepared.dims();
        assert!(m <= 23 && n <= 23 && p <= 21);
        assert!(is_centered(&prepared));
        assert_abs_diff_eq!(prepared.sum(), 1.0, epsilon = 1e-5);
    }
}
