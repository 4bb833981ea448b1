//! Pre-processing filters and statistics of volumes: Gaussian smoothing, image sanitation,
//! flat-field correction and the background fraction reported after a run.

use crate::context::ExecutionContext;
use crate::error::{DeconvError, Result};
use crate::volume::Volume;
use ndarray::{ArrayViewMut1, ArrayViewMut3, Axis, Zip};

/// Values below which a sanitised image is scaled up.
pub const SANITIZE_MAX: f32 = 1000.0;

/// Half of a sampled Gaussian, `weights[k]` for offsets `0..=radius`.
fn gaussian_weights(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    (0..=radius)
        .map(|k| (-((k * k) as f32) / (2.0 * sigma * sigma)).exp())
        .collect()
}

/// Smooths one line in place.
///
/// Every input value is spread over its in-bounds neighbours with weights renormalised to
/// one, so the sum of the line does not change near the edges either.
fn smooth_lane(mut lane: ArrayViewMut1<'_, f32>, weights: &[f32], buffer: &mut Vec<f32>) {
    let len = lane.len();
    let radius = weights.len() - 1;
    buffer.clear();
    buffer.resize(len, 0.0);
    for (i, &value) in lane.iter().enumerate() {
        let lo = i.saturating_sub(radius);
        let hi = (i + radius).min(len - 1);
        let norm: f32 = (lo..=hi).map(|j| weights[i.abs_diff(j)]).sum();
        for j in lo..=hi {
            buffer[j] += value * weights[i.abs_diff(j)] / norm;
        }
    }
    for (dst, &src) in lane.iter_mut().zip(buffer.iter()) {
        *dst = src;
    }
}

/// Separable Gaussian smoothing with standard deviation `sigma` voxels along every axis.
///
/// Axes of length one are left alone. `sigma <= 0` is a no-op.
pub fn gaussian_smooth(volume: &mut Volume, sigma: f32, ctx: &ExecutionContext) -> Result<()> {
    if sigma <= 0.0 || volume.is_empty() {
        return Ok(());
    }
    let weights = gaussian_weights(sigma);
    let [m, n, p] = volume.dims();
    let mut view = ArrayViewMut3::from_shape((p, n, m), volume.as_mut_slice())
        .map_err(|err| DeconvError::Shape(err.to_string()))?;
    ctx.install(|| {
        for axis in [Axis(2), Axis(1), Axis(0)] {
            if view.len_of(axis) < 2 {
                continue;
            }
            Zip::from(view.lanes_mut(axis)).par_for_each(|lane| {
                let mut buffer = Vec::new();
                smooth_lane(lane, &weights, &mut buffer);
            });
        }
    });
    Ok(())
}

/// Shifts an image with negative values to a minimum of 0, and then scales it to a maximum
/// of [`SANITIZE_MAX`] if it is dimmer than that.
///
/// # Returns
/// `true` if the image was changed.
pub fn sanitize(image: &mut Volume, ctx: &ExecutionContext) -> bool {
    let min = image.min();
    if min >= 0.0 {
        return false;
    }
    ctx.info(&format!("min value of the image is {min}, shifting to 0"));
    image.add_scalar(-min);
    let max = image.max();
    if max > 0.0 && max < SANITIZE_MAX {
        image.scale(SANITIZE_MAX / max);
    }
    true
}

/// Divides every Z plane of `image` by the 2D `flatfield`.
pub fn flatfield_correct(image: &mut Volume, flatfield: &Volume) -> Result<()> {
    let [m, n, _] = image.dims();
    if flatfield.dims() != [m, n, 1] {
        return Err(DeconvError::Shape(format!(
            "flat field of {:?} for an image of {:?}",
            flatfield.dims(),
            image.dims()
        )));
    }
    if flatfield.min() <= 0.0 {
        return Err(DeconvError::Configuration(
            "the flat field must be positive".to_string(),
        ));
    }
    let correction = flatfield.as_slice();
    for plane in image.as_mut_slice().chunks_exact_mut(m * n) {
        for (v, c) in plane.iter_mut().zip(correction) {
            *v /= c;
        }
    }
    Ok(())
}

/// Fraction of voxels that are exactly at the `background` level.
pub fn background_fraction(volume: &Volume, background: f32) -> f64 {
    if volume.is_empty() {
        return 0.0;
    }
    volume.count_equal(background) as f64 / volume.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gaussian_smooth_preserves_mass() {
        let ctx = ExecutionContext::new(2).unwrap();
        let mut volume = Volume::zeros([12, 9, 5]);
        volume[[0, 0, 0]] = 100.0;
        volume[[6, 4, 2]] = 50.0;
        volume[[11, 8, 4]] = 7.0;
        gaussian_smooth(&mut volume, 1.5, &ctx).unwrap();
        assert_relative_eq!(volume.sum(), 157.0, max_relative = 1e-5);
        assert!(volume[[6, 4, 2]] < 50.0);
        assert!(volume[[7, 4, 2]] > 0.0);
        assert!(volume.min() >= 0.0);
    }

    #[test]
    fn test_gaussian_smooth_mass_and_noop() {
        let ctx = ExecutionContext::new(1).unwrap();
        let mut volume = Volume::constant([7, 6, 1], 3.0);
        gaussian_smooth(&mut volume, 0.8, &ctx).unwrap();
        assert_relative_eq!(volume.sum(), 126.0, max_relative = 1e-5);

        let before = Volume::from_fn([4, 4, 4], |x, y, z| (x * y + z) as f32);
        let mut after = before.clone();
        gaussian_smooth(&mut after, 0.0, &ctx).unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_sanitize_shifts_and_scales() {
        let ctx = ExecutionContext::new(1).unwrap();
        let mut image = Volume::from_vec([4, 1, 1], vec![-2.0, 0.0, 2.0, 3.0]).unwrap();
        assert!(sanitize(&mut image, &ctx));
        assert_eq!(image.min(), 0.0);
        assert_relative_eq!(image.max(), 1000.0);
        assert_relative_eq!(image[[1, 0, 0]], 400.0);

        let mut positive = Volume::constant([2, 2, 2], 5.0);
        assert!(!sanitize(&mut positive, &ctx));
        assert_eq!(positive.max(), 5.0);
    }

    #[test]
    fn test_flatfield_divides_every_plane() {
        let mut image = Volume::constant([2, 2, 3], 6.0);
        let flat = Volume::from_vec([2, 2, 1], vec![1.0, 2.0, 3.0, 6.0]).unwrap();
        flatfield_correct(&mut image, &flat).unwrap();
        assert_eq!(image[[1, 0, 2]], 3.0);
        assert_eq!(image[[1, 1, 1]], 1.0);
        assert!(flatfield_correct(&mut image, &Volume::constant([3, 2, 1], 1.0)).is_err());
    }

    #[test]
    fn test_background_fraction() {
        let mut volume = Volume::constant([4, 5, 1], 1e-5);
        volume[[0, 0, 0]] = 2.0;
        volume[[1, 0, 0]] = 2.0;
        assert_relative_eq!(background_fraction(&volume, 1e-5), 0.9);
    }
}
