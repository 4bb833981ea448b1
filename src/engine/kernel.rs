//! Transformed PSF kernels and the boundary weights derived from them.

use crate::engine::fft::{Spectrum, Transform3d};
use crate::error::{DeconvError, Result};
use crate::volume::{Dims, Volume};

/// Below this value of the blurred ROI indicator a voxel gets no correction at all.
pub const BOUNDARY_SIGMA: f32 = 0.001;

/// Forward kernel `K` and adjoint kernel `Kr` of one PSF at one work size.
#[derive(Debug)]
pub struct SpectralKernel {
    forward: Spectrum,
    adjoint: Spectrum,
}

impl SpectralKernel {
    /// Builds `K` from the PSF and `Kr` from its point reflection.
    ///
    /// Both are embedded at the origin of the work domain and circularly shifted so that the
    /// PSF center lands on voxel `(0, 0, 0)`; convolving with them therefore does not move
    /// the image.
    pub fn new(psf: &Volume, transform: &Transform3d) -> Result<Self> {
        let work = transform.dims();
        let dims = psf.dims();
        if (0..3).any(|a| dims[a] == 0 || dims[a] > work[a]) {
            return Err(DeconvError::Psf(format!(
                "PSF of {dims:?} does not fit into the work domain {work:?}"
            )));
        }
        let forward = transform.forward(&centered_at_origin(psf, work))?;
        let adjoint = transform.forward(&centered_at_origin(&psf.flipped(), work))?;
        Ok(SpectralKernel { forward, adjoint })
    }

    /// `K`, blurs like the microscope.
    pub fn forward(&self) -> &Spectrum {
        &self.forward
    }

    /// `Kr`, the correlation with the PSF.
    pub fn adjoint(&self) -> &Spectrum {
        &self.adjoint
    }
}

fn centered_at_origin(psf: &Volume, work: Dims) -> Volume {
    let center = psf.center();
    psf.expand(work).circshift(center.map(|c| -(c as isize)))
}

/// Per voxel normalisation of the correction step for an image of `image` dims.
///
/// The indicator of the image region is correlated with the PSF; voxels that see less than
/// [`BOUNDARY_SIGMA`] of it get weight 0, all others the reciprocal.
pub fn boundary_weights(
    image: Dims,
    kernel: &SpectralKernel,
    transform: &Transform3d,
) -> Result<Volume> {
    let mut indicator = Volume::zeros(transform.dims());
    indicator.insert(&Volume::constant(image, 1.0), [0, 0, 0]);
    let mut weights = transform.convolve(kernel.adjoint(), transform.forward(&indicator)?)?;
    weights.map_inplace(|p| if p < BOUNDARY_SIGMA { 0.0 } else { 1.0 / p });
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn delta_psf(dims: Dims) -> Volume {
        let mut psf = Volume::zeros(dims);
        let center = psf.center();
        psf[center] = 1.0;
        psf
    }

    fn test_image(dims: Dims) -> Volume {
        Volume::from_fn(dims, |x, y, z| 1.0 + x as f32 + 2.0 * y as f32 + 3.0 * z as f32)
    }

    #[test]
    fn test_identity_psf_round_trip() {
        let work = [10, 9, 6];
        let transform = Transform3d::new(work).unwrap();
        let kernel = SpectralKernel::new(&delta_psf([5, 3, 3]), &transform).unwrap();
        let image = test_image(work);
        let spectrum = transform.forward(&image).unwrap();
        let blurred = transform.convolve(kernel.forward(), spectrum.clone()).unwrap();
        let correlated = transform.convolve(kernel.adjoint(), spectrum).unwrap();
        for ((a, b), c) in image
            .as_slice()
            .iter()
            .zip(blurred.as_slice())
            .zip(correlated.as_slice())
        {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            assert_abs_diff_eq!(a, c, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_adjoint_kernel_is_the_transpose() {
        let work = [8, 7, 5];
        let transform = Transform3d::new(work).unwrap();
        let psf = Volume::from_fn([3, 3, 3], |x, y, z| (1 + x + 3 * y + 9 * z) as f32);
        let kernel = SpectralKernel::new(&psf, &transform).unwrap();
        let a = test_image(work);
        let b = Volume::from_fn(work, |x, y, z| ((x * 7 + y * 3 + z) % 5) as f32);
        let ka = transform
            .convolve(kernel.forward(), transform.forward(&a).unwrap())
            .unwrap();
        let krb = transform
            .convolve(kernel.adjoint(), transform.forward(&b).unwrap())
            .unwrap();
        // <K a, b> == <a, Kr b>
        let lhs = ordered_reduce::ordered_dot(ka.as_slice(), b.as_slice());
        let rhs = ordered_reduce::ordered_dot(a.as_slice(), krb.as_slice());
        approx::assert_relative_eq!(lhs, rhs, max_relative = 1e-4);
    }

    #[test]
    fn test_shifted_psf_moves_image() {
        let work = [8, 4, 4];
        let transform = Transform3d::new(work).unwrap();
        // peak one voxel right of the center
        let mut psf = Volume::zeros([3, 1, 1]);
        psf[[2, 0, 0]] = 1.0;
        let kernel = SpectralKernel::new(&psf, &transform).unwrap();
        let mut image = Volume::zeros(work);
        image[[3, 1, 2]] = 1.0;
        let out = transform
            .convolve(kernel.forward(), transform.forward(&image).unwrap())
            .unwrap();
        assert_abs_diff_eq!(out[[4, 1, 2]], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[3, 1, 2]], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_oversized_psf_rejected() {
        let transform = Transform3d::new([4, 4, 4]).unwrap();
        assert!(matches!(
            SpectralKernel::new(&delta_psf([5, 3, 3]), &transform),
            Err(DeconvError::Psf(_))
        ));
    }

    #[test]
    fn test_boundary_weights() {
        let image = [6, 5, 3];
        let psf_dims = [3, 3, 3];
        let work = [10, 9, 7];
        let transform = Transform3d::new(work).unwrap();
        let psf = Volume::constant(psf_dims, 1.0 / 27.0);
        let kernel = SpectralKernel::new(&psf, &transform).unwrap();
        let weights = boundary_weights(image, &kernel, &transform).unwrap();
        // fully inside, the whole PSF sees the image
        assert_abs_diff_eq!(weights[[2, 2, 1]], 1.0, epsilon = 1e-4);
        // corner of the image, 8 of 27 PSF voxels see the image
        assert_abs_diff_eq!(weights[[0, 0, 0]], 27.0 / 8.0, epsilon = 1e-3);
        // no PSF voxel reaches the image
        assert_eq!(weights[[8, 7, 5]], 0.0);
    }
}
