//! Three dimensional real-to-complex transforms.
//!
//! The contiguous x axis is transformed with `realfft`, which stores only the Hermitian half
//! of the spectrum (`wM/2 + 1` values per line). The y and z axes are complex transforms from
//! `rustfft`. Lines along y are gathered per z plane, lines along z go through a transposed
//! buffer so every worker owns a contiguous line.

use crate::error::{DeconvError, Result};
use crate::volume::{voxel_count, Dims, Volume};
use num_complex::Complex32;
use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Half spectrum of a volume of the given work dims, layout `(wM/2+1) x wN x wP`.
#[derive(Clone, Debug)]
pub struct Spectrum {
    work: Dims,
    data: Vec<Complex32>,
}

impl Spectrum {
    /// Dims of the real volume this spectrum belongs to.
    pub fn work_dims(&self) -> Dims {
        self.work
    }

    /// Dims of the stored half spectrum.
    pub fn half_dims(&self) -> Dims {
        half_dims(self.work)
    }

    pub fn as_slice(&self) -> &[Complex32] {
        &self.data
    }

    /// Pointwise complex product with `other`, in place.
    pub fn multiply(&mut self, other: &Spectrum) -> Result<()> {
        if self.work != other.work {
            return Err(DeconvError::Shape(format!(
                "cannot multiply spectra of {:?} and {:?}",
                self.work, other.work
            )));
        }
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, b)| *a *= *b);
        Ok(())
    }
}

fn half_dims(work: Dims) -> Dims {
    [work[0] / 2 + 1, work[1], work[2]]
}

/// Allocates a zeroed buffer, reporting allocation failure instead of aborting.
fn try_zeroed<T: Clone>(len: usize, zero: T) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|err| {
        DeconvError::Transform(format!("cannot allocate {len} transform values: {err}"))
    })?;
    buffer.resize(len, zero);
    Ok(buffer)
}

fn transform_error(err: realfft::FftError) -> DeconvError {
    DeconvError::Transform(err.to_string())
}

/// Forward and inverse plans for one work size.
///
/// Plans are immutable once built and shared between threads through the plan cache of
/// [`crate::context::ExecutionContext`].
pub struct Transform3d {
    dims: Dims,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    fft_y: Arc<dyn Fft<f32>>,
    ifft_y: Arc<dyn Fft<f32>>,
    fft_z: Arc<dyn Fft<f32>>,
    ifft_z: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Transform3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform3d").field("dims", &self.dims).finish()
    }
}

impl Transform3d {
    /// Plans the transforms for a volume of `dims`.
    pub fn new(dims: Dims) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(DeconvError::Transform(format!(
                "cannot plan a transform of {dims:?}"
            )));
        }
        let mut real_planner = RealFftPlanner::<f32>::new();
        let mut planner = FftPlanner::<f32>::new();
        Ok(Transform3d {
            dims,
            r2c: real_planner.plan_fft_forward(dims[0]),
            c2r: real_planner.plan_fft_inverse(dims[0]),
            fft_y: planner.plan_fft_forward(dims[1]),
            ifft_y: planner.plan_fft_inverse(dims[1]),
            fft_z: planner.plan_fft_forward(dims[2]),
            ifft_z: planner.plan_fft_inverse(dims[2]),
        })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// Real-to-complex transform of a volume of the planned dims.
    pub fn forward(&self, volume: &Volume) -> Result<Spectrum> {
        if volume.dims() != self.dims {
            return Err(DeconvError::Shape(format!(
                "transform planned for {:?} got a volume of {:?}",
                self.dims,
                volume.dims()
            )));
        }
        let [wm, wn, wp] = self.dims;
        let [hm, _, _] = half_dims(self.dims);
        let mut data = try_zeroed(voxel_count(half_dims(self.dims)), Complex32::new(0.0, 0.0))?;

        let r2c = &self.r2c;
        volume
            .as_slice()
            .par_chunks(wm)
            .zip(data.par_chunks_mut(hm))
            .try_for_each_init(
                || (vec![0.0f32; wm], r2c.make_scratch_vec()),
                |(line, scratch), (input, output)| {
                    // realfft uses its input as scratch space
                    line.copy_from_slice(input);
                    r2c.process_with_scratch(line, output, scratch)
                },
            )
            .map_err(transform_error)?;

        transform_columns(&mut data, hm, wn, &self.fft_y);
        transform_planes(&mut data, hm * wn, wp, &self.fft_z)?;
        Ok(Spectrum {
            work: self.dims,
            data,
        })
    }

    /// Complex-to-real transform, scaled by `1/(wM*wN*wP)` so that `inverse(forward(v)) == v`.
    pub fn inverse(&self, spectrum: Spectrum) -> Result<Volume> {
        if spectrum.work != self.dims {
            return Err(DeconvError::Shape(format!(
                "transform planned for {:?} got a spectrum of {:?}",
                self.dims, spectrum.work
            )));
        }
        let [wm, wn, wp] = self.dims;
        let [hm, _, _] = half_dims(self.dims);
        let mut data = spectrum.data;

        transform_planes(&mut data, hm * wn, wp, &self.ifft_z)?;
        transform_columns(&mut data, hm, wn, &self.ifft_y);

        let mut out = try_zeroed(voxel_count(self.dims), 0.0f32)?;
        let scale = 1.0 / voxel_count(self.dims) as f32;
        let even = wm % 2 == 0;
        let c2r = &self.c2r;
        out.par_chunks_mut(wm)
            .zip(data.par_chunks_mut(hm))
            .try_for_each_init(
                || c2r.make_scratch_vec(),
                |scratch, (line, bins)| -> std::result::Result<(), realfft::FftError> {
                    // the imaginary parts of the DC and Nyquist bins only hold rounding noise
                    bins[0].im = 0.0;
                    if even {
                        bins[hm - 1].im = 0.0;
                    }
                    c2r.process_with_scratch(bins, line, scratch)?;
                    line.iter_mut().for_each(|v| *v *= scale);
                    Ok(())
                },
            )
            .map_err(transform_error)?;
        Volume::from_vec(self.dims, out)
    }

    /// Multiplies `data` with `kernel` and transforms back. `data` is consumed.
    pub fn convolve(&self, kernel: &Spectrum, mut data: Spectrum) -> Result<Volume> {
        data.multiply(kernel)?;
        self.inverse(data)
    }
}

/// Transforms every y line of every z plane in place.
fn transform_columns(data: &mut [Complex32], hm: usize, wn: usize, fft: &Arc<dyn Fft<f32>>) {
    if wn < 2 {
        return;
    }
    let zero = Complex32::new(0.0, 0.0);
    data.par_chunks_mut(hm * wn).for_each_init(
        || {
            (
                vec![zero; wn],
                vec![zero; fft.get_inplace_scratch_len()],
            )
        },
        |(line, scratch), plane| {
            for x in 0..hm {
                for (y, v) in line.iter_mut().enumerate() {
                    *v = plane[x + y * hm];
                }
                fft.process_with_scratch(line, scratch);
                for (y, v) in line.iter().enumerate() {
                    plane[x + y * hm] = *v;
                }
            }
        },
    );
}

/// Transforms every z line in place through a transposed copy.
fn transform_planes(
    data: &mut [Complex32],
    plane: usize,
    wp: usize,
    fft: &Arc<dyn Fft<f32>>,
) -> Result<()> {
    if wp < 2 {
        return Ok(());
    }
    let zero = Complex32::new(0.0, 0.0);
    let mut lines = try_zeroed(plane * wp, zero)?;
    {
        let source: &[Complex32] = data;
        lines.par_chunks_mut(wp).enumerate().for_each_init(
            || vec![zero; fft.get_inplace_scratch_len()],
            |scratch, (l, line)| {
                for (z, v) in line.iter_mut().enumerate() {
                    *v = source[l + z * plane];
                }
                fft.process_with_scratch(line, scratch);
            },
        );
    }
    data.par_chunks_mut(plane)
        .enumerate()
        .for_each(|(z, out)| {
            for (l, v) in out.iter_mut().enumerate() {
                *v = lines[l * wp + z];
            }
        });
    Ok(())
}
