//! Size of the padded domain the iterations run on.

use crate::config::BorderQuality;
use crate::context::ExecutionContext;
use crate::volume::Dims;
use num_complex::Complex32;
use rustfft::FftPlanner;
use std::time::Instant;

/// Values transformed per benchmark round.
const BENCH_VALUES: usize = 1 << 16;
const BENCH_ROUNDS: usize = 3;

/// Smallest work length along one axis for an image extent `image` and PSF extent `psf`.
///
/// # Arguments
/// - `image`: Extent of the image along the axis.
/// - `psf`: Extent of the PSF along the axis.
/// - `quality`: Padding level, see [`BorderQuality`].
///
/// # Returns
/// `image + psf - 1` for [`BorderQuality::Full`], `image + (psf + 1) / 2` for
/// [`BorderQuality::Compromise`] and `max(image, psf)` for [`BorderQuality::Periodic`].
/// The result is never smaller than the PSF so the kernel always fits.
pub fn minimal_work_length(image: usize, psf: usize, quality: BorderQuality) -> usize {
    let len = match quality {
        BorderQuality::Full => image + psf.saturating_sub(1),
        BorderQuality::Compromise => image + (psf + 1) / 2,
        BorderQuality::Periodic => image.max(psf),
    };
    len.max(psf)
}

pub fn minimal_work_size(image: Dims, psf: Dims, quality: BorderQuality) -> Dims {
    [0, 1, 2].map(|a| minimal_work_length(image[a], psf[a], quality))
}

/// Computes the work domain of an image/PSF pair.
///
/// With `lookahead > 0` every axis longer than one voxel is enlarged to the fastest
/// transform length among `minimal..=minimal + lookahead`. Timings come from the context's
/// wisdom and are benchmarked on first use.
pub fn compute_work_size(
    image: Dims,
    psf: Dims,
    quality: BorderQuality,
    lookahead: usize,
    ctx: &ExecutionContext,
) -> Dims {
    let minimal = minimal_work_size(image, psf, quality);
    if lookahead == 0 {
        return minimal;
    }
    minimal.map(|len| {
        if len > 1 {
            let candidates: Vec<usize> = (len..=len + lookahead).collect();
            fastest_length(&candidates, ctx)
        } else {
            len
        }
    })
}

/// The candidate with the smallest transform time. Ties go to the earlier candidate.
pub fn fastest_length(candidates: &[usize], ctx: &ExecutionContext) -> usize {
    let mut best = (f64::INFINITY, 0);
    for &len in candidates {
        let seconds = ctx.transform_timing(len);
        if seconds < best.0 {
            best = (seconds, len);
        }
    }
    if best.0.is_finite() {
        best.1
    } else {
        candidates.first().copied().unwrap_or(0)
    }
}

/// Measures the time of one complex 1D transform of length `len`, in seconds.
pub fn benchmark_length(len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    let fft = FftPlanner::<f32>::new().plan_fft_forward(len);
    let batch = (BENCH_VALUES / len).max(1);
    let zero = Complex32::new(0.0, 0.0);
    let mut buffer: Vec<Complex32> = (0..len * batch)
        .map(|i| Complex32::new((i % 7) as f32 * 1e-3, 0.0))
        .collect();
    let mut scratch = vec![zero; fft.get_inplace_scratch_len()];
    // warm up caches and twiddles
    fft.process_with_scratch(&mut buffer, &mut scratch);
    let start = Instant::now();
    for _ in 0..BENCH_ROUNDS {
        fft.process_with_scratch(&mut buffer, &mut scratch);
    }
    start.elapsed().as_secs_f64() / (BENCH_ROUNDS * batch) as f64
}
