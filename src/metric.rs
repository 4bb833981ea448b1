//! Distance between the blurred estimate and the observed image.
//!
//! Both measures only look at the `M x N x P` image region of the work volume. Sums are
//! accumulated in `f64`, one image row at a time, with `ordered_reduce` combining the rows
//! in a fixed order so the value does not depend on the number of threads. The relative
//! convergence test compares successive values, so this matters.

use crate::config::MetricKind;
use crate::error::{DeconvError, Result};
use crate::volume::{voxel_count, Volume};
use ordered_reduce::ordered_sum;

/// Rows per reduction block.
const ROWS_PER_BLOCK: usize = 64;

/// Computes the error of `simulated` (work dims) against `observed` (image dims).
pub fn compute(kind: MetricKind, simulated: &Volume, observed: &Volume) -> Result<f64> {
    match kind {
        MetricKind::Mse => mse(simulated, observed),
        MetricKind::IDivergence => i_divergence(simulated, observed),
    }
}

/// Mean squared error, `mean((y - g)^2)`.
pub fn mse(simulated: &Volume, observed: &Volume) -> Result<f64> {
    roi_mean(simulated, observed, |g, y| (y - g) * (y - g))
}

/// Csiszar's I-divergence of the observed image from the simulated one,
/// `mean(y ln(y/g) - y + g)`.
///
/// `g` is the simulated and `y` the observed value; voxels where either is not positive
/// contribute 0.
pub fn i_divergence(simulated: &Volume, observed: &Volume) -> Result<f64> {
    roi_mean(simulated, observed, |g, y| {
        if g > 0.0 && y > 0.0 {
            y * (y / g).ln() - y + g
        } else {
            0.0
        }
    })
}

fn roi_mean<F>(simulated: &Volume, observed: &Volume, term: F) -> Result<f64>
where
    F: Fn(f64, f64) -> f64 + Sync + Send,
{
    let [m, n, p] = observed.dims();
    let work = simulated.dims();
    if m > work[0] || n > work[1] || p > work[2] {
        return Err(DeconvError::Shape(format!(
            "image of {:?} does not fit into the work volume {work:?}",
            observed.dims()
        )));
    }
    if observed.is_empty() {
        return Ok(0.0);
    }
    let sim = simulated.as_slice();
    let obs = observed.as_slice();
    let total = ordered_sum(n * p, ROWS_PER_BLOCK, |row| {
        let (y, z) = (row % n, row / n);
        let s = simulated.offset(0, y, z);
        let o = observed.offset(0, y, z);
        sim[s..s + m]
            .iter()
            .zip(&obs[o..o + m])
            .map(|(&g, &y)| term(g as f64, y as f64))
            .sum::<f64>()
    });
    Ok(total / voxel_count(observed.dims()) as f64)
}
