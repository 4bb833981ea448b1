//! The shared iteration loop of all Richardson-Lucy type methods.
//!
//! Every iteration forms an extrapolated point `y = x + alpha (x - x_prev)`, blurs it,
//! compares it with the image and multiplies it with the back projected ratio:
//!
//! ```text
//! r      = K * y
//! ratio  = image / max(r, 1e-7)      inside the image, 0 in the padding
//! x_new  = y . (Kr * ratio) . W
//! ```
//!
//! `W` compensates for the PSF mass that falls outside of the image. The methods only differ
//! in how they choose `alpha`.

use crate::config::{DeconvConfig, MetricKind};
use crate::context::ExecutionContext;
use crate::engine::{boundary_weights, compute_work_size, SpectralKernel, Transform3d};
use crate::error::{DeconvError, Result};
use crate::iteration::IterationController;
use crate::methods::method::build_method;
use crate::metric;
use crate::psf;
use crate::volume::{voxel_count, Volume};
use rayon::prelude::*;
use std::time::Instant;

/// Smallest value of the blurred estimate the image is divided by.
const RATIO_FLOOR: f32 = 1e-7;

/// Inner products of the last two corrections `g = x_new - y`, used for momentum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionProducts {
    /// `<g, g_prev>`
    pub cross: f64,
    /// `<g, g>`
    pub current: f64,
    /// `<g_prev, g_prev>`
    pub previous: f64,
}

/// State of a running deconvolution, shared between the driver and the method.
pub struct IterationContext<'a> {
    observed: &'a Volume,
    kernel: &'a SpectralKernel,
    transform: &'a Transform3d,
    weights: Volume,
    x: Volume,
    x_prev: Volume,
    g: Volume,
    g_prev: Volume,
    iterator: IterationController,
    metric: MetricKind,
    positivity: bool,
    background: f32,
}

impl<'a> IterationContext<'a> {
    /// Sets up the buffers for deconvolving `observed` with the given kernel.
    ///
    /// The first estimate is the constant `sum(image) / (wM wN wP)`.
    pub fn new(
        observed: &'a Volume,
        kernel: &'a SpectralKernel,
        transform: &'a Transform3d,
        config: &DeconvConfig,
    ) -> Result<Self> {
        let work = transform.dims();
        let weights = boundary_weights(observed.dims(), kernel, transform)?;
        let guess = (observed.sum() / voxel_count(work) as f64) as f32;
        let x = Volume::constant(work, guess);
        Ok(IterationContext {
            observed,
            kernel,
            transform,
            weights,
            x_prev: x.clone(),
            x,
            g: Volume::zeros(work),
            g_prev: Volume::zeros(work),
            iterator: IterationController::new(config.policy, config.max_iterations),
            metric: config.metric,
            positivity: config.positivity,
            background: config.background,
        })
    }

    pub fn iterator(&self) -> &IterationController {
        &self.iterator
    }

    pub fn iterator_mut(&mut self) -> &mut IterationController {
        &mut self.iterator
    }

    /// Index of the running iteration.
    pub fn index(&self) -> usize {
        self.iterator.index().unwrap_or(0)
    }

    /// Current estimate on the work domain.
    pub fn estimate(&self) -> &Volume {
        &self.x
    }

    pub fn correction_products(&self) -> CorrectionProducts {
        let g = self.g.as_slice();
        let gp = self.g_prev.as_slice();
        CorrectionProducts {
            cross: ordered_reduce::ordered_dot(g, gp),
            current: ordered_reduce::ordered_sum_squares(g),
            previous: ordered_reduce::ordered_sum_squares(gp),
        }
    }

    /// Performs the multiplicative update from the point extrapolated with `alpha`.
    ///
    /// Reports the error of the blurred extrapolation point to the iteration controller and
    /// rotates the estimate and correction buffers.
    pub fn update(&mut self, alpha: f32) -> Result<()> {
        let index = self.index();
        let mut y = self.x.clone();
        if alpha != 0.0 {
            let positivity = self.positivity;
            y.as_mut_slice()
                .par_iter_mut()
                .zip(self.x_prev.as_slice().par_iter())
                .for_each(|(v, &prev)| {
                    *v += alpha * (*v - prev);
                    if positivity && *v < 0.0 {
                        *v = 0.0;
                    }
                });
        }

        let blurred = self
            .transform
            .convolve(self.kernel.forward(), self.transform.forward(&y)?)?;
        let error = metric::compute(self.metric, &blurred, self.observed)?;
        if !error.is_finite() {
            return Err(DeconvError::NumericFault {
                buffer: "error",
                iteration: index,
            });
        }
        let ratio = observed_ratio(&blurred, self.observed);
        drop(blurred);

        let mut next = self
            .transform
            .convolve(self.kernel.adjoint(), self.transform.forward(&ratio)?)?;
        drop(ratio);
        let (positivity, background) = (self.positivity, self.background);
        next.as_mut_slice()
            .par_iter_mut()
            .zip(y.as_slice().par_iter())
            .zip(self.weights.as_slice().par_iter())
            .for_each(|((v, &yv), &w)| {
                let updated = yv * *v * w;
                *v = if positivity && updated < background {
                    background
                } else {
                    updated
                };
            });
        if !next.all_finite() {
            return Err(DeconvError::NumericFault {
                buffer: "estimate",
                iteration: index,
            });
        }

        self.iterator.set_error(error);
        std::mem::swap(&mut self.g, &mut self.g_prev);
        self.g
            .as_mut_slice()
            .par_iter_mut()
            .zip(next.as_slice().par_iter())
            .zip(y.as_slice().par_iter())
            .for_each(|((g, &xn), &yv)| *g = xn - yv);
        self.x_prev = std::mem::replace(&mut self.x, next);
        Ok(())
    }

    fn into_estimate(self) -> Volume {
        self.x
    }
}

/// `observed / max(simulated, 1e-7)` inside the image region, 0 elsewhere.
fn observed_ratio(simulated: &Volume, observed: &Volume) -> Volume {
    let work = simulated.dims();
    let [m, n, p] = observed.dims();
    let mut ratio = Volume::zeros(work);
    let (sim, obs) = (simulated.as_slice(), observed.as_slice());
    ratio
        .as_mut_slice()
        .par_chunks_mut(work[0])
        .enumerate()
        .for_each(|(row, out)| {
            let (y, z) = (row % work[1], row / work[1]);
            if y < n && z < p {
                let s = simulated.offset(0, y, z);
                let o = observed.offset(0, y, z);
                for x in 0..m {
                    out[x] = obs[o + x] / sim[s + x].max(RATIO_FLOOR);
                }
            }
        });
    ratio
}

/// Deconvolves `image` with `psf`.
///
/// # Arguments
/// - `image`: The observed volume.
/// - `psf`: Normalised PSF with odd extents and its maximum in the center.
/// - `config`: Method, iteration policy, metric and constraints.
/// - `exec`: Thread pool, plan cache and log of the run.
///
/// # Returns
/// - `Ok(Some(volume))` with the estimate cropped to the image dims.
/// - `Ok(None)` if the PSF is not centered, in which case nothing is computed.
/// - `Err(_)` on numeric faults or transform failures.
pub fn deconvolve(
    image: &Volume,
    psf: &Volume,
    config: &DeconvConfig,
    exec: &ExecutionContext,
) -> Result<Option<Volume>> {
    let mut method = build_method(config.method, config.acceleration);
    if method.is_passthrough() {
        return Ok(Some(image.clone()));
    }
    if !psf::is_centered(psf) {
        exec.warn("the PSF is not centered, refusing to deconvolve");
        return Ok(None);
    }
    let info = method.config();
    exec.info(&format!("Method: {} ({})", info.name, info.description));

    let work = compute_work_size(
        image.dims(),
        psf.dims(),
        config.border_quality,
        config.lookahead,
        exec,
    );
    exec.info(&format!(
        "Image {:?}, PSF {:?}, work domain {:?}",
        image.dims(),
        psf.dims(),
        work
    ));
    let started = Instant::now();
    let estimate = exec.install(|| -> Result<Volume> {
        let transform = exec.plan(work)?;
        let kernel = SpectralKernel::new(psf, &transform)?;
        let mut ctx = IterationContext::new(image, &kernel, &transform, config)?;
        while ctx.iterator_mut().advance().is_some() {
            method.step(&mut ctx)?;
            exec.info(&ctx.iterator().progress(config.metric));
        }
        Ok(ctx.into_estimate())
    })?;
    log::debug!(
        "deconvolution of {:?} took {:.2} s",
        image.dims(),
        started.elapsed().as_secs_f64()
    );
    Ok(Some(estimate.subregion(image.dims())))
}
