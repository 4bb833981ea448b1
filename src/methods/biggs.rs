//! Biggs-Andrews vector extrapolation.
//!
//! Both estimators look at the last two corrections `g` and `g_prev`. The additive vector
//! estimator uses the same ratio as the heavy ball, the exponential one the normalised
//! correlation of the two corrections. The step length is capped according to the
//! acceleration level and reset to 0 whenever the error went up in the previous iteration.

use crate::config::MethodKind;
use crate::error::Result;
use crate::methods::deconvolve::{CorrectionProducts, IterationContext};
use crate::methods::method::{Method, MethodConfig};

const EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimator {
    /// AVE, `<g, g_prev> / <g_prev, g_prev>`.
    Additive,
    /// EVE, `<g, g_prev> / (|g| |g_prev|)`.
    Exponential,
}

/// Largest step allowed at an acceleration level.
pub fn level_cap(level: u8) -> f32 {
    match level {
        0 => 0.0,
        1 => 0.5,
        2 => 0.75,
        _ => 1.0,
    }
}

#[derive(Debug, Clone)]
pub struct BiggsAndrews {
    estimator: Estimator,
    level: u8,
    restarts: usize,
}

impl BiggsAndrews {
    pub fn new(estimator: Estimator, level: u8) -> Self {
        BiggsAndrews {
            estimator,
            level,
            restarts: 0,
        }
    }

    /// How often the momentum was reset because the error increased.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Step length for the given correction products, before the restart rule.
    pub fn step_length(&self, products: &CorrectionProducts) -> f32 {
        let cap = level_cap(self.level);
        if cap == 0.0 {
            return 0.0;
        }
        let raw = match self.estimator {
            Estimator::Additive => products.cross / (products.previous + EPSILON),
            Estimator::Exponential => {
                products.cross / ((products.current * products.previous).sqrt() + EPSILON)
            }
        };
        if raw.is_finite() {
            (raw as f32).clamp(0.0, cap)
        } else {
            0.0
        }
    }
}

impl Method for BiggsAndrews {
    fn config(&self) -> MethodConfig {
        let (name, kind) = match self.estimator {
            Estimator::Additive => ("Biggs-Andrews AVE", MethodKind::Ave),
            Estimator::Exponential => ("Biggs-Andrews EVE", MethodKind::Eve),
        };
        MethodConfig {
            name: name.to_string(),
            description: format!(
                "Richardson-Lucy with vector extrapolation, acceleration level {}.",
                self.level
            ),
            hyperlink: Some((
                Some("Biggs and Andrews 1997".to_string()),
                "https://doi.org/10.1364/AO.36.001766".to_string(),
            )),
            kind,
        }
    }

    fn step(&mut self, ctx: &mut IterationContext<'_>) -> Result<()> {
        let alpha = if ctx.index() < 2 {
            0.0
        } else if ctx.iterator().error() > ctx.iterator().previous_error() {
            self.restarts += 1;
            log::debug!("iteration {}: error increased, restarting", ctx.index());
            0.0
        } else {
            self.step_length(&ctx.correction_products())
        };
        ctx.update(alpha)
    }
}
