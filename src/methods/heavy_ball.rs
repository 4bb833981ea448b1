//! Scaled heavy ball acceleration.

use crate::config::MethodKind;
use crate::error::Result;
use crate::methods::deconvolve::{CorrectionProducts, IterationContext};
use crate::methods::method::{Method, MethodConfig};

/// Added to the denominator of the momentum ratio.
const EPSILON: f64 = 1e-7;

/// Richardson-Lucy with momentum.
///
/// From the third iteration on the update starts at `x + alpha (x - x_prev)` with
/// `alpha = <g, g_prev> / (<g_prev, g_prev> + eps)` clipped to `[0, 1]`, where `g` is the
/// change made by the previous update.
#[derive(Debug, Clone, Default)]
pub struct ScaledHeavyBall;

/// Momentum factor for the given correction products.
pub fn momentum(products: &CorrectionProducts) -> f32 {
    let alpha = products.cross / (products.previous + EPSILON);
    if alpha.is_finite() {
        alpha.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

impl Method for ScaledHeavyBall {
    fn config(&self) -> MethodConfig {
        MethodConfig {
            name: "Scaled Heavy Ball".to_string(),
            description: "Richardson-Lucy with a momentum term estimated from successive corrections."
                .to_string(),
            hyperlink: None,
            kind: MethodKind::HeavyBall,
        }
    }

    fn step(&mut self, ctx: &mut IterationContext<'_>) -> Result<()> {
        let alpha = if ctx.index() >= 2 {
            momentum(&ctx.correction_products())
        } else {
            0.0
        };
        log::debug!("iteration {}: alpha = {:.4}", ctx.index(), alpha);
        ctx.update(alpha)
    }
}
