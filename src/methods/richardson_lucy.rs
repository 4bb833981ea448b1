//! Plain Richardson-Lucy iterations.

use crate::config::MethodKind;
use crate::error::Result;
use crate::methods::deconvolve::IterationContext;
use crate::methods::method::{Method, MethodConfig};

/// The classic update without any acceleration, `alpha = 0` in every iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RichardsonLucy;

impl Method for RichardsonLucy {
    fn config(&self) -> MethodConfig {
        MethodConfig {
            name: "Richardson-Lucy".to_string(),
            description: "Multiplicative maximum likelihood updates for Poisson noise."
                .to_string(),
            hyperlink: Some((
                Some("Richardson 1972".to_string()),
                "https://doi.org/10.1364/JOSA.62.000055".to_string(),
            )),
            kind: MethodKind::RichardsonLucy,
        }
    }

    fn step(&mut self, ctx: &mut IterationContext<'_>) -> Result<()> {
        ctx.update(0.0)
    }
}
