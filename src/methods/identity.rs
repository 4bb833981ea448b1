//! Pass-through method, mostly useful to test the surrounding pipeline.

use crate::config::MethodKind;
use crate::error::Result;
use crate::methods::deconvolve::IterationContext;
use crate::methods::method::{Method, MethodConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Method for Identity {
    fn config(&self) -> MethodConfig {
        MethodConfig {
            name: "Identity".to_string(),
            description: "Returns the input image unchanged.".to_string(),
            hyperlink: None,
            kind: MethodKind::Identity,
        }
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn step(&mut self, _ctx: &mut IterationContext<'_>) -> Result<()> {
        Ok(())
    }
}
