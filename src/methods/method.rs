//! The `Method` trait implemented by every update rule.
//!
//! A method owns whatever state its acceleration heuristic needs between iterations. The
//! buffers, kernels and the iteration controller live in the shared
//! [`IterationContext`](crate::methods::deconvolve::IterationContext), which the driver in
//! [`deconvolve`](crate::methods::deconvolve::deconvolve) hands to [`Method::step`] once per
//! iteration.
//!
//! To add a method, implement the trait, add a [`MethodKind`] variant and construct it in
//! [`build_method`].

use crate::config::MethodKind;
use crate::error::Result;
use crate::methods::biggs::{BiggsAndrews, Estimator};
use crate::methods::deconvolve::IterationContext;
use crate::methods::heavy_ball::ScaledHeavyBall;
use crate::methods::identity::Identity;
use crate::methods::richardson_lucy::RichardsonLucy;
use std::fmt::Debug;

/// Descriptive information about a method, shown in the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodConfig {
    /// The name of the method, used for identification and display.
    pub name: String,
    pub description: String,
    /// An optional hyperlink to a DOI or reference, with an optional label.
    pub hyperlink: Option<(Option<String>, String)>, // (optional_label, url)
    pub kind: MethodKind,
}

pub trait Method: Send + Debug {
    /// Returns name, description and kind of the method.
    fn config(&self) -> MethodConfig;

    /// `true` for methods that return the input unchanged without running any iteration.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Runs one iteration.
    ///
    /// # Arguments
    /// - `ctx`: Buffers, kernels and iteration controller of the running deconvolution. The
    ///   iteration index is already advanced; the step reports its error through
    ///   [`IterationContext::update`].
    ///
    /// # Returns
    /// `Err(DeconvError::NumericFault)` if the new estimate is not finite.
    fn step(&mut self, ctx: &mut IterationContext<'_>) -> Result<()>;
}

/// Constructs the method selected in the configuration.
///
/// # Arguments
/// - `kind`: The update rule.
/// - `acceleration`: Aggressiveness level 0 to 3 of the Biggs-Andrews estimators, ignored
///   by the other methods.
pub fn build_method(kind: MethodKind, acceleration: u8) -> Box<dyn Method> {
    match kind {
        MethodKind::Identity => Box::new(Identity),
        MethodKind::RichardsonLucy => Box::new(RichardsonLucy),
        MethodKind::HeavyBall => Box::new(ScaledHeavyBall),
        MethodKind::Ave => Box::new(BiggsAndrews::new(Estimator::Additive, acceleration)),
        MethodKind::Eve => Box::new(BiggsAndrews::new(Estimator::Exponential, acceleration)),
    }
}
