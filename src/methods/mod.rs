//! Deconvolution methods and the iteration loop they share.

pub mod biggs;
pub mod deconvolve;
pub mod heavy_ball;
pub mod identity;
pub mod method;
pub mod richardson_lucy;

pub use deconvolve::{deconvolve, IterationContext};
pub use method::{build_method, Method, MethodConfig};
