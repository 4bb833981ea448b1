//! 3D Richardson-Lucy deconvolution for volumes that may exceed main memory.
//!
//! The entry point for complete runs is [`pipeline::run`]. The building blocks are usable on
//! their own: [`psf::prepare`] readies a PSF, [`methods::deconvolve`] deconvolves a volume in
//! memory and [`tiling`] processes large volumes tile by tile.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod io;
pub mod iteration;
pub mod math_tools;
pub mod methods;
pub mod metric;
pub mod pipeline;
pub mod psf;
pub mod tiling;
pub mod volume;
