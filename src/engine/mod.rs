//! Convolution engine: transforms, work domain planning and kernels.

pub mod fft;
pub mod kernel;
pub mod wisdom;
pub mod work_domain;

pub use fft::{Spectrum, Transform3d};
pub use kernel::{boundary_weights, SpectralKernel};
pub use work_domain::compute_work_size;
