//! Error type shared by every stage of the deconvolution pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to the run controller.
///
/// Nothing in the crate retries: every variant aborts the current run.
#[derive(Debug, Error)]
pub enum DeconvError {
    /// Invalid or contradicting settings, detected before any computation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed or degenerate point spread function.
    #[error("PSF error: {0}")]
    Psf(String),

    /// A working buffer contained NaN or infinity.
    #[error("non-finite value in {buffer} during iteration {iteration}")]
    NumericFault {
        buffer: &'static str,
        iteration: usize,
    },

    /// The output exists and overwriting was not allowed.
    #[error("{0:?} already exists, not overwriting")]
    AlreadyExists(PathBuf),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file could be read but does not hold a usable volume.
    #[error("format error in {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// A buffer does not match the dimensions it was declared with.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Allocation or execution failure of a transform.
    #[error("transform error: {0}")]
    Transform(String),
}

impl DeconvError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeconvError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DeconvError::Format {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` if the run was skipped because the output already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DeconvError::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, DeconvError>;
