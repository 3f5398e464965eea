//! Error types for pixlane-core.
//!
//! Only layout and format validation can fail in this crate. Everything
//! device-related lives in `pixlane-gpu` and wraps [`Error`] through
//! `ComputeError::Core`.
//!
//! ```rust
//! use pixlane_core::{Error, OutputFormat};
//!
//! let err = OutputFormat::P216.layout(0, 4).unwrap_err();
//! assert!(matches!(err, Error::InvalidDimensions { .. }));
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating formats and image geometry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid image dimensions.
    ///
    /// Returned when width or height is zero.
    #[error("invalid dimensions: {width}x{height} ({reason})")]
    InvalidDimensions {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Reason why dimensions are invalid
        reason: String,
    },

    /// A byte size computation overflowed `usize`.
    #[error("byte size of {width}x{height} image overflows")]
    SizeOverflow {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidDimensions`].
    pub fn invalid_dimensions(width: u32, height: u32, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            width,
            height,
            reason: reason.into(),
        }
    }
}
