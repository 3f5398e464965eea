//! # pixlane-core
//!
//! Backend-independent value types shared by the pixlane crates.
//!
//! - [`TextureFormat`] - Pixel formats a device texture can hold
//! - [`OutputFormat`], [`PlaneLayout`] - Packed/planar output formats and their byte layouts
//! - [`DispatchSize`], [`ThreadgroupSize`] - Compute dispatch grid arithmetic
//! - [`pixel`] - Quantisation and BT.709 helpers shared by the CPU kernels and the reference path
//!
//! ## Crate Structure
//!
//! ```text
//! pixlane-core (this crate)
//!    ^
//!    |
//!    +-- pixlane-gpu (device, command path, backends, conversion)
//!    +-- pixlane-bench
//! ```
//!
//! Nothing in this crate touches a GPU. Every function is pure and cheap,
//! so the same numerics can run on the host, in tests, and as the oracle
//! for accelerated backends.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod format;
pub mod grid;
pub mod pixel;

pub use error::{Error, Result};
pub use format::{OutputFormat, PlaneLayout, TextureFormat};
pub use grid::{groups_for, DispatchSize, ThreadgroupSize};

/// Prelude module for convenient imports.
///
/// ```
/// use pixlane_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::format::{OutputFormat, PlaneLayout, TextureFormat};
    pub use crate::grid::{groups_for, DispatchSize, ThreadgroupSize};
}
