//! Shared building blocks for the remote host workspace.
//!
//! Every error enum in the workspace tags its variants with an
//! [`ErrorLocation`] so a log line points at the code that produced it.

pub mod error;

pub use error::error_location::ErrorLocation;
