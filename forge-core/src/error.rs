//! Error types for forge-core.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The variant set is closed: every failure the converter can
//! surface maps onto exactly one of these kinds.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for forge-core operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for forge-core.
///
/// Nothing is retried inside the converter; every failure short-circuits
/// the current command and surfaces with the originating target and
/// command attached.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("invalid reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid arguments to {command}: {reason}")]
    InvalidArgs { command: String, reason: String },

    #[error("invalid secret definition {definition}: {reason}")]
    InvalidSecret { definition: String, reason: String },

    #[error("build arg {name} is not defined")]
    UnresolvedArg { name: String },

    #[error("dependency cycle detected at target {target}")]
    Cycle { target: String },

    #[error("FROM target {target} does not contain a SAVE IMAGE")]
    MissingSaveImage { target: String },

    #[error("failed to resolve {target}: {reason}")]
    ResolveFailed { target: String, reason: String },

    #[error("build of {target} failed: {reason}")]
    BuildFailed { target: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{feature} is not supported")]
    Unsupported { feature: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl ForgeError {
    /// Create an `Io` error carrying the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
