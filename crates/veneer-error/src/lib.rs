#![forbid(unsafe_code)]
//! Error types for veneer.
//!
//! Defines `VeneerError` and a `Result<T>` alias used throughout the
//! workspace. Catastrophic and assertion errors abort the run at the CLI
//! boundary; recoverable conditions (extent degradation, name collisions)
//! never surface here — they only log and adjust plan outputs.

use thiserror::Error;

/// Unified error type for all veneer operations.
#[derive(Debug, Error)]
pub enum VeneerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open {what}: {source}")]
    CannotOpen {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported filesystem selection {mask:#x}")]
    UnsupportedFilesystem { mask: u32 },

    #[error("lane count {0} is not a positive power of two")]
    LaneCount(i64),

    #[error("hybrid output requires a mappable scratch device")]
    HybridUnsupported,

    #[error("source tree too granular for the filesystem: {tree:#x} & {fs:#x} = 0")]
    Granularity { tree: i64, fs: i64 },

    #[error("device {dev} has {actual}-byte blocks, below the {minimum}-byte mapper sector")]
    SourceBlockTooSmall {
        dev: String,
        actual: i64,
        minimum: i64,
    },

    #[error("invariant violated: {context}")]
    Assertion { context: String },
}

impl VeneerError {
    /// Process exit code mandated for this error class.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CannotOpen { .. } => 2,
            _ => 1,
        }
    }

    #[must_use]
    pub fn assertion(context: impl Into<String>) -> Self {
        Self::Assertion {
            context: context.into(),
        }
    }
}

/// Result alias using `VeneerError`.
pub type Result<T> = std::result::Result<T, VeneerError>;
