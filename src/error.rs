//! Error taxonomy and exit-status mapping.
//!
//! Every fallible path in the crate funnels into [`MergeError`]. Display
//! strings are phrased `Failed to <desc>: <os error>` so the CLI can print
//! them verbatim, and each class carries a fixed sysexits status.

use std::io;
use thiserror::Error;

/// Bad or missing arguments.
pub const EX_USAGE: i32 = 64;
/// An input file could not be opened.
pub const EX_NOINPUT: i32 = 66;
/// Out of memory, or the kernel refused a required resource.
pub const EX_UNAVAILABLE: i32 = 69;
/// An internal invariant was violated.
pub const EX_SOFTWARE: i32 = 70;
/// A read or write failed.
pub const EX_IOERR: i32 = 74;

/// Fatal error raised by the merge pipeline.
#[derive(Debug, Error)]
pub enum MergeError {
    /// An input could not be opened (exit 66).
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A read failed mid-merge (exit 74).
    #[error("Failed to read from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A write to the output failed (exit 74).
    #[error("Failed to write merged output: {source}")]
    Write {
        #[source]
        source: io::Error,
    },

    /// Allocation, ring setup, or kernel registration failed (exit 69).
    #[error("Failed to {what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A bug: heap overflow, unexpected completion tag, and friends (exit 70).
    #[error("Internal error: {0}")]
    Invariant(&'static str),
}

impl MergeError {
    /// The sysexits status the CLI exits with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MergeError::Open { .. } => EX_NOINPUT,
            MergeError::Read { .. } | MergeError::Write { .. } => EX_IOERR,
            MergeError::Resource { .. } => EX_UNAVAILABLE,
            MergeError::Invariant(_) => EX_SOFTWARE,
        }
    }

    /// True when this is a ring-setup failure the auto backend may downgrade
    /// from (io_uring missing or forbidden, not an input or output problem).
    pub fn is_ring_unavailable(&self) -> bool {
        matches!(self, MergeError::Resource { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_cli_contract() {
        let err = MergeError::Open {
            path: "missing.log".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        let text = err.to_string();
        assert!(text.starts_with("Failed to open missing.log: "), "{text}");
        assert_eq!(err.exit_code(), EX_NOINPUT);
    }

    #[test]
    fn exit_codes_per_class() {
        let io = || io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(
            MergeError::Read {
                path: "a".into(),
                source: io()
            }
            .exit_code(),
            EX_IOERR
        );
        assert_eq!(MergeError::Write { source: io() }.exit_code(), EX_IOERR);
        assert_eq!(
            MergeError::Resource {
                what: "create ring",
                source: io()
            }
            .exit_code(),
            EX_UNAVAILABLE
        );
        assert_eq!(MergeError::Invariant("x").exit_code(), EX_SOFTWARE);
    }
}
