//! Error taxonomy for fast-scan metadata handling.
//!
//! Block-layer code ([crate::nand], [crate::ubi]) keeps returning `anyhow::Result`; those errors
//! are wrapped here once they cross into the fast-scan subsystem, tagged with the PEB involved.

use std::fmt;

use thiserror::Error;

/// The on-flash record kinds of a fast-scan metadata buffer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordKind {
    Header,
    BlockEntry,
    VolumeInfo,
    LogicalMap,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "header",
            Self::BlockEntry => "block entry",
            Self::VolumeInfo => "volume info",
            Self::LogicalMap => "logical map",
        })
    }
}

#[derive(Debug, Error)]
pub enum FastscanError {
    /// The metadata buffer or region is undersized for the device; a configuration defect, never
    /// retried.
    #[error("fastscan configuration error: {0}")]
    Config(String),

    /// A record could not be decoded: truncated buffer or magic mismatch.
    #[error("malformed {kind} record at offset {offset}: {detail}")]
    Format {
        kind: RecordKind,
        offset: usize,
        detail: String,
    },

    /// The records decoded, but their contents are inconsistent.
    #[error("corrupt fastscan metadata: {0}")]
    Corrupt(String),

    /// The block layer failed to read, write or check a PEB.
    #[error("I/O error on PEB {pnum}: {cause:#}")]
    Io { pnum: u32, cause: anyhow::Error },

    /// Not enough free PEBs to host a fresh metadata generation.
    #[error("cannot allocate {needed} PEBs for fastscan metadata, only {available} free")]
    AllocationFailed { needed: usize, available: usize },

    /// Writing the new generation failed; the previous generation stays authoritative.
    #[error("failed to write fastscan metadata to PEB {pnum}: {cause:#}")]
    WriteFailed { pnum: u32, cause: anyhow::Error },
}

impl FastscanError {
    pub(crate) fn io(pnum: u32) -> impl FnOnce(anyhow::Error) -> Self {
        move |cause| Self::Io { pnum, cause }
    }

    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt(detail.into())
    }

    /// Whether this error means the snapshot itself is unusable (as opposed to the device or the
    /// configuration misbehaving).
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::Corrupt(_))
    }
}

pub type Result<T, E = FastscanError> = std::result::Result<T, E>;

#[test]
fn test_error_classification() {
    let format = FastscanError::Format {
        kind: RecordKind::VolumeInfo,
        offset: 64,
        detail: "bad magic".into(),
    };
    assert!(format.is_corrupt());
    assert_eq!(
        format.to_string(),
        "malformed volume info record at offset 64: bad magic"
    );

    assert!(FastscanError::corrupt("duplicate volume 3").is_corrupt());

    let io = FastscanError::io(7)(anyhow::anyhow!("simulated read failure"));
    assert!(!io.is_corrupt());
    assert_eq!(io.to_string(), "I/O error on PEB 7: simulated read failure");
}
