//! Error types for the sectorsift-core library.
//!
//! Every error that can be tied to a position in the source carries the
//! byte offset at which it occurred.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sectorsift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all sectorsift operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Read or seek failure on the source
    #[error("I/O error at offset 0x{offset:X}: {source}")]
    Io {
        /// Byte offset of the failed operation
        offset: u64,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to open or read an input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Path traversal attempt detected (security error)
    #[error("path traversal detected: '{path}' would escape output directory")]
    PathTraversal {
        /// The suspicious path
        path: PathBuf,
    },

    /// A volume descriptor or directory table is structurally invalid
    #[error("malformed volume at offset 0x{offset:X}: {details}")]
    MalformedVolume {
        /// Byte offset of the descriptor or record
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// A start code that the active stream format does not know
    #[error("unknown block 0x{tag:08X} at offset 0x{offset:X}")]
    UnknownBlock {
        /// Byte offset of the start code
        offset: u64,
        /// The start code, big-endian
        tag: u32,
    },

    /// The stream violates a structural rule (e.g. no forward progress)
    #[error("protocol error at offset 0x{offset:X}: {details}")]
    Protocol {
        /// Byte offset of the offending packet
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// An audio sub-header sentinel not covered by the header-size table
    #[error("unexpected sub-header bytes 0x{value:04X} in block at offset 0x{offset:X}")]
    UnknownSubHeader {
        /// Byte offset of the packet start code
        offset: u64,
        /// The sentinel value that was read
        value: u16,
    },

    /// A computed offset or length exceeds the bounds of the source
    #[error("range 0x{offset:X}+0x{length:X} exceeds source length 0x{limit:X}")]
    OutOfRange {
        /// Requested start offset
        offset: u64,
        /// Requested length
        length: u64,
        /// Length of the source
        limit: u64,
    },
}

impl Error {
    /// Creates a new positioned I/O error
    pub fn io(offset: u64, source: std::io::Error) -> Self {
        Self::Io { offset, source }
    }

    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new path traversal error
    pub fn path_traversal(path: impl Into<PathBuf>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Creates a new malformed volume error
    pub fn malformed_volume(offset: u64, details: impl Into<String>) -> Self {
        Self::MalformedVolume {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new protocol error
    pub fn protocol(offset: u64, details: impl Into<String>) -> Self {
        Self::Protocol {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new out-of-range error
    pub fn out_of_range(offset: u64, length: u64, limit: u64) -> Self {
        Self::OutOfRange {
            offset,
            length,
            limit,
        }
    }

    /// Returns the source offset the error is attached to, if any
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Io { offset, .. }
            | Self::MalformedVolume { offset, .. }
            | Self::UnknownBlock { offset, .. }
            | Self::Protocol { offset, .. }
            | Self::UnknownSubHeader { offset, .. }
            | Self::OutOfRange { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Returns true if scanning can skip past this error and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedVolume { .. })
    }
}
