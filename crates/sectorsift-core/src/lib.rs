//! # sectorsift-core
//!
//! A library for pulling the contents out of optical disc images and
//! multiplexed movie streams.
//!
//! This crate provides the core functionality for:
//! - Detecting raw (2352-byte) and cooked (2048-byte) sector layouts
//! - Discovering ISO9660 and XDVDFS volumes, including multi-volume discs
//! - Extracting volume trees to a destination directory
//! - Demultiplexing program streams into per-stream output files
//!
//! ## Architecture
//!
//! - [`sector`]: Byte and sector level access to a source
//! - [`volume`]: Volume catalog scanning and filesystem parsers
//! - [`extract`]: Copying volume trees to disk
//! - [`demux`]: Program stream demultiplexing and format variants
//! - [`postprocess`]: Chunk stripping and header injection
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use sectorsift_core::{scan_volumes, CancelFlag, Extractor, SectorReader};
//!
//! let mut reader = SectorReader::open("game.iso")?;
//! let volumes = scan_volumes(&mut reader)?;
//!
//! let cancel = CancelFlag::new();
//! let mut extractor = Extractor::new(&mut reader, &cancel);
//! for volume in &volumes {
//!     let report = extractor.extract_volume(volume, "out")?;
//!     println!("{} files written", report.files_written);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! The [`StreamFormat`] trait supplies the demultiplexer with its packet
//! table, payload classification, extension sniffing and final pass.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod atrac3plus;
pub mod cancel;
pub mod demux;
pub mod error;
pub mod extract;
pub mod postprocess;
pub mod sector;
pub mod volume;

// Re-export primary types for convenience
pub use cancel::{CancelFlag, Outcome};
pub use demux::{
    BlockIdDictionary, BlockKind, DemuxOptions, DemuxReport, Demuxer, Mpeg2, PacketSizeRule,
    SonyPam, StreamFormat, SubHeaderPolicy, UnknownBlockPolicy,
};
pub use error::{Error, Result};
pub use extract::{ExtractReport, Extractor};
pub use sector::{ByteOrder, OffsetDescription, SectorReader};
pub use volume::{scan_volumes, DirectoryEntry, FileEntry, Volume, VolumeFormat};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
