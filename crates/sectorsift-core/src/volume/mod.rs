//! Volume discovery on disc images.
//!
//! This module walks a disc image sector by sector looking for filesystem
//! volume descriptors and hands each hit to the matching parser.
//!
//! ## Algorithm Overview
//!
//! 1. Read one sector at the current offset and take its user data
//! 2. Compare the first [`MAX_ID_BYTES_LENGTH`] bytes against the ISO9660
//!    identifier, then the XDVDFS identifier
//! 3. ISO9660: parse, then jump past the whole volume (or one sector when
//!    the volume is an empty placeholder)
//! 4. XDVDFS: parse and stop; it is always the last volume on a disc
//! 5. No match: advance one sector
//!
//! Multi-session and hybrid discs therefore yield one [`Volume`] per
//! session, in disc order.

pub mod iso9660;
pub mod xdvdfs;

use crate::error::{Error, Result};
use crate::sector::{SectorReader, COOKED_SECTOR_SIZE};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub use iso9660::Iso9660Volume;
pub use xdvdfs::XDvdFsVolume;

/// Number of leading data bytes compared against volume signatures
pub const MAX_ID_BYTES_LENGTH: usize = 0x14;

/// Logical block size of directory tables on both supported filesystems
pub(crate) const LOGICAL_BLOCK_SIZE: u64 = COOKED_SECTOR_SIZE;

/// Directory tables larger than this are treated as corrupt
const MAX_DIRECTORY_SIZE: u64 = 16 * 1024 * 1024;

/// Deepest directory nesting accepted before assuming a loop
pub(crate) const MAX_DIRECTORY_DEPTH: usize = 64;

/// A file on a volume, located by absolute disc offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File name without any version suffix
    pub name: String,
    /// Disc offset of the first sector of the file
    pub offset: u64,
    /// File size in bytes
    pub length: u64,
}

/// A directory on a volume and everything below it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Directory name (empty for the volume root)
    pub name: String,
    /// Disc offset of the directory table
    pub offset: u64,
    /// Size of the directory table in bytes
    pub length: u64,
    /// Child directories in table order
    pub subdirectories: Vec<DirectoryEntry>,
    /// Child files in table order
    pub files: Vec<FileEntry>,
}

impl DirectoryEntry {
    /// Creates an empty directory node
    pub fn new(name: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            length,
            subdirectories: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Returns true if the directory has no children at all
    pub fn is_empty(&self) -> bool {
        self.subdirectories.is_empty() && self.files.is_empty()
    }

    /// Number of files in this directory and all subdirectories
    pub fn file_count(&self) -> usize {
        self.files.len()
            + self
                .subdirectories
                .iter()
                .map(DirectoryEntry::file_count)
                .sum::<usize>()
    }

    /// Lists every file below this directory with its path relative to it
    pub fn walk(&self) -> Vec<(PathBuf, &FileEntry)> {
        let mut out = Vec::new();
        self.walk_into(Path::new(""), &mut out);
        out
    }

    fn walk_into<'a>(&'a self, prefix: &Path, out: &mut Vec<(PathBuf, &'a FileEntry)>) {
        for dir in &self.subdirectories {
            dir.walk_into(&prefix.join(&dir.name), out);
        }
        for file in &self.files {
            out.push((prefix.join(&file.name), file));
        }
    }
}

/// Filesystem flavour of a discovered volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFormat {
    /// ISO9660 primary volume
    Iso9660,
    /// Xbox DVD filesystem
    XDvdFs,
}

impl VolumeFormat {
    /// Human readable format name
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Iso9660 => "ISO 9660",
            VolumeFormat::XDvdFs => "XDVDFS",
        }
    }
}

/// A parsed filesystem volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Volume {
    /// ISO9660 volume
    Iso9660(Iso9660Volume),
    /// XDVDFS volume
    XDvdFs(XDvdFsVolume),
}

impl Volume {
    /// Filesystem flavour
    pub fn format(&self) -> VolumeFormat {
        match self {
            Volume::Iso9660(_) => VolumeFormat::Iso9660,
            Volume::XDvdFs(_) => VolumeFormat::XDvdFs,
        }
    }

    /// Disc offset of the volume's sector 0
    pub fn base_offset(&self) -> u64 {
        match self {
            Volume::Iso9660(v) => v.base_offset,
            Volume::XDvdFs(v) => v.base_offset,
        }
    }

    /// Declared size of the volume in sectors
    pub fn space_size(&self) -> u64 {
        match self {
            Volume::Iso9660(v) => v.space_size,
            Volume::XDvdFs(v) => v.space_size,
        }
    }

    /// Volume label, possibly empty
    pub fn label(&self) -> &str {
        match self {
            Volume::Iso9660(v) => &v.label,
            Volume::XDvdFs(_) => "",
        }
    }

    /// Root directory of the volume
    pub fn root(&self) -> &DirectoryEntry {
        match self {
            Volume::Iso9660(v) => &v.root,
            Volume::XDvdFs(v) => &v.root,
        }
    }

    /// Returns true for a placeholder volume with an empty root
    pub fn is_dummy(&self) -> bool {
        self.root().is_empty()
    }

    /// Number of files on the volume
    pub fn file_count(&self) -> usize {
        self.root().file_count()
    }
}

/// Scans a disc image for volumes, in disc order.
///
/// Malformed volume descriptors are logged and skipped one sector at a
/// time; I/O failures abort the scan.
pub fn scan_volumes<R: Read + Seek>(reader: &mut SectorReader<R>) -> Result<Vec<Volume>> {
    let sector_size = reader.sector_size();
    let file_length = reader.len();
    let mut volumes = Vec::new();
    let mut current_offset = 0u64;

    debug!(
        "Starting volume scan of {} bytes (sector size 0x{:X})",
        file_length, sector_size
    );

    while current_offset < file_length {
        let data = reader.read_sector_data(current_offset)?;
        let probe = &data[..data.len().min(MAX_ID_BYTES_LENGTH)];

        if probe.starts_with(&iso9660::VOLUME_DESCRIPTOR_IDENTIFIER) {
            trace!("ISO9660 descriptor at 0x{:X}", current_offset);

            match Iso9660Volume::parse(reader, current_offset) {
                Ok(volume) => {
                    let next_offset = if volume.root.is_empty() {
                        // Placeholder volumes (seen on Xbox discs) declare bogus sizes
                        debug!("Empty ISO9660 volume at 0x{:X}", current_offset);
                        current_offset + sector_size
                    } else {
                        volume.base_offset + volume.space_size * sector_size
                    };

                    debug!(
                        "Found ISO9660 volume '{}' at 0x{:X} ({} sectors)",
                        volume.label, volume.base_offset, volume.space_size
                    );
                    volumes.push(Volume::Iso9660(volume));

                    current_offset = if next_offset > current_offset {
                        next_offset
                    } else {
                        warn!(
                            "Volume at 0x{:X} does not extend past its descriptor",
                            current_offset
                        );
                        current_offset + sector_size
                    };
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping volume descriptor: {}", e);
                    current_offset += sector_size;
                }
                Err(e) => return Err(e),
            }
        } else if probe.starts_with(xdvdfs::STANDARD_IDENTIFIER) {
            trace!("XDVDFS descriptor at 0x{:X}", current_offset);

            match XDvdFsVolume::parse(reader, current_offset) {
                Ok(volume) => {
                    debug!("Found XDVDFS volume at 0x{:X}", volume.base_offset);
                    volumes.push(Volume::XDvdFs(volume));
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping volume descriptor: {}", e);
                    current_offset += sector_size;
                }
                Err(e) => return Err(e),
            }
        } else {
            current_offset += sector_size;
        }
    }

    debug!("Volume scan complete: found {} volumes", volumes.len());
    Ok(volumes)
}

/// Reads a directory table of `length` bytes starting at disc `offset`.
///
/// Raw images contribute one logical block of user data per sector.
pub(crate) fn read_extent<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    if length > MAX_DIRECTORY_SIZE {
        return Err(Error::malformed_volume(
            offset,
            format!("directory table of {} bytes is implausibly large", length),
        ));
    }

    if !reader.is_raw() {
        if offset.saturating_add(length) > reader.len() {
            return Err(Error::malformed_volume(
                offset,
                "directory extent beyond end of image",
            ));
        }
        return reader.read_at(offset, length as usize);
    }

    let sector_size = reader.sector_size();
    let mut out = Vec::with_capacity(length as usize);
    let mut sector_offset = offset;

    while (out.len() as u64) < length {
        if sector_offset.saturating_add(sector_size) > reader.len() {
            return Err(Error::malformed_volume(
                offset,
                "directory extent beyond end of image",
            ));
        }

        let chunk = reader.read_sector_data(sector_offset)?;
        let wanted = (length - out.len() as u64).min(LOGICAL_BLOCK_SIZE) as usize;
        out.extend_from_slice(&chunk[..wanted.min(chunk.len())]);
        sector_offset += sector_size;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> DirectoryEntry {
        let mut root = DirectoryEntry::new("", 0x1000, 0x800);
        let mut sub = DirectoryEntry::new("DATA", 0x2000, 0x800);
        sub.files.push(FileEntry {
            name: "A.BIN".into(),
            offset: 0x3000,
            length: 4,
        });
        root.subdirectories.push(sub);
        root.files.push(FileEntry {
            name: "README.TXT".into(),
            offset: 0x4000,
            length: 10,
        });
        root
    }

    #[test]
    fn test_walk_preserves_relative_paths() {
        let root = sample_tree();
        let paths: Vec<_> = root.walk().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("DATA/A.BIN"), PathBuf::from("README.TXT")]
        );
        assert_eq!(root.file_count(), 2);
        assert!(!root.is_empty());
        assert!(DirectoryEntry::new("", 0, 0).is_empty());
    }

    #[test]
    fn test_volume_format_names() {
        assert_eq!(VolumeFormat::Iso9660.as_str(), "ISO 9660");
        assert_eq!(VolumeFormat::XDvdFs.as_str(), "XDVDFS");
    }
}
