//! ISO9660 primary volume parsing.
//!
//! ## Primary Volume Descriptor (volume sector 16)
//! ```text
//! [0x000] Type (0x01)                 (1 byte)
//! [0x001] Standard identifier "CD001" (5 bytes)
//! [0x028] Volume identifier           (32 bytes)
//! [0x050] Volume space size           (u32 LE, then u32 BE)
//! [0x080] Logical block size          (u16 LE, then u16 BE)
//! [0x09C] Root directory record       (34 bytes)
//! ```
//!
//! ## Directory Record
//! ```text
//! [0x00] Record length                (1 byte, 0 = pad to next block)
//! [0x02] Extent location              (u32 LE, then u32 BE)
//! [0x0A] Data length                  (u32 LE, then u32 BE)
//! [0x19] File flags                   (bit 1 = directory)
//! [0x20] File identifier length       (1 byte)
//! [0x21] File identifier              (n bytes)
//! ```

use super::{read_extent, DirectoryEntry, FileEntry, LOGICAL_BLOCK_SIZE, MAX_DIRECTORY_DEPTH};
use crate::error::{Error, Result};
use crate::sector::{le_u32, SectorReader};
use std::collections::HashSet;
use std::io::{Read, Seek};
use tracing::trace;

/// Descriptor type byte followed by the standard identifier
pub const VOLUME_DESCRIPTOR_IDENTIFIER: [u8; 6] = [0x01, b'C', b'D', b'0', b'0', b'1'];

/// Volume sector holding the primary volume descriptor
pub const DESCRIPTOR_SECTOR: u64 = 16;

const VOLUME_ID_RANGE: std::ops::Range<usize> = 0x28..0x48;
const VOLUME_SPACE_SIZE_OFFSET: usize = 0x50;
const LOGICAL_BLOCK_SIZE_OFFSET: usize = 0x80;
const ROOT_RECORD_OFFSET: usize = 0x9C;

const RECORD_MIN_LENGTH: usize = 34;
const RECORD_FLAG_DIRECTORY: u8 = 0x02;

/// A parsed ISO9660 volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso9660Volume {
    /// Disc offset of volume sector 0
    pub base_offset: u64,
    /// Volume space size in sectors
    pub space_size: u64,
    /// Volume identifier with padding removed
    pub label: String,
    /// Root directory tree
    pub root: DirectoryEntry,
}

/// Fields of one directory record needed to build the tree
struct DirectoryRecord<'a> {
    extent: u32,
    data_length: u32,
    flags: u8,
    identifier: &'a [u8],
}

impl<'a> DirectoryRecord<'a> {
    fn parse(record: &'a [u8], offset: u64) -> Result<Self> {
        if record.len() < RECORD_MIN_LENGTH {
            return Err(Error::malformed_volume(
                offset,
                format!("directory record of {} bytes is too short", record.len()),
            ));
        }

        let id_len = record[32] as usize;
        let identifier = record.get(33..33 + id_len).ok_or_else(|| {
            Error::malformed_volume(
                offset,
                format!("bad identifier length {} in directory record", id_len),
            )
        })?;

        Ok(Self {
            extent: le_u32(&record[2..6]),
            data_length: le_u32(&record[10..14]),
            flags: record[25],
            identifier,
        })
    }

    /// The "." and ".." entries
    fn is_self_or_parent(&self) -> bool {
        self.identifier == [0x00] || self.identifier == [0x01]
    }

    fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }
}

impl Iso9660Volume {
    /// Parses the volume whose primary descriptor sits at `descriptor_offset`
    pub fn parse<R: Read + Seek>(
        reader: &mut SectorReader<R>,
        descriptor_offset: u64,
    ) -> Result<Self> {
        let sector_size = reader.sector_size();
        let descriptor = reader.read_sector_data(descriptor_offset)?;

        if (descriptor.len() as u64) < LOGICAL_BLOCK_SIZE {
            return Err(Error::malformed_volume(
                descriptor_offset,
                "truncated volume descriptor",
            ));
        }
        if !descriptor.starts_with(&VOLUME_DESCRIPTOR_IDENTIFIER) {
            return Err(Error::malformed_volume(
                descriptor_offset,
                "not a primary volume descriptor",
            ));
        }

        let base_offset = descriptor_offset
            .checked_sub(DESCRIPTOR_SECTOR * sector_size)
            .ok_or_else(|| {
                Error::malformed_volume(descriptor_offset, "descriptor precedes sector 16")
            })?;

        let block_size = u16::from_le_bytes([
            descriptor[LOGICAL_BLOCK_SIZE_OFFSET],
            descriptor[LOGICAL_BLOCK_SIZE_OFFSET + 1],
        ]);
        if block_size as u64 != LOGICAL_BLOCK_SIZE {
            return Err(Error::malformed_volume(
                descriptor_offset,
                format!("unsupported logical block size {}", block_size),
            ));
        }

        let space_size =
            le_u32(&descriptor[VOLUME_SPACE_SIZE_OFFSET..VOLUME_SPACE_SIZE_OFFSET + 4]) as u64;
        let volume_end = base_offset + space_size * sector_size;
        if volume_end > reader.len() {
            return Err(Error::malformed_volume(
                descriptor_offset,
                format!(
                    "volume of {} sectors ends at 0x{:X}, past end of image 0x{:X}",
                    space_size,
                    volume_end,
                    reader.len()
                ),
            ));
        }

        let label = String::from_utf8_lossy(&descriptor[VOLUME_ID_RANGE])
            .trim_end_matches([' ', '\0'])
            .to_string();

        let root_record = DirectoryRecord::parse(
            &descriptor[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + RECORD_MIN_LENGTH],
            descriptor_offset + ROOT_RECORD_OFFSET as u64,
        )?;

        let mut walker = TreeWalker {
            reader,
            base_offset,
            sector_size,
            visited: HashSet::new(),
        };
        let root = walker.read_directory(
            String::new(),
            root_record.extent,
            root_record.data_length as u64,
            0,
        )?;

        Ok(Self {
            base_offset,
            space_size,
            label,
            root,
        })
    }
}

struct TreeWalker<'r, R> {
    reader: &'r mut SectorReader<R>,
    base_offset: u64,
    sector_size: u64,
    visited: HashSet<u32>,
}

impl<R: Read + Seek> TreeWalker<'_, R> {
    fn read_directory(
        &mut self,
        name: String,
        extent: u32,
        length: u64,
        depth: usize,
    ) -> Result<DirectoryEntry> {
        let offset = self.base_offset + extent as u64 * self.sector_size;

        if depth > MAX_DIRECTORY_DEPTH {
            return Err(Error::malformed_volume(offset, "directory nesting too deep"));
        }
        if !self.visited.insert(extent) {
            return Err(Error::malformed_volume(offset, "directory loop detected"));
        }

        trace!("Reading directory '{}' at 0x{:X} ({} bytes)", name, offset, length);
        let table = read_extent(self.reader, offset, length)?;
        let mut directory = DirectoryEntry::new(name, offset, length);

        for (block_index, block) in table.chunks(LOGICAL_BLOCK_SIZE as usize).enumerate() {
            let block_offset = offset + block_index as u64 * self.sector_size;
            let mut position = 0usize;

            while position < block.len() {
                let record_length = block[position] as usize;
                if record_length == 0 {
                    // Records never span blocks; the rest is padding
                    break;
                }

                let record_offset = block_offset + position as u64;
                let record = block.get(position..position + record_length).ok_or_else(|| {
                    Error::malformed_volume(record_offset, "directory record crosses block end")
                })?;
                let record = DirectoryRecord::parse(record, record_offset)?;

                if !record.is_self_or_parent() {
                    let name = clean_identifier(record.identifier);

                    if record.is_directory() {
                        let child = self.read_directory(
                            name,
                            record.extent,
                            record.data_length as u64,
                            depth + 1,
                        )?;
                        directory.subdirectories.push(child);
                    } else {
                        directory.files.push(FileEntry {
                            name,
                            offset: self.base_offset + record.extent as u64 * self.sector_size,
                            length: record.data_length as u64,
                        });
                    }
                }

                position += record_length;
            }
        }

        Ok(directory)
    }
}

/// Drops the `;N` version suffix and a bare trailing dot
fn clean_identifier(identifier: &[u8]) -> String {
    let name = String::from_utf8_lossy(identifier);
    let name = name.split(';').next().unwrap_or_default();
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_identifier() {
        assert_eq!(clean_identifier(b"SLUS_123.45;1"), "SLUS_123.45");
        assert_eq!(clean_identifier(b"README.;1"), "README");
        assert_eq!(clean_identifier(b"MOVIE"), "MOVIE");
    }

    #[test]
    fn test_record_rejects_bad_identifier_length() {
        let mut record = [0u8; RECORD_MIN_LENGTH];
        record[0] = RECORD_MIN_LENGTH as u8;
        record[32] = 8;
        let err = DirectoryRecord::parse(&record, 0x40).err().unwrap();
        assert!(matches!(err, Error::MalformedVolume { offset: 0x40, .. }));
    }

    #[test]
    fn test_record_fields() {
        let mut record = vec![0u8; 40];
        record[0] = 40;
        record[2..6].copy_from_slice(&0x1234u32.to_le_bytes());
        record[10..14].copy_from_slice(&0x800u32.to_le_bytes());
        record[25] = RECORD_FLAG_DIRECTORY;
        record[32] = 4;
        record[33..37].copy_from_slice(b"DATA");

        let parsed = DirectoryRecord::parse(&record, 0).unwrap();
        assert_eq!(parsed.extent, 0x1234);
        assert_eq!(parsed.data_length, 0x800);
        assert!(parsed.is_directory());
        assert!(!parsed.is_self_or_parent());
        assert_eq!(parsed.identifier, b"DATA");
    }
}
