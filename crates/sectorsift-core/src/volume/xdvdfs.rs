//! XDVDFS (Xbox DVD filesystem) parsing.
//!
//! ## Volume Header (volume sector 32)
//! ```text
//! [0x000] Identifier "MICROSOFT*XBOX*MEDIA"   (20 bytes)
//! [0x014] Root directory sector               (u32 LE)
//! [0x018] Root directory size                 (u32 LE)
//! [0x01C] Creation time                       (FILETIME, 8 bytes)
//! [0x7EC] Identifier again                    (20 bytes)
//! ```
//!
//! ## Directory Entry (4-byte aligned)
//! ```text
//! [0x00] Left subtree offset    (u16 LE, in 4-byte units, 0 = none)
//! [0x02] Right subtree offset   (u16 LE, in 4-byte units, 0 = none)
//! [0x04] Start sector           (u32 LE)
//! [0x08] File size              (u32 LE)
//! [0x0C] Attributes             (0x10 = directory)
//! [0x0D] Name length            (1 byte)
//! [0x0E] Name                   (n bytes)
//! ```
//!
//! Each directory table is a binary search tree; an in-order walk yields
//! the entries sorted by name.

use super::{read_extent, DirectoryEntry, FileEntry, MAX_DIRECTORY_DEPTH};
use crate::error::{Error, Result};
use crate::sector::{le_u32, SectorReader};
use std::collections::HashSet;
use std::io::{Read, Seek};
use tracing::trace;

/// Identifier at the start of the volume header
pub const STANDARD_IDENTIFIER: &[u8; 20] = b"MICROSOFT*XBOX*MEDIA";

/// Volume sector holding the volume header
pub const HEADER_SECTOR: u64 = 32;

const ROOT_SECTOR_OFFSET: usize = 0x14;
const ROOT_SIZE_OFFSET: usize = 0x18;
const HEADER_MIN_LENGTH: usize = 0x1C;

const ENTRY_HEADER_LENGTH: usize = 0x0E;
const ATTRIBUTE_DIRECTORY: u8 = 0x10;
const PADDING: u16 = 0xFFFF;

/// A parsed XDVDFS volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XDvdFsVolume {
    /// Disc offset of volume sector 0
    pub base_offset: u64,
    /// Sectors from the volume start to the end of the image
    pub space_size: u64,
    /// Root directory tree
    pub root: DirectoryEntry,
}

impl XDvdFsVolume {
    /// Parses the volume whose header sits at `descriptor_offset`
    pub fn parse<R: Read + Seek>(
        reader: &mut SectorReader<R>,
        descriptor_offset: u64,
    ) -> Result<Self> {
        let sector_size = reader.sector_size();
        let header = reader.read_sector_data(descriptor_offset)?;

        if header.len() < HEADER_MIN_LENGTH || !header.starts_with(STANDARD_IDENTIFIER) {
            return Err(Error::malformed_volume(
                descriptor_offset,
                "not an XDVDFS volume header",
            ));
        }

        let base_offset = descriptor_offset
            .checked_sub(HEADER_SECTOR * sector_size)
            .ok_or_else(|| {
                Error::malformed_volume(descriptor_offset, "volume header precedes sector 32")
            })?;

        let root_sector = le_u32(&header[ROOT_SECTOR_OFFSET..]);
        let root_size = le_u32(&header[ROOT_SIZE_OFFSET..]);
        let space_size = (reader.len() - base_offset) / sector_size;

        let mut walker = TreeWalker {
            reader,
            base_offset,
            sector_size,
            visited: HashSet::new(),
        };
        let root = walker.read_directory(String::new(), root_sector, root_size as u64, 0)?;

        Ok(Self {
            base_offset,
            space_size,
            root,
        })
    }
}

/// One decoded directory table node
#[derive(Debug)]
struct Node {
    left: u16,
    right: u16,
    sector: u32,
    size: u32,
    attributes: u8,
    name: String,
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
        sector: u32,
        length: u64,
        depth: usize,
    ) -> Result<DirectoryEntry> {
        let offset = self.base_offset + sector as u64 * self.sector_size;
        let mut directory = DirectoryEntry::new(name, offset, length);

        if length == 0 {
            return Ok(directory);
        }
        if depth > MAX_DIRECTORY_DEPTH {
            return Err(Error::malformed_volume(offset, "directory nesting too deep"));
        }
        if !self.visited.insert(sector) {
            return Err(Error::malformed_volume(offset, "directory loop detected"));
        }

        trace!(
            "Reading directory '{}' at 0x{:X} ({} bytes)",
            directory.name,
            offset,
            length
        );
        let table = read_extent(self.reader, offset, length)?;

        for node in collect_in_order(&table, offset)? {
            if node.attributes & ATTRIBUTE_DIRECTORY != 0 {
                let child =
                    self.read_directory(node.name, node.sector, node.size as u64, depth + 1)?;
                directory.subdirectories.push(child);
            } else {
                directory.files.push(FileEntry {
                    name: node.name,
                    offset: self.base_offset + node.sector as u64 * self.sector_size,
                    length: node.size as u64,
                });
            }
        }

        Ok(directory)
    }
}

/// Walks the directory tree at the start of `table`, left subtree first.
///
/// Uses an explicit stack; a crafted table can chain thousands of entries.
fn collect_in_order(table: &[u8], table_offset: u64) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    let mut seen = HashSet::new();
    let mut pending: Vec<Node> = Vec::new();
    let mut next = Some(0usize);

    loop {
        while let Some(position) = next.take() {
            let node_offset = table_offset + position as u64;
            if !seen.insert(position) {
                return Err(Error::malformed_volume(node_offset, "directory tree loop detected"));
            }

            if let Some(node) = decode_node(table, position, node_offset)? {
                if node.left != 0 {
                    next = Some(node.left as usize * 4);
                }
                pending.push(node);
            }
        }

        let Some(node) = pending.pop() else {
            break;
        };
        if node.right != 0 {
            next = Some(node.right as usize * 4);
        }
        nodes.push(node);
    }

    Ok(nodes)
}

/// Decodes the entry at `position`; `None` for an empty table marker
fn decode_node(table: &[u8], position: usize, node_offset: u64) -> Result<Option<Node>> {
    let header = table
        .get(position..position + ENTRY_HEADER_LENGTH)
        .ok_or_else(|| Error::malformed_volume(node_offset, "directory entry past table end"))?;

    let left = u16::from_le_bytes([header[0], header[1]]);
    let right = u16::from_le_bytes([header[2], header[3]]);
    if left == PADDING && right == PADDING {
        return Ok(None);
    }

    let name_length = header[13] as usize;
    let name_start = position + ENTRY_HEADER_LENGTH;
    let name = table
        .get(name_start..name_start + name_length)
        .ok_or_else(|| Error::malformed_volume(node_offset, "entry name past table end"))?;

    Ok(Some(Node {
        left,
        right,
        sector: le_u32(&header[4..]),
        size: le_u32(&header[8..]),
        attributes: header[12],
        name: String::from_utf8_lossy(name).into_owned(),
    }))
}
