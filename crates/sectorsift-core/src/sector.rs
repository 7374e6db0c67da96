//! Byte and sector level access to disc images and stream files.
//!
//! A [`SectorReader`] wraps any seekable source, remembers its length, and
//! decides once (from the first twelve bytes) whether the source is a raw
//! CD image with 2352-byte sectors or a cooked image with 2048-byte sectors.
//!
//! ## Raw sector layout
//!
//! ```text
//! [0x000] Sync pattern            (12 bytes: 00 FF*10 00)
//! [0x00C] Header (MSF + mode)     (4 bytes, mode at 0x00F)
//! [0x010] Mode 1 user data        (0x800 bytes)
//! [0x010] Mode 2 subheader        (8 bytes, submode at 0x012)
//! [0x018] Mode 2 user data        (0x800 bytes Form 1, 0x914 bytes Form 2)
//! [....]  EDC / ECC               (remainder of 0x930)
//! ```
//!
//! All reads are absolute-offset. A reader owns its handle, so independent
//! sessions over the same file each open their own [`SectorReader`].

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::trace;

/// Synchronization pattern opening every raw CD sector
pub const SYNC_BYTES: [u8; 12] = [
    0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00,
];

/// Sector size of a cooked (user data only) image
pub const COOKED_SECTOR_SIZE: u64 = 0x800;

/// Sector size of a raw image
pub const RAW_SECTOR_SIZE: u64 = 0x930;

const MODE_BYTE_OFFSET: usize = 0x0F;
const SUBMODE_BYTE_OFFSET: usize = 0x12;
const SUBMODE_FORM2: u8 = 0x20;
const MODE1_DATA_OFFSET: usize = 0x10;
const MODE2_DATA_OFFSET: usize = 0x18;
const FORM1_DATA_SIZE: usize = 0x800;
const FORM2_DATA_SIZE: usize = 0x914;

/// Chunk size used for forward pattern searches
const SEARCH_CHUNK_SIZE: usize = 64 * 1024;

/// Returns true if `head` starts with the raw CD sync pattern
pub fn probe_raw(head: &[u8]) -> bool {
    head.starts_with(&SYNC_BYTES)
}

/// Returns the user data portion of a raw sector.
///
/// The mode byte selects the payload offset; Mode 2 sectors additionally
/// consult the submode byte to tell Form 1 from Form 2. Truncated sectors
/// yield whatever data bytes are present.
pub fn data_chunk_from_sector(sector: &[u8]) -> &[u8] {
    let mode = sector.get(MODE_BYTE_OFFSET).copied().unwrap_or(1);

    let (start, size) = match mode {
        2 => {
            let submode = sector.get(SUBMODE_BYTE_OFFSET).copied().unwrap_or(0);
            if submode & SUBMODE_FORM2 != 0 {
                (MODE2_DATA_OFFSET, FORM2_DATA_SIZE)
            } else {
                (MODE2_DATA_OFFSET, FORM1_DATA_SIZE)
            }
        }
        _ => (MODE1_DATA_OFFSET, FORM1_DATA_SIZE),
    };

    let start = start.min(sector.len());
    let end = (start + size).min(sector.len());
    &sector[start..end]
}

/// Byte order of an integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

/// Describes an integer to read relative to some base offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetDescription {
    /// Byte order of the field
    pub byte_order: ByteOrder,
    /// Width of the field in bytes (1..=8)
    pub width: usize,
    /// Offset of the field relative to the base
    pub relative_offset: u64,
}

impl OffsetDescription {
    /// Creates a big-endian description
    pub fn big_endian(width: usize, relative_offset: u64) -> Self {
        Self {
            byte_order: ByteOrder::Big,
            width,
            relative_offset,
        }
    }

    /// Creates a little-endian description
    pub fn little_endian(width: usize, relative_offset: u64) -> Self {
        Self {
            byte_order: ByteOrder::Little,
            width,
            relative_offset,
        }
    }
}

/// Interprets `bytes` as an unsigned integer of the given byte order
pub fn int_from_bytes(bytes: &[u8], byte_order: ByteOrder) -> u64 {
    match byte_order {
        ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        ByteOrder::Little => bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64),
    }
}

/// Reads the little-endian `u32` at the start of `bytes`
pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    int_from_bytes(&bytes[..4], ByteOrder::Little) as u32
}

/// Absolute-offset reader over a disc image or stream file
#[derive(Debug)]
pub struct SectorReader<R> {
    inner: R,
    len: u64,
    is_raw: bool,
}

impl SectorReader<File> {
    /// Opens a file read-only and probes its sector layout
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::file_read(path, e))?;
        Self::new(file)
    }
}

impl<R: Read + Seek> SectorReader<R> {
    /// Wraps a seekable source, measuring its length and probing for raw sectors
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0)).map_err(|e| Error::io(0, e))?;

        let mut reader = Self {
            inner,
            len,
            is_raw: false,
        };

        let head = reader.read_up_to(0, SYNC_BYTES.len())?;
        reader.is_raw = probe_raw(&head);
        trace!(
            "Opened source of {} bytes (raw sectors: {})",
            reader.len,
            reader.is_raw
        );

        Ok(reader)
    }

    /// Total length of the source in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the source has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the source starts with the raw CD sync pattern
    pub fn is_raw(&self) -> bool {
        self.is_raw
    }

    /// Sector size implied by the raw probe
    pub fn sector_size(&self) -> u64 {
        if self.is_raw {
            RAW_SECTOR_SIZE
        } else {
            COOKED_SECTOR_SIZE
        }
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Fails with [`Error::OutOfRange`] if the range ends past the source
    /// length and with [`Error::Io`] if the read comes up short anyway.
    pub fn read_into(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let length = buf.len() as u64;
        match offset.checked_add(length) {
            Some(end) if end <= self.len => {}
            _ => return Err(Error::out_of_range(offset, length, self.len)),
        }

        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(offset, e))?;
        self.inner
            .read_exact(buf)
            .map_err(|e| Error::io(offset, e))
    }

    /// Reads exactly `length` bytes at `offset`
    pub fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads up to `length` bytes at `offset`, truncated at the end of the source
    pub fn read_up_to(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let available = self.len.saturating_sub(offset).min(length as u64) as usize;
        self.read_at(offset, available)
    }

    /// Reads the sector starting at `offset` and returns its user data.
    ///
    /// A trailing partial sector is returned as far as it goes.
    pub fn read_sector_data(&mut self, offset: u64) -> Result<Vec<u8>> {
        let sector = self.read_up_to(offset, self.sector_size() as usize)?;
        if self.is_raw {
            Ok(data_chunk_from_sector(&sector).to_vec())
        } else {
            Ok(sector)
        }
    }

    /// Reads an integer described by `description` relative to `base_offset`
    pub fn read_varying_int(
        &mut self,
        description: &OffsetDescription,
        base_offset: u64,
    ) -> Result<u64> {
        let offset = base_offset.saturating_add(description.relative_offset);
        if description.width == 0 || description.width > 8 {
            return Err(Error::protocol(
                offset,
                format!("unsupported integer width {}", description.width),
            ));
        }

        let bytes = self.read_at(offset, description.width)?;
        Ok(int_from_bytes(&bytes, description.byte_order))
    }

    /// Finds the next occurrence of `pattern` at or after `from`
    pub fn find_next(&mut self, pattern: &[u8], from: u64) -> Result<Option<u64>> {
        if pattern.is_empty() {
            return Ok(Some(from));
        }

        let mut position = from;
        while position < self.len {
            let chunk = self.read_up_to(position, SEARCH_CHUNK_SIZE)?;
            if chunk.len() < pattern.len() {
                break;
            }

            if let Some(found) = chunk.windows(pattern.len()).position(|w| w == pattern) {
                return Ok(Some(position + found as u64));
            }

            // Overlap so a match straddling two chunks is not missed
            position += (chunk.len() - pattern.len() + 1) as u64;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn raw_sector(mode: u8, submode: u8, fill: u8) -> Vec<u8> {
        let mut sector = vec![0u8; RAW_SECTOR_SIZE as usize];
        for b in &mut sector[MODE1_DATA_OFFSET..] {
            *b = fill;
        }
        sector[..12].copy_from_slice(&SYNC_BYTES);
        sector[MODE_BYTE_OFFSET] = mode;
        sector[SUBMODE_BYTE_OFFSET] = submode;
        sector
    }

    #[test]
    fn test_probe_raw_toggles_sector_size() {
        let mut data = raw_sector(1, 0, 0xAA);
        let reader = SectorReader::new(Cursor::new(data.clone())).unwrap();
        assert!(reader.is_raw());
        assert_eq!(reader.sector_size(), RAW_SECTOR_SIZE);

        data[1] = 0x00;
        let reader = SectorReader::new(Cursor::new(data.clone())).unwrap();
        assert!(!reader.is_raw());
        assert_eq!(reader.sector_size(), COOKED_SECTOR_SIZE);
        assert_eq!(reader.len(), data.len() as u64);
    }

    #[test]
    fn test_probe_raw_short_source() {
        let reader = SectorReader::new(Cursor::new(vec![0x00, 0xFF])).unwrap();
        assert!(!reader.is_raw());
    }

    #[test]
    fn test_data_chunk_modes() {
        let mode1 = raw_sector(1, 0, 0x11);
        let chunk = data_chunk_from_sector(&mode1);
        assert_eq!(chunk.len(), FORM1_DATA_SIZE);
        assert_eq!(chunk.as_ptr(), mode1[MODE1_DATA_OFFSET..].as_ptr());

        let form1 = raw_sector(2, 0x08, 0x22);
        let chunk = data_chunk_from_sector(&form1);
        assert_eq!(chunk.len(), FORM1_DATA_SIZE);
        assert_eq!(chunk.as_ptr(), form1[MODE2_DATA_OFFSET..].as_ptr());

        let form2 = raw_sector(2, SUBMODE_FORM2, 0x33);
        assert_eq!(data_chunk_from_sector(&form2).len(), FORM2_DATA_SIZE);
    }

    #[test]
    fn test_read_at_bounds() {
        let mut reader = SectorReader::new(Cursor::new(vec![1u8, 2, 3, 4, 5])).unwrap();
        assert_eq!(reader.read_at(1, 3).unwrap(), vec![2, 3, 4]);
        assert!(matches!(
            reader.read_at(3, 4),
            Err(Error::OutOfRange {
                offset: 3,
                length: 4,
                limit: 5
            })
        ));
        assert_eq!(reader.read_up_to(3, 4).unwrap(), vec![4, 5]);
        assert!(reader.read_up_to(9, 4).unwrap().is_empty());
    }

    #[test]
    fn test_read_varying_int() {
        let mut reader =
            SectorReader::new(Cursor::new(vec![0x00, 0x12, 0x34, 0x56, 0x78])).unwrap();
        let be = OffsetDescription::big_endian(2, 1);
        let le = OffsetDescription::little_endian(4, 0);
        assert_eq!(reader.read_varying_int(&be, 0).unwrap(), 0x1234);
        assert_eq!(reader.read_varying_int(&be, 2).unwrap(), 0x5678);
        assert_eq!(reader.read_varying_int(&le, 1).unwrap(), 0x7856_3412);
        assert!(reader
            .read_varying_int(&OffsetDescription::big_endian(9, 0), 0)
            .is_err());
    }

    #[test]
    fn test_le_u32_reads_leading_bytes() {
        assert_eq!(le_u32(&[0x78, 0x56, 0x34, 0x12, 0xFF]), 0x1234_5678);
        assert_eq!(
            int_from_bytes(&[0x12, 0x34], ByteOrder::Big),
            int_from_bytes(&[0x34, 0x12], ByteOrder::Little)
        );
    }

    #[test]
    fn test_find_next_across_chunks() {
        let mut data = vec![0u8; SEARCH_CHUNK_SIZE + 16];
        let at = SEARCH_CHUNK_SIZE - 2;
        data[at..at + 4].copy_from_slice(&[0x00, 0x00, 0x01, 0xBA]);
        let mut reader = SectorReader::new(Cursor::new(data)).unwrap();

        let found = reader.find_next(&[0x00, 0x00, 0x01, 0xBA], 0).unwrap();
        assert_eq!(found, Some(at as u64));
        assert_eq!(
            reader
                .find_next(&[0x00, 0x00, 0x01, 0xBA], at as u64 + 1)
                .unwrap(),
            None
        );
    }
}
