//! Sony PSP movie streams (PAM/PMF).
//!
//! Audio travels in private stream 1 (`BD`) and the `C0`-`DF` range, each
//! packet carrying a short Sony sub-header whose size is keyed by the two
//! bytes at packet offset 6:
//!
//! | Sentinel        | Skip |
//! |-----------------|------|
//! | `8100`          | 7    |
//! | `8180`, `8101`  | 12   |
//! | `8181`          | 15   |
//!
//! ATRAC3plus audio also repeats an eight byte frame marker through the
//! stream; the final pass strips every copy and can wrap the result in an
//! `.oma` header.

use super::mpeg2::standard_dictionary;
use super::{
    BlockIdDictionary, BlockKind, DemuxOptions, OutputStream, PacketSizeRule, StreamFormat,
    PACK_START_CODE,
};
use crate::atrac3plus;
use crate::error::{Error, Result};
use crate::postprocess::{add_header_to_file, remove_all_chunks};
use crate::sector::{OffsetDescription, SectorReader};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PACK_HEADER_LENGTH: u64 = 0xE;
const AUDIO_MAGIC_OFFSET: u64 = 0xE;
const MARKER_LENGTH: usize = 8;

const ATRAC3_MAGIC: [u8; 4] = [0x1E, 0x60, 0x14, 0x00];
const AC3_MAGIC: [u8; 4] = [0x1E, 0x60, 0x14, 0x30];
const LPCM_MAGIC: [u8; 4] = [0x1E, 0x61, 0x80, 0x40];

const AVC_MAGIC: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const M2V_MAGIC: [u8; 4] = [0x00, 0x00, 0x01, 0xB3];

/// Handling of audio sub-header sentinels outside the known table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubHeaderPolicy {
    /// Assume no sub-header and write the payload as-is
    #[default]
    TreatAsEmpty,
    /// Stop with [`Error::UnknownSubHeader`]
    Reject,
}

/// Sony PSP movie stream format
#[derive(Debug, Clone)]
pub struct SonyPam {
    block_ids: BlockIdDictionary,
    sub_header_policy: SubHeaderPolicy,
    header_builder: fn(u32) -> Vec<u8>,
}

impl Default for SonyPam {
    fn default() -> Self {
        let block_ids = standard_dictionary()
            .with(PACK_START_CODE, PacketSizeRule::Static(PACK_HEADER_LENGTH))
            .with(0x0000_01BD, PacketSizeRule::SizeBytesFollow(2));

        Self {
            block_ids,
            sub_header_policy: SubHeaderPolicy::default(),
            header_builder: atrac3plus::oma_header,
        }
    }
}

impl SonyPam {
    /// Creates the format with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the unknown sub-header policy
    pub fn sub_header_policy(mut self, policy: SubHeaderPolicy) -> Self {
        self.sub_header_policy = policy;
        self
    }

    /// Replaces the function that turns a frame marker into a file header
    pub fn header_builder(mut self, builder: fn(u32) -> Vec<u8>) -> Self {
        self.header_builder = builder;
        self
    }

    /// Strips the repeated frame marker from one audio file.
    ///
    /// Returns the final path of the file.
    fn finish_audio(&self, path: PathBuf, add_header: bool) -> Result<PathBuf> {
        let marker = read_marker(&path)?;
        let Some(marker) = marker else {
            debug!("No frame marker in {}, leaving as-is", path.display());
            return Ok(path);
        };

        let (cleaned, removed) = remove_all_chunks(&path, &marker)?;
        fs::remove_file(&path).map_err(|e| Error::file_write(&path, e))?;
        fs::rename(&cleaned, &path).map_err(|e| Error::file_write(&path, e))?;
        debug!("Stripped {} frame markers from {}", removed, path.display());

        if !add_header {
            return Ok(path);
        }

        let key = u32::from_be_bytes([marker[0], marker[1], marker[2], marker[3]]);
        let headered = path.with_extension(atrac3plus::FILE_EXTENSION);
        add_header_to_file(&(self.header_builder)(key), &path, &headered)?;
        fs::remove_file(&path).map_err(|e| Error::file_write(&path, e))?;

        Ok(headered)
    }
}

/// First eight bytes of `path`, if the first four are not all zero
fn read_marker(path: &Path) -> Result<Option<[u8; MARKER_LENGTH]>> {
    let mut file = File::open(path).map_err(|e| Error::file_read(path, e))?;
    let mut marker = [0u8; MARKER_LENGTH];
    let mut filled = 0;

    while filled < MARKER_LENGTH {
        let read = file
            .read(&mut marker[filled..])
            .map_err(|e| Error::file_read(path, e))?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    if filled < MARKER_LENGTH || u32::from_le_bytes([marker[0], marker[1], marker[2], marker[3]]) == 0 {
        return Ok(None);
    }
    Ok(Some(marker))
}

impl StreamFormat for SonyPam {
    fn name(&self) -> &'static str {
        "sony-pam"
    }

    fn block_ids(&self) -> &BlockIdDictionary {
        &self.block_ids
    }

    fn is_audio_block(&self, tag: u32) -> bool {
        let low = tag & 0xFF;
        tag >> 8 == 0x0000_01 && (0xBD..=0xDF).contains(&low) && low != 0xBE && low != 0xBF
    }

    fn is_video_block(&self, tag: u32) -> bool {
        (0x0000_01E0..=0x0000_01EF).contains(&tag)
    }

    fn resolve_audio_header_size<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<u64> {
        let description = OffsetDescription::big_endian(2, 6);
        let sentinel = reader.read_varying_int(&description, offset)? as u16;

        match sentinel {
            0x8100 => Ok(0x07),
            0x8180 | 0x8101 => Ok(0x0C),
            0x8181 => Ok(0x0F),
            value => match self.sub_header_policy {
                SubHeaderPolicy::TreatAsEmpty => {
                    warn!(
                        "Unexpected sub-header 0x{:04X} at 0x{:X}, writing payload as-is",
                        value, offset
                    );
                    Ok(0)
                }
                SubHeaderPolicy::Reject => Err(Error::UnknownSubHeader { offset, value }),
            },
        }
    }

    fn sniff_audio_extension<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<&'static str> {
        let magic = reader.read_up_to(offset + AUDIO_MAGIC_OFFSET, 4)?;

        Ok(match magic.as_slice() {
            m if m == ATRAC3_MAGIC => ".at3",
            m if m == AC3_MAGIC => ".ac3",
            m if m == LPCM_MAGIC => ".lpcm",
            _ => ".bin",
        })
    }

    fn sniff_video_extension<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<&'static str> {
        let header_size = self.resolve_video_header_size(reader, offset)?;
        let magic = reader.read_up_to(offset + header_size + 6, 4)?;

        Ok(match magic.as_slice() {
            m if m == AVC_MAGIC => ".264",
            m if m == M2V_MAGIC => ".m2v",
            _ => ".bin",
        })
    }

    fn final_pass(
        &self,
        outputs: BTreeMap<u32, OutputStream>,
        options: &DemuxOptions,
    ) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(outputs.len());

        for stream in outputs.into_values() {
            let kind = stream.kind();
            let path = stream.finish()?;

            if kind == BlockKind::Audio {
                paths.push(self.finish_audio(path, options.add_header)?);
            } else {
                paths.push(path);
            }
        }

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn audio_packet(sentinel: u16) -> Vec<u8> {
        let mut packet = vec![0x00, 0x00, 0x01, 0xBD, 0x00, 0x10];
        packet.extend_from_slice(&sentinel.to_be_bytes());
        packet.push(0x05);
        packet.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]);
        packet.extend_from_slice(&ATRAC3_MAGIC);
        packet.extend_from_slice(&[0xAA; 4]);
        packet
    }

    #[test]
    fn test_audio_block_range() {
        let format = SonyPam::new();
        assert!(format.is_audio_block(0x1BD));
        assert!(!format.is_audio_block(0x1BE));
        assert!(!format.is_audio_block(0x1BF));
        assert!(format.is_audio_block(0x1C0));
        assert!(format.is_audio_block(0x1DF));
        assert!(!format.is_audio_block(0x1E0));
        assert!(!format.is_audio_block(0x2BD));
        assert_eq!(format.classify(0x1E3), BlockKind::Video);
        assert_eq!(format.classify(0x1BA), BlockKind::Other);
    }

    #[test]
    fn test_sub_header_table() {
        let format = SonyPam::new();
        for (sentinel, expected) in [(0x8100, 7), (0x8180, 12), (0x8101, 12), (0x8181, 15), (0x1234, 0)] {
            let mut reader = SectorReader::new(Cursor::new(audio_packet(sentinel))).unwrap();
            assert_eq!(format.resolve_audio_header_size(&mut reader, 0).unwrap(), expected);
        }
    }

    #[test]
    fn test_reject_unknown_sub_header() {
        let format = SonyPam::new().sub_header_policy(SubHeaderPolicy::Reject);
        let mut reader = SectorReader::new(Cursor::new(audio_packet(0x1234))).unwrap();
        let err = format.resolve_audio_header_size(&mut reader, 0).unwrap_err();
        assert!(matches!(err, Error::UnknownSubHeader { offset: 0, value: 0x1234 }));
    }

    #[test]
    fn test_sniff_extensions() {
        let format = SonyPam::new();
        let mut reader = SectorReader::new(Cursor::new(audio_packet(0x8180))).unwrap();
        assert_eq!(format.sniff_audio_extension(&mut reader, 0).unwrap(), ".at3");

        let mut video = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x0A, 0x81, 0x80, 0x00];
        video.extend_from_slice(&AVC_MAGIC);
        video.push(0x09);
        let mut reader = SectorReader::new(Cursor::new(video)).unwrap();
        assert_eq!(format.sniff_video_extension(&mut reader, 0).unwrap(), ".264");
    }

    #[test]
    fn test_zero_marker_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie_000001BD.at3");
        fs::write(&path, [0, 0, 0, 0, 1, 2, 3, 4, 5]).unwrap();

        let result = SonyPam::new().finish_audio(path.clone(), true).unwrap();
        assert_eq!(result, path);
        assert_eq!(fs::read(&path).unwrap().len(), 9);
    }
}
