//! Generic MPEG-1/MPEG-2 program streams.
//!
//! ## Pack Header
//! ```text
//! MPEG-2: 00 00 01 BA, 10 bytes (first byte 01xxxxxx), stuffing length in
//!         the low 3 bits of byte 13
//! MPEG-1: 00 00 01 BA, 8 bytes (first byte 0010xxxx)
//! ```
//!
//! Every other start code from `BB` up is followed by a 16-bit length.

use super::{
    pes_header_size, resolve_with_rule, BlockIdDictionary, PacketLength, PacketSizeRule,
    StreamFormat, PACK_START_CODE, PROGRAM_END_CODE, START_CODE_LENGTH,
};
use crate::error::{Error, Result};
use crate::sector::SectorReader;
use std::io::{Read, Seek};

const MPEG2_PACK_LENGTH: u64 = 14;
const MPEG1_PACK_LENGTH: u64 = 12;
const MAX_MPEG1_STUFFING: usize = 16;

const SEQUENCE_HEADER: [u8; 4] = [0x00, 0x00, 0x01, 0xB3];

/// Builds the start code table shared by program stream formats
pub(crate) fn standard_dictionary() -> BlockIdDictionary {
    BlockIdDictionary::new()
        .with(PACK_START_CODE, PacketSizeRule::Static(MPEG2_PACK_LENGTH))
        .with(PROGRAM_END_CODE, PacketSizeRule::EndOfStream)
        .with_range(0x0000_01BB..=0x0000_01FF, PacketSizeRule::SizeBytesFollow(2))
}

/// Plain MPEG program streams: MPEG audio `C0`-`DF`, video `E0`-`EF`
#[derive(Debug, Clone)]
pub struct Mpeg2 {
    block_ids: BlockIdDictionary,
}

impl Default for Mpeg2 {
    fn default() -> Self {
        Self {
            block_ids: standard_dictionary(),
        }
    }
}

impl Mpeg2 {
    /// Creates the format with the standard start code table
    pub fn new() -> Self {
        Self::default()
    }
}

/// Total length of the pack header at `offset`, MPEG-1 or MPEG-2
fn pack_header_length<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    offset: u64,
) -> Result<u64> {
    let marker = reader.read_at(offset + START_CODE_LENGTH, 1)?[0];

    if marker & 0xC0 == 0x40 {
        let stuffing = reader.read_at(offset + 13, 1)?[0] & 0x07;
        Ok(MPEG2_PACK_LENGTH + stuffing as u64)
    } else if marker & 0xF0 == 0x20 {
        Ok(MPEG1_PACK_LENGTH)
    } else {
        Err(Error::protocol(
            offset,
            format!("unrecognized pack header marker 0x{:02X}", marker),
        ))
    }
}

/// PES header size for either MPEG generation
fn payload_header_size<R: Read + Seek>(reader: &mut SectorReader<R>, offset: u64) -> Result<u64> {
    let body = offset + START_CODE_LENGTH + 2;
    let first = reader.read_at(body, 1)?[0];
    if first & 0xC0 == 0x80 {
        return pes_header_size(reader, offset);
    }

    let header = reader.read_up_to(body, MAX_MPEG1_STUFFING + 12)?;
    let mut position = header.iter().take_while(|&&b| b == 0xFF).count();
    if position > MAX_MPEG1_STUFFING {
        return Err(Error::protocol(offset, "too many stuffing bytes in packet header"));
    }

    let flags = |position: usize| {
        header
            .get(position)
            .copied()
            .ok_or_else(|| Error::protocol(offset, "truncated packet header"))
    };

    // Buffer scale and size
    if flags(position)? & 0xC0 == 0x40 {
        position += 2;
    }

    position += match flags(position)? & 0xF0 {
        0x20 => 5,
        0x30 => 10,
        _ if flags(position)? == 0x0F => 1,
        other => {
            return Err(Error::protocol(
                offset,
                format!("unrecognized timestamp flags 0x{:02X}", other),
            ))
        }
    };

    Ok(position as u64)
}

impl StreamFormat for Mpeg2 {
    fn name(&self) -> &'static str {
        "mpeg2"
    }

    fn block_ids(&self) -> &BlockIdDictionary {
        &self.block_ids
    }

    fn is_audio_block(&self, tag: u32) -> bool {
        (0x0000_01C0..=0x0000_01DF).contains(&tag)
    }

    fn is_video_block(&self, tag: u32) -> bool {
        (0x0000_01E0..=0x0000_01EF).contains(&tag)
    }

    fn resolve_packet_length<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
        tag: u32,
        rule: PacketSizeRule,
    ) -> Result<Option<PacketLength>> {
        if tag == PACK_START_CODE {
            let total = pack_header_length(reader, offset)?;
            return resolve_with_rule(reader, offset, PacketSizeRule::Static(total));
        }
        resolve_with_rule(reader, offset, rule)
    }

    fn resolve_audio_header_size<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<u64> {
        payload_header_size(reader, offset)
    }

    fn resolve_video_header_size<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<u64> {
        payload_header_size(reader, offset)
    }

    fn sniff_audio_extension<R: Read + Seek>(
        &self,
        _reader: &mut SectorReader<R>,
        _offset: u64,
    ) -> Result<&'static str> {
        Ok(".mp2")
    }

    fn sniff_video_extension<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<&'static str> {
        let skip = payload_header_size(reader, offset)?;
        let payload = reader.read_up_to(offset + START_CODE_LENGTH + 2 + skip, 4)?;
        if payload == SEQUENCE_HEADER {
            Ok(".m2v")
        } else {
            Ok(".bin")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: Vec<u8>) -> SectorReader<Cursor<Vec<u8>>> {
        SectorReader::new(Cursor::new(data)).unwrap()
    }

    #[test]
    fn test_pack_header_lengths() {
        let mut mpeg2 = vec![0x00, 0x00, 0x01, 0xBA, 0x44, 0, 0, 0, 0, 0, 0, 0, 0, 0xFA];
        mpeg2.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(pack_header_length(&mut reader(mpeg2), 0).unwrap(), 16);

        let mpeg1 = vec![0x00, 0x00, 0x01, 0xBA, 0x21, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(pack_header_length(&mut reader(mpeg1), 0).unwrap(), 12);

        let junk = vec![0x00, 0x00, 0x01, 0xBA, 0x00, 0, 0, 0];
        assert!(matches!(
            pack_header_length(&mut reader(junk), 0),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_mpeg2_payload_header() {
        // 81 80 05 + five bytes of PTS
        let data = vec![
            0x00, 0x00, 0x01, 0xE0, 0x00, 0x0C, 0x81, 0x80, 0x05, 0x21, 0, 1, 0, 1, 0, 0, 1, 0xB3,
        ];
        let mut reader = reader(data);
        assert_eq!(payload_header_size(&mut reader, 0).unwrap(), 8);
        assert_eq!(Mpeg2::new().sniff_video_extension(&mut reader, 0).unwrap(), ".m2v");
    }

    #[test]
    fn test_mpeg1_payload_header() {
        // Two stuffing bytes, buffer size, PTS only
        let data = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x0B, 0xFF, 0xFF, 0x40, 0x20, 0x21, 0, 1, 0, 1];
        assert_eq!(payload_header_size(&mut reader(data), 0).unwrap(), 9);

        let bare = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x01, 0x0F];
        assert_eq!(payload_header_size(&mut reader(bare), 0).unwrap(), 1);
    }

    #[test]
    fn test_classification() {
        let format = Mpeg2::new();
        assert!(format.is_audio_block(0x1C0));
        assert!(format.is_audio_block(0x1DF));
        assert!(!format.is_audio_block(0x1BD));
        assert!(format.is_video_block(0x1E0));
        assert!(!format.is_video_block(0x1F0));
        assert_eq!(format.block_ids().get(0x1B9), Some(PacketSizeRule::EndOfStream));
    }
}
