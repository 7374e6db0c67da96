//! ATRAC3plus container headers.
//!
//! PSP movie audio streams carry a four byte ATRAC3plus frame header
//! (`0F D0 xx yy`) in front of every frame. [`oma_header`] turns that word
//! into the header of an OpenMG (`.oma`) file so the stripped stream plays
//! in ordinary decoders.
//!
//! ## Layout
//! ```text
//! [0x000] "ea3" tag header       (10 bytes, syncsafe size 0xBF6)
//! [0x00A] Tag padding            (zeros up to 0xC00)
//! [0xC00] "EA3" header           (0x60 bytes)
//!         [0x00] "EA3", version 1, 0x0060 header size
//!         [0x06] 0xFFFF (not encrypted)
//!         [0x20] Codec word (u32 BE): 0x01 ATRAC3plus, then parameters
//! ```

/// File extension given to headered ATRAC3plus streams
pub const FILE_EXTENSION: &str = "oma";

const TAG_SIZE: usize = 0xC00;
const EA3_HEADER_SIZE: usize = 0x60;
const CODEC_WORD_OFFSET: usize = 0x20;
const CODEC_ID_ATRAC3PLUS: u32 = 0x01;

/// Builds an `.oma` header from an ATRAC3plus frame header word.
///
/// Only the low sixteen bits (channel layout, sample rate and frame size)
/// are carried over; the high half is the frame sync.
pub fn oma_header(frame_header: u32) -> Vec<u8> {
    let mut header = vec![0u8; TAG_SIZE + EA3_HEADER_SIZE];

    let tag_body = (TAG_SIZE - 10) as u32;
    header[..6].copy_from_slice(&[b'e', b'a', b'3', 0x03, 0x00, 0x00]);
    header[6..10].copy_from_slice(&syncsafe(tag_body));

    let ea3 = &mut header[TAG_SIZE..];
    ea3[..8].copy_from_slice(&[b'E', b'A', b'3', 0x01, 0x00, EA3_HEADER_SIZE as u8, 0xFF, 0xFF]);

    let codec_word = (CODEC_ID_ATRAC3PLUS << 24) | (frame_header & 0xFFFF);
    ea3[CODEC_WORD_OFFSET..CODEC_WORD_OFFSET + 4].copy_from_slice(&codec_word.to_be_bytes());

    header
}

/// 28-bit value as four 7-bit bytes
fn syncsafe(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}
