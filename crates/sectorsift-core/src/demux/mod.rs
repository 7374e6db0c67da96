//! Program stream demultiplexing.
//!
//! A program stream is a run of packets, each opened by a four byte start
//! code (`00 00 01 xx`). The [`Demuxer`] walks those packets and appends
//! every audio and video payload to one output file per start code.
//!
//! ## State Machine
//!
//! ```text
//! ScanningForStartCode -> ResolvingPacketLength -> ClassifyingPayload
//!          ^                                              |
//!          |                                              v
//!          +------------------------------------- WritingOutput
//! ```
//!
//! The machine ends at end of input, at an end-of-stream code, or when the
//! cancel flag is observed before a packet is classified.
//!
//! ## Extensibility
//!
//! The [`StreamFormat`] trait supplies everything format specific: the
//! packet size table, audio/video classification, payload sub-header sizes,
//! extension sniffing and a final pass over the finished files.

mod mpeg2;
mod sony_pam;

use crate::cancel::{CancelFlag, Outcome};
use crate::error::{Error, Result};
use crate::sector::{int_from_bytes, ByteOrder, OffsetDescription, SectorReader};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

pub use mpeg2::Mpeg2;
pub use sony_pam::{SonyPam, SubHeaderPolicy};

/// Pack header start code
pub const PACK_START_CODE: u32 = 0x0000_01BA;

/// Program end start code
pub const PROGRAM_END_CODE: u32 = 0x0000_01B9;

/// Length of every start code
pub const START_CODE_LENGTH: u64 = 4;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How the length of a packet is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSizeRule {
    /// Fixed total packet length, start code included
    Static(u64),
    /// A big-endian field of this many bytes follows the start code and
    /// gives the number of bytes after it
    SizeBytesFollow(usize),
    /// The packet ends the stream
    EndOfStream,
}

/// Packet size rules keyed by start code (big-endian `u32`)
#[derive(Debug, Clone, Default)]
pub struct BlockIdDictionary {
    rules: HashMap<u32, PacketSizeRule>,
}

impl BlockIdDictionary {
    /// Creates an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the rule for `tag`
    pub fn with(mut self, tag: u32, rule: PacketSizeRule) -> Self {
        self.rules.insert(tag, rule);
        self
    }

    /// Adds the same rule for every tag in `tags`
    pub fn with_range(mut self, tags: std::ops::RangeInclusive<u32>, rule: PacketSizeRule) -> Self {
        for tag in tags {
            self.rules.insert(tag, rule);
        }
        self
    }

    /// Looks up the rule for `tag`
    pub fn get(&self, tag: u32) -> Option<PacketSizeRule> {
        self.rules.get(&tag).copied()
    }

    /// Number of known start codes
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no start codes are known
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Media type of a packet payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Audio elementary stream
    Audio,
    /// Video elementary stream
    Video,
    /// Anything else (pack headers, padding, maps)
    Other,
}

/// Resolved size of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLength {
    /// Bytes of the length field following the start code
    pub size_field: u64,
    /// Bytes after the length field
    pub body: u64,
}

impl PacketLength {
    /// Total packet length including the start code
    pub fn total(&self) -> u64 {
        START_CODE_LENGTH + self.size_field + self.body
    }

    /// Disc offset of the first body byte for a packet at `offset`
    pub fn body_offset(&self, offset: u64) -> u64 {
        offset + START_CODE_LENGTH + self.size_field
    }
}

/// Resolves a packet's size from its dictionary rule.
///
/// Returns `None` for [`PacketSizeRule::EndOfStream`].
pub fn resolve_with_rule<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    offset: u64,
    rule: PacketSizeRule,
) -> Result<Option<PacketLength>> {
    match rule {
        PacketSizeRule::Static(total) => {
            let body = total.checked_sub(START_CODE_LENGTH).ok_or_else(|| {
                Error::protocol(offset, format!("static packet length {} is shorter than its start code", total))
            })?;
            Ok(Some(PacketLength { size_field: 0, body }))
        }
        PacketSizeRule::SizeBytesFollow(width) => {
            let description = OffsetDescription::big_endian(width, START_CODE_LENGTH);
            let body = reader.read_varying_int(&description, offset)?;
            Ok(Some(PacketLength {
                size_field: width as u64,
                body,
            }))
        }
        PacketSizeRule::EndOfStream => Ok(None),
    }
}

/// Standard PES header size: two flag bytes, the length byte, and its value
pub fn pes_header_size<R: Read + Seek>(reader: &mut SectorReader<R>, offset: u64) -> Result<u64> {
    let description = OffsetDescription::big_endian(1, 8);
    Ok(reader.read_varying_int(&description, offset)? + 3)
}

/// Format specific behaviour plugged into the [`Demuxer`]
pub trait StreamFormat {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Packet size rules, built once and read-only during a scan
    fn block_ids(&self) -> &BlockIdDictionary;

    /// True if packets with this start code carry audio
    fn is_audio_block(&self, tag: u32) -> bool;

    /// True if packets with this start code carry video
    fn is_video_block(&self, tag: u32) -> bool;

    /// Classifies a start code
    fn classify(&self, tag: u32) -> BlockKind {
        if self.is_audio_block(tag) {
            BlockKind::Audio
        } else if self.is_video_block(tag) {
            BlockKind::Video
        } else {
            BlockKind::Other
        }
    }

    /// Resolves the size of the packet at `offset`.
    ///
    /// The default applies the dictionary rule; formats override this for
    /// packets whose size also depends on their contents.
    fn resolve_packet_length<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
        _tag: u32,
        rule: PacketSizeRule,
    ) -> Result<Option<PacketLength>> {
        resolve_with_rule(reader, offset, rule)
    }

    /// Bytes of header between the length field and the audio payload
    fn resolve_audio_header_size<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<u64> {
        pes_header_size(reader, offset)
    }

    /// Bytes of header between the length field and the video payload
    fn resolve_video_header_size<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<u64> {
        pes_header_size(reader, offset)
    }

    /// File extension (with dot) for a new audio stream
    fn sniff_audio_extension<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<&'static str>;

    /// File extension (with dot) for a new video stream
    fn sniff_video_extension<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
    ) -> Result<&'static str>;

    /// Closes every output and post-processes it; returns the final paths
    fn final_pass(
        &self,
        outputs: BTreeMap<u32, OutputStream>,
        _options: &DemuxOptions,
    ) -> Result<Vec<PathBuf>> {
        outputs.into_values().map(OutputStream::finish).collect()
    }
}

/// What to do with bytes that do not start a known packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownBlockPolicy {
    /// Stop with [`Error::UnknownBlock`]
    Fail,
    /// Skip one byte and look again
    #[default]
    SkipByte,
}

/// Configuration for a demultiplexing run
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Write audio streams
    pub extract_audio: bool,
    /// Write video streams
    pub extract_video: bool,
    /// Let the final pass synthesize container headers
    pub add_header: bool,
    /// Output directory (defaults to the source file's directory)
    pub output_dir: Option<PathBuf>,
    /// Handling of unrecognized start codes
    pub unknown_block_policy: UnknownBlockPolicy,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            extract_audio: true,
            extract_video: true,
            add_header: false,
            output_dir: None,
            unknown_block_policy: UnknownBlockPolicy::default(),
        }
    }
}

impl DemuxOptions {
    /// Creates options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether audio streams are written
    pub fn extract_audio(mut self, extract: bool) -> Self {
        self.extract_audio = extract;
        self
    }

    /// Sets whether video streams are written
    pub fn extract_video(mut self, extract: bool) -> Self {
        self.extract_video = extract;
        self
    }

    /// Sets whether container headers are synthesized
    pub fn add_header(mut self, add: bool) -> Self {
        self.add_header = add;
        self
    }

    /// Sets the output directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets the unknown start code policy
    pub fn unknown_block_policy(mut self, policy: UnknownBlockPolicy) -> Self {
        self.unknown_block_policy = policy;
        self
    }

    fn wants(&self, kind: BlockKind) -> bool {
        match kind {
            BlockKind::Audio => self.extract_audio,
            BlockKind::Video => self.extract_video,
            BlockKind::Other => false,
        }
    }
}

/// An open per-stream output file
#[derive(Debug)]
pub struct OutputStream {
    path: PathBuf,
    kind: BlockKind,
    writer: BufWriter<File>,
}

impl OutputStream {
    /// Creates (or truncates) the file at `path`
    pub fn create(path: PathBuf, kind: BlockKind) -> Result<Self> {
        let file = File::create(&path).map_err(|e| Error::file_write(&path, e))?;
        Ok(Self {
            path,
            kind,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the output file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Media type written to this file
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Appends bytes
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| Error::file_write(&self.path, e))
    }

    /// Flushes and closes the file, returning its path
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .flush()
            .map_err(|e| Error::file_write(&self.path, e))?;
        Ok(self.path)
    }
}

/// Summary of one demultiplexing run
#[derive(Debug)]
pub struct DemuxReport {
    /// Final output paths, ordered by start code
    pub outputs: Vec<PathBuf>,
    /// Packets walked
    pub packets: u64,
    /// Bytes skipped while resynchronizing
    pub skipped_bytes: u64,
    /// Whether the whole stream was processed
    pub outcome: Outcome,
}

enum State {
    ScanningForStartCode,
    ResolvingPacketLength { tag: u32, rule: PacketSizeRule },
    ClassifyingPayload { tag: u32, packet: PacketLength },
    WritingOutput { tag: u32, kind: BlockKind, packet: PacketLength },
    Finished(Outcome),
}

/// Splits a program stream into elementary stream files
#[derive(Debug, Clone)]
pub struct Demuxer<F> {
    format: F,
    options: DemuxOptions,
}

impl<F: StreamFormat> Demuxer<F> {
    /// Creates a demuxer with default options
    pub fn new(format: F) -> Self {
        Self::with_options(format, DemuxOptions::default())
    }

    /// Creates a demuxer with custom options
    pub fn with_options(format: F, options: DemuxOptions) -> Self {
        Self { format, options }
    }

    /// Demultiplexes the file at `path`.
    ///
    /// Outputs are named `<stem>_<start code>.<ext>` and placed in the
    /// configured output directory, or next to the source.
    pub fn demux_file(&self, path: impl AsRef<Path>, cancel: &CancelFlag) -> Result<DemuxReport> {
        let path = path.as_ref();
        let mut reader = SectorReader::open(path)?;

        let output_dir = match &self.options.output_dir {
            Some(dir) => dir.clone(),
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| Error::directory_create(&output_dir, e))?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stream".to_string());

        self.demux(&mut reader, &output_dir, &stem, cancel)
    }

    /// Demultiplexes `reader`, writing outputs into `output_dir`
    pub fn demux<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        output_dir: &Path,
        stem: &str,
        cancel: &CancelFlag,
    ) -> Result<DemuxReport> {
        let mut outputs: BTreeMap<u32, OutputStream> = BTreeMap::new();
        let mut report = DemuxReport {
            outputs: Vec::new(),
            packets: 0,
            skipped_bytes: 0,
            outcome: Outcome::Completed,
        };

        debug!(
            "Starting {} demux of {} bytes",
            self.format.name(),
            reader.len()
        );

        let start = reader.find_next(&PACK_START_CODE.to_be_bytes(), 0)?;
        let Some(start) = start else {
            info!("No pack start code found; nothing to demultiplex");
            return Ok(report);
        };

        let result = self.run(reader, start, output_dir, stem, cancel, &mut outputs, &mut report);

        match result {
            Ok(outcome) => {
                report.outcome = outcome;
                report.outputs = self.format.final_pass(outputs, &self.options)?;
                info!(
                    "Demultiplexed {} packets into {} files",
                    report.packets,
                    report.outputs.len()
                );
                Ok(report)
            }
            Err(e) => {
                // Keep whatever was written so far
                for stream in outputs.into_values() {
                    if let Err(flush_error) = stream.finish() {
                        warn!("{}", flush_error);
                    }
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        start: u64,
        output_dir: &Path,
        stem: &str,
        cancel: &CancelFlag,
        outputs: &mut BTreeMap<u32, OutputStream>,
        report: &mut DemuxReport,
    ) -> Result<Outcome> {
        let length = reader.len();
        let dictionary = self.format.block_ids();
        let mut offset = start;
        let mut state = State::ScanningForStartCode;

        loop {
            state = match state {
                State::ScanningForStartCode => {
                    if offset >= length {
                        State::Finished(Outcome::Completed)
                    } else if length - offset < START_CODE_LENGTH {
                        debug!("Ignoring {} trailing bytes", length - offset);
                        State::Finished(Outcome::Completed)
                    } else {
                        let bytes = reader.read_at(offset, START_CODE_LENGTH as usize)?;
                        let tag = int_from_bytes(&bytes, ByteOrder::Big) as u32;

                        match dictionary.get(tag) {
                            Some(rule) => State::ResolvingPacketLength { tag, rule },
                            None => match self.options.unknown_block_policy {
                                UnknownBlockPolicy::Fail => {
                                    return Err(Error::UnknownBlock { offset, tag });
                                }
                                UnknownBlockPolicy::SkipByte => {
                                    trace!("Skipping junk byte at 0x{:X}", offset);
                                    offset += 1;
                                    report.skipped_bytes += 1;
                                    State::ScanningForStartCode
                                }
                            },
                        }
                    }
                }

                State::ResolvingPacketLength { tag, rule } => {
                    match self.format.resolve_packet_length(reader, offset, tag, rule)? {
                        Some(packet) => State::ClassifyingPayload { tag, packet },
                        None => {
                            debug!("End of stream code at 0x{:X}", offset);
                            State::Finished(Outcome::Completed)
                        }
                    }
                }

                State::ClassifyingPayload { tag, packet } => {
                    if cancel.is_cancelled() {
                        State::Finished(Outcome::Cancelled)
                    } else {
                        let next = offset.checked_add(packet.total()).filter(|&n| n > offset);
                        let Some(next) = next else {
                            return Err(Error::protocol(offset, "packet length makes no progress"));
                        };
                        if next > length {
                            return Err(Error::out_of_range(offset, packet.total(), length));
                        }

                        report.packets += 1;
                        let kind = self.format.classify(tag);
                        if self.options.wants(kind) {
                            State::WritingOutput { tag, kind, packet }
                        } else {
                            offset = next;
                            State::ScanningForStartCode
                        }
                    }
                }

                State::WritingOutput { tag, kind, packet } => {
                    self.write_payload(reader, offset, tag, kind, packet, output_dir, stem, outputs)?;
                    offset += packet.total();
                    State::ScanningForStartCode
                }

                State::Finished(outcome) => return Ok(outcome),
            };
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_payload<R: Read + Seek>(
        &self,
        reader: &mut SectorReader<R>,
        offset: u64,
        tag: u32,
        kind: BlockKind,
        packet: PacketLength,
        output_dir: &Path,
        stem: &str,
        outputs: &mut BTreeMap<u32, OutputStream>,
    ) -> Result<()> {
        if !outputs.contains_key(&tag) {
            let extension = match kind {
                BlockKind::Audio => self.format.sniff_audio_extension(reader, offset)?,
                _ => self.format.sniff_video_extension(reader, offset)?,
            };
            let path = output_dir.join(format!("{}_{:08X}{}", stem, tag, extension));
            debug!("New stream 0x{:08X} at 0x{:X} -> {}", tag, offset, path.display());
            outputs.insert(tag, OutputStream::create(path, kind)?);
        }

        let skip = match kind {
            BlockKind::Audio => self.format.resolve_audio_header_size(reader, offset)?,
            _ => self.format.resolve_video_header_size(reader, offset)?,
        };
        if skip > packet.body {
            return Err(Error::protocol(
                offset,
                format!("sub-header of {} bytes exceeds packet body of {}", skip, packet.body),
            ));
        }

        let Some(stream) = outputs.get_mut(&tag) else {
            return Ok(());
        };

        let mut position = packet.body_offset(offset) + skip;
        let end = packet.body_offset(offset) + packet.body;
        let mut buffer = vec![0u8; (end - position).min(COPY_BUFFER_SIZE as u64) as usize];

        while position < end {
            let size = (end - position).min(buffer.len() as u64) as usize;
            reader.read_into(position, &mut buffer[..size])?;
            stream.write_all(&buffer[..size])?;
            position += size as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_dictionary_lookup() {
        let dictionary = BlockIdDictionary::new()
            .with(PACK_START_CODE, PacketSizeRule::Static(0xE))
            .with_range(0x1E0..=0x1EF, PacketSizeRule::SizeBytesFollow(2));

        assert_eq!(dictionary.len(), 17);
        assert_eq!(dictionary.get(PACK_START_CODE), Some(PacketSizeRule::Static(0xE)));
        assert_eq!(dictionary.get(0x1E7), Some(PacketSizeRule::SizeBytesFollow(2)));
        assert_eq!(dictionary.get(0x1C0), None);
    }

    #[test]
    fn test_resolve_with_rule() {
        let data = vec![0x00, 0x00, 0x01, 0xE0, 0x01, 0x02, 0xFF];
        let mut reader = SectorReader::new(Cursor::new(data)).unwrap();

        let packet = resolve_with_rule(&mut reader, 0, PacketSizeRule::SizeBytesFollow(2))
            .unwrap()
            .unwrap();
        assert_eq!(packet, PacketLength { size_field: 2, body: 0x102 });
        assert_eq!(packet.total(), 4 + 2 + 0x102);
        assert_eq!(packet.body_offset(0x10), 0x16);

        let packet = resolve_with_rule(&mut reader, 0, PacketSizeRule::Static(0xE))
            .unwrap()
            .unwrap();
        assert_eq!(packet.total(), 0xE);

        assert!(resolve_with_rule(&mut reader, 0, PacketSizeRule::Static(2)).is_err());
        assert!(resolve_with_rule(&mut reader, 0, PacketSizeRule::EndOfStream)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_options_builder() {
        let options = DemuxOptions::new()
            .extract_audio(false)
            .add_header(true)
            .output_dir("/tmp/out")
            .unknown_block_policy(UnknownBlockPolicy::Fail);

        assert!(!options.wants(BlockKind::Audio));
        assert!(options.wants(BlockKind::Video));
        assert!(!options.wants(BlockKind::Other));
        assert!(options.add_header);
        assert_eq!(options.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(options.unknown_block_policy, UnknownBlockPolicy::Fail);
    }
}
