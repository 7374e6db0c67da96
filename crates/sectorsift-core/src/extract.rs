//! Copying volume trees from a disc image to disk.
//!
//! Extraction is best-effort: a failing entry is recorded in the
//! [`ExtractReport`] and its siblings are still attempted. The cancel flag
//! is polled before every directory and file, never in the middle of one.

use crate::cancel::{CancelFlag, Outcome};
use crate::error::{Error, Result};
use crate::sector::SectorReader;
use crate::volume::{DirectoryEntry, FileEntry, Volume};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Summary of one extraction run
#[derive(Debug)]
pub struct ExtractReport {
    /// Files written completely
    pub files_written: usize,
    /// Bytes written across all files
    pub bytes_written: u64,
    /// Per-entry failures, in the order they happened
    pub errors: Vec<Error>,
    /// Whether every entry was attempted
    pub outcome: Outcome,
}

impl Default for ExtractReport {
    fn default() -> Self {
        Self {
            files_written: 0,
            bytes_written: 0,
            errors: Vec::new(),
            outcome: Outcome::Completed,
        }
    }
}

impl ExtractReport {
    /// True if every entry was attempted and none failed
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed && self.errors.is_empty()
    }
}

/// Writes volume contents from a [`SectorReader`] to a destination root
pub struct Extractor<'a, R> {
    reader: &'a mut SectorReader<R>,
    cancel: &'a CancelFlag,
    on_file: Option<Box<dyn FnMut(&Path) + 'a>>,
}

impl<'a, R: Read + Seek> Extractor<'a, R> {
    /// Creates an extractor over `reader` that honours `cancel`
    pub fn new(reader: &'a mut SectorReader<R>, cancel: &'a CancelFlag) -> Self {
        Self {
            reader,
            cancel,
            on_file: None,
        }
    }

    /// Registers a callback invoked after each file is fully written
    pub fn on_file_written(mut self, callback: impl FnMut(&Path) + 'a) -> Self {
        self.on_file = Some(Box::new(callback));
        self
    }

    /// Extracts a whole volume below `destination_root`
    pub fn extract_volume(
        &mut self,
        volume: &Volume,
        destination_root: impl AsRef<Path>,
    ) -> Result<ExtractReport> {
        debug!(
            "Extracting {} volume at 0x{:X} ({} files)",
            volume.format().as_str(),
            volume.base_offset(),
            volume.file_count()
        );
        self.extract_directory(volume.root(), destination_root)
    }

    /// Extracts the children of `directory` into `destination`.
    ///
    /// Only a failure to create `destination` itself is returned as an
    /// error; everything below it is collected in the report.
    pub fn extract_directory(
        &mut self,
        directory: &DirectoryEntry,
        destination: impl AsRef<Path>,
    ) -> Result<ExtractReport> {
        let destination = destination.as_ref();
        fs::create_dir_all(destination).map_err(|e| Error::directory_create(destination, e))?;

        let mut report = ExtractReport::default();
        if !self.walk(directory, destination, &mut report) {
            report.outcome = Outcome::Cancelled;
            info!(
                "Extraction cancelled after {} files",
                report.files_written
            );
        } else {
            info!(
                "Extracted {} files ({} bytes, {} errors)",
                report.files_written,
                report.bytes_written,
                report.errors.len()
            );
        }

        Ok(report)
    }

    /// Returns false once cancellation has been observed
    fn walk(
        &mut self,
        directory: &DirectoryEntry,
        destination: &Path,
        report: &mut ExtractReport,
    ) -> bool {
        for subdirectory in &directory.subdirectories {
            if self.cancel.is_cancelled() {
                return false;
            }

            let path = match child_path(destination, &subdirectory.name) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping directory '{}': {}", subdirectory.name, e);
                    report.errors.push(e);
                    continue;
                }
            };

            if let Err(e) = fs::create_dir_all(&path) {
                let e = Error::directory_create(&path, e);
                warn!("{}", e);
                report.errors.push(e);
                continue;
            }

            if !self.walk(subdirectory, &path, report) {
                return false;
            }
        }

        for file in &directory.files {
            if self.cancel.is_cancelled() {
                return false;
            }

            let result = child_path(destination, &file.name)
                .and_then(|path| self.extract_file(file, &path).map(|written| (path, written)));

            match result {
                Ok((path, written)) => {
                    report.files_written += 1;
                    report.bytes_written += written;
                    if let Some(callback) = self.on_file.as_mut() {
                        callback(&path);
                    }
                }
                Err(e) => {
                    warn!("Failed to extract '{}': {}", file.name, e);
                    report.errors.push(e);
                }
            }
        }

        true
    }

    /// Copies one file to `path`, overwriting it, and returns the bytes written
    pub fn extract_file(&mut self, file: &FileEntry, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::directory_create(parent, e))?;
        }

        trace!(
            "Writing {} ({} bytes from 0x{:X})",
            path.display(),
            file.length,
            file.offset
        );

        let handle = File::create(path).map_err(|e| Error::file_write(path, e))?;
        let mut writer = BufWriter::new(handle);

        if self.reader.is_raw() {
            self.copy_raw(file, path, &mut writer)?;
        } else {
            self.copy_cooked(file, path, &mut writer)?;
        }

        writer.flush().map_err(|e| Error::file_write(path, e))?;
        Ok(file.length)
    }

    fn copy_cooked<W: Write>(
        &mut self,
        file: &FileEntry,
        path: &Path,
        writer: &mut W,
    ) -> Result<()> {
        let limit = self.reader.len();
        if file.offset.saturating_add(file.length) > limit {
            return Err(Error::out_of_range(file.offset, file.length, limit));
        }

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut position = file.offset;
        let end = file.offset + file.length;

        while position < end {
            let size = (end - position).min(COPY_BUFFER_SIZE as u64) as usize;
            self.reader.read_into(position, &mut buffer[..size])?;
            writer
                .write_all(&buffer[..size])
                .map_err(|e| Error::file_write(path, e))?;
            position += size as u64;
        }

        Ok(())
    }

    /// Raw images carry user data in the middle of each sector
    fn copy_raw<W: Write>(
        &mut self,
        file: &FileEntry,
        path: &Path,
        writer: &mut W,
    ) -> Result<()> {
        let sector_size = self.reader.sector_size();
        let limit = self.reader.len();
        let mut remaining = file.length;
        let mut sector_offset = file.offset;

        while remaining > 0 {
            let chunk = if sector_offset < limit {
                self.reader.read_sector_data(sector_offset)?
            } else {
                Vec::new()
            };
            if chunk.is_empty() {
                return Err(Error::out_of_range(file.offset, file.length, limit));
            }

            let take = remaining.min(chunk.len() as u64) as usize;
            writer
                .write_all(&chunk[..take])
                .map_err(|e| Error::file_write(path, e))?;

            remaining -= take as u64;
            sector_offset += sector_size;
        }

        Ok(())
    }
}

/// Joins a single on-disc name onto `parent`, refusing anything that could escape it
fn child_path(parent: &Path, name: &str) -> Result<PathBuf> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');

    if unsafe_name {
        return Err(Error::path_traversal(parent.join(name)));
    }

    Ok(parent.join(name))
}
