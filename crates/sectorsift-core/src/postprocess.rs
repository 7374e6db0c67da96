//! Binary transforms applied to demultiplexed output files.
//!
//! - [`strip_chunks`] / [`remove_all_chunks`]: drop every occurrence of a
//!   byte pattern, not only the first
//! - [`add_header_to_file`]: write a header followed by an existing file

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const BUFFER_SIZE: usize = 64 * 1024;

/// Copies `reader` to `writer`, leaving out every non-overlapping occurrence
/// of `pattern` (scanned left to right). Returns the number removed.
pub fn strip_chunks<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    pattern: &[u8],
) -> io::Result<u64> {
    if pattern.is_empty() {
        io::copy(&mut reader, &mut writer)?;
        return Ok(0);
    }

    let n = pattern.len();
    let mut pending: Vec<u8> = Vec::with_capacity(BUFFER_SIZE + n);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut removed = 0u64;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        pending.extend_from_slice(&buffer[..read]);

        let mut position = 0usize;
        let mut kept_from = 0usize;
        while position + n <= pending.len() {
            if &pending[position..position + n] == pattern {
                writer.write_all(&pending[kept_from..position])?;
                position += n;
                kept_from = position;
                removed += 1;
            } else {
                position += 1;
            }
        }

        if read == 0 {
            writer.write_all(&pending[kept_from..])?;
            break;
        }

        // Fewer than n bytes remain past `position`; they may start a match
        writer.write_all(&pending[kept_from..position])?;
        pending.drain(..position);
    }

    writer.flush()?;
    Ok(removed)
}

/// Writes `source` minus every occurrence of `chunk` to a sibling file.
///
/// Returns the path of the cleaned copy and the number of chunks removed.
/// The source file is left untouched.
pub fn remove_all_chunks(source: &Path, chunk: &[u8]) -> Result<(PathBuf, u64)> {
    let destination = with_appended_extension(source, "cleaned");

    let input = File::open(source).map_err(|e| Error::file_read(source, e))?;
    let output = File::create(&destination).map_err(|e| Error::file_write(&destination, e))?;

    let removed = strip_chunks(BufReader::new(input), BufWriter::new(output), chunk)
        .map_err(|e| Error::file_write(&destination, e))?;

    debug!(
        "Removed {} chunk(s) of {} bytes from {}",
        removed,
        chunk.len(),
        source.display()
    );
    Ok((destination, removed))
}

/// Writes `header` followed by the contents of `source` to `destination`.
///
/// Returns the number of bytes written.
pub fn add_header_to_file(header: &[u8], source: &Path, destination: &Path) -> Result<u64> {
    let input = File::open(source).map_err(|e| Error::file_read(source, e))?;
    let output = File::create(destination).map_err(|e| Error::file_write(destination, e))?;
    let mut writer = BufWriter::new(output);

    writer
        .write_all(header)
        .map_err(|e| Error::file_write(destination, e))?;
    let copied = io::copy(&mut BufReader::new(input), &mut writer)
        .map_err(|e| Error::file_write(destination, e))?;
    writer
        .flush()
        .map_err(|e| Error::file_write(destination, e))?;

    Ok(header.len() as u64 + copied)
}

/// `a/b.at3` + `cleaned` -> `a/b.at3.cleaned`
fn with_appended_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
