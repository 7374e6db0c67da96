//! Builders for synthetic disc images and program streams.

#![allow(dead_code)]

use sectorsift_core::sector::SYNC_BYTES;

pub const SECTOR: usize = 0x800;
pub const RAW_SECTOR: usize = 0x930;

/// A file placed on a synthetic volume
pub struct TestFile {
    pub name: &'static str,
    pub data: Vec<u8>,
}

impl TestFile {
    pub fn new(name: &'static str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            data: data.into(),
        }
    }
}

fn sectors_for(length: usize) -> usize {
    length.div_ceil(SECTOR).max(1)
}

fn directory_record(extent: u32, length: u32, flags: u8, identifier: &[u8]) -> Vec<u8> {
    let mut record = vec![0u8; 33 + identifier.len()];
    record[2..6].copy_from_slice(&extent.to_le_bytes());
    record[6..10].copy_from_slice(&extent.to_be_bytes());
    record[10..14].copy_from_slice(&length.to_le_bytes());
    record[14..18].copy_from_slice(&length.to_be_bytes());
    record[25] = flags;
    record[32] = identifier.len() as u8;
    record[33..].copy_from_slice(identifier);
    if record.len() % 2 != 0 {
        record.push(0);
    }
    record[0] = record.len() as u8;
    record
}

/// Builds a cooked ISO9660 volume.
///
/// Layout: sectors 0-15 empty, 16 descriptor, 17 root directory,
/// 18 subdirectory, then file data.
pub fn iso_volume(label: &str, root_files: &[TestFile], subdir: Option<(&str, &[TestFile])>) -> Vec<u8> {
    let root_sector = 17u32;
    let sub_sector = 18u32;
    let mut next_sector = 19usize;

    let mut placements = Vec::new();
    for file in root_files.iter().chain(subdir.iter().flat_map(|(_, files)| files.iter())) {
        placements.push(next_sector);
        next_sector += sectors_for(file.data.len());
    }
    let total_sectors = next_sector;

    let mut image = vec![0u8; total_sectors * SECTOR];

    // Primary volume descriptor
    let pvd = &mut image[16 * SECTOR..17 * SECTOR];
    pvd[0] = 0x01;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 0x01;
    let mut padded_label = label.as_bytes().to_vec();
    padded_label.resize(32, b' ');
    pvd[0x28..0x48].copy_from_slice(&padded_label);
    pvd[0x50..0x54].copy_from_slice(&(total_sectors as u32).to_le_bytes());
    pvd[0x54..0x58].copy_from_slice(&(total_sectors as u32).to_be_bytes());
    pvd[0x80..0x82].copy_from_slice(&(SECTOR as u16).to_le_bytes());
    pvd[0x82..0x84].copy_from_slice(&(SECTOR as u16).to_be_bytes());
    let root_record = directory_record(root_sector, SECTOR as u32, 0x02, &[0x00]);
    pvd[0x9C..0x9C + root_record.len()].copy_from_slice(&root_record);

    let mut file_index = 0;
    let mut root_table = Vec::new();
    root_table.extend(directory_record(root_sector, SECTOR as u32, 0x02, &[0x00]));
    root_table.extend(directory_record(root_sector, SECTOR as u32, 0x02, &[0x01]));
    if let Some((name, _)) = subdir {
        root_table.extend(directory_record(sub_sector, SECTOR as u32, 0x02, name.as_bytes()));
    }
    for file in root_files {
        let identifier = format!("{};1", file.name);
        root_table.extend(directory_record(
            placements[file_index] as u32,
            file.data.len() as u32,
            0x00,
            identifier.as_bytes(),
        ));
        file_index += 1;
    }
    image[17 * SECTOR..17 * SECTOR + root_table.len()].copy_from_slice(&root_table);

    if let Some((_, files)) = subdir {
        let mut sub_table = Vec::new();
        sub_table.extend(directory_record(sub_sector, SECTOR as u32, 0x02, &[0x00]));
        sub_table.extend(directory_record(root_sector, SECTOR as u32, 0x02, &[0x01]));
        for file in files {
            let identifier = format!("{};1", file.name);
            sub_table.extend(directory_record(
                placements[file_index] as u32,
                file.data.len() as u32,
                0x00,
                identifier.as_bytes(),
            ));
            file_index += 1;
        }
        image[18 * SECTOR..18 * SECTOR + sub_table.len()].copy_from_slice(&sub_table);
    }

    let all_files = root_files.iter().chain(subdir.iter().flat_map(|(_, files)| files.iter()));
    for (file, sector) in all_files.zip(&placements) {
        let start = sector * SECTOR;
        image[start..start + file.data.len()].copy_from_slice(&file.data);
    }

    image
}

/// An ISO9660 placeholder whose root directory is empty, declaring
/// `space_size` sectors
pub fn dummy_iso_volume(space_size: u32) -> Vec<u8> {
    let mut image = vec![0u8; 17 * SECTOR];
    let pvd = &mut image[16 * SECTOR..];
    pvd[0] = 0x01;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[0x50..0x54].copy_from_slice(&space_size.to_le_bytes());
    pvd[0x80..0x82].copy_from_slice(&(SECTOR as u16).to_le_bytes());
    let root_record = directory_record(0, 0, 0x02, &[0x00]);
    pvd[0x9C..0x9C + root_record.len()].copy_from_slice(&root_record);
    image
}

fn xdvdfs_entry(left: u16, right: u16, sector: u32, size: u32, attributes: u8, name: &str) -> Vec<u8> {
    let mut entry = Vec::new();
    entry.extend_from_slice(&left.to_le_bytes());
    entry.extend_from_slice(&right.to_le_bytes());
    entry.extend_from_slice(&sector.to_le_bytes());
    entry.extend_from_slice(&size.to_le_bytes());
    entry.push(attributes);
    entry.push(name.len() as u8);
    entry.extend_from_slice(name.as_bytes());
    while entry.len() % 4 != 0 {
        entry.push(0xFF);
    }
    entry
}

/// Builds a cooked XDVDFS volume holding `files` in its root directory.
///
/// Layout: sectors 0-31 empty, 32 header, root directory from 33, then
/// data. The root table is a right-leaning chain, so names must be sorted.
pub fn xdvdfs_volume(files: &[TestFile]) -> Vec<u8> {
    let entry_lengths: Vec<_> = files
        .iter()
        .map(|file| xdvdfs_entry(0, 0, 0, 0, 0, file.name).len())
        .collect();
    let table_length: usize = entry_lengths.iter().sum();

    let mut next_sector = 33 + sectors_for(table_length);
    let mut placements = Vec::new();
    for file in files {
        placements.push(next_sector);
        next_sector += file.data.len().div_ceil(SECTOR);
    }

    let mut table = Vec::with_capacity(table_length);
    for (index, file) in files.iter().enumerate() {
        let right = if index + 1 < files.len() {
            ((table.len() + entry_lengths[index]) / 4) as u16
        } else {
            0
        };
        table.extend(xdvdfs_entry(
            0,
            right,
            placements[index] as u32,
            file.data.len() as u32,
            0,
            file.name,
        ));
    }

    let mut image = vec![0u8; next_sector * SECTOR];
    let header = &mut image[32 * SECTOR..33 * SECTOR];
    header[..20].copy_from_slice(b"MICROSOFT*XBOX*MEDIA");
    header[0x14..0x18].copy_from_slice(&33u32.to_le_bytes());
    header[0x18..0x1C].copy_from_slice(&(table.len() as u32).to_le_bytes());
    header[0x7EC..0x800].copy_from_slice(b"MICROSOFT*XBOX*MEDIA");

    image[33 * SECTOR..33 * SECTOR + table.len()].copy_from_slice(&table);
    for (file, sector) in files.iter().zip(&placements) {
        let start = sector * SECTOR;
        image[start..start + file.data.len()].copy_from_slice(&file.data);
    }

    image
}

/// Wraps every 2048-byte sector of a cooked image in a Mode 1 raw sector
pub fn to_raw(cooked: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(cooked.len() / SECTOR * RAW_SECTOR);
    for chunk in cooked.chunks(SECTOR) {
        let mut sector = vec![0u8; RAW_SECTOR];
        sector[..12].copy_from_slice(&SYNC_BYTES);
        sector[0x0F] = 0x01;
        sector[0x10..0x10 + chunk.len()].copy_from_slice(chunk);
        raw.extend(sector);
    }
    raw
}

/// Program stream builder
#[derive(Default)]
pub struct StreamBuilder {
    bytes: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// MPEG-2 pack header without stuffing
    pub fn pack(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0xBA, 0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x89, 0xC3, 0xF8]);
        self
    }

    /// Sony audio packet: sentinel, PTS, four sub-header bytes, payload
    pub fn sony_audio(self, stream: u8, sentinel: u16, sub_header: [u8; 4], payload: &[u8]) -> Self {
        let mut body = sentinel.to_be_bytes().to_vec();
        body.push(0x05);
        body.extend_from_slice(&[0x21, 0x00, 0x01, 0x00, 0x01]);
        body.extend_from_slice(&sub_header);
        body.extend_from_slice(payload);
        self.packet(stream, &body)
    }

    /// Video packet with a five byte PTS header
    pub fn video(self, stream: u8, payload: &[u8]) -> Self {
        let mut body = vec![0x81, 0x80, 0x05, 0x21, 0x00, 0x01, 0x00, 0x01];
        body.extend_from_slice(payload);
        self.packet(stream, &body)
    }

    /// Any start code followed by a 16-bit length and `body`
    pub fn packet(mut self, stream: u8, body: &[u8]) -> Self {
        self.bytes.extend_from_slice(&[0x00, 0x00, 0x01, stream]);
        self.bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        self.bytes.extend_from_slice(body);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn end(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0xB9]);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
