//! Hash-indexed partition filesystem (HFS0).
//!
//! The cartridge-level container. The root instance enumerates the card's
//! partitions (`update`, `logo`, `normal`, `secure`, sometimes `boot`);
//! nested instances enumerate content archives. Every entry carries a
//! SHA-256 digest over the leading `hashed_region_size` bytes of its
//! payload, which is the integrity contract tying a parent container to
//! its children.

use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::io::RegionReader;
use crate::util::string_table_name;

#[derive(BinRead, BinWrite, Debug)]
#[brw(little, magic = b"HFS0")]
pub struct Hfs0Header {
    /// Number of entries in this container.
    pub entry_count: u32,
    /// Size of the string table in bytes.
    pub string_table_size: u32,
    pub reserved: [u8; 4],
}

/// On-disk entry layout (0x40 bytes).
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct Hfs0RawEntry {
    /// Offset of the payload, relative to the start of the data region.
    pub file_offset: u64,
    pub file_size: u64,
    pub filename_offset: u32,
    /// Length of the leading payload region covered by the digest.
    pub hashed_region_size: u32,
    pub _reserved: u64,
    pub hashed_region_sha256: [u8; 0x20],
}

/// A resolved entry with its absolute offset.
#[derive(Debug, Clone)]
pub struct HashFsEntry {
    pub name: String,
    /// Absolute offset within the backing storage.
    pub offset: u64,
    pub size: u64,
    pub hashed_region_size: u32,
    pub hashed_region_sha256: [u8; 0x20],
    /// Whether the hashed region has been checked against the digest.
    pub verified: bool,
}

pub struct HashFs<R: Read + Seek> {
    reader: R,
    pub header: Hfs0Header,
    entries: Vec<HashFsEntry>,
}

impl<R: Read + Seek> HashFs<R> {
    /// Parses an HFS0 container located at `base_offset` of the reader.
    pub fn from_reader(mut reader: R, base_offset: u64) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(base_offset))?;
        let header: Hfs0Header = reader.read_le()?;

        let raw_entries = (0..header.entry_count)
            .map(|_| reader.read_le::<Hfs0RawEntry>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut string_table = vec![0u8; header.string_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let data_offset = base_offset
            + 0x10
            + header.entry_count as u64 * 0x40
            + header.string_table_size as u64;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let name = string_table_name(&string_table, raw.filename_offset as usize)?;
            entries.push(HashFsEntry {
                name,
                offset: data_offset + raw.file_offset,
                size: raw.file_size,
                hashed_region_size: raw.hashed_region_size,
                hashed_region_sha256: raw.hashed_region_sha256,
                verified: false,
            });
        }

        tracing::trace!(
            entry_count = entries.len(),
            base_offset = format_args!("{base_offset:#x}"),
            "HFS0 parsed"
        );

        Ok(Self {
            reader,
            header,
            entries,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &HashFsEntry> {
        self.entries.iter()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Looks up an entry by exact ASCII name.
    pub fn entry_by_name(&self, name: &str) -> Option<&HashFsEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Verifies the hashed region of the entry at `index` against its
    /// recorded digest and latches the `verified` flag.
    pub fn verify_entry(&mut self, index: usize) -> Result<(), Error> {
        let (offset, region, name) = {
            let entry = self.entries.get(index).ok_or_else(|| {
                Error::Parse(format!("HFS0 entry index {index} out of range"))
            })?;
            (entry.offset, entry.hashed_region_size as usize, entry.name.clone())
        };

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut hasher = Sha256::new();
        let mut remaining = region;
        let mut buf = [0u8; 0x4000];
        while remaining > 0 {
            let take = remaining.min(buf.len());
            self.reader.read_exact(&mut buf[..take])?;
            hasher.update(&buf[..take]);
            remaining -= take;
        }

        let digest: [u8; 0x20] = hasher.finalize().into();
        if digest != self.entries[index].hashed_region_sha256 {
            return Err(Error::Integrity { entry: name });
        }

        self.entries[index].verified = true;
        Ok(())
    }

    /// Verifies every entry. Fails on the first mismatch.
    pub fn verify_all(&mut self) -> Result<(), Error> {
        for index in 0..self.entries.len() {
            self.verify_entry(index)?;
        }
        Ok(())
    }

    /// Opens an entry for reading.
    pub fn open(&self, name: &str) -> Result<RegionReader<R>, Error>
    where
        R: Clone,
    {
        let entry = self
            .entry_by_name(name)
            .ok_or_else(|| Error::Parse(format!("HFS0 entry not found: {name}")))?;
        Ok(RegionReader::new(
            self.reader.clone(),
            entry.offset,
            entry.size,
        ))
    }
}

/// Builds a synthetic HFS0 image. Fixture support for tests and for the
/// nested-partition layouts the gamecard code exercises.
#[cfg(test)]
pub(crate) fn build_hfs0(files: &[(&str, &[u8])]) -> Vec<u8> {
    use binrw::io::Cursor;

    let mut string_table = Vec::new();
    let mut name_offsets = Vec::new();
    for (name, _) in files {
        name_offsets.push(string_table.len() as u32);
        string_table.extend_from_slice(name.as_bytes());
        string_table.push(0);
    }
    // Align the table like production images do.
    while string_table.len() % 0x10 != 0 {
        string_table.push(0);
    }

    let mut cursor = Cursor::new(Vec::new());
    Hfs0Header {
        entry_count: files.len() as u32,
        string_table_size: string_table.len() as u32,
        reserved: [0; 4],
    }
    .write_le(&mut cursor)
    .unwrap();

    let mut data = Vec::new();
    for (i, (_, payload)) in files.iter().enumerate() {
        let entry = Hfs0RawEntry {
            file_offset: data.len() as u64,
            file_size: payload.len() as u64,
            filename_offset: name_offsets[i],
            hashed_region_size: payload.len() as u32,
            _reserved: 0,
            hashed_region_sha256: crate::crypto::sha256(payload),
        };
        entry.write_le(&mut cursor).unwrap();
        data.extend_from_slice(payload);
    }

    let mut image = cursor.into_inner();
    image.extend_from_slice(&string_table);
    image.extend_from_slice(&data);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_and_lists_entries() {
        let image = build_hfs0(&[
            ("update", b"update-partition".as_slice()),
            ("secure", b"secure-partition-data".as_slice()),
        ]);
        let fs = HashFs::from_reader(Cursor::new(image), 0).unwrap();

        assert_eq!(fs.entry_count(), 2);
        let names: Vec<_> = fs.entries().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["update", "secure"]);

        let secure = fs.entry_by_name("secure").unwrap();
        assert_eq!(secure.size, 21);
        assert!(!secure.verified);
    }

    #[test]
    fn verifies_hashed_regions() {
        let image = build_hfs0(&[("a.nca", b"some archive payload".as_slice())]);
        let mut fs = HashFs::from_reader(Cursor::new(image), 0).unwrap();

        fs.verify_all().unwrap();
        assert!(fs.entries().all(|e| e.verified));
    }

    #[test]
    fn detects_payload_bit_flip() {
        let mut image = build_hfs0(&[("a.nca", b"some archive payload".as_slice())]);
        // Flip one bit inside the hashed region (the payload is at the
        // tail of the image).
        let n = image.len();
        image[n - 5] ^= 0x01;

        let mut fs = HashFs::from_reader(Cursor::new(image), 0).unwrap();
        assert!(matches!(
            fs.verify_entry(0),
            Err(Error::Integrity { entry }) if entry == "a.nca"
        ));
    }

    #[test]
    fn parses_at_nonzero_base() {
        let image = build_hfs0(&[("logo", b"logo".as_slice())]);
        let mut padded = vec![0xFFu8; 0x123];
        padded.extend_from_slice(&image);

        let fs = HashFs::from_reader(Cursor::new(padded), 0x123).unwrap();
        let entry = fs.entry_by_name("logo").unwrap();
        assert_eq!(entry.offset, 0x123 + 0x10 + 0x40 + 0x10);
    }

    #[test]
    fn rejects_bad_magic() {
        let image = vec![0u8; 0x40];
        assert!(HashFs::from_reader(Cursor::new(image), 0).is_err());
    }

    #[test]
    fn open_reads_payload() {
        let image = build_hfs0(&[("x", b"payload-bytes".as_slice())]);
        let shared = crate::io::SharedStorage::new(Cursor::new(image));
        let fs = HashFs::from_reader(shared, 0).unwrap();

        let mut reader = fs.open("x").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload-bytes");
    }
}
