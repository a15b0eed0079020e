//! Partition filesystem (PFS0).
//!
//! The lightweight container found inside content-archive sections and
//! used for the installable output package. Unlike [HFS0](super::hfs)
//! there is no per-entry hash; integrity comes from the owning archive's
//! section hash table.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::prelude::*;

use crate::error::Error;
use crate::io::RegionReader;
use crate::util::string_table_name;

#[derive(BinRead, BinWrite, Debug)]
#[brw(little, magic = b"PFS0")]
pub struct Pfs0Header {
    /// Number of files contained in this image.
    pub entry_count: u32,
    /// Size of the string table in bytes.
    pub string_table_size: u32,
    pub reserved: [u8; 4],
}

/// On-disk file entry (0x18 bytes).
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct Pfs0Entry {
    /// Offset of the payload, relative to the start of the data region.
    pub data_offset: u64,
    pub data_size: u64,
    pub filename_offset: u32,
    pub reserved: [u8; 4],
}

#[derive(Debug, Clone)]
pub struct Pfs0File {
    pub name: String,
    pub entry: Pfs0Entry,
}

pub struct Pfs0<R: Read + Seek> {
    reader: R,
    pub header: Pfs0Header,
    pub files: Vec<Pfs0File>,
}

impl<R: Read + Seek> Pfs0<R> {
    /// Parses a PFS0 image. The reader is consumed and must be positioned
    /// so that offset 0 is the image start (carve a
    /// [`RegionReader`](crate::io::RegionReader) when it lives inside a
    /// section).
    pub fn from_reader(mut reader: R) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;
        let header: Pfs0Header = reader.read_le()?;

        let entries = (0..header.entry_count)
            .map(|_| reader.read_le::<Pfs0Entry>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut string_table = vec![0u8; header.string_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = string_table_name(&string_table, entry.filename_offset as usize)?;
            files.push(Pfs0File { name, entry });
        }

        tracing::trace!(files = files.len(), "PFS0 parsed");
        Ok(Self {
            reader,
            header,
            files,
        })
    }

    /// Absolute offset of the data region within the image.
    pub fn data_offset(&self) -> u64 {
        0x10 + 0x18 * self.header.entry_count as u64 + self.header.string_table_size as u64
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn list_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    pub fn file_by_name(&self, name: &str) -> Option<&Pfs0File> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Absolute byte range of a file inside the image.
    pub fn file_range(&self, file: &Pfs0File) -> (u64, u64) {
        let start = self.data_offset() + file.entry.data_offset;
        (start, start + file.entry.data_size)
    }

    /// Reads a whole file into memory.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let file = self
            .files
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::Parse(format!("PFS0 entry not found: {name}")))?;
        let data_offset =
            0x10 + 0x18 * self.header.entry_count as u64 + self.header.string_table_size as u64;
        let start = data_offset + file.entry.data_offset;
        let size = file.entry.data_size as usize;

        self.reader.seek(SeekFrom::Start(start))?;
        let mut data = vec![0u8; size];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    /// Opens a file as a region of the image.
    pub fn open(&self, name: &str) -> Result<RegionReader<R>, Error>
    where
        R: Clone,
    {
        let file = self
            .file_by_name(name)
            .ok_or_else(|| Error::Parse(format!("PFS0 entry not found: {name}")))?;
        let (start, _) = self.file_range(file);
        Ok(RegionReader::new(
            self.reader.clone(),
            start,
            file.entry.data_size,
        ))
    }
}

/// Incremental PFS0 image writer.
///
/// Entries are declared up front with fixed string-table slot widths (the
/// output package format mandates exact filename lengths); payloads are
/// then streamed in declaration order.
pub struct Pfs0Builder {
    names: Vec<String>,
    /// Per-entry string table slot width including the NUL terminator.
    /// `None` means natural width.
    slots: Vec<Option<usize>>,
    sizes: Vec<u64>,
}

impl Pfs0Builder {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            slots: Vec::new(),
            sizes: Vec::new(),
        }
    }

    /// Declares an entry. `slot` fixes the string-table slot width
    /// (including terminator); it must cover the name.
    pub fn add_entry(&mut self, name: &str, size: u64, slot: Option<usize>) -> Result<(), Error> {
        if let Some(slot) = slot {
            if name.len() + 1 > slot {
                return Err(Error::Parse(format!(
                    "filename \"{name}\" does not fit its {slot:#x}-byte slot"
                )));
            }
        }
        self.names.push(name.to_string());
        self.slots.push(slot);
        self.sizes.push(size);
        Ok(())
    }

    fn string_table(&self) -> (Vec<u8>, Vec<u32>) {
        let mut table = Vec::new();
        let mut offsets = Vec::with_capacity(self.names.len());
        for (name, slot) in self.names.iter().zip(&self.slots) {
            offsets.push(table.len() as u32);
            table.extend_from_slice(name.as_bytes());
            table.push(0);
            if let Some(slot) = slot {
                table.resize(table.len() + slot - (name.len() + 1), 0);
            }
        }
        while table.len() % 0x20 != 0 {
            table.push(0);
        }
        (table, offsets)
    }

    /// Total image size once all payloads are written.
    pub fn image_size(&self) -> u64 {
        let (table, _) = self.string_table();
        let header = 0x10 + 0x18 * self.names.len() as u64 + table.len() as u64;
        header + self.sizes.iter().sum::<u64>()
    }

    /// Serializes the header, entry table and string table.
    pub fn write_header<W: Write>(&self, writer: &mut W) -> Result<u64, Error> {
        let (table, offsets) = self.string_table();

        let mut cursor = binrw::io::Cursor::new(Vec::new());
        Pfs0Header {
            entry_count: self.names.len() as u32,
            string_table_size: table.len() as u32,
            reserved: [0; 4],
        }
        .write_le(&mut cursor)?;

        let mut data_offset = 0u64;
        for (i, size) in self.sizes.iter().enumerate() {
            Pfs0Entry {
                data_offset,
                data_size: *size,
                filename_offset: offsets[i],
                reserved: [0; 4],
            }
            .write_le(&mut cursor)?;
            data_offset += size;
        }

        let mut header = cursor.into_inner();
        header.extend_from_slice(&table);
        writer.write_all(&header)?;
        Ok(header.len() as u64)
    }
}

impl Default for Pfs0Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::Pfs0Builder;

    /// Serializes a complete PFS0 image from in-memory files.
    pub fn build_simple_pfs0(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = Pfs0Builder::new();
        for (name, data) in files {
            builder.add_entry(name, data.len() as u64, None).unwrap();
        }
        let mut image = Vec::new();
        builder.write_header(&mut image).unwrap();
        for (_, data) in files {
            image.extend_from_slice(data);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::build_simple_pfs0 as build_image;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn builder_round_trips_through_parser() {
        let image = build_image(&[
            ("0123.nca", b"first payload".as_slice()),
            ("4567.cnmt.nca", b"second".as_slice()),
        ]);

        let mut pfs = Pfs0::from_reader(Cursor::new(image)).unwrap();
        assert_eq!(pfs.list_files(), ["0123.nca", "4567.cnmt.nca"]);
        assert_eq!(pfs.read_file("0123.nca").unwrap(), b"first payload");
        assert_eq!(pfs.read_file("4567.cnmt.nca").unwrap(), b"second");
    }

    #[test]
    fn fixed_slot_widths() {
        let mut builder = Pfs0Builder::new();
        builder.add_entry("aa.nca", 4, Some(0x25)).unwrap();
        builder.add_entry("bb.tik", 4, Some(0x25)).unwrap();
        let mut image = Vec::new();
        builder.write_header(&mut image).unwrap();

        let pfs = Pfs0::from_reader(Cursor::new(image)).unwrap();
        // Second name starts exactly one slot after the first.
        assert_eq!(pfs.files[1].entry.filename_offset, 0x25);
    }

    #[test]
    fn oversized_name_is_rejected() {
        let mut builder = Pfs0Builder::new();
        let long = "x".repeat(0x30);
        assert!(builder.add_entry(&long, 1, Some(0x25)).is_err());
    }

    #[test]
    fn image_size_accounts_for_all_regions() {
        let files: &[(&str, &[u8])] = &[("a", b"12345".as_slice()), ("b", b"678".as_slice())];
        let image = build_image(files);

        let mut builder = Pfs0Builder::new();
        for (name, data) in files {
            builder.add_entry(name, data.len() as u64, None).unwrap();
        }
        assert_eq!(builder.image_size(), image.len() as u64);
    }

    #[test]
    fn open_windows_single_file() {
        let image = build_image(&[("f", b"windowed".as_slice())]);
        let shared = crate::io::SharedStorage::new(Cursor::new(image));
        let pfs = Pfs0::from_reader(shared).unwrap();

        let mut reader = pfs.open("f").unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"windowed");
    }
}
