//! Content metadata ("cnmt") parsing and re-serialization.
//!
//! A metadata archive carries exactly one `.cnmt` file enumerating every
//! archive belonging to a title: ids, hashes, sizes and types. The
//! rewriter also needs to emit a modified cnmt after a program archive has
//! been re-signed, so every structure here round-trips through binrw.

use binrw::prelude::*;
use std::io::{Read, Seek, SeekFrom};

use crate::error::Error;

/// Content meta type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentMetaType {
    Invalid = 0x00,
    SystemProgram = 0x01,
    SystemData = 0x02,
    SystemUpdate = 0x03,
    BootImagePackage = 0x04,
    BootImagePackageSafe = 0x05,
    Application = 0x80,
    Patch = 0x81,
    AddOnContent = 0x82,
    Delta = 0x83,
}

impl ContentMetaType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::SystemProgram => "SystemProgram",
            Self::SystemData => "SystemData",
            Self::SystemUpdate => "SystemUpdate",
            Self::BootImagePackage => "BootImagePackage",
            Self::BootImagePackageSafe => "BootImagePackageSafe",
            Self::Application => "Application",
            Self::Patch => "Patch",
            Self::AddOnContent => "AddOnContent",
            Self::Delta => "Delta",
        }
    }
}

/// Content record type. Ordering matters: output packages emit records
/// sorted by this value, then by id offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[binrw]
#[brw(little, repr = u8)]
#[repr(u8)]
pub enum ContentType {
    Meta = 0,
    Program = 1,
    Data = 2,
    Control = 3,
    HtmlDocument = 4,
    LegalInformation = 5,
    DeltaFragment = 6,
}

impl ContentType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Meta => "Meta",
            Self::Program => "Program",
            Self::Data => "Data",
            Self::Control => "Control",
            Self::HtmlDocument => "HtmlDocument",
            Self::LegalInformation => "LegalInformation",
            Self::DeltaFragment => "DeltaFragment",
        }
    }
}

#[derive(Debug, Clone)]
#[binrw]
#[brw(little)]
pub struct CnmtHeader {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: ContentMetaType,
    pub _field_d: u8,
    pub extended_header_size: u16,
    pub content_count: u16,
    pub content_meta_count: u16,
    pub attributes: u8,
    pub _reserved: [u8; 3],
    pub required_dl_system_version: u32,
    pub _reserved2: [u8; 4],
}

/// Per-content record (0x38 bytes).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ContentRecord {
    pub hash: [u8; 0x20],
    pub nca_id: [u8; 0x10],
    /// 48-bit little-endian size.
    #[br(map = |bytes: [u8; 6]| u64::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], 0, 0]))]
    #[bw(map = |&size: &u64| [size as u8, (size >> 8) as u8, (size >> 16) as u8, (size >> 24) as u8, (size >> 32) as u8, (size >> 40) as u8])]
    pub size: u64,
    pub content_type: ContentType,
    pub id_offset: u8,
}

impl ContentRecord {
    pub fn nca_id_hex(&self) -> String {
        hex::encode(self.nca_id)
    }
}

/// Record referencing a sub-title.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ContentMetaRecord {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: u8,
    pub attributes: u8,
    pub _reserved: [u8; 2],
}

/// Type-specific extended header.
#[derive(Debug, Clone)]
pub enum ExtendedHeader {
    Application(ApplicationExtendedHeader),
    Patch(PatchExtendedHeader),
    AddOnContent(AddOnContentExtendedHeader),
    Other(Vec<u8>),
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ApplicationExtendedHeader {
    /// Title id of the matching patch.
    pub patch_tid: u64,
    pub min_sysver: u32,
    pub min_appver: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct PatchExtendedHeader {
    /// Title id of the base application.
    pub application_tid: u64,
    pub min_sysver: u32,
    pub extended_data_size: u32,
    pub _reserved: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct AddOnContentExtendedHeader {
    pub application_tid: u64,
    pub min_appver: u32,
    pub _reserved: u32,
}

#[derive(Debug, Clone)]
pub struct Cnmt {
    pub header: CnmtHeader,
    pub extended_header: ExtendedHeader,
    pub content_records: Vec<ContentRecord>,
    pub meta_records: Vec<ContentMetaRecord>,
}

impl Cnmt {
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, Error> {
        let base = reader.stream_position()?;
        let header: CnmtHeader = reader.read_le()?;

        let extended_header = match header.meta_type {
            ContentMetaType::Application => ExtendedHeader::Application(reader.read_le()?),
            ContentMetaType::Patch => ExtendedHeader::Patch(reader.read_le()?),
            ContentMetaType::AddOnContent => ExtendedHeader::AddOnContent(reader.read_le()?),
            _ => {
                let mut raw = vec![0u8; header.extended_header_size as usize];
                reader.read_exact(&mut raw)?;
                ExtendedHeader::Other(raw)
            }
        };

        // Records start right after the fixed header + extended header,
        // whatever the variant consumed.
        reader.seek(SeekFrom::Start(
            base + 0x20 + header.extended_header_size as u64,
        ))?;

        let content_records = (0..header.content_count)
            .map(|_| reader.read_le::<ContentRecord>())
            .collect::<Result<Vec<_>, _>>()?;
        let meta_records = (0..header.content_meta_count)
            .map(|_| reader.read_le::<ContentMetaRecord>())
            .collect::<Result<Vec<_>, _>>()?;

        tracing::trace!(
            title_id = format_args!("{:016X}", header.title_id),
            meta_type = ?header.meta_type,
            contents = content_records.len(),
            "cnmt parsed"
        );

        Ok(Self {
            header,
            extended_header,
            content_records,
            meta_records,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_reader(&mut binrw::io::Cursor::new(bytes))
    }

    /// Serializes the structure back to its on-disk layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.header.write_le(&mut cursor)?;

        match &self.extended_header {
            ExtendedHeader::Application(h) => h.write_le(&mut cursor)?,
            ExtendedHeader::Patch(h) => h.write_le(&mut cursor)?,
            ExtendedHeader::AddOnContent(h) => h.write_le(&mut cursor)?,
            ExtendedHeader::Other(raw) => cursor.get_mut().extend_from_slice(raw),
        }

        // Honor the declared extended header size even when the typed
        // struct is shorter on disk.
        let expected = 0x20 + self.header.extended_header_size as usize;
        let mut out = cursor.into_inner();
        if out.len() < expected {
            out.resize(expected, 0);
        }

        let mut cursor = binrw::io::Cursor::new(out);
        cursor.seek(SeekFrom::End(0))?;
        for record in &self.content_records {
            record.write_le(&mut cursor)?;
        }
        for record in &self.meta_records {
            record.write_le(&mut cursor)?;
        }
        Ok(cursor.into_inner())
    }

    pub fn title_id_hex(&self) -> String {
        format!("{:016X}", self.header.title_id)
    }

    pub fn content_by_type(&self, content_type: ContentType) -> Option<&ContentRecord> {
        self.content_records
            .iter()
            .find(|r| r.content_type == content_type)
    }

    /// Replaces the hash (and derived nca id) of the record matching
    /// `content_type`/`id_offset`, as required after a header rewrite.
    pub fn update_content_record(
        &mut self,
        content_type: ContentType,
        id_offset: u8,
        hash: &[u8; 0x20],
        size: u64,
    ) -> Result<(), Error> {
        let record = self
            .content_records
            .iter_mut()
            .find(|r| r.content_type == content_type && r.id_offset == id_offset)
            .ok_or_else(|| {
                Error::Parse(format!(
                    "no {} record with id offset {id_offset} in cnmt",
                    content_type.name()
                ))
            })?;

        record.hash = *hash;
        record.nca_id.copy_from_slice(&hash[..0x10]);
        record.size = size;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_cnmt(title_id: u64, version: u32, meta_type: ContentMetaType) -> Cnmt {
    let extended_header = match meta_type {
        ContentMetaType::Patch => ExtendedHeader::Patch(PatchExtendedHeader {
            application_tid: title_id - 0x800,
            min_sysver: 0,
            extended_data_size: 0,
            _reserved: 0,
        }),
        ContentMetaType::AddOnContent => ExtendedHeader::AddOnContent(AddOnContentExtendedHeader {
            application_tid: (title_id & !0xFFF) - 0x1000,
            min_appver: 0,
            _reserved: 0,
        }),
        _ => ExtendedHeader::Application(ApplicationExtendedHeader {
            patch_tid: title_id + 0x800,
            min_sysver: 0,
            min_appver: 0,
        }),
    };
    let ext_size = match &extended_header {
        ExtendedHeader::Application(_) => 0x10,
        ExtendedHeader::Patch(_) => 0x18,
        ExtendedHeader::AddOnContent(_) => 0x10,
        ExtendedHeader::Other(raw) => raw.len() as u16,
    };

    let mut record = |ty: ContentType, fill: u8| ContentRecord {
        hash: [fill; 0x20],
        nca_id: [fill; 0x10],
        size: 0x1000 + fill as u64,
        content_type: ty,
        id_offset: 0,
    };

    Cnmt {
        header: CnmtHeader {
            title_id,
            version,
            meta_type,
            _field_d: 0,
            extended_header_size: ext_size,
            content_count: 2,
            content_meta_count: 0,
            attributes: 0,
            _reserved: [0; 3],
            required_dl_system_version: 0,
            _reserved2: [0; 4],
        },
        extended_header,
        content_records: vec![
            record(ContentType::Program, 0x11),
            record(ContentType::Control, 0x22),
        ],
        meta_records: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn header_layout() {
        let test_data = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, // title_id
            0x12, 0x34, 0x56, 0x78, // version
            0x80, // meta_type: Application
            0x00, // field_d
            0x10, 0x00, // extended_header_size
            0x02, 0x00, // content_count
            0x01, 0x00, // content_meta_count
            0x01, // attributes
            0x00, 0x00, 0x00, // reserved
            0x11, 0x22, 0x33, 0x44, // required_dl_system_version
            0x00, 0x00, 0x00, 0x00, // reserved2
        ];

        let mut cursor = Cursor::new(test_data);
        let header: CnmtHeader = cursor.read_le().unwrap();
        assert_eq!(header.title_id, 0xEFCDAB8967452301);
        assert_eq!(header.version, 0x78563412);
        assert_eq!(header.meta_type, ContentMetaType::Application);
        assert_eq!(header.extended_header_size, 0x10);
        assert_eq!(header.content_count, 2);
        assert_eq!(header.required_dl_system_version, 0x44332211);
    }

    #[test]
    fn content_record_48bit_size() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xAA; 0x20]); // hash
        data.extend_from_slice(&[0xBB; 0x10]); // nca_id
        data.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36]); // size
        data.push(0x01); // Program
        data.push(0x02); // id_offset

        let mut cursor = Cursor::new(data);
        let record: ContentRecord = cursor.read_le().unwrap();
        assert_eq!(record.size, 0x363534333231);
        assert_eq!(record.content_type, ContentType::Program);
        assert_eq!(record.id_offset, 2);
    }

    #[test]
    fn round_trip_serialization() {
        let cnmt = test_cnmt(0x0100ABCDEF000000, 0x30000, ContentMetaType::Application);
        let bytes = cnmt.to_bytes().unwrap();
        assert_eq!(bytes.len(), 0x20 + 0x10 + 2 * 0x38);

        let parsed = Cnmt::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.header.title_id, cnmt.header.title_id);
        assert_eq!(parsed.content_records.len(), 2);
        assert_eq!(parsed.content_records[0].size, cnmt.content_records[0].size);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn patch_extended_header_links_base() {
        let cnmt = test_cnmt(0x0100ABCDEF000800, 0x10000, ContentMetaType::Patch);
        let bytes = cnmt.to_bytes().unwrap();
        let parsed = Cnmt::from_bytes(&bytes).unwrap();

        match parsed.extended_header {
            ExtendedHeader::Patch(h) => assert_eq!(h.application_tid, 0x0100ABCDEF000000),
            other => panic!("unexpected extended header: {other:?}"),
        }
    }

    #[test]
    fn record_update_rewrites_id_from_hash() {
        let mut cnmt = test_cnmt(0x0100ABCDEF000000, 0, ContentMetaType::Application);
        let new_hash = {
            let mut h = [0u8; 0x20];
            h[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
            h
        };

        cnmt.update_content_record(ContentType::Program, 0, &new_hash, 0x4242)
            .unwrap();

        let record = cnmt.content_by_type(ContentType::Program).unwrap();
        assert_eq!(record.hash, new_hash);
        assert_eq!(&record.nca_id[..], &new_hash[..0x10]);
        assert_eq!(record.size, 0x4242);
        assert_eq!(record.nca_id_hex()[..8], *"deadbeef");
    }
}
