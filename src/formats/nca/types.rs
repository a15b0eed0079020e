//! On-disk types for the content-archive header and its section headers.

use binrw::prelude::*;

use crate::error::Error;

/// The source of the content: downloaded from the CDN or read from a
/// gamecard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Download,
    GameCard,
}

/// The type of content stored in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

/// Section crypt mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptType {
    None,
    Xts,
    Ctr,
    Bktr,
}

impl CryptType {
    pub fn from_raw(value: u8) -> Result<Self, Error> {
        match value {
            0x01 => Ok(Self::None),
            0x02 => Ok(Self::Xts),
            0x03 => Ok(Self::Ctr),
            0x04 => Ok(Self::Bktr),
            other => Err(Error::Unsupported(format!(
                "unknown section crypt type {other:#x}"
            ))),
        }
    }
}

/// Section filesystem type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFsType {
    Pfs0,
    RomFs,
}

/// Section entry in the archive header, in 0x200-byte media units
/// relative to the archive start.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionEntry {
    pub media_start_offset: u32,
    pub media_end_offset: u32,
    pub _reserved: u64,
}

impl SectionEntry {
    pub fn is_empty(&self) -> bool {
        self.media_end_offset <= self.media_start_offset
    }
}

/// PFS0 section superblock.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct Pfs0Superblock {
    /// SHA-256 of the hash table.
    pub master_hash: [u8; 0x20],
    /// Hash block size in bytes.
    pub block_size: u32,
    pub always_2: u32,
    /// Relative to the section start.
    pub hash_table_offset: u64,
    pub hash_table_size: u64,
    /// Relative to the section start.
    pub pfs0_offset: u64,
    pub pfs0_size: u64,
    #[brw(pad_size_to = 0xF0)]
    pub _reserved: (),
}

pub const IVFC_MAX_LEVEL: usize = 6;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IvfcLevel {
    pub logical_offset: u64,
    pub hash_data_size: u64,
    pub block_size_log2: u32,
    pub _reserved: u32,
}

/// IVFC hash tree header used by RomFS sections.
#[binrw]
#[brw(little, magic = b"IVFC")]
#[derive(Debug, Clone)]
pub struct IvfcHeader {
    pub id: u32,
    pub master_hash_size: u32,
    pub level_count: u32,
    pub levels: [IvfcLevel; IVFC_MAX_LEVEL],
    pub _salt: [u8; 0x20],
    pub master_hash: [u8; 0x20],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct RomfsSuperblock {
    pub ivfc: IvfcHeader,
    #[brw(pad_size_to = 0x58)]
    pub _reserved: (),
}

/// Header of one BKTR bucket table (relocation or subsection).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default)]
pub struct BktrTableHeader {
    /// Relative to the section start.
    pub offset: u64,
    pub size: u64,
    #[brw(magic = b"BKTR")]
    pub version: u32,
    pub entry_count: u32,
    pub _reserved: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct BktrSuperblock {
    pub ivfc: IvfcHeader,
    #[brw(pad_size_to = 0x18)]
    pub _pad: (),
    pub relocation_header: BktrTableHeader,
    pub subsection_header: BktrTableHeader,
}

/// FS-specific superblock, selected by the section's fs and crypt types.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
#[br(import(fs_type: u8, crypt_type: u8))]
pub enum Superblock {
    #[br(pre_assert(fs_type == 0x02))]
    Pfs0(Pfs0Superblock),
    #[br(pre_assert(fs_type == 0x03 && crypt_type == 0x04))]
    Bktr(BktrSuperblock),
    #[br(pre_assert(fs_type == 0x03))]
    Romfs(RomfsSuperblock),
}

impl Superblock {
    pub fn as_pfs0(&self) -> Option<&Pfs0Superblock> {
        match self {
            Superblock::Pfs0(sb) => Some(sb),
            _ => None,
        }
    }

    pub fn as_bktr(&self) -> Option<&BktrSuperblock> {
        match self {
            Superblock::Bktr(sb) => Some(sb),
            _ => None,
        }
    }
}

/// One of the four 0x200-byte FS headers trailing the archive header.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct FsHeader {
    pub version: u16,
    pub partition_type: u8,
    pub fs_type_raw: u8,
    pub crypt_type_raw: u8,
    #[brw(pad_size_to = 0x3)]
    pub _pad: (),
    #[br(args(fs_type_raw, crypt_type_raw))]
    #[brw(pad_size_to = 0x138)]
    pub superblock: Superblock,
    /// Base counter for CTR sections.
    pub section_ctr: u64,
    #[brw(pad_size_to = 0xB8)]
    pub _pad2: (),
}

impl FsHeader {
    pub fn crypt_type(&self) -> Result<CryptType, Error> {
        CryptType::from_raw(self.crypt_type_raw)
    }

    pub fn fs_type(&self) -> Result<SectionFsType, Error> {
        match self.fs_type_raw {
            0x02 => Ok(SectionFsType::Pfs0),
            0x03 => Ok(SectionFsType::RomFs),
            other => Err(Error::Unsupported(format!(
                "unknown section fs type {other:#x}"
            ))),
        }
    }
}

impl Distribution {
    pub fn from_raw(value: u8) -> Result<Self, Error> {
        match value {
            0x00 => Ok(Self::Download),
            0x01 => Ok(Self::GameCard),
            other => Err(Error::Parse(format!("unknown distribution type {other:#x}"))),
        }
    }
}

impl NcaContentType {
    pub fn from_raw(value: u8) -> Result<Self, Error> {
        match value {
            0x00 => Ok(Self::Program),
            0x01 => Ok(Self::Meta),
            0x02 => Ok(Self::Control),
            0x03 => Ok(Self::Manual),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::PublicData),
            other => Err(Error::Parse(format!("unknown content type {other:#x}"))),
        }
    }
}
