//! Cartridge header, key area and certificate layouts.

use binrw::prelude::*;

use crate::crypto::aes::{cbc_decrypt, ccm_decrypt, ecb_decrypt_block};
use crate::error::{CryptoError, Error};
use crate::version::{VersionType1, VersionType2};

pub const CARD_MEDIA_UNIT_SIZE: u64 = 0x200;
pub const CARD_HEADER_SIZE: usize = 0x200;
pub const CARD_CERTIFICATE_OFFSET: u64 = 0x7000;
pub const CARD_CERTIFICATE_SIZE: usize = 0x200;
pub const CARD_INITIAL_DATA_SIZE: usize = 0x200;

pub const fn media_offset(units: u32) -> u64 {
    units as u64 * CARD_MEDIA_UNIT_SIZE
}

/// Decrypted contents of the header's encrypted area (0x70 bytes,
/// AES-128-CBC with the platform XCI header key).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardEncryptedArea {
    pub fw_version: u64,
    pub acc_ctrl_1: u32,
    pub wait_1_time_read: u32,
    pub wait_2_time_read: u32,
    pub wait_1_time_write: u32,
    pub wait_2_time_write: u32,
    #[br(map = VersionType2)]
    #[bw(map = |v: &VersionType2| v.0)]
    pub fw_mode: VersionType2,
    /// Bundled firmware update version.
    #[br(map = VersionType1)]
    #[bw(map = |v: &VersionType1| v.0)]
    pub cup_version: VersionType1,
    pub compatibility_type: u8,
    pub _reserved_1: [u8; 3],
    pub cup_hash: u64,
    /// Must match the system-update title id.
    pub cup_id: u64,
    pub _reserved_2: [u8; 0x38],
}

/// Fixed 0x200-byte cartridge header. The leading 0x100 bytes are an
/// RSA-PSS signature over the remainder.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardHeader {
    pub signature: [u8; 0x100],
    #[brw(magic = b"HEAD")]
    /// First media unit of the secure storage area.
    pub secure_area_start: u32,
    /// Always 0xFFFFFFFF.
    pub backup_area_start: u32,
    /// kek index in the low nibble, titlekey decryption index in the
    /// high nibble.
    pub key_index: u8,
    pub rom_size: u8,
    pub header_version: u8,
    pub flags: u8,
    pub package_id: u64,
    /// Last media unit holding valid data.
    pub valid_data_end: u32,
    pub _reserved: [u8; 4],
    /// Stored byte-reversed relative to its CBC use.
    pub iv: [u8; 0x10],
    /// Absolute offset of the root hash-FS header.
    pub partition_fs_header_address: u64,
    pub partition_fs_header_size: u64,
    pub partition_fs_header_hash: [u8; 0x20],
    pub initial_data_hash: [u8; 0x20],
    pub sel_sec: u32,
    pub sel_t1_key: u32,
    pub sel_key: u32,
    /// End of the normal storage area, in media units.
    pub normal_area_end: u32,
    pub encrypted_area: [u8; 0x70],
}

impl CardHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let header: Self = binrw::io::Cursor::new(bytes).read_le()?;
        Ok(header)
    }

    pub fn kek_index(&self) -> u8 {
        self.key_index & 0xF
    }

    pub fn titlekey_dec_index(&self) -> u8 {
        self.key_index >> 4
    }

    /// ROM capacity in bytes from the rom-size byte.
    pub fn rom_capacity(&self) -> Option<u64> {
        const GIB: u64 = 0x4000_0000;
        match self.rom_size {
            0xFA => Some(GIB),
            0xF8 => Some(2 * GIB),
            0xF0 => Some(4 * GIB),
            0xE0 => Some(8 * GIB),
            0xE1 => Some(16 * GIB),
            0xE2 => Some(32 * GIB),
            _ => None,
        }
    }

    /// Area-layout invariant: valid data must end within the normal and
    /// secure layout, which in turn must fit the medium.
    pub fn validate_areas(&self, total_media_units: u64) -> Result<(), Error> {
        if (self.valid_data_end as u64) <= (self.normal_area_end as u64)
            && (self.normal_area_end as u64) <= total_media_units
        {
            Ok(())
        } else {
            Err(Error::Parse(format!(
                "inconsistent card areas: valid_data_end={:#x} normal_area_end={:#x} total={:#x}",
                self.valid_data_end, self.normal_area_end, total_media_units
            )))
        }
    }

    /// Decrypts the trailing encrypted area with the platform XCI header
    /// key. The stored IV is byte-reversed.
    pub fn decrypt_encrypted_area(
        &self,
        xci_header_key: &[u8; 0x10],
    ) -> Result<CardEncryptedArea, Error> {
        let mut iv = self.iv;
        iv.reverse();

        let mut buf = self.encrypted_area.to_vec();
        cbc_decrypt(xci_header_key, &iv, &mut buf)?;

        let area: CardEncryptedArea = binrw::io::Cursor::new(&buf).read_le()?;
        Ok(area)
    }
}

/// Key source of the cartridge initial data, encrypted with the common
/// titlekek generator key.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardKeySource {
    /// Matches `package_id` from the card header.
    pub package_id: u64,
    pub _reserved: [u8; 8],
}

/// Plaintext initial-data blob fetched from the card's key area (0x200
/// bytes). Carries the CCM-sealed titlekey.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardInitialData {
    pub key_source: CardKeySource,
    pub encrypted_titlekey: [u8; 0x10],
    pub mac: [u8; 0x10],
    pub nonce: [u8; 0xC],
    #[brw(pad_size_to = 0x1C4)]
    pub _reserved: (),
}

impl CardInitialData {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let data: Self = binrw::io::Cursor::new(bytes).read_le()?;
        Ok(data)
    }

    /// Recovers the cartridge titlekey: the key source decrypts with the
    /// generator kek, the result keys the AES-CCM unseal.
    pub fn decrypt_titlekey(&self, generator_kek: &[u8; 0x10]) -> Result<[u8; 0x10], Error> {
        let mut source = [0u8; 0x10];
        source[..8].copy_from_slice(&self.key_source.package_id.to_le_bytes());
        source[8..].copy_from_slice(&self.key_source._reserved);
        let ccm_key = ecb_decrypt_block(generator_kek, &source);

        let mut sealed = Vec::with_capacity(0x20);
        sealed.extend_from_slice(&self.encrypted_titlekey);
        sealed.extend_from_slice(&self.mac);

        let titlekey = ccm_decrypt(&ccm_key, &self.nonce, &sealed)?;
        titlekey
            .try_into()
            .map_err(|_| CryptoError::Aead.into())
    }
}

/// Per-cartridge titlekey block, CTR-encrypted with a random kek and IV.
/// Zero-filled on retail cards.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardTitleKeyBlock {
    pub titlekey: [u8; 0x10],
    #[brw(pad_size_to = 0xCF0)]
    pub _reserved: (),
}

/// OAEP-wrapped kek/IV pair for the titlekey block. Zero-filled on
/// retail cards.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardTitleKeyEncryption {
    pub titlekey_encryption_key: [u8; 0x10],
    pub titlekey_encryption_iv: [u8; 0x10],
    #[brw(pad_size_to = 0xE0)]
    pub _reserved: (),
}

/// The three layered key-area blobs preceding the card header. Only the
/// initial data is readable at runtime; the rest is presumed zero.
#[derive(Debug, Clone, Default)]
pub struct CardKeyArea {
    pub initial_data: Option<CardInitialData>,
}

#[cfg(test)]
pub(crate) fn test_card_header(
    secure_area_start: u32,
    valid_data_end: u32,
    normal_area_end: u32,
    partition_fs_header_address: u64,
) -> CardHeader {
    CardHeader {
        signature: [0; 0x100],
        secure_area_start,
        backup_area_start: 0xFFFFFFFF,
        key_index: 0,
        rom_size: 0xF8,
        header_version: 0,
        flags: 0,
        package_id: 0x1122334455667788,
        valid_data_end,
        _reserved: [0; 4],
        iv: [0x0F; 0x10],
        partition_fs_header_address,
        partition_fs_header_size: 0x200,
        partition_fs_header_hash: [0; 0x20],
        initial_data_hash: [0; 0x20],
        sel_sec: 1,
        sel_t1_key: 2,
        sel_key: 0,
        normal_area_end,
        encrypted_area: [0; 0x70],
    }
}
