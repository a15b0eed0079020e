//! Content archive (NCA) handling.
//!
//! An archive is a 0xC00-byte header followed by up to four sections. The
//! header is AES-XTS encrypted with the vault's header key: generation-3
//! archives ("NCA3") encrypt all six 0x200-byte sectors sequentially,
//! generation-2 ("NCA2") encrypts each trailing FS header as sector 0.
//! Sections carry their own crypt mode, key slot and integrity tree.

mod bktr;
pub mod program;
mod types;

use std::io::{Read, Seek, SeekFrom};

use binrw::prelude::*;
use tracing::instrument;

pub use bktr::{BktrReader, RelocationEntry};
pub use types::*;

use crate::crypto::aes::{ecb_decrypt, nintendo_tweak, xts_cipher};
use crate::error::Error;
use crate::formats::cnmt::Cnmt;
use crate::formats::pfs::Pfs0;
use crate::io::{Aes128CtrReader, Aes128XtsReader, ReadSeek, RegionReader};
use crate::keys::{KaekIndex, KeyVault};

pub const NCA_HEADER_SIZE: usize = 0xC00;
pub const NCA_SECTION_HEADER_SIZE: usize = 0x200;
pub const NCA_SECTION_COUNT: usize = 4;
pub const MEDIA_UNIT_SIZE: u64 = 0x200;

/// Archive generation, taken from the header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    Nca2,
    Nca3,
}

impl NcaVersion {
    fn from_magic(magic: &[u8; 4]) -> Result<Self, Error> {
        match magic {
            b"NCA2" => Ok(Self::Nca2),
            b"NCA3" => Ok(Self::Nca3),
            other => Err(Error::Unsupported(format!(
                "unsupported archive magic {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Fixed 0x400-byte archive header (excluding the four FS headers).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// RSA-PSS signature with the fixed platform key. Never touched by
    /// the rewriter.
    pub fixed_key_sig: [u8; 0x100],
    /// RSA-PSS signature with the key from the program meta file.
    pub npdm_key_sig: [u8; 0x100],
    pub magic: [u8; 4],
    pub distribution_raw: u8,
    pub content_type_raw: u8,
    pub crypto_type: u8,
    pub kaek_ind: u8,
    pub nca_size: u64,
    pub title_id: u64,
    pub _pad_218: [u8; 4],
    pub sdk_version: u32,
    pub crypto_type2: u8,
    pub fixed_key_generation: u8,
    pub _pad_222: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    pub section_entries: [SectionEntry; NCA_SECTION_COUNT],
    pub section_hashes: [[u8; 0x20]; NCA_SECTION_COUNT],
    /// Encrypted key area: 4 x 16-byte key slots.
    pub key_area: [[u8; 0x10]; NCA_SECTION_COUNT],
    #[brw(pad_size_to = 0xC0)]
    pub _pad_340: (),
}

impl NcaHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(binrw::io::Cursor::new(bytes).read_le()?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.write_le(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn version(&self) -> Result<NcaVersion, Error> {
        NcaVersion::from_magic(&self.magic)
    }

    pub fn distribution(&self) -> Result<Distribution, Error> {
        Distribution::from_raw(self.distribution_raw)
    }

    pub fn content_type(&self) -> Result<NcaContentType, Error> {
        NcaContentType::from_raw(self.content_type_raw)
    }

    pub fn has_rights_id(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    /// Effective crypto generation: the larger of the two header bytes,
    /// shifted down by one because the on-disk convention is 1-indexed.
    pub fn key_generation(&self) -> u8 {
        let raw = self.crypto_type.max(self.crypto_type2);
        raw.saturating_sub(1)
    }

    pub fn kaek_index(&self) -> Result<KaekIndex, Error> {
        KaekIndex::from_u8(self.kaek_ind)
            .ok_or_else(|| Error::Parse(format!("invalid KAEK index {}", self.kaek_ind)))
    }
}

/// Decrypts a full 0xC00 header in place and reports the archive
/// generation. Magic values other than NCA2/NCA3 are rejected.
pub fn decrypt_header(header_key: &[u8; 0x20], buf: &mut [u8]) -> Result<NcaVersion, Error> {
    assert_eq!(buf.len(), NCA_HEADER_SIZE);
    let xts = xts_cipher(header_key);

    // The first 0x400 bytes are laid out identically in both generations.
    xts.decrypt_area(&mut buf[..0x400], 0x200, 0, nintendo_tweak);
    let magic: [u8; 4] = buf[0x200..0x204].try_into().unwrap();
    let version = NcaVersion::from_magic(&magic)?;

    match version {
        NcaVersion::Nca3 => {
            xts.decrypt_area(&mut buf[0x400..], 0x200, 2, nintendo_tweak);
        }
        NcaVersion::Nca2 => {
            // Each FS header is its own sector 0.
            for section in 0..NCA_SECTION_COUNT {
                let start = 0x400 + section * NCA_SECTION_HEADER_SIZE;
                xts.decrypt_area(
                    &mut buf[start..start + NCA_SECTION_HEADER_SIZE],
                    0x200,
                    0,
                    nintendo_tweak,
                );
            }
        }
    }

    Ok(version)
}

/// Re-encrypts a plaintext 0xC00 header in place.
pub fn encrypt_header(header_key: &[u8; 0x20], buf: &mut [u8], version: NcaVersion) {
    assert_eq!(buf.len(), NCA_HEADER_SIZE);
    let xts = xts_cipher(header_key);

    xts.encrypt_area(&mut buf[..0x400], 0x200, 0, nintendo_tweak);
    match version {
        NcaVersion::Nca3 => {
            xts.encrypt_area(&mut buf[0x400..], 0x200, 2, nintendo_tweak);
        }
        NcaVersion::Nca2 => {
            for section in 0..NCA_SECTION_COUNT {
                let start = 0x400 + section * NCA_SECTION_HEADER_SIZE;
                xts.encrypt_area(
                    &mut buf[start..start + NCA_SECTION_HEADER_SIZE],
                    0x200,
                    0,
                    nintendo_tweak,
                );
            }
        }
    }
}

/// Parsed archive with decrypted keys and section access.
pub struct Nca<R: Read + Seek> {
    reader: R,
    pub version: NcaVersion,
    pub header: NcaHeader,
    pub fs_headers: [Option<FsHeader>; NCA_SECTION_COUNT],
    /// Decrypted full header, kept around for hashing and rewriting.
    plaintext_header: Vec<u8>,
    dec_key_area: [[u8; 0x10]; NCA_SECTION_COUNT],
    dec_title_key: Option<[u8; 0x10]>,
}

impl<R: Read + Seek> Nca<R> {
    /// Parses an archive. For ticket-bound archives the caller resolves
    /// the decrypted titlekey first (see the ticket module) and passes it
    /// in; key-area archives decrypt their key slots from the vault.
    #[instrument(level = "trace", skip(reader, vault, title_key))]
    pub fn from_reader(
        mut reader: R,
        vault: &KeyVault,
        title_key: Option<[u8; 0x10]>,
    ) -> Result<Self, Error> {
        reader.seek(SeekFrom::Start(0))?;
        let mut plaintext_header = vec![0u8; NCA_HEADER_SIZE];
        reader.read_exact(&mut plaintext_header)?;

        let version = decrypt_header(vault.header_key(), &mut plaintext_header)?;
        let header = NcaHeader::from_bytes(&plaintext_header)?;

        tracing::trace!(
            version = ?version,
            content_type = ?header.content_type(),
            title_id = format_args!("{:016X}", header.title_id),
            rights_id = %hex::encode(header.rights_id),
            "Archive header decrypted"
        );

        let mut fs_headers: [Option<FsHeader>; NCA_SECTION_COUNT] = [None, None, None, None];
        for (i, entry) in header.section_entries.iter().enumerate() {
            if entry.is_empty() {
                continue;
            }
            let start = 0x400 + i * NCA_SECTION_HEADER_SIZE;
            let bytes = &plaintext_header[start..start + NCA_SECTION_HEADER_SIZE];
            fs_headers[i] = Some(binrw::io::Cursor::new(bytes).read_le()?);
        }

        // Key resolution. Ticket-bound archives treat the titlekey as key
        // slot 2; the other slots are undefined.
        let mut dec_key_area = [[0u8; 0x10]; NCA_SECTION_COUNT];
        let dec_title_key = if header.has_rights_id() {
            if let Some(key) = title_key {
                dec_key_area[2] = key;
            }
            title_key
        } else {
            let kaek = vault.kaek(header.key_generation(), header.kaek_index()?)?;
            let mut area = [0u8; 0x40];
            for (i, slot) in header.key_area.iter().enumerate() {
                area[i * 0x10..(i + 1) * 0x10].copy_from_slice(slot);
            }
            ecb_decrypt(&kaek, &mut area)?;
            for (i, slot) in dec_key_area.iter_mut().enumerate() {
                slot.copy_from_slice(&area[i * 0x10..(i + 1) * 0x10]);
            }
            None
        };

        Ok(Self {
            reader,
            version,
            header,
            fs_headers,
            plaintext_header,
            dec_key_area,
            dec_title_key,
        })
    }

    pub fn plaintext_header(&self) -> &[u8] {
        &self.plaintext_header
    }

    pub fn dec_key_area(&self) -> &[[u8; 0x10]; NCA_SECTION_COUNT] {
        &self.dec_key_area
    }

    /// The AES-CTR key for a section: the titlekey for ticket-bound
    /// archives, key slot 2 otherwise.
    pub fn ctr_key(&self) -> Result<[u8; 0x10], Error> {
        if self.header.has_rights_id() {
            self.dec_title_key.ok_or_else(|| {
                crate::error::TicketError::NotInstalled(hex::encode(self.header.rights_id)).into()
            })
        } else {
            Ok(self.dec_key_area[2])
        }
    }

    /// Byte range of a section, relative to the archive start.
    pub fn section_range(&self, idx: usize) -> Option<(u64, u64)> {
        let entry = self.header.section_entries.get(idx)?;
        if entry.is_empty() {
            return None;
        }
        Some((
            entry.media_start_offset as u64 * MEDIA_UNIT_SIZE,
            entry.media_end_offset as u64 * MEDIA_UNIT_SIZE,
        ))
    }

    /// Verifies that an FS header matches its digest recorded in the
    /// archive header.
    pub fn verify_section_hash(&self, idx: usize) -> Result<(), Error> {
        if self.fs_headers.get(idx).map(Option::is_some) != Some(true) {
            return Err(Error::Parse(format!("section {idx} is empty")));
        }
        let start = 0x400 + idx * NCA_SECTION_HEADER_SIZE;
        let digest =
            crate::crypto::sha256(&self.plaintext_header[start..start + NCA_SECTION_HEADER_SIZE]);
        if digest != self.header.section_hashes[idx] {
            return Err(Error::Integrity {
                entry: format!("section header {idx}"),
            });
        }
        Ok(())
    }

    /// Builds a decrypting reader over a section. BKTR sections get the
    /// base archive's section via [`Nca::bktr_section_reader`].
    #[instrument(level = "trace", skip(self))]
    pub fn section_reader(&mut self, idx: usize) -> Result<Box<dyn ReadSeek + '_>, Error> {
        let (start, end) = self
            .section_range(idx)
            .ok_or_else(|| Error::Parse(format!("section {idx} is empty")))?;
        let fs_header = self.fs_headers[idx]
            .clone()
            .ok_or_else(|| Error::Parse(format!("section {idx} has no FS header")))?;

        match fs_header.crypt_type()? {
            CryptType::None => {
                let region = RegionReader::new(self.reader.by_ref(), start, end - start);
                Ok(Box::new(region))
            }
            CryptType::Ctr => {
                let key = self.ctr_key()?;
                // CTR sections count their block offset from the archive
                // start, so the region is carved out of the CTR view.
                let ctr = Aes128CtrReader::new(
                    self.reader.by_ref(),
                    0,
                    fs_header.section_ctr,
                    key,
                );
                Ok(Box::new(RegionReader::new(ctr, start, end - start)))
            }
            CryptType::Xts => {
                let mut key = [0u8; 0x20];
                key[..0x10].copy_from_slice(&self.dec_key_area[0]);
                key[0x10..].copy_from_slice(&self.dec_key_area[1]);
                let xts = Aes128XtsReader::new(self.reader.by_ref(), start, key);
                Ok(Box::new(RegionReader::new(xts, 0, end - start)))
            }
            CryptType::Bktr => Err(Error::Unsupported(
                "BKTR sections need the base archive; use bktr_section_reader".to_string(),
            )),
        }
    }

    /// Builds the virtual (post-relocation) view of a BKTR patch section.
    pub fn bktr_section_reader<'a>(
        &'a mut self,
        idx: usize,
        base: Option<Box<dyn ReadSeek + 'a>>,
    ) -> Result<BktrReader<'a>, Error> {
        let (start, end) = self
            .section_range(idx)
            .ok_or_else(|| Error::Parse(format!("section {idx} is empty")))?;
        let fs_header = self.fs_headers[idx]
            .clone()
            .ok_or_else(|| Error::Parse(format!("section {idx} has no FS header")))?;
        if fs_header.crypt_type()? != CryptType::Bktr {
            return Err(Error::Parse(format!("section {idx} is not a BKTR section")));
        }
        let superblock = fs_header
            .superblock
            .as_bktr()
            .ok_or_else(|| Error::Parse("BKTR section without BKTR superblock".to_string()))?
            .clone();

        let key = self.ctr_key()?;
        let ctr = Aes128CtrReader::new(self.reader.by_ref(), 0, fs_header.section_ctr, key);
        let patch = RegionReader::new(ctr, start, end - start);
        BktrReader::new(Box::new(patch), base, &superblock)
    }

    /// Opens the PFS0 image inside a section.
    pub fn open_pfs0(&mut self, idx: usize) -> Result<Pfs0<Box<dyn ReadSeek + '_>>, Error> {
        let fs_header = self.fs_headers[idx]
            .clone()
            .ok_or_else(|| Error::Parse(format!("section {idx} has no FS header")))?;
        let sb = fs_header
            .superblock
            .as_pfs0()
            .ok_or_else(|| Error::Parse(format!("section {idx} is not a PFS0 section")))?
            .clone();

        let reader = self.section_reader(idx)?;
        let window = RegionReader::new(reader, sb.pfs0_offset, sb.pfs0_size);
        Pfs0::from_reader(Box::new(window) as Box<dyn ReadSeek + '_>)
    }

    /// Extracts and parses the single `.cnmt` entry of a metadata
    /// archive.
    pub fn extract_cnmt(&mut self) -> Result<Cnmt, Error> {
        if self.header.content_type()? != NcaContentType::Meta {
            return Err(Error::Parse(
                "cnmt extraction requires a metadata archive".to_string(),
            ));
        }

        let mut pfs = self.open_pfs0(0)?;
        let name = pfs
            .list_files()
            .into_iter()
            .find(|n| n.ends_with(".cnmt"))
            .ok_or_else(|| Error::Parse("no .cnmt entry in metadata archive".to_string()))?;
        let bytes = pfs.read_file(&name)?;
        Cnmt::from_bytes(&bytes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::crypto::aes::ecb_encrypt_block;
    use crate::crypto::sha256;

    /// Serializes and encrypts a complete archive image from plaintext
    /// parts. Sections are encrypted according to their FS headers.
    pub struct NcaImageBuilder {
        pub header: NcaHeader,
        pub fs_headers: [Option<FsHeader>; NCA_SECTION_COUNT],
        pub sections: Vec<(usize, Vec<u8>)>,
        pub plain_keys: [[u8; 0x10]; 4],
    }

    impl NcaImageBuilder {
        pub fn new(content_type: u8) -> Self {
            Self {
                header: NcaHeader {
                    fixed_key_sig: [0; 0x100],
                    npdm_key_sig: [0; 0x100],
                    magic: *b"NCA3",
                    distribution_raw: 0x01,
                    content_type_raw: content_type,
                    crypto_type: 0x02,
                    kaek_ind: 0,
                    nca_size: 0,
                    title_id: 0x0100ABCDEF000000,
                    _pad_218: [0; 4],
                    sdk_version: 0x000C1100,
                    crypto_type2: 0x03,
                    fixed_key_generation: 0,
                    _pad_222: [0; 0xE],
                    rights_id: [0; 0x10],
                    section_entries: [SectionEntry::default(); 4],
                    section_hashes: [[0; 0x20]; 4],
                    key_area: [[0; 0x10]; 4],
                    _pad_340: (),
                },
                fs_headers: [None, None, None, None],
                sections: Vec::new(),
                plain_keys: [[0x44; 0x10]; 4],
            }
        }

        /// Adds a section; `plaintext` is padded to whole media units.
        pub fn add_section(&mut self, idx: usize, fs_header: FsHeader, plaintext: Vec<u8>) {
            self.fs_headers[idx] = Some(fs_header);
            self.sections.push((idx, plaintext));
        }

        /// Lays out sections after the header, encrypts everything and
        /// returns the image.
        pub fn build(&mut self, vault: &KeyVault) -> Vec<u8> {
            let kaek = vault
                .kaek(
                    self.header.key_generation(),
                    KaekIndex::from_u8(self.header.kaek_ind).unwrap(),
                )
                .unwrap();
            for (i, key) in self.plain_keys.iter().enumerate() {
                self.header.key_area[i] = ecb_encrypt_block(&kaek, key);
            }

            let mut cursor = NCA_HEADER_SIZE as u64;
            let mut encrypted_sections = Vec::new();
            for (idx, plaintext) in &self.sections {
                let mut data = plaintext.clone();
                let padded = crate::util::align_up(data.len() as u64, MEDIA_UNIT_SIZE);
                data.resize(padded as usize, 0);

                let fs_header = self.fs_headers[*idx].as_ref().unwrap();
                let start = cursor;
                let end = start + data.len() as u64;
                self.header.section_entries[*idx] = SectionEntry {
                    media_start_offset: (start / MEDIA_UNIT_SIZE) as u32,
                    media_end_offset: (end / MEDIA_UNIT_SIZE) as u32,
                    _reserved: 0,
                };

                match fs_header.crypt_type().unwrap() {
                    CryptType::None => {}
                    CryptType::Ctr => {
                        // Encrypt at the absolute archive offset.
                        let iv = crate::crypto::aes::nintendo_ctr_iv(fs_header.section_ctr, start);
                        crate::crypto::aes::ctr_crypt(&self.plain_keys[2], &iv, &mut data);
                    }
                    other => panic!("builder does not support {other:?} sections"),
                }

                encrypted_sections.push((start, data));
                cursor = end;
            }
            self.header.nca_size = cursor;

            // FS headers + their digests in the main header.
            let mut plaintext = vec![0u8; NCA_HEADER_SIZE];
            for idx in 0..NCA_SECTION_COUNT {
                if let Some(fs_header) = &self.fs_headers[idx] {
                    let mut cur = binrw::io::Cursor::new(Vec::new());
                    fs_header.write_le(&mut cur).unwrap();
                    let bytes = cur.into_inner();
                    let start = 0x400 + idx * NCA_SECTION_HEADER_SIZE;
                    plaintext[start..start + NCA_SECTION_HEADER_SIZE].copy_from_slice(&bytes);
                    self.header.section_hashes[idx] =
                        sha256(&plaintext[start..start + NCA_SECTION_HEADER_SIZE]);
                }
            }
            plaintext[..0x400].copy_from_slice(&self.header.to_bytes().unwrap());

            encrypt_header(vault.header_key(), &mut plaintext, NcaVersion::Nca3);

            let mut image = plaintext;
            for (start, data) in encrypted_sections {
                let start = start as usize;
                if image.len() < start + data.len() {
                    image.resize(start + data.len(), 0);
                }
                image[start..start + data.len()].copy_from_slice(&data);
            }
            image
        }
    }

    pub fn pfs0_fs_header(
        crypt_type: u8,
        section_ctr: u64,
        block_size: u32,
        hash_table_size: u64,
        pfs0_offset: u64,
        pfs0_size: u64,
        master_hash: [u8; 0x20],
    ) -> FsHeader {
        FsHeader {
            version: 2,
            partition_type: 0x01,
            fs_type_raw: 0x02,
            crypt_type_raw: crypt_type,
            _pad: (),
            superblock: Superblock::Pfs0(Pfs0Superblock {
                master_hash,
                block_size,
                always_2: 2,
                hash_table_offset: 0,
                hash_table_size,
                pfs0_offset,
                pfs0_size,
                _reserved: (),
            }),
            section_ctr,
            _pad2: (),
        }
    }
}
