//! Program-archive header rewrite.
//!
//! Repackaged program archives are re-signed with the bundled RSA-2048
//! key: the ACID public key inside the PFS0-hosted meta file is replaced
//! with the bundled public key, the affected hash-table blocks and the
//! superblock master hash are recomputed, the header section hash is
//! refreshed, and the `npdm_key_sig` is regenerated over header bytes
//! [0x200, 0x400). The fixed-key signature is never touched.
//!
//! All mutations are reported as `(offset, bytes)` spans over the
//! encrypted image so a streamer can emit the rewritten archive without
//! holding it in memory.

use std::io::{self, Read, Seek, SeekFrom};

use binrw::BinReaderExt;

use crate::crypto::aes::{ctr_crypt, nintendo_ctr_iv};
use crate::crypto::{rsa, sha256};
use crate::error::Error;
use crate::formats::cnmt::Cnmt;
use crate::formats::pfs::Pfs0;
use crate::io::RegionReader;

use super::{CryptType, Nca, NcaContentType, encrypt_header};

/// NPDM header offsets.
const NPDM_MAGIC: &[u8; 4] = b"META";
const NPDM_ACID_OFFSET_FIELD: usize = 0x78;
const NPDM_ACID_SIZE_FIELD: usize = 0x7C;
/// The ACID public key sits behind the 0x100-byte ACID signature.
const ACID_PUBKEY_OFFSET: usize = 0x100;

/// A rewritten span of the encrypted archive image.
#[derive(Debug, Clone)]
pub struct NcaPatch {
    /// Absolute offset within the archive.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Result of a program-archive rewrite.
pub struct ProgramModData {
    /// Encrypted replacement spans, sorted by offset.
    pub patches: Vec<NcaPatch>,
    /// The rewritten plaintext header.
    pub plaintext_header: Vec<u8>,
}

fn encrypt_section_span(
    crypt_type: CryptType,
    section_ctr: u64,
    key: &[u8; 0x10],
    abs_offset: u64,
    data: &mut [u8],
) -> Result<(), Error> {
    match crypt_type {
        CryptType::None => Ok(()),
        CryptType::Ctr => {
            if abs_offset % 0x10 != 0 {
                return Err(Error::Unsupported(format!(
                    "unaligned CTR rewrite span at {abs_offset:#x}"
                )));
            }
            let iv = nintendo_ctr_iv(section_ctr, abs_offset);
            ctr_crypt(key, &iv, data);
            Ok(())
        }
        other => Err(Error::Unsupported(format!(
            "cannot rewrite {other:?} sections"
        ))),
    }
}

impl<R: Read + Seek> Nca<R> {
    /// Rewrites this program archive so its meta file carries the bundled
    /// public key and its header is signed by the matching private key.
    pub fn rewrite_program(&mut self, vault: &crate::keys::KeyVault) -> Result<ProgramModData, Error> {
        if self.header.content_type()? != NcaContentType::Program {
            return Err(Error::Parse(
                "header rewrite requires a program archive".to_string(),
            ));
        }

        let fs_header = self.fs_headers[0]
            .clone()
            .ok_or_else(|| Error::Parse("program archive has no section 0".to_string()))?;
        let sb = fs_header
            .superblock
            .as_pfs0()
            .ok_or_else(|| Error::Parse("program section 0 is not a PFS0 section".to_string()))?
            .clone();
        let crypt_type = fs_header.crypt_type()?;
        let section_ctr = fs_header.section_ctr;
        let (section_start, _) = self
            .section_range(0)
            .ok_or_else(|| Error::Parse("program section 0 is empty".to_string()))?;
        let section_key = match crypt_type {
            CryptType::Ctr => self.ctr_key()?,
            _ => [0u8; 0x10],
        };

        // Locate the meta file and pull out the spans we have to touch.
        let (npdm_pfs0_offset, mut npdm, block_range, mut hash_table) = {
            let mut reader = self.section_reader(0)?;

            let pfs = Pfs0::from_reader(RegionReader::new(
                &mut reader,
                sb.pfs0_offset,
                sb.pfs0_size,
            ))?;
            let npdm_file = pfs
                .files
                .iter()
                .find(|f| f.name.ends_with(".npdm"))
                .ok_or_else(|| Error::Parse("program ExeFS carries no .npdm".to_string()))?;
            let (npdm_start, npdm_end) = pfs.file_range(npdm_file);
            drop(pfs);

            let mut npdm = vec![0u8; (npdm_end - npdm_start) as usize];
            reader.seek(SeekFrom::Start(sb.pfs0_offset + npdm_start))?;
            reader.read_exact(&mut npdm)?;

            // Hash blocks covering the meta file.
            let block_size = sb.block_size as u64;
            let first_block = npdm_start / block_size;
            let last_block = (npdm_end - 1) / block_size;
            let blocks_start = first_block * block_size;
            let blocks_end = ((last_block + 1) * block_size).min(sb.pfs0_size);

            let mut hash_table = vec![0u8; sb.hash_table_size as usize];
            reader.seek(SeekFrom::Start(sb.hash_table_offset))?;
            reader.read_exact(&mut hash_table)?;

            (npdm_start, npdm, (blocks_start, blocks_end), hash_table)
        };

        // Patch the ACID public key inside the meta file. The key is
        // located through the explicit acid_offset field rather than by
        // signature pattern matching.
        if &npdm[..4] != NPDM_MAGIC {
            return Err(Error::Parse("meta file magic mismatch".to_string()));
        }
        let acid_offset = u32::from_le_bytes(
            npdm[NPDM_ACID_OFFSET_FIELD..NPDM_ACID_OFFSET_FIELD + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        let acid_size = u32::from_le_bytes(
            npdm[NPDM_ACID_SIZE_FIELD..NPDM_ACID_SIZE_FIELD + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        let pubkey_start = acid_offset + ACID_PUBKEY_OFFSET;
        if acid_size < ACID_PUBKEY_OFFSET + rsa::RSA2048_PUBKEY_SIZE
            || npdm.len() < pubkey_start + rsa::RSA2048_PUBKEY_SIZE
        {
            return Err(Error::Parse("ACID region out of bounds".to_string()));
        }
        npdm[pubkey_start..pubkey_start + rsa::RSA2048_PUBKEY_SIZE]
            .copy_from_slice(&rsa::custom_public_key());

        // Recompute the hash-table entries for the touched blocks. The
        // block plaintext is reconstructed from the section with the
        // patched meta file overlaid.
        let (blocks_start, blocks_end) = block_range;
        let mut blocks = vec![0u8; (blocks_end - blocks_start) as usize];
        {
            let mut reader = self.section_reader(0)?;
            reader.seek(SeekFrom::Start(sb.pfs0_offset + blocks_start))?;
            reader.read_exact(&mut blocks)?;
        }
        let overlay_start = (npdm_pfs0_offset - blocks_start) as usize;
        blocks[overlay_start..overlay_start + npdm.len()].copy_from_slice(&npdm);

        let block_size = sb.block_size as usize;
        let first_block = (blocks_start / sb.block_size as u64) as usize;
        for (i, chunk) in blocks.chunks(block_size).enumerate() {
            let entry = (first_block + i) * 0x20;
            hash_table[entry..entry + 0x20].copy_from_slice(&sha256(chunk));
        }

        // Propagate upwards: superblock master hash, FS header digest,
        // then the fresh npdm signature over [0x200, 0x400).
        let master_hash = sha256(&hash_table);
        let fs_header_span = 0x400..0x600;
        self.plaintext_header[fs_header_span.start + 0x8..fs_header_span.start + 0x28]
            .copy_from_slice(&master_hash);
        let section_hash = sha256(&self.plaintext_header[fs_header_span.clone()]);
        self.plaintext_header[0x280..0x2A0].copy_from_slice(&section_hash);

        let signature = rsa::pss_sign(&self.plaintext_header[0x200..0x400])?;
        self.plaintext_header[0x100..0x200].copy_from_slice(&signature);

        // Refresh the parsed views.
        self.header = super::NcaHeader::from_bytes(&self.plaintext_header)?;
        self.fs_headers[0] = Some(
            binrw::io::Cursor::new(&self.plaintext_header[fs_header_span.clone()])
                .read_le()
                .map_err(Error::from)?,
        );

        // Emit the encrypted replacement spans.
        let mut header_cipher = self.plaintext_header.clone();
        encrypt_header(vault.header_key(), &mut header_cipher, self.version);

        let mut table_cipher = hash_table.clone();
        encrypt_section_span(
            crypt_type,
            section_ctr,
            &section_key,
            section_start + sb.hash_table_offset,
            &mut table_cipher,
        )?;

        let mut blocks_cipher = blocks.clone();
        encrypt_section_span(
            crypt_type,
            section_ctr,
            &section_key,
            section_start + sb.pfs0_offset + blocks_start,
            &mut blocks_cipher,
        )?;

        let patches = vec![
            NcaPatch {
                offset: 0,
                data: header_cipher,
            },
            NcaPatch {
                offset: section_start + sb.hash_table_offset,
                data: table_cipher,
            },
            NcaPatch {
                offset: section_start + sb.pfs0_offset + blocks_start,
                data: blocks_cipher,
            },
        ];

        tracing::trace!(
            title_id = format_args!("{:016X}", self.header.title_id),
            spans = patches.len(),
            "Program archive rewritten"
        );

        Ok(ProgramModData {
            patches,
            plaintext_header: self.plaintext_header.clone(),
        })
    }

    /// Rebuilds a metadata archive image around an updated cnmt. The cnmt
    /// payload must keep its original size; hashes and the header are
    /// recomputed and the full re-encrypted image is returned.
    pub fn rebuild_cnmt_nca(
        &mut self,
        vault: &crate::keys::KeyVault,
        cnmt: &Cnmt,
    ) -> Result<Vec<u8>, Error> {
        if self.header.content_type()? != NcaContentType::Meta {
            return Err(Error::Parse(
                "cnmt rebuild requires a metadata archive".to_string(),
            ));
        }

        let fs_header = self.fs_headers[0]
            .clone()
            .ok_or_else(|| Error::Parse("metadata archive has no section 0".to_string()))?;
        let sb = fs_header
            .superblock
            .as_pfs0()
            .ok_or_else(|| Error::Parse("metadata section 0 is not a PFS0 section".to_string()))?
            .clone();
        let crypt_type = fs_header.crypt_type()?;
        let section_ctr = fs_header.section_ctr;
        let (section_start, section_end) = self
            .section_range(0)
            .ok_or_else(|| Error::Parse("metadata section 0 is empty".to_string()))?;
        let section_key = match crypt_type {
            CryptType::Ctr => self.ctr_key()?,
            _ => [0u8; 0x10],
        };

        // Full plaintext of the (small) metadata section.
        let mut section = vec![0u8; (section_end - section_start) as usize];
        {
            let mut reader = self.section_reader(0)?;
            reader.read_exact(&mut section)?;
        }

        // Swap the cnmt file bytes in place.
        let (cnmt_start, cnmt_end) = {
            let pfs = Pfs0::from_reader(binrw::io::Cursor::new(
                &section[sb.pfs0_offset as usize..(sb.pfs0_offset + sb.pfs0_size) as usize],
            ))?;
            let file = pfs
                .files
                .iter()
                .find(|f| f.name.ends_with(".cnmt"))
                .ok_or_else(|| Error::Parse("no .cnmt entry in metadata archive".to_string()))?;
            pfs.file_range(file)
        };
        let new_bytes = cnmt.to_bytes()?;
        if new_bytes.len() as u64 != cnmt_end - cnmt_start {
            return Err(Error::Parse(format!(
                "cnmt size changed: {:#x} -> {:#x}",
                cnmt_end - cnmt_start,
                new_bytes.len()
            )));
        }
        let abs_start = (sb.pfs0_offset + cnmt_start) as usize;
        section[abs_start..abs_start + new_bytes.len()].copy_from_slice(&new_bytes);

        // Recompute the whole hash table; the section is small.
        let block_size = sb.block_size as usize;
        let pfs0_region =
            section[sb.pfs0_offset as usize..(sb.pfs0_offset + sb.pfs0_size) as usize].to_vec();
        let table_offset = sb.hash_table_offset as usize;
        for (i, chunk) in pfs0_region.chunks(block_size).enumerate() {
            let entry = table_offset + i * 0x20;
            section[entry..entry + 0x20].copy_from_slice(&sha256(chunk));
        }
        let table =
            section[table_offset..table_offset + sb.hash_table_size as usize].to_vec();
        let master_hash = sha256(&table);

        self.plaintext_header[0x400 + 0x8..0x400 + 0x28].copy_from_slice(&master_hash);
        let section_hash = sha256(&self.plaintext_header[0x400..0x600]);
        self.plaintext_header[0x280..0x2A0].copy_from_slice(&section_hash);
        self.header = super::NcaHeader::from_bytes(&self.plaintext_header)?;
        self.fs_headers[0] = Some(
            binrw::io::Cursor::new(&self.plaintext_header[0x400..0x600])
                .read_le()
                .map_err(Error::from)?,
        );

        // Assemble the full image: encrypted header + encrypted section.
        let mut image = self.plaintext_header.clone();
        encrypt_header(vault.header_key(), &mut image, self.version);

        encrypt_section_span(
            crypt_type,
            section_ctr,
            &section_key,
            section_start,
            &mut section,
        )?;
        image.resize(section_start as usize, 0);
        image.extend_from_slice(&section);

        Ok(image)
    }
}

/// Read adapter that overlays rewrite patches on top of the original
/// archive bytes, so the rewritten image can be streamed without being
/// materialized.
pub struct PatchedNcaReader<R: Read + Seek> {
    inner: R,
    patches: Vec<NcaPatch>,
    position: u64,
    size: u64,
}

impl<R: Read + Seek> PatchedNcaReader<R> {
    pub fn new(inner: R, mut patches: Vec<NcaPatch>, size: u64) -> Self {
        patches.sort_by_key(|p| p.offset);
        Self {
            inner,
            patches,
            position: 0,
            size,
        }
    }
}

impl<R: Read + Seek> Read for PatchedNcaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let take = buf.len().min((self.size - self.position) as usize);

        self.inner.seek(SeekFrom::Start(self.position))?;
        self.inner.read_exact(&mut buf[..take])?;

        // Overlay any patch intersecting the window.
        for patch in &self.patches {
            let patch_end = patch.offset + patch.data.len() as u64;
            let window_end = self.position + take as u64;
            if patch_end <= self.position || patch.offset >= window_end {
                continue;
            }
            let from = patch.offset.max(self.position);
            let to = patch_end.min(window_end);
            let src = (from - patch.offset) as usize;
            let dst = (from - self.position) as usize;
            let len = (to - from) as usize;
            buf[dst..dst + len].copy_from_slice(&patch.data[src..src + len]);
        }

        self.position += take as u64;
        Ok(take)
    }
}

impl<R: Read + Seek> Seek for PatchedNcaReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.size as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before start of patched archive",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}
