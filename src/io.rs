//! Reader adapters used to compose decryption pipelines over archives.
//!
//! Storage is modeled as one shared medium (a card image, an archive
//! file) carved into byte regions: partitions, archive sections and
//! packaged files are all [`RegionReader`]s over the same medium,
//! optionally layered under a decrypting reader.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};

use crate::crypto::aes::nintendo_ctr_iv;
use crate::util::{align_down, align_up};

/// Trait that combines Read and Seek, used to simplify type bounds.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Cloneable handle to a single storage medium.
///
/// Every clone reads through the same serialized reader, so regions
/// carved out of one medium never interleave mid-call.
pub struct SharedStorage<R> {
    medium: Arc<Mutex<R>>,
}

impl<R> Clone for SharedStorage<R> {
    fn clone(&self) -> Self {
        Self {
            medium: Arc::clone(&self.medium),
        }
    }
}

impl<R: Read + Seek> SharedStorage<R> {
    pub fn new(medium: R) -> Self {
        Self {
            medium: Arc::new(Mutex::new(medium)),
        }
    }

    /// Carves a `size`-byte region starting at `offset` out of the
    /// medium.
    pub fn region(&self, offset: u64, size: u64) -> RegionReader<Self> {
        RegionReader::new(self.clone(), offset, size)
    }
}

impl<R: Read + Seek> Read for SharedStorage<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.medium.lock().unwrap().read(buf)
    }
}

impl<R: Read + Seek> Seek for SharedStorage<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.medium.lock().unwrap().seek(pos)
    }
}

/// A fixed-size byte region of an underlying reader, addressed from 0.
///
/// The region keeps its own cursor and re-positions the underlying
/// reader on every read, so any number of regions can coexist over one
/// medium. Partitions, archive sections and packaged files are all
/// regions.
#[derive(Clone)]
pub struct RegionReader<R> {
    inner: R,
    base: u64,
    size: u64,
    cursor: u64,
}

impl<R: Read + Seek> RegionReader<R> {
    pub fn new(inner: R, base: u64, size: u64) -> Self {
        Self {
            inner,
            base,
            size,
            cursor: 0,
        }
    }

    /// Region size in bytes.
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl<R: Read + Seek> Read for RegionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.cursor);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let take = buf.len().min(remaining.min(usize::MAX as u64) as usize);
        self.inner.seek(SeekFrom::Start(self.base + self.cursor))?;
        let got = self.inner.read(&mut buf[..take])?;
        self.cursor += got as u64;
        Ok(got)
    }
}

impl<R: Read + Seek> Seek for RegionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.size.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.cursor.checked_add_signed(offset),
        };

        match target {
            Some(cursor) if cursor <= self.size => {
                self.cursor = cursor;
                Ok(cursor)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside of storage region",
            )),
        }
    }
}

/// AES-128-CTR reader that decrypts section data as it is read.
///
/// The counter is composed the Nintendo way: the upper 8 bytes carry the
/// section counter, the lower 8 bytes the absolute offset divided by 0x10,
/// both big-endian. Seeking recomputes the counter from the offset, so
/// random access is supported.
pub struct Aes128CtrReader<R: Read + Seek> {
    base_reader: R,
    base_offset: u64,
    position: u64,
    ctr: u64,
    key: [u8; 0x10],
}

impl<R: Read + Seek> Aes128CtrReader<R> {
    pub fn new(base_reader: R, base_offset: u64, ctr: u64, key: [u8; 0x10]) -> Self {
        Self {
            base_reader,
            base_offset,
            position: 0,
            ctr,
            key,
        }
    }
}

impl<R: Read + Seek> Read for Aes128CtrReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let abs_offset = self.base_offset + self.position;
        let aligned_offset = align_down(abs_offset, 0x10);
        let lead = (abs_offset - aligned_offset) as usize;

        let window = align_up((lead + buf.len()) as u64, 0x10) as usize;
        let mut read_buf = vec![0u8; window];

        self.base_reader.seek(SeekFrom::Start(aligned_offset))?;
        let got = self.base_reader.read(&mut read_buf)?;
        if got <= lead {
            return Ok(0);
        }
        read_buf.truncate(got);

        let iv = nintendo_ctr_iv(self.ctr, aligned_offset);
        let mut cipher = ctr::Ctr128BE::<Aes128>::new((&self.key).into(), (&iv).into());
        cipher.apply_keystream(&mut read_buf);

        let take = std::cmp::min(buf.len(), got - lead);
        buf[..take].copy_from_slice(&read_buf[lead..lead + take]);
        self.position += take as u64;
        Ok(take)
    }
}

impl<R: Read + Seek> Seek for Aes128CtrReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => {
                let end = self.base_reader.seek(SeekFrom::End(0))?;
                (end - self.base_offset) as i64 + offset
            }
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before start of CTR section",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// AES-128-XTS reader over a section encrypted with 0x200-byte sectors.
///
/// The tweak is the sector index counted from the start of the section.
pub struct Aes128XtsReader<R: Read + Seek> {
    base_reader: R,
    base_offset: u64,
    position: u64,
    key: [u8; 0x20],
}

impl<R: Read + Seek> Aes128XtsReader<R> {
    pub const SECTOR_SIZE: u64 = 0x200;

    pub fn new(base_reader: R, base_offset: u64, key: [u8; 0x20]) -> Self {
        Self {
            base_reader,
            base_offset,
            position: 0,
            key,
        }
    }
}

impl<R: Read + Seek> Read for Aes128XtsReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let aligned_pos = align_down(self.position, Self::SECTOR_SIZE);
        let lead = (self.position - aligned_pos) as usize;
        let window = align_up((lead + buf.len()) as u64, Self::SECTOR_SIZE) as usize;

        let mut read_buf = vec![0u8; window];
        self.base_reader
            .seek(SeekFrom::Start(self.base_offset + aligned_pos))?;
        let got = self.base_reader.read(&mut read_buf)?;
        // Partial trailing sectors cannot be decrypted; clamp to whole ones.
        let whole = align_down(got as u64, Self::SECTOR_SIZE) as usize;
        if whole <= lead {
            return Ok(0);
        }
        read_buf.truncate(whole);

        let xts = crate::crypto::aes::xts_cipher(&self.key);
        xts.decrypt_area(
            &mut read_buf,
            Self::SECTOR_SIZE as usize,
            (aligned_pos / Self::SECTOR_SIZE) as u128,
            crate::crypto::aes::nintendo_tweak,
        );

        let take = std::cmp::min(buf.len(), whole - lead);
        buf[..take].copy_from_slice(&read_buf[lead..lead + take]);
        self.position += take as u64;
        Ok(take)
    }
}

impl<R: Read + Seek> Seek for Aes128XtsReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => {
                let end = self.base_reader.seek(SeekFrom::End(0))?;
                (end - self.base_offset) as i64 + offset
            }
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before start of XTS section",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn region_reader_windows_reads() {
        let data: Vec<u8> = (0u8..=0xFF).collect();
        let storage = SharedStorage::new(Cursor::new(data));
        let mut region = storage.region(0x10, 0x10);

        assert_eq!(region.len(), 0x10);
        let mut buf = [0u8; 0x10];
        region.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], 0x10);
        assert_eq!(buf[0xF], 0x1F);
        // The region ends where its size says, not where the medium does.
        assert_eq!(region.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn region_reader_rejects_out_of_bounds_seeks() {
        let storage = SharedStorage::new(Cursor::new(vec![0u8; 0x40]));
        let mut region = storage.region(0x10, 0x20);

        assert_eq!(region.seek(SeekFrom::End(0)).unwrap(), 0x20);
        assert!(region.seek(SeekFrom::Current(1)).is_err());
        assert!(region.seek(SeekFrom::End(-0x21)).is_err());
        assert_eq!(region.seek(SeekFrom::Start(0x08)).unwrap(), 0x08);
    }

    #[test]
    fn ctr_reader_round_trip() {
        let plain = b"0123456789ABCDEF0123456789ABCDEF".to_vec();
        let key = [0x13u8; 0x10];
        let ctr_base = 0x42u64;

        let mut encrypted = plain.clone();
        let iv = nintendo_ctr_iv(ctr_base, 0);
        let mut cipher = ctr::Ctr128BE::<Aes128>::new((&key).into(), (&iv).into());
        cipher.apply_keystream(&mut encrypted);

        let mut reader = Aes128CtrReader::new(Cursor::new(encrypted), 0, ctr_base, key);
        let mut out = vec![0u8; plain.len()];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn ctr_reader_unaligned_seek() {
        let plain: Vec<u8> = (0u8..0x40).collect();
        let key = [0x77u8; 0x10];

        let mut encrypted = plain.clone();
        let iv = nintendo_ctr_iv(7, 0);
        let mut cipher = ctr::Ctr128BE::<Aes128>::new((&key).into(), (&iv).into());
        cipher.apply_keystream(&mut encrypted);

        let mut reader = Aes128CtrReader::new(Cursor::new(encrypted), 0, 7, key);
        reader.seek(SeekFrom::Start(0x13)).unwrap();
        let mut out = [0u8; 5];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, &plain[0x13..0x18]);
    }

    #[test]
    fn xts_reader_round_trip() {
        let plain = vec![0xA5u8; 0x400];
        let key = [0x01u8; 0x20];

        let mut encrypted = plain.clone();
        let xts = crate::crypto::aes::xts_cipher(&key);
        xts.encrypt_area(&mut encrypted, 0x200, 0, crate::crypto::aes::nintendo_tweak);

        let mut reader = Aes128XtsReader::new(Cursor::new(encrypted), 0, key);
        reader.seek(SeekFrom::Start(0x200)).unwrap();
        let mut out = vec![0u8; 0x200];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, plain[0x200..]);
    }
}
