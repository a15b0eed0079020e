//! BKTR patch sections: CTR crypto plus a relocation table that stitches
//! the patched view together from base and patch data.
//!
//! The reader exposes the virtual, post-relocation view. Ranges are
//! half-open and sorted by virtual offset; each range names its physical
//! offset and whether it is served from the patch section or the base
//! archive's section.

use std::io::{self, Read, Seek, SeekFrom};

use binrw::prelude::*;

use super::types::BktrSuperblock;
use crate::error::Error;
use crate::io::ReadSeek;

/// One relocation range.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct RelocationEntry {
    /// Start of the range in the virtual view.
    pub virt_offset: u64,
    /// Matching offset inside the source section.
    pub phys_offset: u64,
    /// Non-zero when the range is served from the patch section.
    pub is_patch: u32,
}

/// Virtual view over a BKTR patch section.
pub struct BktrReader<'a> {
    patch: Box<dyn ReadSeek + 'a>,
    base: Option<Box<dyn ReadSeek + 'a>>,
    relocations: Vec<RelocationEntry>,
    virtual_size: u64,
    position: u64,
}

impl<'a> BktrReader<'a> {
    /// Parses the relocation table out of the (already decrypted) patch
    /// section and builds the virtual view. `base` supplies data for
    /// ranges relocated into the base archive; without it those ranges
    /// read as zeroes.
    pub fn new(
        mut patch: Box<dyn ReadSeek + 'a>,
        base: Option<Box<dyn ReadSeek + 'a>>,
        superblock: &BktrSuperblock,
    ) -> Result<Self, Error> {
        let table = &superblock.relocation_header;
        patch.seek(SeekFrom::Start(table.offset))?;

        let mut relocations = Vec::with_capacity(table.entry_count as usize);
        for _ in 0..table.entry_count {
            let mut raw = [0u8; 0x14];
            patch.read_exact(&mut raw)?;
            let entry: RelocationEntry = binrw::io::Cursor::new(&raw).read_le()?;
            relocations.push(entry);
        }

        if relocations.is_empty() {
            return Err(Error::Parse("BKTR relocation table is empty".to_string()));
        }
        if !relocations.is_sorted_by_key(|e| e.virt_offset) {
            return Err(Error::Parse(
                "BKTR relocation table is not sorted".to_string(),
            ));
        }
        if relocations[0].virt_offset != 0 {
            return Err(Error::Parse(
                "BKTR relocation table does not start at virtual offset 0".to_string(),
            ));
        }

        // The virtual view is as large as the outermost IVFC level.
        let ivfc = &superblock.ivfc;
        let last = ivfc
            .levels
            .get(ivfc.level_count.saturating_sub(1) as usize)
            .copied()
            .unwrap_or_default();
        let virtual_size = last.logical_offset + last.hash_data_size;

        tracing::trace!(
            entries = relocations.len(),
            virtual_size = format_args!("{virtual_size:#x}"),
            "BKTR relocation table parsed"
        );

        Ok(Self {
            patch,
            base,
            relocations,
            virtual_size,
            position: 0,
        })
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// The relocation range covering a virtual offset, plus the range's
    /// end in virtual space.
    fn range_for(&self, virt: u64) -> (&RelocationEntry, u64) {
        let idx = self
            .relocations
            .partition_point(|e| e.virt_offset <= virt)
            .saturating_sub(1);
        let end = self
            .relocations
            .get(idx + 1)
            .map(|e| e.virt_offset)
            .unwrap_or(self.virtual_size);
        (&self.relocations[idx], end)
    }
}

impl Read for BktrReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.virtual_size {
            return Ok(0);
        }

        let (entry, range_end) = {
            let (entry, range_end) = self.range_for(self.position);
            (entry.clone(), range_end)
        };

        let in_range = self.position - entry.virt_offset;
        let phys = entry.phys_offset + in_range;
        let take = buf
            .len()
            .min((range_end - self.position) as usize)
            .min((self.virtual_size - self.position) as usize);

        let got = if entry.is_patch != 0 {
            self.patch.seek(SeekFrom::Start(phys))?;
            self.patch.read(&mut buf[..take])?
        } else if let Some(base) = self.base.as_mut() {
            base.seek(SeekFrom::Start(phys))?;
            base.read(&mut buf[..take])?
        } else {
            buf[..take].fill(0);
            take
        };

        self.position += got as u64;
        Ok(got)
    }
}

impl Seek for BktrReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.virtual_size as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before start of BKTR view",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}
