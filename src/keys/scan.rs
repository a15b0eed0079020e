//! Locating key material inside running-process memory dumps.
//!
//! Keys are found by hashing every key-length-sized window of a segment
//! and comparing the digest against a table of known SHA-256 digests.

use sha2::{Digest, Sha256};

use crate::error::KeyVaultError;

/// A key to look for: its canonical name, the SHA-256 digest of its value
/// and its length in bytes.
pub struct KeyInfo {
    pub name: &'static str,
    pub hash: [u8; 0x20],
    pub len: usize,
}

pub const HEADER_KEK_SOURCE: KeyInfo = KeyInfo {
    name: "header_kek_source",
    hash: [
        0x18, 0x88, 0xCA, 0xED, 0x55, 0x51, 0xB3, 0xED, 0xE0, 0x14, 0x99, 0xE8, 0x7C, 0xE0, 0xD8,
        0x68, 0x27, 0xF8, 0x08, 0x20, 0xEF, 0xB2, 0x75, 0x92, 0x10, 0x55, 0xAA, 0x4E, 0x2A, 0xBD,
        0xFF, 0xC2,
    ],
    len: 0x10,
};

pub const HEADER_KEY_SOURCE: KeyInfo = KeyInfo {
    name: "header_key_source",
    hash: [
        0x8F, 0x78, 0x3E, 0x46, 0x85, 0x2D, 0xF6, 0xBE, 0x0B, 0xA4, 0xE1, 0x92, 0x73, 0xC4, 0xAD,
        0xBA, 0xEE, 0x16, 0x38, 0x00, 0x43, 0xE1, 0xB8, 0xC4, 0x18, 0xC4, 0x08, 0x9A, 0x8B, 0xD6,
        0x4A, 0xA6,
    ],
    len: 0x20,
};

pub const KEY_AREA_KEY_APPLICATION_SOURCE: KeyInfo = KeyInfo {
    name: "key_area_key_application_source",
    hash: [
        0x04, 0xAD, 0x66, 0x14, 0x3C, 0x72, 0x6B, 0x2A, 0x13, 0x9F, 0xB6, 0xB2, 0x11, 0x28, 0xB4,
        0x6F, 0x56, 0xC5, 0x53, 0xB2, 0xB3, 0x88, 0x71, 0x10, 0x30, 0x42, 0x98, 0xD8, 0xD0, 0x09,
        0x2D, 0x9E,
    ],
    len: 0x10,
};

pub const KEY_AREA_KEY_OCEAN_SOURCE: KeyInfo = KeyInfo {
    name: "key_area_key_ocean_source",
    hash: [
        0xFD, 0x43, 0x40, 0x00, 0xC8, 0xFF, 0x2B, 0x26, 0xF8, 0xE9, 0xA9, 0xD2, 0xD2, 0xC1, 0x2F,
        0x6B, 0xE5, 0x77, 0x3C, 0xBB, 0x9D, 0xC8, 0x63, 0x00, 0xE1, 0xBD, 0x99, 0xF8, 0xEA, 0x33,
        0xA4, 0x17,
    ],
    len: 0x10,
};

pub const KEY_AREA_KEY_SYSTEM_SOURCE: KeyInfo = KeyInfo {
    name: "key_area_key_system_source",
    hash: [
        0x1F, 0x17, 0xB1, 0xFD, 0x51, 0xAD, 0x1C, 0x23, 0x79, 0xB5, 0x8F, 0x15, 0x2C, 0xA4, 0x91,
        0x2E, 0xC2, 0x10, 0x64, 0x41, 0xE5, 0x17, 0x22, 0xF3, 0x87, 0x00, 0xD5, 0x93, 0x7A, 0x11,
        0x62, 0xF7,
    ],
    len: 0x10,
};

/// Scannable key material: either a plain byte slice or a concatenation of
/// process-memory pages.
///
/// `scan` calls `visit` with every `window`-sized slice in order and stops
/// early when the callback returns true. The return value reports whether
/// the callback ever matched.
pub trait KeySegment {
    fn scan(&self, window: usize, visit: &mut dyn FnMut(&[u8]) -> bool) -> bool;
}

impl KeySegment for [u8] {
    fn scan(&self, window: usize, visit: &mut dyn FnMut(&[u8]) -> bool) -> bool {
        if window == 0 || self.len() < window {
            return false;
        }
        for chunk in self.windows(window) {
            if visit(chunk) {
                return true;
            }
        }
        false
    }
}

/// Memory pages read from a running process, concatenated in mapping
/// order. Windows may straddle page boundaries, so the pages are flattened
/// before scanning.
#[derive(Default)]
pub struct SegmentDump {
    data: Vec<u8>,
}

impl SegmentDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&mut self, page: &[u8]) {
        self.data.extend_from_slice(page);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KeySegment for SegmentDump {
    fn scan(&self, window: usize, visit: &mut dyn FnMut(&[u8]) -> bool) -> bool {
        self.data.as_slice().scan(window, visit)
    }
}

/// Finds a key in a segment by its digest. First match wins.
pub fn find_key<T: KeySegment + ?Sized>(
    segment: &T,
    info: &KeyInfo,
) -> Result<Vec<u8>, KeyVaultError> {
    let mut found = None;
    segment.scan(info.len, &mut |window| {
        let digest: [u8; 0x20] = Sha256::digest(window).into();
        if digest == info.hash {
            found = Some(window.to_vec());
            true
        } else {
            false
        }
    });

    found.ok_or(KeyVaultError::ScanMiss(info.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key_info(value: &[u8]) -> KeyInfo {
        KeyInfo {
            name: "test_key_source",
            hash: Sha256::digest(value).into(),
            len: value.len(),
        }
    }

    #[test]
    fn finds_key_in_slice() {
        let key = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        let mut blob = vec![0u8; 0x100];
        blob[0x37..0x37 + key.len()].copy_from_slice(&key);

        let info = test_key_info(&key);
        let found = find_key(&blob[..], &info).unwrap();
        assert_eq!(found, key);
    }

    #[test]
    fn finds_key_across_page_boundary() {
        let key = [0xAAu8; 0x10];
        let mut dump = SegmentDump::new();
        let mut page_a = vec![0u8; 0x1000];
        // Key starts 8 bytes before the end of the first page.
        page_a[0x1000 - 8..].copy_from_slice(&key[..8]);
        let mut page_b = vec![0u8; 0x1000];
        page_b[..8].copy_from_slice(&key[8..]);
        dump.push_page(&page_a);
        dump.push_page(&page_b);

        let info = test_key_info(&key);
        assert_eq!(find_key(&dump, &info).unwrap(), key);
    }

    #[test]
    fn reports_miss() {
        let blob = vec![0u8; 0x40];
        let info = test_key_info(&[0x55u8; 0x10]);
        assert!(matches!(
            find_key(&blob[..], &info),
            Err(KeyVaultError::ScanMiss("test_key_source"))
        ));
    }
}
