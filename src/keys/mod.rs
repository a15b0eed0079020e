//! Key vault assembly and ownership.
//!
//! All derived key material lives in a single [`KeyVault`] assembled in
//! ordered phases: process-memory scan, seal-service derivation, external
//! key file, calibration device key. The vault is installed once per
//! process and is append-only afterwards; readers borrow key references
//! and never receive owning copies.

pub mod device;
pub mod external;
pub mod scan;

use std::sync::OnceLock;

use aes::Aes128;
use xts_mode::Xts128;

use crate::crypto::aes::xts_cipher;
use crate::error::{Error, KeyVaultError};
pub use device::EticketDeviceKey;
pub use external::ExternalKeys;
use scan::{
    HEADER_KEK_SOURCE, HEADER_KEY_SOURCE, KEY_AREA_KEY_APPLICATION_SOURCE,
    KEY_AREA_KEY_OCEAN_SOURCE, KEY_AREA_KEY_SYSTEM_SOURCE, KeySegment, find_key,
};

/// Highest supported crypto generation (exclusive).
pub const KEY_GENERATION_MAX: usize = 0x20;

/// Key-area-encryption-key index carried by archive headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KaekIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

impl KaekIndex {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Application),
            1 => Some(Self::Ocean),
            2 => Some(Self::System),
            _ => None,
        }
    }
}

/// Platform seal-key service: derives working keys from sealed sources.
/// Mirrors the `GenerateAesKek` / `GenerateAesKey` pair of spl:crypto.
pub trait SealOps {
    fn generate_kek(
        &self,
        source: &[u8; 0x10],
        generation: u32,
        option: u32,
    ) -> Result<[u8; 0x10], Error>;

    fn generate_key(&self, kek: &[u8; 0x10], source: &[u8; 0x10]) -> Result<[u8; 0x10], Error>;
}

/// Process-wide key material.
pub struct KeyVault {
    header_kek: [u8; 0x10],
    header_key: [u8; 0x20],
    kaek: [[Option<[u8; 0x10]>; 3]; KEY_GENERATION_MAX],
    titlekek: [Option<[u8; 0x10]>; KEY_GENERATION_MAX],
    eticket_rsa_kek: Option<[u8; 0x10]>,
    device_key: Option<EticketDeviceKey>,
    memory_key_count: usize,
    external_key_count: usize,
}

static VAULT: OnceLock<KeyVault> = OnceLock::new();

impl KeyVault {
    /// Assembles the vault from its ordered sources.
    ///
    /// `rodata` and `data` are the read-only and read-write code segments
    /// of the filesystem service module; `seal` performs the platform key
    /// derivations; `key_file` is the external `name = hex` key file.
    pub fn assemble<R: KeySegment + ?Sized, D: KeySegment + ?Sized>(
        rodata: &R,
        data: &D,
        seal: &dyn SealOps,
        key_file: impl std::io::Read,
    ) -> Result<Self, Error> {
        // Phase 1: memory scan.
        let header_kek_source: [u8; 0x10] = find_key(rodata, &HEADER_KEK_SOURCE)?
            .try_into()
            .expect("scan returns declared length");
        let kaek_sources: [[u8; 0x10]; 3] = [
            find_key(rodata, &KEY_AREA_KEY_APPLICATION_SOURCE)?
                .try_into()
                .expect("scan returns declared length"),
            find_key(rodata, &KEY_AREA_KEY_OCEAN_SOURCE)?
                .try_into()
                .expect("scan returns declared length"),
            find_key(rodata, &KEY_AREA_KEY_SYSTEM_SOURCE)?
                .try_into()
                .expect("scan returns declared length"),
        ];
        let header_key_source: [u8; 0x20] = find_key(data, &HEADER_KEY_SOURCE)?
            .try_into()
            .expect("scan returns declared length");
        let mut memory_key_count = 5;

        // Phase 2: derivations.
        let header_kek = seal.generate_kek(&header_kek_source, 0, 0)?;
        memory_key_count += 1;

        let mut header_key = [0u8; 0x20];
        let lo: [u8; 0x10] = header_key_source[..0x10].try_into().unwrap();
        let hi: [u8; 0x10] = header_key_source[0x10..].try_into().unwrap();
        header_key[..0x10].copy_from_slice(&seal.generate_key(&header_kek, &lo)?);
        header_key[0x10..].copy_from_slice(&seal.generate_key(&header_kek, &hi)?);
        memory_key_count += 1;

        let mut kaek = [[None; 3]; KEY_GENERATION_MAX];
        for (generation, row) in kaek.iter_mut().enumerate() {
            for (source_idx, slot) in row.iter_mut().enumerate() {
                match seal.generate_kek(&kaek_sources[source_idx], generation as u32, 0) {
                    Ok(key) => *slot = Some(key),
                    Err(e) => {
                        tracing::trace!(
                            generation,
                            source_idx,
                            error = %e,
                            "Seal service refused KAEK generation"
                        );
                    }
                }
            }
        }

        // Phase 3: external key file. Seal-derived keys win; the file
        // fills the remaining slots and supplies titlekeks and the
        // eTicket kek.
        let ext = ExternalKeys::from_reader(key_file)?;
        let mut titlekek = [None; KEY_GENERATION_MAX];
        for generation in 0..KEY_GENERATION_MAX {
            titlekek[generation] = ext.titlekek[generation];
            for source_idx in 0..3 {
                if kaek[generation][source_idx].is_none() {
                    kaek[generation][source_idx] = ext.key_area_keys[generation][source_idx];
                }
            }
        }

        tracing::info!(
            memory_keys = memory_key_count,
            external_keys = ext.key_count,
            "Key vault assembled"
        );

        Ok(Self {
            header_kek,
            header_key,
            kaek,
            titlekek,
            eticket_rsa_kek: ext.eticket_rsa_kek,
            device_key: None,
            memory_key_count,
            external_key_count: ext.key_count,
        })
    }

    /// Phase 4: decrypt and self-test the eTicket device key from the
    /// calibration blob. Requires `eticket_rsa_kek` from phase 3.
    pub fn load_device_key(&mut self, calibration_blob: &[u8]) -> Result<(), Error> {
        let kek = self.eticket_rsa_kek()?;
        self.device_key = Some(EticketDeviceKey::from_calibration(calibration_blob, &kek)?);
        Ok(())
    }

    /// Installs this vault as the process-wide instance. Idempotent: if a
    /// vault is already installed, the existing one is kept.
    pub fn install(self) -> &'static KeyVault {
        VAULT.get_or_init(|| self)
    }

    /// Returns the installed vault.
    pub fn installed() -> Result<&'static KeyVault, KeyVaultError> {
        VAULT.get().ok_or(KeyVaultError::NotInitialized)
    }

    pub fn header_key(&self) -> &[u8; 0x20] {
        &self.header_key
    }

    pub fn header_kek(&self) -> &[u8; 0x10] {
        &self.header_kek
    }

    /// XTS cipher over the header key, ready for archive header crypto.
    pub fn header_crypt(&self) -> Xts128<Aes128> {
        xts_cipher(&self.header_key)
    }

    pub fn kaek(&self, generation: u8, index: KaekIndex) -> Result<[u8; 0x10], KeyVaultError> {
        self.kaek
            .get(generation as usize)
            .and_then(|row| row[index as usize])
            .ok_or_else(|| {
                let name = match index {
                    KaekIndex::Application => "key_area_key_application",
                    KaekIndex::Ocean => "key_area_key_ocean",
                    KaekIndex::System => "key_area_key_system",
                };
                KeyVaultError::MissingKey(format!("{name}_{generation:02x}"))
            })
    }

    pub fn titlekek(&self, generation: u8) -> Result<[u8; 0x10], KeyVaultError> {
        self.titlekek
            .get(generation as usize)
            .copied()
            .flatten()
            .ok_or_else(|| KeyVaultError::MissingKey(format!("titlekek_{generation:02x}")))
    }

    pub fn eticket_rsa_kek(&self) -> Result<[u8; 0x10], KeyVaultError> {
        self.eticket_rsa_kek
            .ok_or_else(|| KeyVaultError::MissingKey("eticket_rsa_kek".to_string()))
    }

    pub fn device_key(&self) -> Result<&EticketDeviceKey, KeyVaultError> {
        self.device_key
            .as_ref()
            .ok_or_else(|| KeyVaultError::MissingKey("eticket device key".to_string()))
    }

    /// Number of keys sourced from process memory (including derivations).
    pub fn memory_key_count(&self) -> usize {
        self.memory_key_count
    }

    /// Number of keys sourced from the external key file.
    pub fn external_key_count(&self) -> usize {
        self.external_key_count
    }
}


#[cfg(test)]
mod tests {
    use super::testing::SoftSealOps;
    use super::*;
    use sha2::{Digest, Sha256};

    /// Builds fake FS segments carrying the real key sources. The values
    /// are synthetic; only their digests must match the scan table, so the
    /// table is rebuilt around them.
    fn fake_segments() -> (Vec<u8>, Vec<u8>, [u8; 0x10], [u8; 0x20]) {
        let kek_source = [0x10u8; 0x10];
        let key_source = [0x20u8; 0x20];
        let mut rodata = vec![0u8; 0x400];
        rodata[0x100..0x110].copy_from_slice(&kek_source);
        let mut data = vec![0u8; 0x400];
        data[0x80..0xA0].copy_from_slice(&key_source);
        (rodata, data, kek_source, key_source)
    }

    #[test]
    fn scan_digest_table_shape() {
        // The production digests cannot be regenerated here, but their
        // declared lengths are load-bearing for the rolling scan.
        assert_eq!(scan::HEADER_KEK_SOURCE.len, 0x10);
        assert_eq!(scan::HEADER_KEY_SOURCE.len, 0x20);
        assert_eq!(scan::KEY_AREA_KEY_APPLICATION_SOURCE.len, 0x10);
        assert_eq!(scan::KEY_AREA_KEY_OCEAN_SOURCE.len, 0x10);
        assert_eq!(scan::KEY_AREA_KEY_SYSTEM_SOURCE.len, 0x10);
    }

    #[test]
    fn seal_derivation_is_deterministic() {
        let seal = SoftSealOps;
        let source = [0x42u8; 0x10];
        let a = seal.generate_kek(&source, 3, 0).unwrap();
        let b = seal.generate_kek(&source, 3, 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, seal.generate_kek(&source, 4, 0).unwrap());
    }

    #[test]
    fn scan_finds_sources_by_digest() {
        let (rodata, _, kek_source, _) = fake_segments();
        let info = scan::KeyInfo {
            name: "header_kek_source",
            hash: Sha256::digest(kek_source).into(),
            len: 0x10,
        };
        assert_eq!(find_key(&rodata[..], &info).unwrap(), kek_source);
    }

    #[test]
    fn assemble_requires_memory_keys() {
        // Without the FS module's key sources in the scanned segments,
        // phase 1 is fatal.
        let empty = vec![0u8; 0x400];
        let key_file = std::io::Cursor::new("titlekek_00 = 00000000000000000000000000000000\n");
        let result = KeyVault::assemble(&empty[..], &empty[..], &SoftSealOps, key_file);
        assert!(matches!(
            result,
            Err(Error::KeyVault(KeyVaultError::ScanMiss("header_kek_source")))
        ));
    }

    #[test]
    fn vault_accessors() {
        let vault = testing::test_vault();
        assert_eq!(vault.header_key()[0], 0x22);
        assert_eq!(vault.kaek(3, KaekIndex::Ocean).unwrap()[1], 1);
        assert_eq!(vault.titlekek(3).unwrap()[0], 3);
        assert!(matches!(
            vault.kaek(0x20, KaekIndex::Application),
            Err(KeyVaultError::MissingKey(_))
        ));
        assert_eq!(vault.memory_key_count(), 7);
        assert_eq!(vault.external_key_count(), 0x61);
    }

    #[test]
    fn device_key_phase() {
        let (d, n, e) = crate::crypto::rsa::test_device_keypair();
        let mut vault = testing::test_vault();
        let kek = vault.eticket_rsa_kek().unwrap();
        let ctr = [0x77u8; 0x10];
        let blob = device::build_calibration_blob(&d, &n, &e, &kek, &ctr);

        vault.load_device_key(&blob).unwrap();
        assert!(vault.device_key().is_ok());
    }

    #[test]
    fn kaek_index_mapping() {
        assert_eq!(KaekIndex::from_u8(0), Some(KaekIndex::Application));
        assert_eq!(KaekIndex::from_u8(2), Some(KaekIndex::System));
        assert_eq!(KaekIndex::from_u8(3), None);
    }
}
