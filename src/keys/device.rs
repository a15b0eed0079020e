//! The per-device eTicket RSA key, recovered from the calibration blob.

use crate::crypto::{aes, rsa};
use crate::error::{Error, KeyVaultError};

/// Offset of the AES-CTR counter within the calibration device-key blob.
const DEVKEY_CTR_OFFSET: usize = 0x0;
/// Offset of the encrypted RSA payload.
const DEVKEY_RSA_OFFSET: usize = 0x10;
/// Size of the encrypted RSA payload: D (0x100) + N (0x100) + E (0x4) and
/// trailing padding.
const DEVKEY_RSA_SIZE: usize = 0x230;
/// Minimum blob size covering counter + payload.
pub const DEVKEY_BLOB_SIZE: usize = DEVKEY_RSA_OFFSET + DEVKEY_RSA_SIZE;

/// The public exponent doubles as a signature-type marker: it must read as
/// RSA-2048-SHA1 (0x00010001) in big-endian.
const SIGTYPE_RSA2048_SHA1: u32 = 0x10001;

/// Decrypted eTicket RSA-2048 private key.
///
/// Components are kept as raw big-endian byte strings; they only ever feed
/// the raw modular exponentiation primitive.
pub struct EticketDeviceKey {
    d: [u8; 0x100],
    n: [u8; 0x100],
    e: [u8; 0x4],
}

impl EticketDeviceKey {
    /// Decrypts and validates the device key from a calibration blob.
    ///
    /// The payload is AES-CTR decrypted with `eticket_rsa_kek` and the
    /// counter stored in the blob, the trailing exponent marker is
    /// checked, and the key pair self-test must round-trip.
    pub fn from_calibration(blob: &[u8], eticket_rsa_kek: &[u8; 0x10]) -> Result<Self, Error> {
        if blob.len() < DEVKEY_BLOB_SIZE {
            return Err(Error::Parse(format!(
                "calibration device key blob too short: {:#x} bytes",
                blob.len()
            )));
        }

        let mut ctr = [0u8; 0x10];
        ctr.copy_from_slice(&blob[DEVKEY_CTR_OFFSET..DEVKEY_CTR_OFFSET + 0x10]);

        let mut payload = blob[DEVKEY_RSA_OFFSET..DEVKEY_RSA_OFFSET + DEVKEY_RSA_SIZE].to_vec();
        aes::ctr_crypt(eticket_rsa_kek, &ctr, &mut payload);

        let marker = u32::from_be_bytes(payload[0x200..0x204].try_into().unwrap());
        if marker != SIGTYPE_RSA2048_SHA1 {
            tracing::warn!(marker = format_args!("{marker:#x}"), "Bad device key marker");
            return Err(KeyVaultError::DevKeyCorrupt.into());
        }

        let mut key = Self {
            d: [0u8; 0x100],
            n: [0u8; 0x100],
            e: [0u8; 0x4],
        };
        key.d.copy_from_slice(&payload[..0x100]);
        key.n.copy_from_slice(&payload[0x100..0x200]);
        key.e.copy_from_slice(&payload[0x200..0x204]);

        rsa::test_key_pair(&key.e, &key.d, &key.n)
            .map_err(|_| KeyVaultError::DevKeyCorrupt)?;

        Ok(key)
    }

    /// Private operation: `ciphertext ^ d mod n`.
    pub fn private_exp(&self, ciphertext: &[u8; 0x100]) -> [u8; 0x100] {
        rsa::mod_exp(ciphertext, &self.n, &self.d)
            .try_into()
            .expect("mod_exp output is modulus-sized")
    }

    /// Public operation: `plaintext ^ e mod n`. Used by round-trip checks.
    pub fn public_exp(&self, plaintext: &[u8; 0x100]) -> [u8; 0x100] {
        rsa::mod_exp(plaintext, &self.n, &self.e)
            .try_into()
            .expect("mod_exp output is modulus-sized")
    }
}

#[cfg(test)]
pub(crate) fn build_calibration_blob(
    d: &[u8],
    n: &[u8],
    e: &[u8],
    kek: &[u8; 0x10],
    ctr: &[u8; 0x10],
) -> Vec<u8> {
    let mut payload = vec![0u8; DEVKEY_RSA_SIZE];
    payload[..0x100].copy_from_slice(d);
    payload[0x100..0x200].copy_from_slice(n);
    payload[0x200..0x204].copy_from_slice(e);
    aes::ctr_crypt(kek, ctr, &mut payload);

    let mut blob = Vec::with_capacity(DEVKEY_BLOB_SIZE);
    blob.extend_from_slice(ctr);
    blob.extend_from_slice(&payload);
    blob
}
