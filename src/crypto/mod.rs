//! Stateless crypto primitives shared by the container pipeline.
//!
//! AES modes are composed from the RustCrypto cipher crates, RSA operations
//! (PSS re-signing, OAEP titlekey unwrapping, raw modular exponentiation)
//! live in [`rsa`], and CRC-32 streaming state is re-exported from
//! `crc32fast` for dump checksums.

pub mod aes;
pub mod rsa;

pub use crc32fast::Hasher as Crc32;

/// One-shot CRC-32 (IEEE polynomial, reflected).
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// One-shot SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 0x20] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha256_empty_string() {
        assert_eq!(
            sha256(b""),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn crc32_streaming_matches_one_shot() {
        let data = b"123456789";
        assert_eq!(crc32(data), 0xCBF43926);

        let mut hasher = Crc32::new();
        hasher.update(&data[..4]);
        hasher.update(&data[4..]);
        assert_eq!(hasher.finalize(), 0xCBF43926);
    }
}
