//! AES-128 building blocks: ECB, CBC, CTR, XTS and CCM.
//!
//! The XTS tweak and the CTR counter layout are both non-standard: the
//! tweak is the sector index in big-endian, and the CTR counter packs the
//! section counter in the upper 8 bytes with the block offset in the lower
//! 8 bytes, again big-endian.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use ccm::aead::Payload;
use ccm::consts::{U12, U16};
use ccm::{Ccm, aead::Aead};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use xts_mode::Xts128;

use crate::error::CryptoError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128Ccm = Ccm<Aes128, U16, U12>;

/// Builds a tweak for the XTS header crypto.
///
/// The endianness is reversed compared to a standard XTS tweak.
pub fn nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// Composes a CTR IV from a section counter and an absolute byte offset.
pub fn nintendo_ctr_iv(ctr: u64, offset: u64) -> [u8; 0x10] {
    (((ctr as u128) << 64) | ((offset >> 4) as u128)).to_be_bytes()
}

/// Creates an XTS128 cipher from a 32-byte header key.
///
/// The first half keys the data unit, the second half the tweak.
pub fn xts_cipher(key: &[u8; 0x20]) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(&key[..0x10]));
    let cipher_2 = Aes128::new(GenericArray::from_slice(&key[0x10..]));
    Xts128::new(cipher_1, cipher_2)
}

/// Encrypts a single 16-byte block with AES-128-ECB.
pub fn ecb_encrypt_block(key: &[u8; 0x10], block: &[u8; 0x10]) -> [u8; 0x10] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Decrypts a single 16-byte block with AES-128-ECB.
pub fn ecb_decrypt_block(key: &[u8; 0x10], block: &[u8; 0x10]) -> [u8; 0x10] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

/// Decrypts a block-aligned buffer in place with AES-128-ECB.
pub fn ecb_decrypt(key: &[u8; 0x10], data: &mut [u8]) -> Result<(), CryptoError> {
    let decryptor = Aes128EcbDec::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength("AES-128-ECB"))?;
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::InvalidKeyLength("AES-128-ECB data"))?;
    Ok(())
}

/// Decrypts a block-aligned buffer in place with AES-128-CBC. No padding.
pub fn cbc_decrypt(key: &[u8; 0x10], iv: &[u8; 0x10], data: &mut [u8]) -> Result<(), CryptoError> {
    let decryptor = Aes128CbcDec::new(key.into(), iv.into());
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| CryptoError::InvalidKeyLength("AES-128-CBC data"))?;
    Ok(())
}

/// Applies the AES-128-CTR keystream in place. Encrypt and decrypt are the
/// same operation.
pub fn ctr_crypt(key: &[u8; 0x10], iv: &[u8; 0x10], data: &mut [u8]) {
    let mut cipher = ctr::Ctr128BE::<Aes128>::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Decrypts and verifies an AES-128-CCM payload (16-byte MAC, 12-byte
/// nonce). `ciphertext_and_tag` is the ciphertext followed by the MAC.
pub fn ccm_decrypt(
    key: &[u8; 0x10],
    nonce: &[u8; 0xC],
    ciphertext_and_tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext_and_tag,
                aad: b"",
            },
        )
        .map_err(|_| CryptoError::Aead)
}

#[cfg(test)]
pub(crate) fn ccm_encrypt(key: &[u8; 0x10], nonce: &[u8; 0xC], plaintext: &[u8]) -> Vec<u8> {
    use ccm::aead::Aead;
    let cipher = Aes128Ccm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: b"",
            },
        )
        .unwrap()
}
