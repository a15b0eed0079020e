//! RSA-2048 operations: raw modular exponentiation, PSS re-signing with
//! the bundled keypair, and the OAEP private operation used for
//! personalized titlekeys.

use std::sync::OnceLock;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

pub const RSA2048_SIG_SIZE: usize = 0x100;
pub const RSA2048_PUBKEY_SIZE: usize = RSA2048_SIG_SIZE;

/// SHA-256 of the empty string. OAEP titlekey blocks carry this as their
/// label hash.
pub const NULL_HASH: [u8; 0x20] = [
    0xE3, 0xB0, 0xC4, 0x42, 0x98, 0xFC, 0x1C, 0x14, 0x9A, 0xFB, 0xF4, 0xC8, 0x99, 0x6F, 0xB9,
    0x24, 0x27, 0xAE, 0x41, 0xE4, 0x64, 0x9B, 0x93, 0x4C, 0xA4, 0x95, 0x99, 0x1B, 0x78, 0x52,
    0xB8, 0x55,
];

const PSS_SALT_LEN: usize = 0x20;

// Seed for the bundled signing keypair. Deriving the key from a fixed seed
// keeps the pair stable across builds without shipping raw key material.
const SIGNING_KEY_SEED: [u8; 0x20] = *b"nxdump bundled signing keypair!!";

static SIGNING_KEYPAIR: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();

fn signing_keypair() -> &'static (RsaPrivateKey, RsaPublicKey) {
    SIGNING_KEYPAIR.get_or_init(|| {
        let mut rng = ChaCha20Rng::from_seed(SIGNING_KEY_SEED);
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("bundled keypair generation");
        let public = RsaPublicKey::from(&private);
        (private, public)
    })
}

/// Returns the public modulus of the bundled signing keypair as big-endian
/// bytes. Suitable to replace the ACID public key in a program meta file.
pub fn custom_public_key() -> [u8; RSA2048_PUBKEY_SIZE] {
    let (_, public) = signing_keypair();
    let mut out = [0u8; RSA2048_PUBKEY_SIZE];
    let n = public.n().to_bytes_be();
    out[RSA2048_PUBKEY_SIZE - n.len()..].copy_from_slice(&n);
    out
}

/// Generates an RSA-2048-PSS SHA-256 signature over `msg` with the bundled
/// private key. Salt length is 0x20.
pub fn pss_sign(msg: &[u8]) -> Result<[u8; RSA2048_SIG_SIZE], CryptoError> {
    let (private, _) = signing_keypair();
    let digest = Sha256::digest(msg);
    let sig = private
        .sign_with_rng(
            &mut rand::thread_rng(),
            Pss::new_with_salt::<Sha256>(PSS_SALT_LEN),
            &digest,
        )
        .map_err(|e| CryptoError::Signature(e.to_string()))?;

    let mut out = [0u8; RSA2048_SIG_SIZE];
    out[RSA2048_SIG_SIZE - sig.len()..].copy_from_slice(&sig);
    Ok(out)
}

/// Verifies a signature produced by [`pss_sign`] against the bundled
/// public key.
pub fn pss_verify(msg: &[u8], signature: &[u8]) -> bool {
    let (_, public) = signing_keypair();
    let digest = Sha256::digest(msg);
    public
        .verify(
            Pss::new_with_salt::<Sha256>(PSS_SALT_LEN),
            &digest,
            signature,
        )
        .is_ok()
}

/// Raw RSA modular exponentiation for arbitrary exponent lengths.
///
/// The result is left-padded with zeroes to the modulus length.
pub fn mod_exp(base: &[u8], modulus: &[u8], exponent: &[u8]) -> Vec<u8> {
    let b = BigUint::from_bytes_be(base);
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from_bytes_be(exponent);

    let result = b.modpow(&e, &n).to_bytes_be();
    let mut out = vec![0u8; modulus.len()];
    out[modulus.len() - result.len()..].copy_from_slice(&result);
    out
}

/// Round-trip self-test for an RSA key pair: encrypts a known plaintext
/// with `(e, n)` after raising it with `(d, n)` and compares.
pub fn test_key_pair(e: &[u8], d: &[u8], n: &[u8]) -> Result<(), CryptoError> {
    let mut x = [0u8; 0x100];
    x[0xFC..].copy_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);

    let y = mod_exp(&x, n, d);
    let z = mod_exp(&y, n, e);

    if z != x {
        return Err(CryptoError::KeyPair);
    }
    Ok(())
}

/// MGF1 mask generation with SHA-256.
pub fn mgf1(seed: &[u8], mask_len: usize) -> Vec<u8> {
    let mut mask = Vec::with_capacity(mask_len);
    let mut counter = 0u32;

    while mask.len() < mask_len {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        let block = hasher.finalize();
        let take = std::cmp::min(0x20, mask_len - mask.len());
        mask.extend_from_slice(&block[..take]);
        counter += 1;
    }

    mask
}

/// Decodes a raw RSA-OAEP-SHA256 plaintext block and verifies its label
/// hash. Returns the recovered payload.
///
/// `em` is the 0x100-byte result of the private exponentiation. The label
/// hash of titlekey blocks is [`NULL_HASH`].
pub fn oaep_decrypt_and_verify(
    em: &[u8; 0x100],
    label_hash: &[u8; 0x20],
) -> Result<Vec<u8>, CryptoError> {
    // EM = 0x00 || maskedSeed[0x20] || maskedDB[0xDF]
    let seed_mask = mgf1(&em[0x21..], 0x20);
    let mut seed = [0u8; 0x20];
    for (i, b) in seed.iter_mut().enumerate() {
        *b = em[1 + i] ^ seed_mask[i];
    }

    let db_mask = mgf1(&seed, 0xDF);
    let mut db = [0u8; 0xDF];
    for (i, b) in db.iter_mut().enumerate() {
        *b = em[0x21 + i] ^ db_mask[i];
    }

    if &db[..0x20] != label_hash {
        return Err(CryptoError::Oaep);
    }

    // Skip the zero padding string, expect the 0x01 separator.
    let mut idx = 0x20;
    while idx < db.len() && db[idx] == 0 {
        idx += 1;
    }
    if idx >= db.len() || db[idx] != 0x01 {
        return Err(CryptoError::Oaep);
    }

    Ok(db[idx + 1..].to_vec())
}

/// Encodes a payload into a raw OAEP block. Counterpart of
/// [`oaep_decrypt_and_verify`], used to build fixtures.
#[cfg(test)]
pub(crate) fn oaep_encode(
    payload: &[u8],
    label_hash: &[u8; 0x20],
    seed: &[u8; 0x20],
) -> [u8; 0x100] {
    let mut db = [0u8; 0xDF];
    db[..0x20].copy_from_slice(label_hash);
    let sep = 0xDF - payload.len() - 1;
    db[sep] = 0x01;
    db[sep + 1..].copy_from_slice(payload);

    let db_mask = mgf1(seed, 0xDF);
    let mut masked_db = [0u8; 0xDF];
    for i in 0..0xDF {
        masked_db[i] = db[i] ^ db_mask[i];
    }

    let seed_mask = mgf1(&masked_db, 0x20);
    let mut masked_seed = [0u8; 0x20];
    for i in 0..0x20 {
        masked_seed[i] = seed[i] ^ seed_mask[i];
    }

    let mut em = [0u8; 0x100];
    em[1..0x21].copy_from_slice(&masked_seed);
    em[0x21..].copy_from_slice(&masked_db);
    em
}

#[cfg(test)]
pub(crate) fn test_device_keypair() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    use rsa::traits::PrivateKeyParts;

    static DEVICE_KEYPAIR: OnceLock<(Vec<u8>, Vec<u8>, Vec<u8>)> = OnceLock::new();
    DEVICE_KEYPAIR
        .get_or_init(|| {
            // Deterministic device key; generated once per test run.
            let mut rng = ChaCha20Rng::from_seed([0x5Au8; 0x20]);
            let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();

            let pad = |v: Vec<u8>, len: usize| {
                let mut out = vec![0u8; len];
                out[len - v.len()..].copy_from_slice(&v);
                out
            };

            (
                pad(private.d().to_bytes_be(), 0x100),
                pad(private.n().to_bytes_be(), 0x100),
                pad(private.e().to_bytes_be(), 0x4),
            )
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_hash_is_sha256_of_empty_string() {
        assert_eq!(NULL_HASH, crate::crypto::sha256(b""));
    }

    #[test]
    fn pss_sign_round_trip() {
        let msg = [0x5Au8; 0x200];
        let sig = pss_sign(&msg).unwrap();
        assert!(pss_verify(&msg, &sig));

        // A single-bit change to the message must break verification.
        let mut tampered = msg;
        tampered[0x123] ^= 0x01;
        assert!(!pss_verify(&tampered, &sig));
    }

    #[test]
    fn custom_public_key_matches_signer() {
        let n = custom_public_key();
        assert_eq!(n.len(), RSA2048_PUBKEY_SIZE);
        // The modulus of a 2048-bit key has its top bit set.
        assert!(n[0] & 0x80 != 0);
    }

    #[test]
    fn mod_exp_small_numbers() {
        // 4^13 mod 497 = 445
        let out = mod_exp(&[4], &[0x01, 0xF1], &[13]);
        assert_eq!(out, vec![0x01, 0xBD]);
    }

    #[test]
    fn key_pair_self_test() {
        let (d, n, e) = test_device_keypair();
        test_key_pair(&e, &d, &n).unwrap();

        // A corrupted exponent must fail the round trip.
        let mut bad_d = d.clone();
        bad_d[0x80] ^= 0x10;
        assert!(matches!(
            test_key_pair(&e, &bad_d, &n),
            Err(CryptoError::KeyPair)
        ));
    }

    #[test]
    fn mgf1_properties() {
        let mask = mgf1(b"seed", 0x45);
        assert_eq!(mask.len(), 0x45);
        // Deterministic, and a prefix of a longer mask.
        let longer = mgf1(b"seed", 0x60);
        assert_eq!(&longer[..0x45], mask.as_slice());
    }

    #[test]
    fn oaep_round_trip() {
        let titlekey = [0xABu8; 0x10];
        let seed = [0x11u8; 0x20];
        let em = oaep_encode(&titlekey, &NULL_HASH, &seed);

        let payload = oaep_decrypt_and_verify(&em, &NULL_HASH).unwrap();
        assert_eq!(payload, titlekey);
    }

    #[test]
    fn oaep_label_mismatch() {
        let titlekey = [0xABu8; 0x10];
        let seed = [0x11u8; 0x20];
        let mut wrong_label = NULL_HASH;
        wrong_label[0] ^= 0xFF;
        let em = oaep_encode(&titlekey, &wrong_label, &seed);

        assert!(matches!(
            oaep_decrypt_and_verify(&em, &NULL_HASH),
            Err(CryptoError::Oaep)
        ));
    }

    #[test]
    fn oaep_through_rsa() {
        // Full path: encode, public-encrypt, private-decrypt, decode.
        let (d, n, e) = test_device_keypair();
        let titlekey = [0x42u8; 0x10];
        let em = oaep_encode(&titlekey, &NULL_HASH, &[0x77u8; 0x20]);

        let ciphertext = mod_exp(&em, &n, &e);
        let recovered = mod_exp(&ciphertext, &n, &d);
        let block: [u8; 0x100] = recovered.try_into().unwrap();

        let payload = oaep_decrypt_and_verify(&block, &NULL_HASH).unwrap();
        assert_eq!(payload, titlekey);
    }
}
