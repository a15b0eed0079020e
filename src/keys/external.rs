//! External key file parsing (`prod.keys` style).
//!
//! One `name = hex` pair per line; `,` is accepted in place of `=`.
//! Blank lines and `#` comments are ignored, names are case-insensitive
//! and surrounding whitespace is tolerated.

use std::io::{BufRead, BufReader, Read};

use hex::FromHex;
use tracing::warn;

use crate::error::{Error, KeyVaultError};
use crate::keys::KEY_GENERATION_MAX;

/// Keys recognized from the external key file.
#[derive(Default)]
pub struct ExternalKeys {
    pub eticket_rsa_kek: Option<[u8; 0x10]>,
    pub titlekek: [Option<[u8; 0x10]>; KEY_GENERATION_MAX],
    /// Indexed `[generation][source]`, sources being application / ocean /
    /// system in that order.
    pub key_area_keys: [[Option<[u8; 0x10]>; 3]; KEY_GENERATION_MAX],
    pub key_count: usize,
}

impl ExternalKeys {
    /// Parses the key file. An unreadable file or a parse yielding zero
    /// recognized keys is fatal.
    pub fn from_reader(reader: impl Read) -> Result<Self, Error> {
        let mut keys = ExternalKeys::default();

        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(sep) = line.find(['=', ',']) else {
                continue;
            };

            let name = line[..sep].trim().to_ascii_lowercase();
            let value = line[sep + 1..].trim();
            if name.is_empty() {
                continue;
            }

            let Ok(data) = Vec::from_hex(value) else {
                warn!(key = %name, "Ignoring key with invalid hex value");
                continue;
            };

            keys.store(&name, &data);
        }

        if keys.key_count == 0 {
            return Err(KeyVaultError::EmptyKeyFile.into());
        }

        tracing::info!(count = keys.key_count, "Loaded external keys");
        Ok(keys)
    }

    fn store(&mut self, name: &str, data: &[u8]) {
        let mut put = |slot: &mut Option<[u8; 0x10]>| {
            if data.len() == 0x10 {
                let mut key = [0u8; 0x10];
                key.copy_from_slice(data);
                *slot = Some(key);
                self.key_count += 1;
            } else {
                warn!(key = %name, len = data.len(), "Unexpected key length");
            }
        };

        if name == "eticket_rsa_kek" {
            put(&mut self.eticket_rsa_kek);
            return;
        }

        let Some((prefix, gen_str)) = name.rsplit_once('_') else {
            return;
        };
        let Ok(generation) = usize::from_str_radix(gen_str, 16) else {
            return;
        };
        if generation >= KEY_GENERATION_MAX {
            return;
        }

        match prefix {
            "titlekek" => put(&mut self.titlekek[generation]),
            "key_area_key_application" => put(&mut self.key_area_keys[generation][0]),
            "key_area_key_ocean" => put(&mut self.key_area_keys[generation][1]),
            "key_area_key_system" => put(&mut self.key_area_keys[generation][2]),
            _ => {}
        }
    }
}
