//! Ticket enumeration and title-key resolution.
//!
//! Tickets live as fixed 0x400-byte records inside the ES system saves.
//! A rights-id is first matched against the installed common and
//! personalized ticket lists, then the matching record is located by
//! streaming the save. Common tickets carry the encrypted titlekey
//! directly; personalized ones wrap it in an RSA-OAEP block keyed to the
//! console's eTicket device key.

use std::io::Read;

use binrw::prelude::*;

use crate::crypto::aes::ecb_decrypt_block;
use crate::crypto::rsa::{self, NULL_HASH};
use crate::error::{Error, TicketError};
use crate::keys::KeyVault;

/// Raw record size inside the ES save.
pub const TICKET_RECORD_SIZE: usize = 0x400;
/// Size of an exported `.tik` artifact.
pub const TICKET_FILE_SIZE: usize = 0x2C0;
/// CA certificate size within an exported chain.
pub const CA_CERT_SIZE: usize = 0x400;
/// XS certificate size within an exported chain.
pub const XS_CERT_SIZE: usize = 0x300;
/// Size of an exported `.cert` artifact (CA + XS).
pub const CERT_CHAIN_SIZE: usize = CA_CERT_SIZE + XS_CERT_SIZE;

pub const SIGTYPE_RSA2048_SHA256: u32 = 0x10004;

/// Whether a rights-id is licensed through a common or personalized
/// ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Common,
    Personalized,
}

/// Parsed RSA-2048-SHA256 ticket (0x2C0 bytes: 0x140 signature area +
/// 0x180 body).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct TicketRecord {
    pub sig_type: u32,
    pub signature: [u8; 0x100],
    pub _sig_padding: [u8; 0x3C],
    pub sig_issuer: [u8; 0x40],
    /// Common: the 16-byte encrypted titlekey, zero padded.
    /// Personalized: a 0x100-byte RSA-OAEP ciphertext.
    pub titlekey_block: [u8; 0x100],
    pub _unk1: u8,
    /// 0 = common, 1 = personalized.
    pub titlekey_type: u8,
    pub _unk2: [u8; 3],
    /// Picks the titlekek generation that decrypts the titlekey.
    pub master_key_rev: u8,
    pub _unk3: [u8; 0xA],
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: [u8; 0x10],
    pub account_id: u32,
    pub _unk4: [u8; 0xC],
}

impl TicketRecord {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let record: Self = binrw::io::Cursor::new(bytes).read_le()?;
        Ok(record)
    }

    /// Serializes the `.tik` artifact.
    pub fn to_tik_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.write_le(&mut cursor)?;
        let bytes = cursor.into_inner();
        debug_assert_eq!(bytes.len(), TICKET_FILE_SIZE);
        Ok(bytes)
    }

    pub fn rights_id_hex(&self) -> String {
        hex::encode(self.rights_id)
    }
}

/// Access to the installed ticket state. Implemented by the embedder on
/// top of the ES service and the mounted system saves.
pub trait TicketEnumerator {
    fn common_rights_ids(&self) -> Result<Vec<[u8; 0x10]>, Error>;
    fn personalized_rights_ids(&self) -> Result<Vec<[u8; 0x10]>, Error>;
    /// Streams the raw ticket save holding records of the given kind.
    fn open_ticket_save(&self, kind: TicketKind) -> Result<Box<dyn Read + '_>, Error>;
    /// CA + XS certificate chain matching the ticket kind.
    fn certificate_chain(&self, kind: TicketKind) -> Result<Vec<u8>, Error>;
}

/// A fully resolved titlekey for a rights-id.
pub struct ResolvedTitleKey {
    pub kind: TicketKind,
    pub ticket: TicketRecord,
    /// Encrypted titlekey (input to the titlekek decryption).
    pub enc_title_key: [u8; 0x10],
    /// Ready for section decryption.
    pub dec_title_key: [u8; 0x10],
}

/// Resolves the titlekey for a rights-id at the given crypto generation.
pub fn resolve_title_key(
    rights_id: &[u8; 0x10],
    generation: u8,
    enumerator: &dyn TicketEnumerator,
    vault: &KeyVault,
) -> Result<ResolvedTitleKey, Error> {
    let kind = if enumerator.common_rights_ids()?.contains(rights_id) {
        TicketKind::Common
    } else if enumerator.personalized_rights_ids()?.contains(rights_id) {
        TicketKind::Personalized
    } else {
        return Err(TicketError::NotInstalled(hex::encode(rights_id)).into());
    };

    tracing::trace!(
        rights_id = %hex::encode(rights_id),
        kind = ?kind,
        "Rights id is installed"
    );

    let ticket = locate_ticket_record(rights_id, enumerator.open_ticket_save(kind)?.as_mut())?;

    let enc_title_key: [u8; 0x10] = match kind {
        TicketKind::Common => ticket.titlekey_block[..0x10].try_into().unwrap(),
        TicketKind::Personalized => {
            let device_key = vault.device_key()?;
            let ciphertext: [u8; 0x100] = ticket.titlekey_block;
            let em = device_key.private_exp(&ciphertext);

            let payload =
                rsa::oaep_decrypt_and_verify(&em, &NULL_HASH).map_err(|_| TicketError::Oaep)?;
            payload
                .as_slice()
                .try_into()
                .map_err(|_| TicketError::Oaep)?
        }
    };

    let titlekek = vault.titlekek(generation)?;
    let dec_title_key = ecb_decrypt_block(&titlekek, &enc_title_key);

    Ok(ResolvedTitleKey {
        kind,
        ticket,
        enc_title_key,
        dec_title_key,
    })
}

/// Streams a ticket save in fixed records and returns the one matching
/// the rights-id. Records with foreign signature types are skipped.
fn locate_ticket_record(
    rights_id: &[u8; 0x10],
    save: &mut dyn Read,
) -> Result<TicketRecord, Error> {
    let mut record = [0u8; TICKET_RECORD_SIZE];
    loop {
        match save.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TicketError::RecordNotFound.into());
            }
            Err(e) => return Err(e.into()),
        }

        let sig_type = u32::from_le_bytes(record[..4].try_into().unwrap());
        if sig_type != SIGTYPE_RSA2048_SHA256 {
            continue;
        }

        // rights_id lives at 0x2A0 in the record body.
        if &record[0x2A0..0x2B0] == rights_id.as_slice() {
            let parsed = TicketRecord::from_bytes(&record[..TICKET_FILE_SIZE])?;
            if parsed.sig_type != SIGTYPE_RSA2048_SHA256 {
                return Err(TicketError::BadSignatureType(parsed.sig_type).into());
            }
            return Ok(parsed);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub struct MockTicketStore {
        pub common: Vec<[u8; 0x10]>,
        pub personalized: Vec<[u8; 0x10]>,
        pub common_save: Vec<u8>,
        pub personalized_save: Vec<u8>,
    }

    impl TicketEnumerator for MockTicketStore {
        fn common_rights_ids(&self) -> Result<Vec<[u8; 0x10]>, Error> {
            Ok(self.common.clone())
        }

        fn personalized_rights_ids(&self) -> Result<Vec<[u8; 0x10]>, Error> {
            Ok(self.personalized.clone())
        }

        fn open_ticket_save(&self, kind: TicketKind) -> Result<Box<dyn Read + '_>, Error> {
            let save = match kind {
                TicketKind::Common => &self.common_save,
                TicketKind::Personalized => &self.personalized_save,
            };
            Ok(Box::new(save.as_slice()))
        }

        fn certificate_chain(&self, _kind: TicketKind) -> Result<Vec<u8>, Error> {
            Ok(vec![0xCE; CERT_CHAIN_SIZE])
        }
    }

    /// Builds a raw 0x400 save record.
    pub fn build_record(
        sig_type: u32,
        rights_id: &[u8; 0x10],
        titlekey_block: &[u8],
        titlekey_type: u8,
        master_key_rev: u8,
    ) -> Vec<u8> {
        let mut record = vec![0u8; TICKET_RECORD_SIZE];
        record[..4].copy_from_slice(&sig_type.to_le_bytes());
        record[0x180..0x180 + titlekey_block.len()].copy_from_slice(titlekey_block);
        record[0x281] = titlekey_type;
        record[0x285] = master_key_rev;
        record[0x2A0..0x2B0].copy_from_slice(rights_id);
        record
    }
}
