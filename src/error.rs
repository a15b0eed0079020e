use thiserror::Error;

/// Crypto primitive failures.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("OAEP padding or label verification failed")]
    Oaep,
    #[error("RSA key pair round-trip test failed")]
    KeyPair,
    #[error("Invalid key length for {0}")]
    InvalidKeyLength(&'static str),
    #[error("RSA signing failed: {0}")]
    Signature(String),
    #[error("AEAD verification failed")]
    Aead,
}

/// Key vault assembly failures.
#[derive(Error, Debug)]
pub enum KeyVaultError {
    #[error("Key \"{0}\" not found in process memory")]
    ScanMiss(&'static str),
    #[error("Key \"{0}\" missing from the external key file")]
    MissingKey(String),
    #[error("External key file contained no recognized keys")]
    EmptyKeyFile,
    #[error("eTicket device key is corrupt or was decrypted with the wrong kek")]
    DevKeyCorrupt,
    #[error("Seal operation failed: {0}")]
    SealOp(String),
    #[error("Key vault has not been initialized")]
    NotInitialized,
}

/// Ticket and title-key resolution failures.
#[derive(Error, Debug)]
pub enum TicketError {
    #[error("No ticket installed for rights ID {0}")]
    NotInstalled(String),
    #[error("OAEP label verification failed while unwrapping the titlekey")]
    Oaep,
    #[error("Ticket record uses unsupported signature type {0:#x}")]
    BadSignatureType(u32),
    #[error("No matching record in the ticket save")]
    RecordNotFound,
}

/// Cartridge storage failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read of {len:#x} bytes at {offset:#x} exceeds trimmed size {trimmed:#x}")]
    OutOfRange { offset: u64, len: u64, trimmed: u64 },
    #[error("Gamecard was ejected mid-operation")]
    Ejected,
    #[error("No gamecard inserted")]
    NotInserted,
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse binary data: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("Unable to parse string: {0}")]
    StringParser(#[from] core::str::Utf8Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Hash mismatch for {entry}")]
    Integrity { entry: String },
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Key vault error: {0}")]
    KeyVault(#[from] KeyVaultError),
    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Not supported: {0}")]
    Unsupported(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<cipher::InvalidLength> for Error {
    fn from(_: cipher::InvalidLength) -> Self {
        Error::Crypto(CryptoError::InvalidKeyLength("cipher key"))
    }
}
