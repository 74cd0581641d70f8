use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("File has incorrect magic - possibly wrong file format")]
    BadMagic,

    #[error("Truncated data: needed {expected} bytes, had {actual}")]
    TruncatedData { expected: usize, actual: usize },

    #[error("Data checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported BLTE encoding type: {0:#04x}")]
    UnsupportedBlteEncoding(u8),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Manifest is missing required field '{0}'")]
    MissingField(String),

    #[error("Manifest has no data rows")]
    EmptyManifest,

    #[error("Unsupported hash size: {0}")]
    UnsupportedHashSize(u8),

    #[error("No usable CDN host in manifest")]
    NoUsableHost,

    #[error("CDN returned status {0}")]
    CdnStatus(u16),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
