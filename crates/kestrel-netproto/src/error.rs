use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("buffer too short")]
    TooShort,
    #[error("length mismatch (expected {expected}, got {got})")]
    LengthMismatch { expected: usize, got: usize },
    #[error("unknown command tag {0:#04x}")]
    UnknownTag(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("checksum mismatch (expected {expected:#010x}, got {got:#010x})")]
    BadChecksum { expected: u32, got: u32 },
    #[error("field out of range: {0}")]
    FieldRange(&'static str),
}
