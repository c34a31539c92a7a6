//! Protocol error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid service tag: 0x{0:02x}")]
    InvalidServiceTag(u8),

    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Invalid frame count: expected {expected}, got {got}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("Frame is not a single byte: {what} ({len} bytes)")]
    MalformedFrame { what: &'static str, len: usize },

    #[error("Payload truncated while reading {what}")]
    Truncated { what: &'static str },

    #[error("Declared length {len} exceeds remaining payload ({remaining} bytes)")]
    LengthOverrun { len: u64, remaining: usize },

    #[error("{remaining} trailing bytes after payload")]
    TrailingBytes { remaining: usize },

    #[error("Invalid job state byte: {0}")]
    InvalidJobState(u8),

    #[error("Invalid content source flag: {0}")]
    InvalidContentSource(u8),

    #[error("Invalid content encoding flag: {0}")]
    InvalidContentEncoding(u8),

    #[error("Duplicate content key in submission: {0}")]
    DuplicateContentKey(String),

    #[error("Invalid UTF-8 in {what}")]
    InvalidUtf8 { what: &'static str },
}
