use std::io;
use thiserror::Error;

/// Unified error type for every layer of the parser.
///
/// `InvalidFormat` is fatal and only produced while opening an archive;
/// `CorruptBlock` is scoped to one node so callers can skip a damaged
/// message and keep traversing; `NotFound` means a key is missing from an
/// index. A property or child that simply is not there is reported as
/// `None` by the accessor, never as an error.
#[derive(Error, Debug)]
pub enum PstError {
    #[error("invalid archive format: {0}")]
    InvalidFormat(String),
    #[error("corrupt block: {0}")]
    CorruptBlock(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PstError>;
