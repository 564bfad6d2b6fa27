//! Storage error types.
//!
//! All storage operations return `Result<T>` aliased to
//! `Result<T, Error>`, so callers can propagate with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read targeted an offset below the lowest or above the highest
    /// offset currently held by the log.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    /// An index read or write ran past the mapped capacity. On the append
    /// path this is the segment rotation trigger.
    #[error("end of index")]
    EndOfIndex,

    #[error("record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("record encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("malformed segment file name: {0}")]
    MalformedSegmentName(String),
}
