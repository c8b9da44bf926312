use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("payload too large")]
    PayloadTooLarge,
    /// Segment has no room left for the requested reservation.
    #[error("segment full")]
    SegmentFull,
    #[error("reservation overflow: {requested} bytes requested, {remaining} remaining")]
    ReservationOverflow { requested: usize, remaining: usize },
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },
    #[error("malformed stop-bit varint")]
    MalformedVarint,
    #[error("record not yet committed")]
    NotYetCommitted,
    #[error("offset out of range")]
    OutOfRange,
    #[error("index {0:#x} precedes retained data")]
    IndexEvicted(u64),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("writer already active")]
    WriterAlreadyActive,
    #[error("store opened read-only")]
    ReadOnly,
    #[error("store closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
