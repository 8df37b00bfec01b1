use thiserror::Error;

/// Largest key or value the entry encoding can frame (lengths are u16).
pub const MAX_ENTRY_COMPONENT: usize = u16::MAX as usize;

/// Error kinds raised by the storage engine. They travel through
/// `anyhow::Result` and can be recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum SiltError {
    /// A key or value exceeds what the entry encoding can frame.
    #[error("key or value of {0} bytes exceeds the {MAX_ENTRY_COMPONENT} byte limit")]
    InvalidInput(usize),

    /// Internal exhaustion sentinel. Never surfaced to library callers;
    /// external iterators expose `is_valid() == false` instead.
    #[error("iterator ended")]
    IteratorEnded,

    /// A decoded block carried zero entries.
    #[error("block has no entries")]
    BlockEmpty,

    /// Checksum mismatch, truncated buffer, or inconsistent metadata while
    /// decoding a table or block. The table is unusable; the engine is not.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// An underlying read or write failed.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a sorted table whose file handle was closed.
    #[error("sorted table is closed")]
    TableClosed,
}
