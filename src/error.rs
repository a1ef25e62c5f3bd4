//! Error types for the storage engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine.
///
/// Each variant maps to one of four kinds: invalid argument
/// (`KeyTooLarge`, `ValueTooLarge`, `InvalidPage`), I/O failure (`Io`),
/// out of space (`OutOfSpace`), and corruption (`Corruption`).
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system or memory map.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page does not exist.
    #[error("page {0} not found")]
    PageNotFound(PageId),

    /// A node's serialized payload does not fit in the remaining page
    /// capacity. Signals the caller to split rather than retry.
    #[error("page {page_id} is full, need {needed} bytes but only {available} available")]
    PageFull {
        page_id: PageId,
        needed: usize,
        available: usize,
    },

    /// The index file has exhausted `MAX_PAGES`.
    #[error("out of space: the store has reached its maximum of {max_pages} pages")]
    OutOfSpace { max_pages: u32 },

    /// Key exceeds `MAX_KEY_SIZE`.
    #[error("key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds `MAX_VALUE_SIZE`.
    #[error("value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// The file header's magic number did not match, or a node's byte
    /// layout violates an invariant the codec depends on.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A page's contents could not be interpreted the way the caller
    /// expected (e.g. reading an internal node's child out of range).
    #[error("invalid page: {0}")]
    InvalidPage(String),
}

impl StorageError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn invalid_page(msg: impl Into<String>) -> Self {
        Self::InvalidPage(msg.into())
    }
}
