//! Page store abstraction.
//!
//! This module provides a `PageStore` trait that abstracts over page-based
//! storage, allowing the bulk loader to write into a real database file in
//! production and into an in-memory store (with fault injection) in tests.
//!
//! # Design
//!
//! The trait is a minimal abstraction over the operations the loader needs:
//! - Page read/write operations
//! - Vectored writes of contiguous page runs
//! - File synchronization
//!
//! All methods take `&self`: one store is shared by every flush pipeline
//! and by the merger, so implementations synchronize internally.

use crate::storage::page::{Page, PageId};

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Buffer pool exhausted - no buffers available.
    BufferPoolExhausted,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(
                f,
                "page {page_id} out of bounds (total pages: {total_pages})"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-based storage operations.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_page` returns the last written content for a page
/// - `sync` makes all previous writes durable
/// - writing past the current end of storage extends it
pub trait PageStore: Send + Sync {
    /// Read a page from storage.
    fn read_page(&self, page_id: PageId) -> Result<Page, StorageError>;

    /// Write a page to storage.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    /// Write a run of pages to consecutive page numbers starting at `first`.
    ///
    /// The default implementation writes page by page.
    fn write_pages(&self, first: PageId, pages: &[&Page]) -> Result<(), StorageError> {
        for (page_id, page) in (first..).zip(pages) {
            self.write_page(page_id, page)?;
        }
        Ok(())
    }

    /// Whether `write_pages` is a single scatter/gather request.
    fn supports_vectored(&self) -> bool {
        false
    }

    /// Sync all pending writes to durable storage.
    fn sync(&self) -> Result<(), StorageError>;

    /// Number of pages currently backed by storage.
    fn total_pages(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::PageOutOfBounds {
            page_id: 10,
            total_pages: 5,
        };
        assert!(e.to_string().contains("page 10"));
        assert!(e.to_string().contains("total pages: 5"));

        let e = StorageError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));
    }
}
