//! Page storage for bulk-loaded indexes.
//!
//! # File Format
//!
//! The database is a single file of 8KB pages:
//!
//! - Page 0: Space header (magic, never handed out)
//! - Remaining pages: B-tree nodes and blob pages, owned by segments
//!
//! # Usage
//!
//! ```ignore
//! use bulkload::storage::{BufferPool, DatabaseFile, PageStore, Tablespace};
//!
//! let pool = BufferPool::new(1024);
//! let file = DatabaseFile::create(path, pool)?;
//! let space = Tablespace::new(file.total_pages());
//! ```

mod buffer_pool;
mod file;
mod io;
mod memory;
mod page;
mod space;

pub use buffer_pool::{BufferPool, DEFAULT_POOL_CAPACITY};
pub use file::{DatabaseFile, FileError};
pub use io::{PageStore, StorageError};
pub use memory::{FaultConfig, MemoryStore, MemoryStoreStats};
pub use page::{
    FLAG_ROOT, NULL_PAGE, PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageHeader, PageId, PageType,
};
pub use space::{PageRange, SegmentId, SegmentKind, SpaceError, Tablespace};
