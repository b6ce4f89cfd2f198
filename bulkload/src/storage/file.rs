//! Database file I/O operations.
//!
//! This module handles reading and writing pages to the tablespace file.
//! Page 0 holds a small space header; every other page belongs to a segment.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::buffer_pool::BufferPool;
use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64, Page, PageHeader, PageId, PageType};

/// Magic bytes identifying a tablespace file.
const SPACE_MAGIC: &[u8; 8] = b"BLKLOAD1";

/// A database file handle with low-level page I/O operations.
pub struct DatabaseFile {
    file: File,
    /// Serializes seek + write sequences (vectored writes, non-unix fallback).
    io_lock: Mutex<()>,
    total_pages: AtomicU64,
    buffer_pool: Arc<BufferPool>,
}

impl DatabaseFile {
    /// Create a new database file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        let mut header_page = Page::new();
        let header = PageHeader {
            page_type: PageType::SpaceHeader,
            flags: 0,
            checksum: 0,
        };
        header_page.write_bytes(0, &header.to_bytes());
        header_page.write_bytes(PageHeader::SIZE, SPACE_MAGIC);
        header_page.seal();

        file.write_all(header_page.as_bytes()).map_err(FileError::Io)?;
        file.sync_all().map_err(FileError::Io)?;

        Ok(Self {
            file,
            io_lock: Mutex::new(()),
            total_pages: AtomicU64::new(1),
            buffer_pool,
        })
    }

    /// Open an existing database file.
    pub fn open(path: &Path, buffer_pool: Arc<BufferPool>) -> Result<Self, FileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf).map_err(FileError::Io)?;
        if &buf[PageHeader::SIZE..PageHeader::SIZE + SPACE_MAGIC.len()] != SPACE_MAGIC {
            return Err(FileError::BadMagic);
        }

        let len = file.metadata().map_err(FileError::Io)?.len();

        Ok(Self {
            file,
            io_lock: Mutex::new(()),
            total_pages: AtomicU64::new(len / PAGE_SIZE_U64),
            buffer_pool,
        })
    }

    /// Get a reference to the buffer pool.
    #[must_use]
    pub const fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    fn check_bounds(&self, page_id: PageId) -> Result<(), FileError> {
        let total_pages = self.total_pages.load(Ordering::Acquire);
        if page_id >= total_pages {
            return Err(FileError::PageOutOfBounds {
                page_id,
                total_pages,
            });
        }
        Ok(())
    }

    fn note_written(&self, last_page: PageId) {
        self.total_pages.fetch_max(last_page + 1, Ordering::AcqRel);
    }

    /// Read a page from the file.
    ///
    /// Returns an error if page is out of bounds or buffer pool is exhausted.
    pub fn read_page(&self, page_id: PageId) -> Result<Page, FileError> {
        self.check_bounds(page_id)?;

        let mut page = self
            .buffer_pool
            .lease_page_zeroed()
            .ok_or(FileError::BufferPoolExhausted)?;

        let offset = page_id * PAGE_SIZE_U64;
        self.read_at(page.as_bytes_mut(), offset)
            .map_err(FileError::Io)?;

        Ok(page)
    }

    /// Write a page to the file.
    pub fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), FileError> {
        let offset = page_id * PAGE_SIZE_U64;
        self.write_at(page.as_bytes(), offset)
            .map_err(FileError::Io)?;
        self.note_written(page_id);
        Ok(())
    }

    /// Write consecutive pages with a single scatter/gather request.
    pub fn write_pages_vectored(&self, first: PageId, pages: &[&Page]) -> Result<(), FileError> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut slices: Vec<IoSlice<'_>> = pages.iter().map(|p| IoSlice::new(p.as_bytes())).collect();
        let mut bufs = slices.as_mut_slice();

        let _guard = self.io_lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(first * PAGE_SIZE_U64))
            .map_err(FileError::Io)?;
        while !bufs.is_empty() {
            let written = file.write_vectored(bufs).map_err(FileError::Io)?;
            if written == 0 {
                return Err(FileError::Io(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            IoSlice::advance_slices(&mut bufs, written);
        }

        self.note_written(first + pages.len() as u64 - 1);
        Ok(())
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }

    /// Get the total number of pages in the file.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Acquire)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let _guard = self.io_lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        let _guard = self.io_lock.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl std::fmt::Debug for DatabaseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseFile")
            .field("total_pages", &self.total_pages())
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(std::path::PathBuf),
    /// Page 0 does not carry the tablespace magic.
    BadMagic,
    /// Page ID out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// Buffer pool exhausted.
    BufferPoolExhausted,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::BadMagic => write!(f, "not a tablespace file"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => {
                write!(
                    f,
                    "page {page_id} out of bounds (total pages: {total_pages})"
                )
            }
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists(_)
            | Self::BadMagic
            | Self::PageOutOfBounds { .. }
            | Self::BufferPoolExhausted => None,
        }
    }
}

impl From<FileError> for StorageError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io_err) => Self::Io(io_err),
            FileError::PageOutOfBounds {
                page_id,
                total_pages,
            } => Self::PageOutOfBounds {
                page_id,
                total_pages,
            },
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::BadMagic => Self::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a tablespace file",
            )),
            FileError::BufferPoolExhausted => Self::BufferPoolExhausted,
        }
    }
}

impl PageStore for DatabaseFile {
    fn read_page(&self, page_id: PageId) -> Result<Page, StorageError> {
        Self::read_page(self, page_id).map_err(StorageError::from)
    }

    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        Self::write_page(self, page_id, page).map_err(StorageError::from)
    }

    fn write_pages(&self, first: PageId, pages: &[&Page]) -> Result<(), StorageError> {
        Self::write_pages_vectored(self, first, pages).map_err(StorageError::from)
    }

    fn supports_vectored(&self) -> bool {
        true
    }

    fn sync(&self) -> Result<(), StorageError> {
        Self::sync(self).map_err(StorageError::from)
    }

    fn total_pages(&self) -> u64 {
        Self::total_pages(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn test_pool() -> Arc<BufferPool> {
        BufferPool::new(100)
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let pool = test_pool();

        {
            let db = DatabaseFile::create(&path, Arc::clone(&pool)).expect("create db");
            assert_eq!(db.total_pages(), 1);
        }

        {
            let db = DatabaseFile::open(&path, Arc::clone(&pool)).expect("open db");
            assert_eq!(db.total_pages(), 1);
        }
    }

    #[test]
    fn test_create_already_exists() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        fs::write(&path, b"existing").expect("write file");

        let result = DatabaseFile::create(&path, test_pool());
        assert!(matches!(result, Err(FileError::AlreadyExists(_))));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        fs::write(&path, vec![0u8; PAGE_SIZE]).expect("write file");

        let result = DatabaseFile::open(&path, test_pool());
        assert!(matches!(result, Err(FileError::BadMagic)));
    }

    #[test]
    fn test_write_extends_and_reads_back() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let db = DatabaseFile::create(&path, test_pool()).expect("create db");

        let mut page = Page::new();
        page.write_bytes(0, b"hello world");
        db.write_page(3, &page).expect("write page");
        assert_eq!(db.total_pages(), 4);

        let read_page = db.read_page(3).expect("read page");
        assert_eq!(read_page.read_bytes(0, 11), b"hello world");
    }

    #[test]
    fn test_vectored_write() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let db = DatabaseFile::create(&path, test_pool()).expect("create db");

        let pages: Vec<Page> = (0..5u64)
            .map(|i| {
                let mut page = Page::new();
                page.write_u64(100, i * 11);
                page
            })
            .collect();
        let refs: Vec<&Page> = pages.iter().collect();
        db.write_pages_vectored(10, &refs).expect("vectored write");
        assert_eq!(db.total_pages(), 15);

        for i in 0..5u64 {
            let page = db.read_page(10 + i).expect("read");
            assert_eq!(page.read_u64(100), i * 11);
        }
    }

    #[test]
    fn test_page_out_of_bounds() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let db = DatabaseFile::create(&path, test_pool()).expect("create db");

        let result = db.read_page(100);
        assert!(matches!(result, Err(FileError::PageOutOfBounds { .. })));
    }

    #[test]
    fn test_page_data_persistence() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let pool = test_pool();

        {
            let db = DatabaseFile::create(&path, Arc::clone(&pool)).expect("create db");
            let mut page = Page::new();
            page.write_u64(100, 0xDEAD_BEEF_CAFE_BABE);
            db.write_page(1, &page).expect("write");
            db.sync().expect("sync");
        }

        {
            let db = DatabaseFile::open(&path, pool).expect("open db");
            let page = db.read_page(1).expect("read");
            assert_eq!(page.read_u64(100), 0xDEAD_BEEF_CAFE_BABE);
        }
    }
}
