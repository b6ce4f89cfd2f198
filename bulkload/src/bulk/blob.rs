//! Writes values too large for a leaf page into chains of blob pages.
//!
//! A blob is laid out as one first page (length, first index page, first
//! chunk of data), any number of data pages, and index pages listing the
//! data pages in order. Blob pages come from the leaf segment through the
//! builder's own page cursor, so they are flushed with the builder's other
//! extents.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::record::{
    BLOB_DATA_CAPACITY, BLOB_DATA_CHUNK, BLOB_DATA_DATA, BLOB_FIRST_CAPACITY, BLOB_FIRST_CHUNK,
    BLOB_FIRST_DATA, BLOB_FIRST_INDEX, BLOB_FIRST_LENGTH, BLOB_INDEX_CAPACITY, BLOB_INDEX_COUNT,
    BLOB_INDEX_ENTRIES, BLOB_INDEX_NEXT, BlobRef,
};
use crate::bulk::context::{BuildContext, PageCursor};
use crate::bulk::error::BulkError;
use crate::bulk::extent::{ExtentHandle, ExtentKind, ObjectPool};
use crate::storage::{NULL_PAGE, Page, PageHeader, PageId, PageType};

/// Idle blob states kept for reuse.
const STATE_POOL_SIZE: usize = 4;

/// Names the blob returned by [`BlobInserter::open`].
#[derive(Debug, PartialEq, Eq)]
pub struct BlobHandle {
    id: u64,
}

/// Bookkeeping for one open blob.
#[derive(Debug, Default)]
struct BlobState {
    key: Vec<u8>,
    data_pages: Vec<PageId>,
}

#[derive(Debug)]
struct PendingPage {
    page_id: PageId,
    extent: ExtentHandle,
    page: Page,
    fill: usize,
}

impl PendingPage {
    fn seal(mut self, page_type: PageType, ctx: &mut BuildContext) -> Result<(), BulkError> {
        let header = PageHeader {
            page_type,
            flags: 0,
            checksum: 0,
        };
        self.page.write_bytes(0, &header.to_bytes());
        self.page.seal();
        ctx.commit(self.extent, self.page_id, self.page)
    }
}

#[derive(Debug)]
struct OpenBlob {
    id: u64,
    state: BlobState,
    first: PendingPage,
    data: Option<PendingPage>,
    length: u64,
}

/// Blob statistics of one builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStats {
    pub blobs: u64,
    pub pages: u64,
    pub bytes: u64,
}

/// Writes blobs for one subtree builder. At most one blob is open at a time.
#[derive(Debug)]
pub struct BlobInserter {
    cursor: PageCursor,
    next_id: u64,
    open: Option<OpenBlob>,
    states: ObjectPool<BlobState>,
    stats: BlobStats,
}

impl Default for BlobInserter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobInserter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursor: PageCursor::new(ExtentKind::Leaf),
            next_id: 0,
            open: None,
            states: ObjectPool::new(STATE_POOL_SIZE),
            stats: BlobStats::default(),
        }
    }

    fn new_page(&mut self, ctx: &mut BuildContext) -> Result<PendingPage, BulkError> {
        let (page_id, extent) = self.cursor.next_page(ctx)?;
        let page = ctx.lease_page()?;
        self.stats.pages += 1;
        Ok(PendingPage {
            page_id,
            extent,
            page,
            fill: 0,
        })
    }

    /// Start a blob for the row with `key`. Claims the first page.
    pub fn open(&mut self, ctx: &mut BuildContext, key: &[u8]) -> Result<BlobHandle, BulkError> {
        if self.open.is_some() {
            return Err(BulkError::BlobAlreadyOpen);
        }
        let first = self.new_page(ctx)?;
        let mut state = self.states.checkout();
        state.key.extend_from_slice(key);
        let id = self.next_id;
        self.next_id += 1;
        self.open = Some(OpenBlob {
            id,
            state,
            first,
            data: None,
            length: 0,
        });
        Ok(BlobHandle { id })
    }

    fn open_for(&mut self, handle: &BlobHandle) -> Result<&mut OpenBlob, BulkError> {
        match self.open.as_mut() {
            Some(blob) if blob.id == handle.id => Ok(blob),
            _ => Err(BulkError::BlobHandleMismatch),
        }
    }

    /// Append `bytes` to the open blob.
    pub fn write(
        &mut self,
        ctx: &mut BuildContext,
        handle: &BlobHandle,
        bytes: &[u8],
    ) -> Result<(), BulkError> {
        let mut rest = bytes;
        {
            let blob = self.open_for(handle)?;
            blob.length += bytes.len() as u64;
            if blob.data.is_none() {
                let first = &mut blob.first;
                let n = rest.len().min(BLOB_FIRST_CAPACITY - first.fill);
                first
                    .page
                    .write_bytes(BLOB_FIRST_DATA + first.fill, &rest[..n]);
                first.fill += n;
                rest = &rest[n..];
            }
        }
        while !rest.is_empty() {
            let full = self
                .open
                .as_ref()
                .and_then(|blob| blob.data.as_ref())
                .is_none_or(|data| data.fill == BLOB_DATA_CAPACITY);
            if full {
                let fresh = self.new_page(ctx)?;
                let blob = self.open_for(handle)?;
                blob.state.data_pages.push(fresh.page_id);
                if let Some(done) = blob.data.replace(fresh) {
                    seal_data(done, ctx)?;
                }
            }
            let blob = self.open_for(handle)?;
            let Some(data) = blob.data.as_mut() else {
                return Err(BulkError::BlobHandleMismatch);
            };
            let n = rest.len().min(BLOB_DATA_CAPACITY - data.fill);
            data.page.write_bytes(BLOB_DATA_DATA + data.fill, &rest[..n]);
            data.fill += n;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Finish the open blob and return its reference.
    pub fn close(
        &mut self,
        ctx: &mut BuildContext,
        handle: BlobHandle,
    ) -> Result<BlobRef, BulkError> {
        self.open_for(&handle)?;
        let Some(OpenBlob {
            mut state,
            mut first,
            data,
            length,
            ..
        }) = self.open.take()
        else {
            return Err(BulkError::BlobHandleMismatch);
        };
        if let Some(data) = data {
            seal_data(data, ctx)?;
        }

        let mut index_pages = Vec::new();
        for _ in state.data_pages.chunks(BLOB_INDEX_CAPACITY) {
            index_pages.push(self.new_page(ctx)?);
        }
        let first_index = index_pages.first().map_or(NULL_PAGE, |p| p.page_id);
        let next_ids: Vec<PageId> = index_pages
            .iter()
            .skip(1)
            .map(|p| p.page_id)
            .chain(std::iter::once(NULL_PAGE))
            .collect();
        let index_count = index_pages.len();
        for ((mut index, entries), next) in index_pages
            .into_iter()
            .zip(state.data_pages.chunks(BLOB_INDEX_CAPACITY))
            .zip(next_ids)
        {
            index.page.write_u32(BLOB_INDEX_COUNT, entries.len() as u32);
            index.page.write_u64(BLOB_INDEX_NEXT, next);
            for (i, data_id) in entries.iter().enumerate() {
                index.page.write_u64(BLOB_INDEX_ENTRIES + i * 8, *data_id);
            }
            index.seal(PageType::BlobIndex, ctx)?;
        }

        first.page.write_u64(BLOB_FIRST_LENGTH, length);
        first.page.write_u64(BLOB_FIRST_INDEX, first_index);
        first.page.write_u32(BLOB_FIRST_CHUNK, first.fill as u32);
        let first_page = first.page_id;
        first.seal(PageType::BlobFirst, ctx)?;

        let page_count = (1 + state.data_pages.len() + index_count) as u32;
        tracing::trace!(
            key = ?String::from_utf8_lossy(&state.key),
            length,
            page_count,
            "blob stored"
        );
        self.stats.blobs += 1;
        self.stats.bytes += length;
        state.key.clear();
        state.data_pages.clear();
        self.states.release(state);
        Ok(BlobRef {
            first_page,
            length,
            page_count,
        })
    }

    /// Write a whole value as one blob.
    pub fn store(
        &mut self,
        ctx: &mut BuildContext,
        key: &[u8],
        value: &[u8],
    ) -> Result<BlobRef, BulkError> {
        let handle = self.open(ctx, key)?;
        self.write(ctx, &handle, value)?;
        self.close(ctx, handle)
    }

    /// Drop the open blob, if any. Its pages are never committed.
    pub fn abandon(&mut self) {
        if let Some(mut blob) = self.open.take() {
            blob.state.key.clear();
            blob.state.data_pages.clear();
            self.states.release(blob.state);
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open.is_some()
    }

    #[must_use]
    pub const fn stats(&self) -> BlobStats {
        self.stats
    }
}

fn seal_data(mut data: PendingPage, ctx: &mut BuildContext) -> Result<(), BulkError> {
    data.page.write_u32(BLOB_DATA_CHUNK, data.fill as u32);
    data.seal(PageType::BlobData, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::reader::TreeReader;
    use crate::bulk::context::fixture::{fixture, small_config};
    use crate::storage::PageStore;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8 ^ seed).collect()
    }

    #[test]
    fn test_streamed_writes_form_one_value() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("blob", fx.env.clone()).expect("context");
        let mut inserter = BlobInserter::new();

        let value = pattern(30_000, 7);
        let handle = inserter.open(&mut ctx, b"k1").expect("open");
        assert!(inserter.is_open());
        for chunk in value.chunks(1_234) {
            inserter.write(&mut ctx, &handle, chunk).expect("write");
        }
        let blob = inserter.close(&mut ctx, handle).expect("close");
        assert!(!inserter.is_open());
        assert_eq!(blob.length, 30_000);
        // First page, three data pages, one index page.
        assert_eq!(blob.page_count, 5);
        assert_eq!(
            inserter.stats(),
            BlobStats {
                blobs: 1,
                pages: 5,
                bytes: 30_000
            }
        );
        ctx.finish().expect("finish");

        let reader = TreeReader::new(fx.store.as_ref(), fx.env.comparator.as_ref());
        assert_eq!(reader.read_blob(&blob).expect("read"), value);
    }

    #[test]
    fn test_open_while_open_is_rejected() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("blob", fx.env.clone()).expect("context");
        let mut inserter = BlobInserter::new();

        let handle = inserter.open(&mut ctx, b"a").expect("open");
        assert!(matches!(
            inserter.open(&mut ctx, b"b"),
            Err(BulkError::BlobAlreadyOpen)
        ));
        // The first blob is unaffected.
        inserter.write(&mut ctx, &handle, b"still open").expect("write");
        let blob = inserter.close(&mut ctx, handle).expect("close");
        ctx.finish().expect("finish");

        let reader = TreeReader::new(fx.store.as_ref(), fx.env.comparator.as_ref());
        assert_eq!(reader.read_blob(&blob).expect("read"), b"still open");
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("blob", fx.env.clone()).expect("context");
        let mut inserter = BlobInserter::new();

        let handle = inserter.open(&mut ctx, b"a").expect("open");
        let other = BlobHandle { id: handle.id + 1 };
        assert!(matches!(
            inserter.write(&mut ctx, &other, b"xyz"),
            Err(BulkError::BlobHandleMismatch)
        ));
        assert!(matches!(
            inserter.close(&mut ctx, other),
            Err(BulkError::BlobHandleMismatch)
        ));
        assert!(inserter.is_open());

        inserter.write(&mut ctx, &handle, b"abc").expect("write");
        let blob = inserter.close(&mut ctx, handle).expect("close");
        assert_eq!(blob.length, 3);

        // Nothing is open any more, so an earlier id is stale too.
        let stale = BlobHandle { id: 0 };
        assert!(matches!(
            inserter.write(&mut ctx, &stale, b"late"),
            Err(BulkError::BlobHandleMismatch)
        ));
        ctx.finish().expect("finish");
    }

    #[test]
    fn test_small_value_stays_in_the_first_page() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("blob", fx.env.clone()).expect("context");
        let mut inserter = BlobInserter::new();

        let value = pattern(BLOB_FIRST_CAPACITY, 3);
        let blob = inserter.store(&mut ctx, b"k", &value).expect("store");
        assert_eq!(blob.page_count, 1);
        ctx.finish().expect("finish");

        let first = fx.store.read_page(blob.first_page).expect("first page");
        assert_eq!(first.read_u64(BLOB_FIRST_INDEX), NULL_PAGE);
        assert_eq!(first.read_u64(BLOB_FIRST_LENGTH), value.len() as u64);
        let reader = TreeReader::new(fx.store.as_ref(), fx.env.comparator.as_ref());
        assert_eq!(reader.read_blob(&blob).expect("read"), value);
    }

    #[test]
    fn test_long_value_chains_index_pages() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("blob", fx.env.clone()).expect("context");
        let mut inserter = BlobInserter::new();

        let chunk = pattern(7_000, 11);
        let chunks = 1_300;
        let length = chunk.len() * chunks;
        let handle = inserter.open(&mut ctx, b"big").expect("open");
        for _ in 0..chunks {
            inserter.write(&mut ctx, &handle, &chunk).expect("write");
        }
        let blob = inserter.close(&mut ctx, handle).expect("close");

        let data_pages = (length - BLOB_FIRST_CAPACITY).div_ceil(BLOB_DATA_CAPACITY);
        let index_pages = data_pages.div_ceil(BLOB_INDEX_CAPACITY);
        assert_eq!(index_pages, 2);
        assert_eq!(blob.page_count as usize, 1 + data_pages + index_pages);
        ctx.finish().expect("finish");

        let first = fx.store.read_page(blob.first_page).expect("first page");
        let index = fx
            .store
            .read_page(first.read_u64(BLOB_FIRST_INDEX))
            .expect("index page");
        assert_eq!(index.read_u32(BLOB_INDEX_COUNT) as usize, BLOB_INDEX_CAPACITY);
        assert_ne!(index.read_u64(BLOB_INDEX_NEXT), NULL_PAGE);

        let reader = TreeReader::new(fx.store.as_ref(), fx.env.comparator.as_ref());
        let read = reader.read_blob(&blob).expect("read");
        assert_eq!(read.len(), length);
        assert!(read.chunks(chunk.len()).all(|c| c == chunk.as_slice()));
    }
}
