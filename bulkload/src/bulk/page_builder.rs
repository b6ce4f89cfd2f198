//! Fills one B-tree page with records appended in key order.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::node::{
    DATA_OFFSET, NODE_CAPACITY, NodeHeader, SLOT_SIZE, SLOT_STRIDE, SegmentHeader, page_type_for,
    slot_offset, slots_for,
};
use crate::btree::record::{RECORD_HEADER_SIZE, Record, Row, record_size};
use crate::bulk::blob::BlobInserter;
use crate::bulk::context::BuildContext;
use crate::bulk::error::BulkError;
use crate::bulk::extent::ExtentHandle;
use crate::storage::{FLAG_ROOT, NULL_PAGE, Page, PageHeader, PageId};

/// Result of appending a record to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Yes,
    /// The record would push the page past its budget. The page is unchanged.
    PageFull,
}

/// Builds one node page in memory.
#[derive(Debug)]
pub struct PageBuilder {
    page: Page,
    page_id: PageId,
    extent: ExtentHandle,
    level: u16,
    prev: PageId,
    next: PageId,
    reserve: usize,
    heap_top: usize,
    records: usize,
    /// Offset and length of the first and last keys in the heap.
    first_key: (usize, usize),
    last_key: (usize, usize),
    root: Option<SegmentHeader>,
}

impl PageBuilder {
    /// Start a page. `page` must be zeroed.
    #[must_use]
    pub const fn init(
        page: Page,
        page_id: PageId,
        extent: ExtentHandle,
        level: u16,
        prev: PageId,
        reserve: usize,
    ) -> Self {
        Self {
            page,
            page_id,
            extent,
            level,
            prev,
            next: NULL_PAGE,
            reserve,
            heap_top: DATA_OFFSET,
            records: 0,
            first_key: (0, 0),
            last_key: (0, 0),
            root: None,
        }
    }

    /// Largest record an empty page with `reserve` bytes held back accepts.
    #[must_use]
    pub const fn max_record(reserve: usize) -> usize {
        NODE_CAPACITY - reserve - SLOT_SIZE
    }

    /// Bytes of records and slots the page would use after adding a record
    /// of `len` bytes.
    const fn used_after(&self, len: usize) -> usize {
        self.heap_top - DATA_OFFSET + len + slots_for(self.records + 1) * SLOT_SIZE
    }

    /// Append a record.
    ///
    /// # Pre-conditions
    ///
    /// `record` sorts after every record already on the page.
    pub fn insert(&mut self, record: &Record) -> Inserted {
        let len = record.encoded_len();
        if self.used_after(len) > NODE_CAPACITY - self.reserve {
            return Inserted::PageFull;
        }
        let start = self.heap_top;
        record.encode_into(&mut self.page.as_bytes_mut()[start..start + len]);
        let key = (start + RECORD_HEADER_SIZE, record.key.len());
        if self.records == 0 {
            self.first_key = key;
        }
        self.last_key = key;
        self.heap_top += len;
        self.records += 1;
        Inserted::Yes
    }

    pub const fn set_next(&mut self, next: PageId) {
        self.next = next;
    }

    /// Make this page the root of an index owning `segments`.
    pub const fn mark_root(&mut self, segments: SegmentHeader) {
        self.root = Some(segments);
    }

    /// Write the slot directory and header, then seal the page.
    ///
    /// Walks the records once; every `SLOT_STRIDE`-th record gets a slot.
    pub fn finish(&mut self) {
        let mut offset = DATA_OFFSET;
        for index in 0..self.records {
            if index % SLOT_STRIDE == 0 {
                self.page
                    .write_u16(slot_offset(index / SLOT_STRIDE), offset as u16);
            }
            let key_len = usize::from(self.page.read_u16(offset + 1));
            let payload_len = usize::from(self.page.read_u16(offset + 3));
            offset += record_size(key_len, payload_len);
        }
        debug_assert_eq!(offset, self.heap_top);

        let slot_count = slots_for(self.records);
        let used = self.heap_top - DATA_OFFSET + slot_count * SLOT_SIZE;
        let header = NodeHeader {
            level: self.level,
            record_count: self.records as u16,
            heap_top: self.heap_top as u16,
            free_space: (NODE_CAPACITY - used) as u16,
            reserve: self.reserve as u16,
            slot_count: slot_count as u16,
            prev: self.prev,
            next: self.next,
            segments: self.root,
        };
        let page_header = PageHeader {
            page_type: page_type_for(self.level),
            flags: if self.root.is_some() { FLAG_ROOT } else { 0 },
            checksum: 0,
        };
        self.page.write_bytes(0, &page_header.to_bytes());
        header.write_to_page(&mut self.page);
        self.page.seal();
    }

    /// Hand the finished page to its extent.
    pub fn commit(self, ctx: &mut BuildContext) -> Result<(), BulkError> {
        ctx.commit(self.extent, self.page_id, self.page)
    }

    #[must_use]
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }

    #[must_use]
    pub const fn level(&self) -> u16 {
        self.level
    }

    #[must_use]
    pub const fn record_count(&self) -> usize {
        self.records
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Bytes of records and slots in use.
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.heap_top - DATA_OFFSET + slots_for(self.records) * SLOT_SIZE
    }

    #[must_use]
    pub fn first_key(&self) -> &[u8] {
        let (start, len) = self.first_key;
        self.page.read_bytes(start, len)
    }

    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        let (start, len) = self.last_key;
        self.page.read_bytes(start, len)
    }
}

/// Turn a row into a leaf record.
///
/// Values whose inline record would exceed `threshold` bytes are written to a
/// blob chain and the record carries the reference instead.
pub fn leaf_record(
    row: Row,
    threshold: usize,
    blob: &mut BlobInserter,
    ctx: &mut BuildContext,
) -> Result<Record, BulkError> {
    if row.inline_size() <= threshold {
        return Ok(Record::leaf(row.key, row.value));
    }
    let blob_ref = blob.store(ctx, &row.key, &row.value)?;
    Ok(Record::external(row.key, blob_ref))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NodeView;
    use crate::bulk::extent::{Extent, ExtentArena, ExtentKind};
    use crate::storage::PageRange;

    fn handle() -> ExtentHandle {
        let mut arena = ExtentArena::new();
        arena.insert(Extent::new(ExtentKind::Leaf, PageRange::new(10, 4)))
    }

    fn record(i: u32) -> Record {
        Record::leaf(format!("key-{i:05}").into_bytes(), vec![7u8; 40])
    }

    #[test]
    fn test_finish_writes_a_valid_node() {
        let mut builder = PageBuilder::init(Page::new(), 10, handle(), 0, 9, 512);
        for i in 0..20 {
            assert_eq!(builder.insert(&record(i)), Inserted::Yes);
        }
        builder.set_next(11);
        builder.finish();

        let view = NodeView::new(&builder.page).expect("valid node");
        assert_eq!(view.header.record_count, 20);
        assert_eq!(view.header.slot_count, 3);
        assert_eq!(view.header.prev, 9);
        assert_eq!(view.header.next, 11);
        assert_eq!(usize::from(view.header.reserve), 512);
        assert!(!view.is_root);
        assert_eq!(view.slot(0), DATA_OFFSET);
        let keys: Vec<Vec<u8>> = view
            .records()
            .map(|r| r.expect("record").key.to_vec())
            .collect();
        assert_eq!(keys.len(), 20);
        assert_eq!(keys[8], builder.page.read_bytes(view.slot(1) + 5, 9));
        assert_eq!(builder.first_key(), b"key-00000");
        assert_eq!(builder.last_key(), b"key-00019");
    }

    #[test]
    fn test_insert_stops_at_the_budget() {
        let reserve = 1024;
        let mut builder = PageBuilder::init(Page::new(), 10, handle(), 0, NULL_PAGE, reserve);
        let mut count = 0;
        while builder.insert(&record(count)) == Inserted::Yes {
            count += 1;
        }
        assert!(count > 0);
        assert!(builder.used_bytes() <= NODE_CAPACITY - reserve);
        assert_eq!(builder.record_count(), count as usize);
        // A rejected insert leaves the page untouched.
        assert_eq!(builder.last_key(), format!("key-{:05}", count - 1).as_bytes());
    }

    #[test]
    fn test_max_record_fits_an_empty_page() {
        let reserve = 100;
        let mut builder = PageBuilder::init(Page::new(), 10, handle(), 0, NULL_PAGE, reserve);
        let size = PageBuilder::max_record(reserve);
        let value = vec![1u8; size - RECORD_HEADER_SIZE - 1];
        assert_eq!(builder.insert(&Record::leaf(b"k".to_vec(), value)), Inserted::Yes);
        assert_eq!(builder.insert(&Record::leaf(b"l".to_vec(), Vec::new())), Inserted::PageFull);
    }

    #[test]
    fn test_root_pages_carry_flag_and_segments() {
        use crate::storage::SegmentId;
        let mut builder = PageBuilder::init(Page::new(), 10, handle(), 2, NULL_PAGE, 0);
        builder.insert(&Record::node_pointer(b"a".to_vec(), 5));
        builder.mark_root(SegmentHeader {
            leaf: SegmentId(1),
            non_leaf: SegmentId(2),
        });
        builder.finish();
        let view = NodeView::new(&builder.page).expect("valid node");
        assert!(view.is_root);
        assert_eq!(view.header.level, 2);
        assert_eq!(
            view.header.segments,
            Some(SegmentHeader {
                leaf: SegmentId(1),
                non_leaf: SegmentId(2),
            })
        );
    }
}
