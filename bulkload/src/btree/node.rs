//! On-disk B-tree node layout.
//!
//! ```text
//! +-------------------+ 0
//! | page header (8)   |
//! +-------------------+ 8
//! | node header (36)  |
//! +-------------------+ DATA_OFFSET
//! | record heap  ->   |
//! |                   |
//! |   <-  slot dir    |
//! +-------------------+ PAGE_SIZE
//! ```
//!
//! Records are stored back to back in key order. The slot directory is
//! sparse: slot `i` holds the heap offset of record `i * SLOT_STRIDE`, and
//! slots grow downward from the end of the page.

#![allow(clippy::cast_possible_truncation)]

use crate::btree::record::{INFO_MIN_REC, RecordRef};
use crate::storage::{
    FLAG_ROOT, NULL_PAGE, PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType, SegmentId,
};

/// Node header layout (after page header):
/// - `level`: 2 bytes (0 = leaf)
/// - `record_count`: 2 bytes
/// - `heap_top`: 2 bytes (offset of the first free heap byte)
/// - `free_space`: 2 bytes
/// - `reserve`: 2 bytes (fill-factor margin left unused)
/// - `slot_count`: 2 bytes
/// - `prev`: 8 bytes
/// - `next`: 8 bytes
/// - `leaf_segment`: 4 bytes (root only, else 0)
/// - `non_leaf_segment`: 4 bytes (root only, else 0)
///
/// Total: 36 bytes
pub const NODE_HEADER_SIZE: usize = 36;

/// Offset where the record heap starts.
pub const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Bytes available for records and slots.
pub const NODE_CAPACITY: usize = PAGE_SIZE - DATA_OFFSET;

/// Records per directory slot.
pub const SLOT_STRIDE: usize = 8;

/// Size of one directory slot.
pub const SLOT_SIZE: usize = 2;

const LEVEL: usize = PageHeader::SIZE;
const RECORD_COUNT: usize = LEVEL + 2;
const HEAP_TOP: usize = LEVEL + 4;
const FREE_SPACE: usize = LEVEL + 6;
const RESERVE: usize = LEVEL + 8;
const SLOT_COUNT: usize = LEVEL + 10;
const PREV: usize = LEVEL + 12;
const NEXT: usize = LEVEL + 20;
const LEAF_SEGMENT: usize = LEVEL + 28;
const NON_LEAF_SEGMENT: usize = LEVEL + 32;

/// Slots needed for `records` records.
#[must_use]
pub const fn slots_for(records: usize) -> usize {
    records.div_ceil(SLOT_STRIDE)
}

/// Offset of directory slot `index`.
#[must_use]
pub const fn slot_offset(index: usize) -> usize {
    PAGE_SIZE - SLOT_SIZE * (index + 1)
}

/// Errors decoding a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Page header is invalid or the checksum does not match.
    Page(PageError),
    /// The page is not a B-tree node.
    NotANode(PageType),
    /// Node contents are inconsistent.
    Corrupt(&'static str),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::NotANode(t) => write!(f, "page of type {t:?} is not a B-tree node"),
            Self::Corrupt(what) => write!(f, "corrupt node: {what}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageError> for NodeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

/// Segments owned by an index, recorded on its root page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub leaf: SegmentId,
    pub non_leaf: SegmentId,
}

/// Header information for a B-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub level: u16,
    pub record_count: u16,
    pub heap_top: u16,
    pub free_space: u16,
    pub reserve: u16,
    pub slot_count: u16,
    pub prev: PageId,
    pub next: PageId,
    pub segments: Option<SegmentHeader>,
}

impl NodeHeader {
    /// Header of an empty node.
    #[must_use]
    pub const fn empty(level: u16, reserve: u16) -> Self {
        Self {
            level,
            record_count: 0,
            heap_top: DATA_OFFSET as u16,
            free_space: NODE_CAPACITY as u16,
            reserve,
            slot_count: 0,
            prev: NULL_PAGE,
            next: NULL_PAGE,
            segments: None,
        }
    }

    /// Read a node header from a page.
    #[must_use]
    pub fn from_page(page: &Page) -> Self {
        let leaf = page.read_u32(LEAF_SEGMENT);
        let non_leaf = page.read_u32(NON_LEAF_SEGMENT);
        let segments = (leaf != 0 || non_leaf != 0).then_some(SegmentHeader {
            leaf: SegmentId(leaf),
            non_leaf: SegmentId(non_leaf),
        });
        Self {
            level: page.read_u16(LEVEL),
            record_count: page.read_u16(RECORD_COUNT),
            heap_top: page.read_u16(HEAP_TOP),
            free_space: page.read_u16(FREE_SPACE),
            reserve: page.read_u16(RESERVE),
            slot_count: page.read_u16(SLOT_COUNT),
            prev: page.read_u64(PREV),
            next: page.read_u64(NEXT),
            segments,
        }
    }

    /// Write a node header to a page.
    pub fn write_to_page(&self, page: &mut Page) {
        page.write_u16(LEVEL, self.level);
        page.write_u16(RECORD_COUNT, self.record_count);
        page.write_u16(HEAP_TOP, self.heap_top);
        page.write_u16(FREE_SPACE, self.free_space);
        page.write_u16(RESERVE, self.reserve);
        page.write_u16(SLOT_COUNT, self.slot_count);
        page.write_u64(PREV, self.prev);
        page.write_u64(NEXT, self.next);
        let (leaf, non_leaf) = self
            .segments
            .map_or((0, 0), |s| (s.leaf.0, s.non_leaf.0));
        page.write_u32(LEAF_SEGMENT, leaf);
        page.write_u32(NON_LEAF_SEGMENT, non_leaf);
    }

    /// Bytes of records plus slots in use.
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.heap_top as usize - DATA_OFFSET + self.slot_count as usize * SLOT_SIZE
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Page type used for nodes at `level`.
#[must_use]
pub const fn page_type_for(level: u16) -> PageType {
    if level == 0 {
        PageType::BTreeLeaf
    } else {
        PageType::BTreeInternal
    }
}

/// A decoded view over a B-tree page.
#[derive(Debug)]
pub struct NodeView<'a> {
    page: &'a Page,
    pub header: NodeHeader,
    pub is_root: bool,
}

impl<'a> NodeView<'a> {
    /// Decode and validate a node page.
    pub fn new(page: &'a Page) -> Result<Self, NodeError> {
        page.verify_checksum()?;
        let page_header = PageHeader::from_page(page)?;
        match page_header.page_type {
            PageType::BTreeLeaf | PageType::BTreeInternal => {}
            other => return Err(NodeError::NotANode(other)),
        }
        let header = NodeHeader::from_page(page);
        if (page_header.page_type == PageType::BTreeLeaf) != header.is_leaf() {
            return Err(NodeError::Corrupt("page type does not match level"));
        }
        if usize::from(header.heap_top) < DATA_OFFSET
            || usize::from(header.heap_top) > slot_offset(usize::from(header.slot_count)) + SLOT_SIZE
        {
            return Err(NodeError::Corrupt("heap top out of range"));
        }
        if usize::from(header.slot_count) != slots_for(usize::from(header.record_count)) {
            return Err(NodeError::Corrupt("slot count does not match record count"));
        }
        Ok(Self {
            page,
            header,
            is_root: page.has_flag(FLAG_ROOT),
        })
    }

    /// Iterate the records in key order.
    #[must_use]
    pub fn records(&self) -> Records<'a> {
        Records {
            heap: &self.page.as_bytes()[..usize::from(self.header.heap_top)],
            offset: DATA_OFFSET,
            remaining: usize::from(self.header.record_count),
        }
    }

    /// Heap offset stored in directory slot `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> usize {
        usize::from(self.page.read_u16(slot_offset(index)))
    }

    /// First record, if any.
    pub fn first_record(&self) -> Result<Option<RecordRef<'a>>, NodeError> {
        self.records().next().transpose()
    }

    /// Last record, if any.
    ///
    /// Starts from the last directory slot and scans at most `SLOT_STRIDE` records.
    pub fn last_record(&self) -> Result<Option<RecordRef<'a>>, NodeError> {
        let count = usize::from(self.header.record_count);
        if count == 0 {
            return Ok(None);
        }
        let last_slot = slots_for(count) - 1;
        let records = Records {
            heap: &self.page.as_bytes()[..usize::from(self.header.heap_top)],
            offset: self.slot(last_slot),
            remaining: count - last_slot * SLOT_STRIDE,
        };
        let mut last = None;
        for record in records {
            last = Some(record?);
        }
        Ok(last)
    }
}

/// Iterator over the records of a node.
#[derive(Debug)]
pub struct Records<'a> {
    heap: &'a [u8],
    offset: usize,
    remaining: usize,
}

impl Records<'_> {
    /// Heap offset of the next record.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<RecordRef<'a>, NodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let Some(bytes) = self.heap.get(self.offset..) else {
            self.remaining = 0;
            return Some(Err(NodeError::Corrupt("record offset out of range")));
        };
        match RecordRef::decode(bytes) {
            Ok((record, len)) => {
                self.offset += len;
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Set `prev`/`next` on a node page in place. `None` leaves a field unchanged.
pub fn set_siblings(page: &mut Page, prev: Option<PageId>, next: Option<PageId>) {
    if let Some(prev) = prev {
        page.write_u64(PREV, prev);
    }
    if let Some(next) = next {
        page.write_u64(NEXT, next);
    }
}

/// Demote a root page to an ordinary node: clear the root flag and the
/// segment header.
pub fn clear_root(page: &mut Page) {
    page.set_flag(FLAG_ROOT, false);
    page.write_u32(LEAF_SEGMENT, 0);
    page.write_u32(NON_LEAF_SEGMENT, 0);
}

/// Clear `INFO_MIN_REC` on the first record of a node page.
pub fn clear_min_rec(page: &mut Page) {
    if page.read_u16(RECORD_COUNT) > 0 {
        let info = page.read_u8(DATA_OFFSET);
        page.write_u8(DATA_OFFSET, info & !INFO_MIN_REC);
    }
}
