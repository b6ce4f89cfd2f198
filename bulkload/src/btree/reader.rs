//! Read-side access to a finished tree.
//!
//! The bulk loader never serves lookups; this module exists to scan the
//! leaf chain, read externally stored values back and check that a built
//! tree is well formed.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::btree::compare::KeyComparator;
use crate::btree::node::{NODE_CAPACITY, NodeError, NodeView, SLOT_STRIDE};
use crate::btree::record::{
    BLOB_DATA_CAPACITY, BLOB_DATA_CHUNK, BLOB_DATA_DATA, BLOB_FIRST_CAPACITY, BLOB_FIRST_CHUNK,
    BLOB_FIRST_DATA, BLOB_FIRST_INDEX, BLOB_FIRST_LENGTH, BLOB_INDEX_CAPACITY, BLOB_INDEX_COUNT,
    BLOB_INDEX_ENTRIES, BLOB_INDEX_NEXT, BlobRef, Row,
};
use crate::storage::{NULL_PAGE, Page, PageHeader, PageId, PageStore, PageType, StorageError};

/// A leaf value: stored inline or in a blob chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Inline(Vec<u8>),
    External(BlobRef),
}

/// One leaf record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: LeafValue,
}

/// Shape of a verified tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Level of the root (0 for a single-leaf tree).
    pub root_level: u16,
    /// Pages per level, indexed by level.
    pub pages_per_level: Vec<u64>,
    /// Leaf records.
    pub records: u64,
    /// Leaf records whose value is stored externally.
    pub external_values: u64,
}

impl TreeStats {
    /// Total number of node pages.
    #[must_use]
    pub fn node_pages(&self) -> u64 {
        self.pages_per_level.iter().sum()
    }
}

/// Errors reading a tree.
#[derive(Debug)]
pub enum ReadError {
    /// Store error.
    Storage(StorageError),
    /// A page could not be decoded.
    Node { page: PageId, source: NodeError },
    /// The tree structure is inconsistent.
    Structure { page: PageId, reason: String },
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Node { page, source } => write!(f, "page {page}: {source}"),
            Self::Structure { page, reason } => write!(f, "page {page}: {reason}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Node { source, .. } => Some(source),
            Self::Structure { .. } => None,
        }
    }
}

impl From<StorageError> for ReadError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

fn structure(page: PageId, reason: impl Into<String>) -> ReadError {
    ReadError::Structure {
        page,
        reason: reason.into(),
    }
}

fn node(page_id: PageId, page: &Page) -> Result<NodeView<'_>, ReadError> {
    NodeView::new(page).map_err(|source| ReadError::Node {
        page: page_id,
        source,
    })
}

fn blob_page(store: &dyn PageStore, page_id: PageId, expected: PageType) -> Result<Page, ReadError> {
    let page = store.read_page(page_id)?;
    page.verify_checksum().map_err(|e| ReadError::Node {
        page: page_id,
        source: e.into(),
    })?;
    let header = PageHeader::from_page(&page).map_err(|e| ReadError::Node {
        page: page_id,
        source: e.into(),
    })?;
    if header.page_type != expected {
        return Err(structure(
            page_id,
            format!("expected {expected:?}, found {:?}", header.page_type),
        ));
    }
    Ok(page)
}

/// Reads pages of finished trees from a store.
pub struct TreeReader<'a> {
    store: &'a dyn PageStore,
    comparator: &'a dyn KeyComparator,
}

impl<'a> TreeReader<'a> {
    #[must_use]
    pub fn new(store: &'a dyn PageStore, comparator: &'a dyn KeyComparator) -> Self {
        Self { store, comparator }
    }

    /// Follow first children from `root` down to the leftmost leaf.
    pub fn leftmost_leaf(&self, root: PageId) -> Result<PageId, ReadError> {
        let mut current = root;
        loop {
            let page = self.store.read_page(current)?;
            let view = node(current, &page)?;
            if view.header.is_leaf() {
                return Ok(current);
            }
            let first = view
                .first_record()
                .map_err(|source| ReadError::Node {
                    page: current,
                    source,
                })?
                .ok_or_else(|| structure(current, "internal node without records"))?;
            current = first.child().map_err(|source| ReadError::Node {
                page: current,
                source,
            })?;
        }
    }

    /// Create a cursor over all leaf entries in key order.
    ///
    /// A `NULL_PAGE` root is an empty tree.
    pub fn cursor(&self, root: PageId) -> Result<LeafCursor<'a>, ReadError> {
        let current_page_id = if root == NULL_PAGE {
            NULL_PAGE
        } else {
            self.leftmost_leaf(root)?
        };
        Ok(LeafCursor {
            store: self.store,
            current_page_id,
            entries: Vec::new().into_iter(),
        })
    }

    /// All keys in leaf order.
    pub fn keys(&self, root: PageId) -> Result<Vec<Vec<u8>>, ReadError> {
        let mut cursor = self.cursor(root)?;
        let mut keys = Vec::new();
        while let Some(entry) = cursor.next_entry()? {
            keys.push(entry.key);
        }
        Ok(keys)
    }

    /// All rows in leaf order, with external values read back.
    pub fn rows(&self, root: PageId) -> Result<Vec<Row>, ReadError> {
        let mut cursor = self.cursor(root)?;
        let mut rows = Vec::new();
        while let Some(entry) = cursor.next_entry()? {
            let value = match entry.value {
                LeafValue::Inline(value) => value,
                LeafValue::External(blob) => self.read_blob(&blob)?,
            };
            rows.push(Row::new(entry.key, value));
        }
        Ok(rows)
    }

    /// First key stored on a node page.
    pub fn first_key(&self, page_id: PageId) -> Result<Option<Vec<u8>>, ReadError> {
        let page = self.store.read_page(page_id)?;
        let view = node(page_id, &page)?;
        let first = view.first_record().map_err(|source| ReadError::Node {
            page: page_id,
            source,
        })?;
        Ok(first.map(|r| r.key.to_vec()))
    }

    /// Last key stored on a node page.
    pub fn last_key(&self, page_id: PageId) -> Result<Option<Vec<u8>>, ReadError> {
        let page = self.store.read_page(page_id)?;
        let view = node(page_id, &page)?;
        let last = view.last_record().map_err(|source| ReadError::Node {
            page: page_id,
            source,
        })?;
        Ok(last.map(|r| r.key.to_vec()))
    }

    /// Read an externally stored value back through its reference.
    pub fn read_blob(&self, blob: &BlobRef) -> Result<Vec<u8>, ReadError> {
        let first_id = blob.first_page;
        let first = blob_page(self.store, first_id, PageType::BlobFirst)?;
        let length = first.read_u64(BLOB_FIRST_LENGTH);
        if length != blob.length {
            return Err(structure(
                first_id,
                format!("blob length {length} does not match reference {}", blob.length),
            ));
        }

        let mut value = Vec::with_capacity(length as usize);
        let chunk = first.read_u32(BLOB_FIRST_CHUNK) as usize;
        if chunk > BLOB_FIRST_CAPACITY {
            return Err(structure(first_id, "first chunk too large"));
        }
        value.extend_from_slice(first.read_bytes(BLOB_FIRST_DATA, chunk));
        let mut pages = 1u32;

        let mut index_id = first.read_u64(BLOB_FIRST_INDEX);
        while index_id != NULL_PAGE {
            let index = blob_page(self.store, index_id, PageType::BlobIndex)?;
            pages += 1;
            let count = index.read_u32(BLOB_INDEX_COUNT) as usize;
            if count > BLOB_INDEX_CAPACITY {
                return Err(structure(index_id, "index page entry count too large"));
            }
            for i in 0..count {
                let data_id = index.read_u64(BLOB_INDEX_ENTRIES + i * 8);
                let data = blob_page(self.store, data_id, PageType::BlobData)?;
                pages += 1;
                let chunk = data.read_u32(BLOB_DATA_CHUNK) as usize;
                if chunk > BLOB_DATA_CAPACITY {
                    return Err(structure(data_id, "data chunk too large"));
                }
                value.extend_from_slice(data.read_bytes(BLOB_DATA_DATA, chunk));
            }
            index_id = index.read_u64(BLOB_INDEX_NEXT);
        }

        if value.len() as u64 != blob.length || pages != blob.page_count {
            return Err(structure(
                first_id,
                format!(
                    "blob chain holds {} bytes in {pages} pages, reference says {} bytes in {} pages",
                    value.len(),
                    blob.length,
                    blob.page_count
                ),
            ));
        }
        Ok(value)
    }

    /// Check every structural property of the tree rooted at `root`.
    ///
    /// # Invariants checked
    ///
    /// - Every page has a valid checksum and the level of its position
    /// - Only the root carries the root flag
    /// - Keys ascend within and across the pages of every level
    /// - Each level is a doubly linked chain whose order matches the
    ///   child pointers of the level above
    /// - Node pointer keys separate their child from its left neighbor
    /// - Only the first record of each non-leaf level is a min record
    /// - No page uses more than its capacity minus its fill-factor reserve
    #[allow(clippy::too_many_lines, clippy::cognitive_complexity)]
    pub fn verify(&self, root: PageId) -> Result<TreeStats, ReadError> {
        if root == NULL_PAGE {
            return Ok(TreeStats::default());
        }
        let root_page = self.store.read_page(root)?;
        let root_view = node(root, &root_page)?;
        if !root_view.is_root {
            return Err(structure(root, "root flag not set"));
        }
        if root_view.header.prev != NULL_PAGE || root_view.header.next != NULL_PAGE {
            return Err(structure(root, "root has siblings"));
        }
        let root_level = root_view.header.level;

        let mut stats = TreeStats {
            root_level,
            pages_per_level: vec![0; usize::from(root_level) + 1],
            ..TreeStats::default()
        };

        // Expected (page, separator) for the level being walked.
        let mut expected: Vec<(PageId, Option<Vec<u8>>)> = vec![(root, None)];
        for level in (0..=root_level).rev() {
            let mut children = Vec::new();
            let mut prev_page = NULL_PAGE;
            let mut prev_key: Option<Vec<u8>> = None;

            for (position, (page_id, separator)) in expected.iter().enumerate() {
                let page_id = *page_id;
                let page = self.store.read_page(page_id)?;
                let view = node(page_id, &page)?;
                let header = view.header;

                if header.level != level {
                    return Err(structure(
                        page_id,
                        format!("expected level {level}, found {}", header.level),
                    ));
                }
                if page_id != root && view.is_root {
                    return Err(structure(page_id, "root flag on non-root page"));
                }
                if header.prev != prev_page {
                    return Err(structure(
                        page_id,
                        format!("prev is {}, expected {prev_page}", header.prev),
                    ));
                }
                let expected_next = expected.get(position + 1).map_or(NULL_PAGE, |(p, _)| *p);
                if header.next != expected_next {
                    return Err(structure(
                        page_id,
                        format!("next is {}, expected {expected_next}", header.next),
                    ));
                }
                let limit = NODE_CAPACITY.saturating_sub(usize::from(header.reserve));
                if header.used_bytes() > limit {
                    return Err(structure(
                        page_id,
                        format!("uses {} bytes, limit {limit}", header.used_bytes()),
                    ));
                }
                if header.record_count == 0 {
                    return Err(structure(page_id, "empty node"));
                }

                let mut records = view.records();
                let mut index = 0usize;
                loop {
                    let offset = records.offset();
                    let Some(record) = records.next() else {
                        break;
                    };
                    let record = record.map_err(|source| ReadError::Node {
                        page: page_id,
                        source,
                    })?;
                    if index % SLOT_STRIDE == 0 && view.slot(index / SLOT_STRIDE) != offset {
                        return Err(structure(page_id, format!("slot for record {index} is stale")));
                    }

                    let should_be_min = level > 0 && position == 0 && index == 0;
                    if record.is_min_rec() != should_be_min {
                        return Err(structure(
                            page_id,
                            format!("min record flag wrong on record {index}"),
                        ));
                    }

                    if index == 0
                        && let Some(separator) = separator
                    {
                        if self.comparator.compare(separator, record.key) == Ordering::Greater {
                            return Err(structure(page_id, "separator above first key"));
                        }
                        if let Some(prev) = &prev_key {
                            match self.comparator.compare(separator, prev) {
                                Ordering::Greater => {}
                                Ordering::Equal if self.comparator.on_duplicate(prev) => {}
                                _ => {
                                    return Err(structure(
                                        page_id,
                                        "separator not above left neighbor",
                                    ));
                                }
                            }
                        }
                    }

                    if let Some(prev) = &prev_key {
                        match self.comparator.compare(prev, record.key) {
                            Ordering::Less => {}
                            Ordering::Equal if self.comparator.on_duplicate(record.key) => {}
                            _ => {
                                return Err(structure(
                                    page_id,
                                    format!("key order broken at record {index}"),
                                ));
                            }
                        }
                    }
                    prev_key = Some(record.key.to_vec());

                    if level == 0 {
                        stats.records += 1;
                        if record.is_extern() {
                            let blob = record.blob_ref().map_err(|source| ReadError::Node {
                                page: page_id,
                                source,
                            })?;
                            self.check_blob_header(&blob)?;
                            stats.external_values += 1;
                        }
                    } else {
                        let child = record.child().map_err(|source| ReadError::Node {
                            page: page_id,
                            source,
                        })?;
                        let key = (!record.is_min_rec()).then(|| record.key.to_vec());
                        children.push((child, key));
                    }
                    index += 1;
                }

                stats.pages_per_level[usize::from(level)] += 1;
                prev_page = page_id;
            }

            expected = children;
        }

        Ok(stats)
    }

    fn check_blob_header(&self, blob: &BlobRef) -> Result<(), ReadError> {
        let first = blob_page(self.store, blob.first_page, PageType::BlobFirst)?;
        if first.read_u64(BLOB_FIRST_LENGTH) != blob.length {
            return Err(structure(blob.first_page, "blob length mismatch"));
        }
        Ok(())
    }
}

/// Cursor over leaf entries, following the `next` chain.
pub struct LeafCursor<'a> {
    store: &'a dyn PageStore,
    current_page_id: PageId,
    entries: std::vec::IntoIter<LeafEntry>,
}

impl LeafCursor<'_> {
    /// Get the next entry.
    pub fn next_entry(&mut self) -> Result<Option<LeafEntry>, ReadError> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Ok(Some(entry));
            }
            if self.current_page_id == NULL_PAGE {
                return Ok(None);
            }

            let page_id = self.current_page_id;
            let page = self.store.read_page(page_id)?;
            let view = node(page_id, &page)?;
            if !view.header.is_leaf() {
                return Err(structure(page_id, "leaf chain reached an internal node"));
            }

            let mut entries = Vec::with_capacity(usize::from(view.header.record_count));
            for record in view.records() {
                let record = record.map_err(|source| ReadError::Node {
                    page: page_id,
                    source,
                })?;
                let value = if record.is_extern() {
                    LeafValue::External(record.blob_ref().map_err(|source| ReadError::Node {
                        page: page_id,
                        source,
                    })?)
                } else {
                    LeafValue::Inline(record.payload.to_vec())
                };
                entries.push(LeafEntry {
                    key: record.key.to_vec(),
                    value,
                });
            }
            self.entries = entries.into_iter();
            self.current_page_id = view.header.next;
        }
    }
}
