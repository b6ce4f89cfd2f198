//! One level of a tree under construction.

use crate::btree::node::SegmentHeader;
use crate::btree::record::Record;
use crate::bulk::context::{BuildContext, PageCursor};
use crate::bulk::error::BulkError;
use crate::bulk::extent::ExtentKind;
use crate::bulk::page_builder::{Inserted, PageBuilder};
use crate::storage::{NULL_PAGE, PageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelState {
    Empty,
    Open,
    Finished,
}

/// Pages a level ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSpan {
    pub level: u16,
    pub first: PageId,
    pub last: PageId,
    pub pages: u64,
}

/// Builds the pages of one level left to right.
///
/// Each page that closes yields a node pointer for the level above. At
/// level 0 the pointer key is the shortest separator between the previous
/// page's last key and the closed page's first key; above that it is the
/// child's first key.
#[derive(Debug)]
pub struct LevelContext {
    level: u16,
    cursor: PageCursor,
    open: Option<PageBuilder>,
    state: LevelState,
    first_page: PageId,
    last_page: PageId,
    pages: u64,
    records: u64,
    prev_last_key: Option<Vec<u8>>,
}

impl LevelContext {
    #[must_use]
    pub const fn new(level: u16) -> Self {
        Self {
            level,
            cursor: PageCursor::new(ExtentKind::for_level(level)),
            open: None,
            state: LevelState::Empty,
            first_page: NULL_PAGE,
            last_page: NULL_PAGE,
            pages: 0,
            records: 0,
            prev_last_key: None,
        }
    }

    fn start_page(&mut self, ctx: &mut BuildContext, prev: PageId) -> Result<PageBuilder, BulkError> {
        let (page_id, extent) = self.cursor.next_page(ctx)?;
        let page = ctx.lease_page()?;
        if self.first_page == NULL_PAGE {
            self.first_page = page_id;
        }
        self.last_page = page_id;
        self.pages += 1;
        Ok(PageBuilder::init(
            page,
            page_id,
            extent,
            self.level,
            prev,
            ctx.env.config.page_reserve(),
        ))
    }

    /// Append a record, opening a new page when the current one is full.
    ///
    /// Returns the node pointer for the page that closed, if one did.
    pub fn insert(
        &mut self,
        ctx: &mut BuildContext,
        mut record: Record,
    ) -> Result<Option<Record>, BulkError> {
        if self.state == LevelState::Finished {
            return Err(BulkError::AlreadyFinished { level: self.level });
        }
        let limit = PageBuilder::max_record(ctx.env.config.page_reserve());
        let size = record.encoded_len();
        if size > limit {
            return Err(BulkError::RecordTooLarge {
                key: record.key,
                size,
                limit,
            });
        }
        if self.level > 0 && self.records == 0 {
            record.set_min_rec();
        }

        let mut page = match self.open.take() {
            Some(page) => page,
            None => {
                self.state = LevelState::Open;
                self.start_page(ctx, NULL_PAGE)?
            }
        };
        if page.insert(&record) == Inserted::Yes {
            self.open = Some(page);
            self.records += 1;
            return Ok(None);
        }

        let mut fresh = match self.start_page(ctx, page.page_id()) {
            Ok(fresh) => fresh,
            Err(e) => {
                self.open = Some(page);
                return Err(e);
            }
        };
        page.set_next(fresh.page_id());
        let pointer = self.close_page(ctx, page)?;
        if fresh.insert(&record) == Inserted::PageFull {
            return Err(BulkError::RecordTooLarge {
                key: record.key,
                size,
                limit,
            });
        }
        self.open = Some(fresh);
        self.records += 1;
        Ok(Some(pointer))
    }

    fn close_page(
        &mut self,
        ctx: &mut BuildContext,
        mut page: PageBuilder,
    ) -> Result<Record, BulkError> {
        let key = match &self.prev_last_key {
            Some(prev) if self.level == 0 => ctx.env.comparator.separator(prev, page.first_key()),
            _ => page.first_key().to_vec(),
        };
        if self.level == 0 {
            self.prev_last_key = Some(page.last_key().to_vec());
        }
        let child = page.page_id();
        page.finish();
        page.commit(ctx)?;
        Ok(Record::node_pointer(key, child))
    }

    /// Close the last page.
    ///
    /// With `root` set, the page becomes the root of the index and nothing is
    /// returned; otherwise the node pointer for the page is returned. An
    /// empty level returns nothing.
    pub fn finish(
        &mut self,
        ctx: &mut BuildContext,
        root: Option<SegmentHeader>,
    ) -> Result<Option<Record>, BulkError> {
        let state = std::mem::replace(&mut self.state, LevelState::Finished);
        match state {
            LevelState::Finished => Err(BulkError::AlreadyFinished { level: self.level }),
            LevelState::Empty => Ok(None),
            LevelState::Open => {
                let Some(mut page) = self.open.take() else {
                    return Ok(None);
                };
                if let Some(segments) = root {
                    page.mark_root(segments);
                    page.finish();
                    page.commit(ctx)?;
                    Ok(None)
                } else {
                    self.close_page(ctx, page).map(Some)
                }
            }
        }
    }

    /// Drop the open page without committing it.
    pub fn abandon(&mut self) {
        self.open = None;
        self.state = LevelState::Finished;
    }

    #[must_use]
    pub const fn level(&self) -> u16 {
        self.level
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    #[must_use]
    pub const fn span(&self) -> LevelSpan {
        LevelSpan {
            level: self.level,
            first: self.first_page,
            last: self.last_page,
            pages: self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NodeView;
    use crate::bulk::context::fixture::{fixture, small_config};
    use crate::storage::PageStore;

    fn row_record(i: u32) -> Record {
        Record::leaf(format!("row-{i:06}").into_bytes(), vec![0xAB; 200])
    }

    #[test]
    fn test_closing_pages_yields_separators() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("t", fx.env.clone()).expect("context");
        let mut level = LevelContext::new(0);
        let mut pointers = Vec::new();
        for i in 0..200 {
            if let Some(pointer) = level.insert(&mut ctx, row_record(i)).expect("insert") {
                pointers.push(pointer);
            }
        }
        pointers.push(level.finish(&mut ctx, None).expect("finish").expect("pointer"));
        assert_eq!(pointers.len() as u64, level.pages());
        assert!(level.pages() > 1);
        ctx.finish().expect("flush");

        // The first pointer carries the first key; later ones a separator that
        // sorts between the neighbouring pages.
        assert_eq!(pointers[0].key, b"row-000000");
        for pair in pointers.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }
        let span = level.span();
        let first = fx.store.read_page(span.first).expect("read");
        let view = NodeView::new(&first).expect("node");
        assert_eq!(view.header.prev, NULL_PAGE);
        assert_ne!(view.header.next, NULL_PAGE);
        let last = fx.store.read_page(span.last).expect("read");
        let view = NodeView::new(&last).expect("node");
        assert_eq!(view.header.next, NULL_PAGE);
    }

    #[test]
    fn test_first_record_above_leaves_is_min_rec() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("t", fx.env.clone()).expect("context");
        let mut level = LevelContext::new(1);
        level
            .insert(&mut ctx, Record::node_pointer(b"a".to_vec(), 3))
            .expect("insert");
        level
            .insert(&mut ctx, Record::node_pointer(b"b".to_vec(), 4))
            .expect("insert");
        let span = level.span();
        level.finish(&mut ctx, None).expect("finish");
        ctx.finish().expect("flush");

        let page = fx.store.read_page(span.first).expect("read");
        let view = NodeView::new(&page).expect("node");
        let records: Vec<_> = view.records().map(|r| r.expect("record")).collect();
        assert!(records[0].is_min_rec());
        assert!(!records[1].is_min_rec());
    }

    #[test]
    fn test_finish_twice_is_rejected() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("t", fx.env.clone()).expect("context");
        let mut level = LevelContext::new(0);
        level.insert(&mut ctx, row_record(1)).expect("insert");
        level.finish(&mut ctx, Some(fx.env.segments)).expect("finish");
        assert!(matches!(
            level.finish(&mut ctx, None),
            Err(BulkError::AlreadyFinished { level: 0 })
        ));
        assert!(matches!(
            level.insert(&mut ctx, row_record(2)),
            Err(BulkError::AlreadyFinished { level: 0 })
        ));
        ctx.finish().expect("flush");
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let fx = fixture(small_config());
        let mut ctx = BuildContext::new("t", fx.env.clone()).expect("context");
        let mut level = LevelContext::new(0);
        let huge = Record::leaf(b"k".to_vec(), vec![0; 9000]);
        assert!(matches!(
            level.insert(&mut ctx, huge),
            Err(BulkError::RecordTooLarge { .. })
        ));
        ctx.abort();
    }
}
