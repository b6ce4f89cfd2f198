//! Builds one complete subtree from a sorted stream of rows.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::btree::record::{MAX_KEY_LEN, Record, Row};
use crate::bulk::blob::{BlobInserter, BlobStats};
use crate::bulk::context::{BuildContext, BuildEnv};
use crate::bulk::error::BulkError;
use crate::bulk::flush::FlushStats;
use crate::bulk::level::{LevelContext, LevelSpan};
use crate::bulk::page_builder::leaf_record;
use crate::storage::{NULL_PAGE, PageId};

/// What a finished subtree builder produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeInfo {
    pub id: usize,
    /// Root page, or `NULL_PAGE` when no row was inserted.
    pub root: PageId,
    pub root_level: u16,
    /// One entry per level, lowest first.
    pub levels: Vec<LevelSpan>,
    pub min_key: Option<Vec<u8>>,
    pub max_key: Option<Vec<u8>>,
    pub rows: u64,
    pub pages: u64,
    pub blobs: BlobStats,
    pub flush: FlushStats,
}

impl SubtreeInfo {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root == NULL_PAGE
    }

    /// Span of `level`, if the subtree reaches it.
    #[must_use]
    pub fn span(&self, level: u16) -> Option<&LevelSpan> {
        self.levels.iter().find(|span| span.level == level)
    }
}

/// Builds a subtree bottom-up.
///
/// Records are appended at the lowest level; each page that fills up closes
/// and pushes a node pointer one level up, opening levels as needed.
/// `finish` closes every level bottom-up and marks the single page of the
/// top level as root.
///
/// The first error stops the builder: later inserts return the same error.
#[derive(Debug)]
pub struct SubtreeBuilder {
    id: usize,
    ctx: BuildContext,
    base_level: u16,
    levels: Vec<LevelContext>,
    blob: BlobInserter,
    min_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
    rows: u64,
    since_poll: u32,
    error: Option<BulkError>,
}

impl SubtreeBuilder {
    /// A builder for leaf rows.
    pub fn new(id: usize, env: BuildEnv) -> Result<Self, BulkError> {
        Self::with_base(id, format!("subtree-{id}"), env, 0)
    }

    /// A builder that takes node pointers at `base_level` and builds the
    /// levels above it.
    pub fn upper(name: impl Into<String>, env: BuildEnv, base_level: u16) -> Result<Self, BulkError> {
        Self::with_base(usize::MAX, name.into(), env, base_level)
    }

    fn with_base(id: usize, name: String, env: BuildEnv, base_level: u16) -> Result<Self, BulkError> {
        Ok(Self {
            id,
            ctx: BuildContext::new(name, env)?,
            base_level,
            levels: Vec::new(),
            blob: BlobInserter::new(),
            min_key: None,
            last_key: Vec::new(),
            rows: 0,
            since_poll: 0,
            error: None,
        })
    }

    /// Append a row. Rows must arrive in ascending key order.
    pub fn insert(&mut self, row: Row) -> Result<(), BulkError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let result = self.insert_row(row);
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    /// Append a node pointer at the base level.
    pub fn insert_pointer(&mut self, record: Record) -> Result<(), BulkError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let result = self.poll().and_then(|()| {
            self.track_key(&record.key);
            self.insert_at(0, record)
        });
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    fn insert_row(&mut self, row: Row) -> Result<(), BulkError> {
        self.poll()?;
        if row.key.len() > MAX_KEY_LEN {
            return Err(BulkError::RecordTooLarge {
                size: row.key.len(),
                key: row.key,
                limit: MAX_KEY_LEN,
            });
        }
        if self.ctx.env.config.validate_order {
            self.check_order(&row.key)?;
        }
        self.track_key(&row.key);
        let threshold = self.ctx.env.config.blob_threshold;
        let record = leaf_record(row, threshold, &mut self.blob, &mut self.ctx)?;
        self.insert_at(0, record)?;
        self.rows += 1;
        Ok(())
    }

    fn check_order(&self, key: &[u8]) -> Result<(), BulkError> {
        if self.min_key.is_none() {
            return Ok(());
        }
        let comparator = &self.ctx.env.comparator;
        match comparator.compare(&self.last_key, key) {
            Ordering::Less => Ok(()),
            Ordering::Equal if comparator.on_duplicate(key) => Ok(()),
            Ordering::Equal => Err(BulkError::DuplicateKey { key: key.to_vec() }),
            Ordering::Greater => Err(BulkError::UnsortedInput {
                previous: self.last_key.clone(),
                key: key.to_vec(),
            }),
        }
    }

    fn track_key(&mut self, key: &[u8]) {
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    fn poll(&mut self) -> Result<(), BulkError> {
        self.since_poll += 1;
        if self.since_poll >= self.ctx.env.config.interrupt_poll_interval {
            self.since_poll = 0;
            self.ctx.check_interrupt()?;
            self.ctx.check_flush()?;
        }
        Ok(())
    }

    /// Insert at level `index` (relative to the base) and carry node
    /// pointers upward until a level absorbs one without closing a page.
    fn insert_at(&mut self, mut index: usize, record: Record) -> Result<(), BulkError> {
        let mut pending = Some(record);
        while let Some(record) = pending.take() {
            if index == self.levels.len() {
                let level = self.base_level + index as u16;
                tracing::trace!(builder = %self.ctx.name, level, "level opened");
                self.levels.push(LevelContext::new(level));
            }
            pending = self.levels[index].insert(&mut self.ctx, record)?;
            index += 1;
        }
        Ok(())
    }

    /// Close every level bottom-up. Returns the root page and level.
    fn close_levels(&mut self) -> Result<Option<(PageId, u16)>, BulkError> {
        let segments = self.ctx.env.segments;
        let mut index = 0;
        while index < self.levels.len() {
            let top = index + 1 == self.levels.len();
            let level = &mut self.levels[index];
            if top && level.pages() <= 1 {
                let span = level.span();
                level.finish(&mut self.ctx, Some(segments))?;
                if span.pages == 0 {
                    return Ok(None);
                }
                return Ok(Some((span.first, span.level)));
            }
            if let Some(pointer) = level.finish(&mut self.ctx, None)? {
                self.insert_at(index + 1, pointer)?;
            }
            index += 1;
        }
        Ok(None)
    }

    /// Close all levels, flush everything and describe the result.
    pub fn finish(mut self) -> Result<SubtreeInfo, BulkError> {
        if let Some(e) = self.error.take() {
            return Err(self.abort(e));
        }
        let root = match self.close_levels() {
            Ok(root) => root,
            Err(e) => return Err(self.abort(e)),
        };

        let Self {
            id,
            ctx,
            base_level,
            levels,
            blob,
            min_key,
            last_key,
            rows,
            ..
        } = self;
        let name = ctx.name.clone();
        let pages = ctx.pages_committed();
        let flush = ctx.finish()?;
        let (root, root_level) = root.unwrap_or((NULL_PAGE, base_level));
        let max_key = min_key.is_some().then_some(last_key);
        tracing::info!(
            builder = %name,
            rows,
            pages,
            root,
            root_level,
            "subtree built"
        );
        Ok(SubtreeInfo {
            id,
            root,
            root_level,
            levels: levels.iter().map(LevelContext::span).collect(),
            min_key,
            max_key,
            rows,
            pages,
            blobs: blob.stats(),
            flush,
        })
    }

    /// Drop every unwritten page and stop the flush pipeline. Returns `err`.
    pub fn abort(mut self, err: BulkError) -> BulkError {
        for level in &mut self.levels {
            level.abandon();
        }
        self.blob.abandon();
        if err.is_interrupt() {
            tracing::info!(builder = %self.ctx.name, "subtree build interrupted");
        } else {
            tracing::warn!(builder = %self.ctx.name, error = %err, "subtree build failed");
        }
        self.ctx.abort();
        err
    }

    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows
    }
}

/// Build a subtree from `rows`, which must be sorted.
pub fn build_subtree<I>(id: usize, env: &BuildEnv, rows: I) -> Result<SubtreeInfo, BulkError>
where
    I: IntoIterator<Item = Row>,
{
    let mut builder = SubtreeBuilder::new(id, env.clone())?;
    for row in rows {
        if let Err(e) = builder.insert(row) {
            return Err(builder.abort(e));
        }
    }
    builder.finish()
}
