//! Per-builder state shared by every level and the blob inserter.

use std::sync::Arc;

use crate::btree::compare::{BytewiseComparator, KeyComparator};
use crate::btree::node::SegmentHeader;
use crate::bulk::allocator::{AllocUnit, AllocatorHandle};
use crate::bulk::error::BulkError;
use crate::bulk::extent::{Extent, ExtentArena, ExtentHandle, ExtentKind, ObjectPool};
use crate::bulk::flush::{FlushPipeline, FlushStats, IoCounter};
use crate::bulk::interrupt::{InterruptCheck, NeverInterrupt, NoopObserver, WaitObserver};
use crate::config::BulkLoadConfig;
use crate::storage::{BufferPool, Page, PageId, PageStore, SpaceError};

/// Idle extent objects kept for reuse across all builders of a build.
const EXTENT_POOL_SIZE: usize = 256;

/// Everything the builders of one index share.
#[derive(Clone)]
pub struct BuildEnv {
    pub config: Arc<BulkLoadConfig>,
    pub store: Arc<dyn PageStore>,
    pub pool: Arc<BufferPool>,
    pub allocator: AllocatorHandle,
    pub segments: SegmentHeader,
    pub comparator: Arc<dyn KeyComparator>,
    pub interrupt: Arc<dyn InterruptCheck>,
    pub observer: Arc<dyn WaitObserver>,
    pub extents: ObjectPool<Extent>,
    pub io: Option<Arc<IoCounter>>,
}

impl std::fmt::Debug for BuildEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEnv")
            .field("config", &self.config)
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

impl BuildEnv {
    /// An environment with bytewise keys, no interruption and no wait observer.
    #[must_use]
    pub fn new(
        config: Arc<BulkLoadConfig>,
        store: Arc<dyn PageStore>,
        pool: Arc<BufferPool>,
        allocator: AllocatorHandle,
        segments: SegmentHeader,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            allocator,
            segments,
            comparator: Arc::new(BytewiseComparator),
            interrupt: Arc::new(NeverInterrupt),
            observer: Arc::new(NoopObserver),
            extents: ObjectPool::new(EXTENT_POOL_SIZE),
            io: None,
        }
    }

    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<dyn InterruptCheck>) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn WaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_io_counter(mut self, io: Arc<IoCounter>) -> Self {
        self.io = Some(io);
        self
    }
}

/// State of one builder: its extents and its flush pipeline.
#[derive(Debug)]
pub struct BuildContext {
    pub name: String,
    pub env: BuildEnv,
    arena: ExtentArena,
    flush: FlushPipeline,
    pages_committed: u64,
}

impl BuildContext {
    pub fn new(name: impl Into<String>, env: BuildEnv) -> Result<Self, BulkError> {
        let name = name.into();
        let flush = FlushPipeline::start(
            name.clone(),
            Arc::clone(&env.store),
            env.extents.clone(),
            env.config.flush_queue_depth,
            env.config.vectored_io,
            env.io.clone(),
        )?;
        Ok(Self {
            name,
            env,
            arena: ExtentArena::new(),
            flush,
            pages_committed: 0,
        })
    }

    /// A zeroed page buffer from the shared pool.
    pub fn lease_page(&self) -> Result<Page, BulkError> {
        self.env
            .pool
            .lease_page_zeroed()
            .ok_or(BulkError::BufferPoolExhausted)
    }

    pub fn check_interrupt(&self) -> Result<(), BulkError> {
        if self.env.interrupt.is_interrupted() {
            return Err(BulkError::Interrupted);
        }
        Ok(())
    }

    /// Surface a background flush failure.
    pub fn check_flush(&self) -> Result<(), BulkError> {
        self.flush.check_and_notify()
    }

    /// Hand a finished page to its extent.
    ///
    /// When that completes the extent, it moves to the flush pipeline.
    pub fn commit(
        &mut self,
        handle: ExtentHandle,
        page_id: PageId,
        page: Page,
    ) -> Result<(), BulkError> {
        let extent = self.arena.get_mut(handle)?;
        extent.commit(page_id, page);
        self.pages_committed += 1;
        if extent.is_complete() {
            let extent = self.arena.remove(handle)?;
            self.flush.add(extent, self.env.observer.as_ref())?;
        }
        Ok(())
    }

    /// Allocate a fresh range and register it in the arena.
    fn new_extent(
        &mut self,
        kind: ExtentKind,
        unit: AllocUnit,
    ) -> Result<(PageId, ExtentHandle), BulkError> {
        let range = self.env.allocator.allocate(
            kind,
            unit,
            self.env.observer.as_ref(),
            self.env.interrupt.as_ref(),
        )?;
        let mut extent = self.env.extents.checkout();
        extent.reset(kind, range);
        let Some(page_id) = extent.claim() else {
            return Err(BulkError::OutOfSpace(SpaceError::Exhausted {
                requested: 1,
                max_pages: range.count,
            }));
        };
        Ok((page_id, self.arena.insert(extent)))
    }

    #[must_use]
    pub const fn pages_committed(&self) -> u64 {
        self.pages_committed
    }

    /// Flush every remaining extent and stop the pipeline.
    ///
    /// Pages that were allocated but never claimed go back to the tablespace.
    ///
    /// # Pre-conditions
    ///
    /// Every claimed page has been committed.
    pub fn finish(mut self) -> Result<FlushStats, BulkError> {
        for extent in self.arena.drain() {
            debug_assert!(extent.all_claimed_committed());
            if let Err(e) = self
                .env
                .allocator
                .release_unused(extent.kind(), extent.unused_range())
            {
                self.abort();
                return Err(e);
            }
            if extent.committed() == 0 {
                self.env.extents.release(extent);
            } else if let Err(e) = self.flush.add(extent, self.env.observer.as_ref()) {
                self.abort();
                return Err(e);
            }
        }
        let Self { name, flush, .. } = self;
        let stats = flush.wait_to_stop()?;
        tracing::debug!(builder = %name, pages = stats.pages, "builder flushed");
        Ok(stats)
    }

    /// Drop every in-memory page and stop the pipeline without reporting
    /// its outcome. The caller already holds the error that caused the abort.
    pub fn abort(self) {
        let Self {
            name,
            mut arena,
            flush,
            ..
        } = self;
        let dropped = arena.drain().len();
        if let Err(e) = flush.wait_to_stop() {
            tracing::debug!(builder = %name, error = %e, "flush pipeline failed during abort");
        }
        tracing::debug!(builder = %name, extents = dropped, "builder aborted");
    }
}

/// Hands out page numbers for one level (or for blob pages).
///
/// The first `fragment_pages` pages are allocated one at a time; after that
/// the cursor takes whole extents and claims pages from them in order.
#[derive(Debug)]
pub struct PageCursor {
    kind: ExtentKind,
    current: Option<ExtentHandle>,
    pages_taken: u64,
}

impl PageCursor {
    #[must_use]
    pub const fn new(kind: ExtentKind) -> Self {
        Self {
            kind,
            current: None,
            pages_taken: 0,
        }
    }

    /// Next page number and the extent it belongs to.
    pub fn next_page(
        &mut self,
        ctx: &mut BuildContext,
    ) -> Result<(PageId, ExtentHandle), BulkError> {
        if let Some(handle) = self.current
            && let Some(page_id) = ctx.arena.try_claim(handle)
        {
            self.pages_taken += 1;
            return Ok((page_id, handle));
        }
        let unit = if self.pages_taken < ctx.env.config.fragment_pages {
            AllocUnit::Page
        } else {
            AllocUnit::Extent
        };
        let (page_id, handle) = ctx.new_extent(self.kind, unit)?;
        self.current = Some(handle);
        self.pages_taken += 1;
        Ok((page_id, handle))
    }

    #[must_use]
    pub const fn pages_taken(&self) -> u64 {
        self.pages_taken
    }
}
