//! Parallel index build: one subtree builder per input partition, then a
//! merge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::btree::compare::{BytewiseComparator, KeyComparator};
use crate::btree::node::SegmentHeader;
use crate::btree::record::Row;
use crate::bulk::allocator::{AllocatorStats, ExtentAllocator};
use crate::bulk::context::BuildEnv;
use crate::bulk::error::BulkError;
use crate::bulk::flush::IoCounter;
use crate::bulk::interrupt::{InterruptCheck, NeverInterrupt, NoopObserver, WaitObserver};
use crate::bulk::merge::{TreeRoot, merge};
use crate::bulk::subtree::{SubtreeInfo, build_subtree};
use crate::config::BulkLoadConfig;
use crate::storage::{BufferPool, PageStore, SegmentKind, StorageError, Tablespace};

/// Stops every worker once one of them fails, or when the caller interrupts.
struct BuildInterrupt {
    caller: Arc<dyn InterruptCheck>,
    failed: AtomicBool,
}

impl InterruptCheck for BuildInterrupt {
    fn is_interrupted(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.caller.is_interrupted()
    }
}

/// Counters of a finished build.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub rows: u64,
    pub pages: u64,
    pub blobs: u64,
    pub pages_written: u64,
    pub subtrees: Vec<SubtreeInfo>,
    pub allocator: AllocatorStats,
    pub elapsed: Duration,
}

/// A finished index.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub root: TreeRoot,
    pub segments: SegmentHeader,
    pub stats: BuildStats,
}

/// Builds one index from sorted, disjoint partitions.
///
/// Partition `i` must hold keys that all sort before those of partition
/// `i + 1`. On failure every page allocated for the index goes back to the
/// tablespace.
pub struct IndexBuild {
    config: Arc<BulkLoadConfig>,
    store: Arc<dyn PageStore>,
    space: Arc<Tablespace>,
    pool: Arc<BufferPool>,
    comparator: Arc<dyn KeyComparator>,
    interrupt: Arc<dyn InterruptCheck>,
    observer: Arc<dyn WaitObserver>,
    estimated_pages: u64,
}

impl IndexBuild {
    #[must_use]
    pub fn new(config: BulkLoadConfig, store: Arc<dyn PageStore>, space: Arc<Tablespace>) -> Self {
        let pool = BufferPool::new(config.buffer_pool_pages);
        Self {
            config: Arc::new(config),
            store,
            space,
            pool,
            comparator: Arc::new(BytewiseComparator),
            interrupt: Arc::new(NeverInterrupt),
            observer: Arc::new(NoopObserver),
            estimated_pages: 0,
        }
    }

    #[must_use]
    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
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

    /// Expected size of the finished index, used to size allocator caches.
    #[must_use]
    pub const fn with_estimated_pages(mut self, pages: u64) -> Self {
        self.estimated_pages = pages;
        self
    }

    /// Build the index. Each partition is consumed by its own thread.
    pub fn run<P>(&self, partitions: Vec<P>) -> Result<BuildOutput, BulkError>
    where
        P: IntoIterator<Item = Row> + Send,
    {
        let started = Instant::now();
        let segments = SegmentHeader {
            leaf: self.space.create_segment(SegmentKind::Leaf),
            non_leaf: self.space.create_segment(SegmentKind::NonLeaf),
        };
        let workers = partitions.len();
        let buffers_needed = workers.saturating_mul(self.config.buffers_per_builder());
        if buffers_needed > self.pool.capacity() {
            tracing::warn!(
                workers,
                buffers_needed,
                pool = self.pool.capacity(),
                "buffer pool may run out before builders flush"
            );
        }
        tracing::info!(
            workers,
            leaf_segment = %segments.leaf,
            non_leaf_segment = %segments.non_leaf,
            "index build started"
        );

        let allocator = match ExtentAllocator::start(
            Arc::clone(&self.space),
            segments,
            &self.config,
            workers,
            self.estimated_pages,
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                self.rollback(segments);
                return Err(e);
            }
        };

        let interrupt = Arc::new(BuildInterrupt {
            caller: Arc::clone(&self.interrupt),
            failed: AtomicBool::new(false),
        });
        let io = Arc::new(IoCounter::default());
        let env = BuildEnv::new(
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            allocator.handle(),
            segments,
        )
        .with_comparator(Arc::clone(&self.comparator))
        .with_interrupt(interrupt.clone())
        .with_observer(Arc::clone(&self.observer))
        .with_io_counter(Arc::clone(&io));

        let result = run_workers(&env, &interrupt, partitions).and_then(|subtrees| {
            let root = merge(&env, subtrees.clone())?;
            self.store.sync()?;
            Ok((root, subtrees))
        });
        drop(env);
        let allocator_stats = allocator.stop();

        match result {
            Ok((root, subtrees)) => {
                let stats = BuildStats {
                    rows: subtrees.iter().map(|s| s.rows).sum(),
                    pages: subtrees.iter().map(|s| s.pages).sum(),
                    blobs: subtrees.iter().map(|s| s.blobs.blobs).sum(),
                    pages_written: io.written(),
                    subtrees,
                    allocator: allocator_stats,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    root = root.page,
                    level = root.level,
                    rows = stats.rows,
                    pages_written = stats.pages_written,
                    elapsed_ms = stats.elapsed.as_millis(),
                    "index build finished"
                );
                Ok(BuildOutput {
                    root,
                    segments,
                    stats,
                })
            }
            Err(e) => {
                if e.is_interrupt() {
                    tracing::info!("index build interrupted");
                } else {
                    tracing::error!(error = %e, "index build failed");
                }
                self.rollback(segments);
                Err(e)
            }
        }
    }

    /// Return every page of the index to the tablespace.
    fn rollback(&self, segments: SegmentHeader) {
        for segment in [segments.leaf, segments.non_leaf] {
            match self.space.release_segment(segment) {
                Ok(pages) => tracing::debug!(%segment, pages, "segment released"),
                Err(e) => tracing::warn!(%segment, error = %e, "segment release failed"),
            }
        }
    }
}

/// Run one builder thread per partition and collect their subtrees in
/// partition order.
///
/// When any worker fails the others are interrupted. The reported error is
/// the first real failure, not the interruptions it caused.
fn run_workers<P>(
    env: &BuildEnv,
    interrupt: &BuildInterrupt,
    partitions: Vec<P>,
) -> Result<Vec<SubtreeInfo>, BulkError>
where
    P: IntoIterator<Item = Row> + Send,
{
    let results: Vec<Result<SubtreeInfo, BulkError>> = thread::scope(|scope| {
        let handles: Vec<_> = partitions
            .into_iter()
            .enumerate()
            .map(|(id, rows)| {
                let env = env.clone();
                let spawned = thread::Builder::new()
                    .name(format!("subtree-{id}"))
                    .spawn_scoped(scope, move || {
                        let result = build_subtree(id, &env, rows);
                        if result.is_err() {
                            interrupt.failed.store(true, Ordering::Release);
                        }
                        result
                    });
                if spawned.is_err() {
                    interrupt.failed.store(true, Ordering::Release);
                }
                (id, spawned)
            })
            .collect();
        handles
            .into_iter()
            .map(|(id, spawned)| match spawned {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    interrupt.failed.store(true, Ordering::Release);
                    Err(BulkError::WorkerPanicked {
                        worker: format!("subtree-{id}"),
                    })
                }),
                Err(e) => Err(StorageError::from(e).into()),
            })
            .collect()
    });

    let mut subtrees = Vec::with_capacity(results.len());
    let mut first_error: Option<BulkError> = None;
    for result in results {
        match result {
            Ok(info) => subtrees.push(info),
            Err(e) => {
                let replace = first_error
                    .as_ref()
                    .is_none_or(|current| current.is_interrupt() && !e.is_interrupt());
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(subtrees),
    }
}
