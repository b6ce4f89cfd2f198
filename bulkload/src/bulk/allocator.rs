//! Shared extent allocator.
//!
//! All subtree builders of one index draw page ranges from here. Whole
//! extents come from two caches (leaf and non-leaf) that a background
//! thread keeps topped up, so builders rarely talk to the tablespace
//! themselves. Single pages are always allocated directly.
//!
//! The first allocation failure is recorded and returned to every later
//! caller; the background thread stops at that point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::btree::node::SegmentHeader;
use crate::bulk::error::BulkError;
use crate::bulk::extent::ExtentKind;
use crate::bulk::interrupt::{InterruptCheck, WaitKind, WaitObserver};
use crate::config::BulkLoadConfig;
use crate::storage::{PageRange, SegmentId, Tablespace};

/// Extents allocated per cache before the producer publishes them.
const REFILL_BATCH: usize = 16;

/// Granularity of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocUnit {
    /// One page, allocated directly from the tablespace.
    Page,
    /// A whole extent, taken from the cache.
    Extent,
}

/// Counters kept by the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Extents allocated by the background thread.
    pub extents_prefetched: u64,
    /// Ranges allocated directly on a caller's thread.
    pub direct_allocations: u64,
    /// Times a caller found its cache empty and had to wait.
    pub consumer_waits: u64,
    /// Cached pages given back to the tablespace at shutdown.
    pub pages_returned: u64,
}

/// Cache sizes for a build.
///
/// Each cache holds about a quarter of the extents the data is expected to
/// need, at least two per worker, never more than `max_cached_extents`.
#[must_use]
pub fn cache_capacities(
    workers: usize,
    estimated_pages: u64,
    config: &BulkLoadConfig,
) -> (usize, usize) {
    let expected =
        usize::try_from(estimated_pages.div_ceil(config.extent_pages)).unwrap_or(usize::MAX);
    let max = config.max_cached_extents;
    let leaf = expected.div_ceil(4).max(workers * 2).min(max).max(1);
    let non_leaf = (leaf / 16).max(workers).min(max).max(1);
    (leaf, non_leaf)
}

#[derive(Debug)]
struct Cache {
    ranges: VecDeque<PageRange>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            ranges: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn deficit(&self) -> usize {
        self.capacity.saturating_sub(self.ranges.len())
    }
}

#[derive(Debug)]
struct AllocState {
    leaf: Cache,
    non_leaf: Cache,
    error: Option<BulkError>,
    stop: bool,
    stats: AllocatorStats,
}

impl AllocState {
    const fn cache_mut(&mut self, kind: ExtentKind) -> &mut Cache {
        match kind {
            ExtentKind::Leaf => &mut self.leaf,
            ExtentKind::NonLeaf => &mut self.non_leaf,
        }
    }

    fn record_error(&mut self, err: &BulkError) {
        if self.error.is_none() {
            tracing::warn!(error = %err, "extent allocation failed");
            self.error = Some(err.clone());
        }
    }
}

#[derive(Debug)]
struct Shared {
    space: Arc<Tablespace>,
    segments: SegmentHeader,
    extent_pages: u64,
    background: bool,
    tick: Duration,
    state: Mutex<AllocState>,
    /// Signalled when a cache drops below capacity or on shutdown.
    need: Condvar,
    /// Signalled when extents are published or an error is recorded.
    ready: Condvar,
}

impl Shared {
    const fn segment(&self, kind: ExtentKind) -> SegmentId {
        match kind {
            ExtentKind::Leaf => self.segments.leaf,
            ExtentKind::NonLeaf => self.segments.non_leaf,
        }
    }

    /// Allocate on the caller's thread. One tablespace call is one
    /// mini-transaction.
    fn allocate_direct(&self, kind: ExtentKind, pages: u64) -> Result<PageRange, BulkError> {
        if let Some(err) = &self.state.lock().error {
            return Err(err.clone());
        }
        match self.space.allocate(self.segment(kind), pages) {
            Ok(range) => {
                self.state.lock().stats.direct_allocations += 1;
                Ok(range)
            }
            Err(e) => {
                let err = BulkError::from(e);
                self.state.lock().record_error(&err);
                self.ready.notify_all();
                Err(err)
            }
        }
    }

    fn run_producer(&self) {
        tracing::debug!("extent allocator started");
        loop {
            let (leaf_need, non_leaf_need) = {
                let mut state = self.state.lock();
                loop {
                    if state.stop || state.error.is_some() {
                        tracing::debug!("extent allocator stopping");
                        return;
                    }
                    let needs = (state.leaf.deficit(), state.non_leaf.deficit());
                    if needs != (0, 0) {
                        break needs;
                    }
                    self.need.wait(&mut state);
                }
            };

            let mut failure = None;
            let mut leaf = Vec::new();
            let mut non_leaf = Vec::new();
            for (kind, need, out) in [
                (ExtentKind::Leaf, leaf_need, &mut leaf),
                (ExtentKind::NonLeaf, non_leaf_need, &mut non_leaf),
            ] {
                for _ in 0..need.min(REFILL_BATCH) {
                    if failure.is_some() {
                        break;
                    }
                    match self.space.allocate(self.segment(kind), self.extent_pages) {
                        Ok(range) => out.push(range),
                        Err(e) => failure = Some(BulkError::from(e)),
                    }
                }
            }

            let mut state = self.state.lock();
            let published = (leaf.len() + non_leaf.len()) as u64;
            state.leaf.ranges.extend(leaf);
            state.non_leaf.ranges.extend(non_leaf);
            state.stats.extents_prefetched += published;
            if let Some(err) = failure {
                state.record_error(&err);
            }
            tracing::trace!(
                published,
                leaf_cached = state.leaf.ranges.len(),
                non_leaf_cached = state.non_leaf.ranges.len(),
                "published extents"
            );
            drop(state);
            self.ready.notify_all();
        }
    }
}

/// Owner of the allocator and its background thread.
#[derive(Debug)]
pub struct ExtentAllocator {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ExtentAllocator {
    /// Start an allocator for the index owning `segments`.
    ///
    /// `workers` and `estimated_pages` size the caches.
    pub fn start(
        space: Arc<Tablespace>,
        segments: SegmentHeader,
        config: &BulkLoadConfig,
        workers: usize,
        estimated_pages: u64,
    ) -> Result<Self, BulkError> {
        let (leaf_cap, non_leaf_cap) = cache_capacities(workers, estimated_pages, config);
        let shared = Arc::new(Shared {
            space,
            segments,
            extent_pages: config.extent_pages,
            background: config.background_allocation,
            tick: config.allocator_wait_timeout,
            state: Mutex::new(AllocState {
                leaf: Cache::new(leaf_cap),
                non_leaf: Cache::new(non_leaf_cap),
                error: None,
                stop: false,
                stats: AllocatorStats::default(),
            }),
            need: Condvar::new(),
            ready: Condvar::new(),
        });

        let worker = if config.background_allocation {
            let producer = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("extent-allocator".to_string())
                .spawn(move || producer.run_producer())
                .map_err(crate::storage::StorageError::from)?;
            Some(handle)
        } else {
            None
        };

        tracing::info!(
            leaf_cache = leaf_cap,
            non_leaf_cache = non_leaf_cap,
            background = config.background_allocation,
            "extent allocator ready"
        );
        Ok(Self { shared, worker })
    }

    /// A cloneable handle for builders.
    #[must_use]
    pub fn handle(&self) -> AllocatorHandle {
        AllocatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop the background thread and give every cached extent back to the
    /// tablespace.
    pub fn stop(mut self) -> AllocatorStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> AllocatorStats {
        self.shared.state.lock().stop = true;
        self.shared.need.notify_all();
        self.shared.ready.notify_all();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("extent allocator thread panicked");
        }

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let cached: Vec<(ExtentKind, PageRange)> = state
            .leaf
            .ranges
            .drain(..)
            .map(|r| (ExtentKind::Leaf, r))
            .chain(state.non_leaf.ranges.drain(..).map(|r| (ExtentKind::NonLeaf, r)))
            .collect();
        for (kind, range) in cached {
            match self.shared.space.free_range(self.shared.segment(kind), range) {
                Ok(()) => state.stats.pages_returned += range.count,
                // The segment is gone when a failed build already released it.
                Err(e) => tracing::debug!(error = %e, "cached extent not returned"),
            }
        }
        tracing::debug!(stats = ?state.stats, "extent allocator stopped");
        state.stats
    }
}

impl Drop for ExtentAllocator {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

/// Handle used by builders to request page ranges.
#[derive(Debug, Clone)]
pub struct AllocatorHandle {
    shared: Arc<Shared>,
}

impl AllocatorHandle {
    /// Pages per whole extent.
    #[must_use]
    pub fn extent_pages(&self) -> u64 {
        self.shared.extent_pages
    }

    /// Allocate a page range for `kind`.
    ///
    /// Blocks while the cache is empty, calling `observer` around the wait
    /// and re-checking `interrupt` on every wake-up.
    ///
    /// # Post-conditions
    ///
    /// The range is owned by the index segment for `kind` and was never
    /// handed out before.
    pub fn allocate(
        &self,
        kind: ExtentKind,
        unit: AllocUnit,
        observer: &dyn WaitObserver,
        interrupt: &dyn InterruptCheck,
    ) -> Result<PageRange, BulkError> {
        if interrupt.is_interrupted() {
            return Err(BulkError::Interrupted);
        }
        let shared = &*self.shared;
        if unit == AllocUnit::Page {
            return shared.allocate_direct(kind, 1);
        }
        if !shared.background {
            return shared.allocate_direct(kind, shared.extent_pages);
        }

        let mut waiting = false;
        let mut state = shared.state.lock();
        let result = loop {
            if let Some(err) = &state.error {
                break Err(err.clone());
            }
            if let Some(range) = state.cache_mut(kind).ranges.pop_front() {
                shared.need.notify_one();
                break Ok(range);
            }
            if state.stop {
                drop(state);
                if waiting {
                    observer.wait_end(WaitKind::Allocation);
                }
                return shared.allocate_direct(kind, shared.extent_pages);
            }
            if interrupt.is_interrupted() {
                break Err(BulkError::Interrupted);
            }
            if !waiting {
                waiting = true;
                state.stats.consumer_waits += 1;
                observer.wait_begin(WaitKind::Allocation);
            }
            shared.need.notify_one();
            shared.ready.wait_for(&mut state, shared.tick);
        };
        drop(state);
        if waiting {
            observer.wait_end(WaitKind::Allocation);
        }
        result
    }

    /// Give back pages that were allocated but never used.
    pub fn release_unused(&self, kind: ExtentKind, range: PageRange) -> Result<(), BulkError> {
        if range.is_empty() {
            return Ok(());
        }
        self.shared
            .space
            .free_range(self.shared.segment(kind), range)
            .map_err(BulkError::from)
    }

    /// The recorded allocation failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<BulkError> {
        self.shared.state.lock().error.clone()
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.shared.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::interrupt::recording::WaitLog;
    use crate::bulk::interrupt::{InterruptFlag, NeverInterrupt, NoopObserver, StallCounter};
    use crate::storage::SegmentKind;

    fn setup(space: Tablespace, config: &BulkLoadConfig) -> (Arc<Tablespace>, ExtentAllocator) {
        let space = Arc::new(space);
        let segments = SegmentHeader {
            leaf: space.create_segment(SegmentKind::Leaf),
            non_leaf: space.create_segment(SegmentKind::NonLeaf),
        };
        let allocator =
            ExtentAllocator::start(Arc::clone(&space), segments, config, 2, 1_000).expect("start");
        (space, allocator)
    }

    fn small_config() -> BulkLoadConfig {
        BulkLoadConfig {
            extent_pages: 8,
            max_cached_extents: 4,
            allocator_wait_timeout: Duration::from_millis(5),
            ..BulkLoadConfig::default()
        }
    }

    #[test]
    fn test_cache_capacities() {
        let config = BulkLoadConfig::default();
        // Tiny build: bounded below by workers.
        assert_eq!(cache_capacities(4, 10, &config), (8, 4));
        // Huge build: capped.
        let (leaf, non_leaf) = cache_capacities(4, u64::MAX / 2, &config);
        assert_eq!(leaf, config.max_cached_extents);
        assert_eq!(non_leaf, config.max_cached_extents / 16);
    }

    #[test]
    fn test_extents_are_disjoint() {
        let config = small_config();
        let (space, allocator) = setup(Tablespace::new(1), &config);
        let handle = allocator.handle();

        let mut ranges = Vec::new();
        for i in 0..20 {
            let kind = if i % 3 == 0 {
                ExtentKind::NonLeaf
            } else {
                ExtentKind::Leaf
            };
            let unit = if i % 5 == 0 {
                AllocUnit::Page
            } else {
                AllocUnit::Extent
            };
            let range = handle
                .allocate(kind, unit, &NoopObserver, &NeverInterrupt)
                .expect("allocate");
            assert_eq!(range.count, if unit == AllocUnit::Page { 1 } else { 8 });
            ranges.push(range);
        }
        ranges.sort_by_key(|r| r.first);
        for pair in ranges.windows(2) {
            assert!(pair[0].end() <= pair[1].first);
        }
        for range in &ranges {
            assert!(space.is_allocated(range.first));
        }

        allocator.stop();
        let handed_out: u64 = ranges.iter().map(|r| r.count).sum();
        assert_eq!(space.used_pages(), 1 + handed_out);
    }

    #[test]
    fn test_stop_returns_cached_extents() {
        let config = small_config();
        let (space, allocator) = setup(Tablespace::new(1), &config);
        let handle = allocator.handle();
        let taken = handle
            .allocate(ExtentKind::Leaf, AllocUnit::Extent, &NoopObserver, &NeverInterrupt)
            .expect("allocate");

        allocator.stop();
        // Only the range handed out remains allocated (plus page 0).
        assert_eq!(space.used_pages(), 1 + taken.count);
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let config = small_config();
        // Room for page 0 plus three extents.
        let (_space, allocator) = setup(Tablespace::with_limit(1, 25), &config);
        let handle = allocator.handle();
        let counter = StallCounter::default();

        let mut successes = 0;
        let err = loop {
            match handle.allocate(ExtentKind::Leaf, AllocUnit::Extent, &counter, &NeverInterrupt) {
                Ok(_) => successes += 1,
                Err(e) => break e,
            }
            assert!(successes <= 3, "more extents than the space holds");
        };
        assert!(matches!(err, BulkError::OutOfSpace(_)));

        // Every later caller sees the same failure, even for single pages.
        assert!(matches!(
            handle.allocate(ExtentKind::NonLeaf, AllocUnit::Page, &NoopObserver, &NeverInterrupt),
            Err(BulkError::OutOfSpace(_))
        ));
        assert!(handle.error().is_some());
        allocator.stop();
    }

    #[test]
    fn test_interrupted_before_allocation() {
        let config = small_config();
        let (_space, allocator) = setup(Tablespace::new(1), &config);
        let flag = InterruptFlag::new();
        flag.raise();
        let result =
            allocator
                .handle()
                .allocate(ExtentKind::Leaf, AllocUnit::Extent, &NoopObserver, &flag);
        assert!(matches!(result, Err(BulkError::Interrupted)));
        allocator.stop();
    }

    #[test]
    fn test_synchronous_mode() {
        let config = BulkLoadConfig {
            background_allocation: false,
            ..small_config()
        };
        let (space, allocator) = setup(Tablespace::new(1), &config);
        let range = allocator
            .handle()
            .allocate(ExtentKind::Leaf, AllocUnit::Extent, &NoopObserver, &NeverInterrupt)
            .expect("allocate");
        assert_eq!(range.count, 8);
        // Nothing was prefetched.
        assert_eq!(space.used_pages(), 1 + 8);
        let stats = allocator.stop();
        assert_eq!(stats.extents_prefetched, 0);
        assert_eq!(stats.direct_allocations, 1);
    }

    #[test]
    fn test_release_unused() {
        let config = small_config();
        let (space, allocator) = setup(Tablespace::new(1), &config);
        let handle = allocator.handle();
        let range = handle
            .allocate(ExtentKind::Leaf, AllocUnit::Extent, &NoopObserver, &NeverInterrupt)
            .expect("allocate");
        handle
            .release_unused(ExtentKind::Leaf, PageRange::new(range.first + 3, 5))
            .expect("release");
        assert!(space.is_allocated(range.first + 2));
        assert!(!space.is_allocated(range.first + 3));
        allocator.stop();
    }

    #[test]
    fn test_empty_cache_reports_wait() {
        let config = small_config();
        let (_space, allocator) = setup(Tablespace::new(1), &config);
        let shared = &allocator.shared;
        let capacity = shared.state.lock().leaf.capacity;
        while shared.state.lock().leaf.ranges.len() < capacity {
            thread::yield_now();
        }
        // Starve the leaf cache so the next caller has to wait for the producer.
        let parked: Vec<PageRange> = {
            let mut state = shared.state.lock();
            state.leaf.capacity = 0;
            state.leaf.ranges.drain(..).collect()
        };
        assert_eq!(parked.len(), capacity);

        let handle = allocator.handle();
        let log = WaitLog::default();
        let range = thread::scope(|s| {
            let consumer = s.spawn(|| {
                handle.allocate(ExtentKind::Leaf, AllocUnit::Extent, &log, &NeverInterrupt)
            });
            while log.begins(WaitKind::Allocation) == 0 {
                thread::yield_now();
            }
            shared.state.lock().leaf.capacity = capacity;
            shared.need.notify_all();
            consumer.join().expect("consumer")
        })
        .expect("allocate");

        assert_eq!(range.count, 8);
        assert!(parked.iter().all(|p| p.first != range.first));
        assert_eq!(log.begins(WaitKind::Allocation), 1);
        assert_eq!(log.begins(WaitKind::Flush), 0);
        assert!(log.is_paired());
        assert_eq!(handle.stats().consumer_waits, 1);
        allocator.stop();
    }
}
