//! Background flushing of filled extents.
//!
//! Each subtree builder owns one pipeline: a bounded queue of extents and a
//! worker thread that writes them. Writes of consecutive pages are issued as
//! one vectored request when the store supports it. After a write the
//! emptied extent object goes back to the shared pool.
//!
//! A write failure is sticky. The worker keeps draining (and discarding)
//! queued extents so producers never block forever, and every later `add`
//! or `check_and_notify` returns the error. `wait_to_stop` joins the worker
//! and returns the error too, so a failure cannot be missed at shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::bulk::error::BulkError;
use crate::bulk::extent::{Extent, ObjectPool};
use crate::bulk::interrupt::{WaitKind, WaitObserver};
use crate::storage::{PageStore, StorageError};

/// Pages queued and written across every pipeline of a build.
#[derive(Debug, Default)]
pub struct IoCounter {
    pending: AtomicU64,
    written: AtomicU64,
}

impl IoCounter {
    /// Pages handed to a pipeline but not yet written.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Pages written.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// What one pipeline wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub extents: u64,
    pub pages: u64,
    pub write_requests: u64,
}

#[derive(Debug, Default)]
struct FlushState {
    queue: VecDeque<Extent>,
    stop: bool,
    error: Option<Arc<StorageError>>,
    stats: FlushStats,
}

struct Shared {
    store: Arc<dyn PageStore>,
    extents: ObjectPool<Extent>,
    counter: Option<Arc<IoCounter>>,
    depth: usize,
    vectored: bool,
    state: Mutex<FlushState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Shared {
    fn run_worker(&self, name: &str) {
        tracing::debug!(pipeline = name, "flush worker started");
        loop {
            let (extent, failed) = {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.stop {
                    self.not_empty.wait(&mut state);
                }
                let Some(extent) = state.queue.pop_front() else {
                    break;
                };
                (extent, state.error.is_some())
            };
            self.not_full.notify_all();

            let pages = extent.committed();
            let outcome = if failed {
                // Already failed: discard without writing.
                Ok(0)
            } else {
                self.write_extent(&extent)
            };

            if let Some(counter) = &self.counter {
                counter.pending.fetch_sub(pages, Ordering::Relaxed);
            }
            let mut state = self.state.lock();
            match outcome {
                Ok(requests) if !failed => {
                    state.stats.extents += 1;
                    state.stats.pages += pages;
                    state.stats.write_requests += requests;
                    if let Some(counter) = &self.counter {
                        counter.written.fetch_add(pages, Ordering::Relaxed);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        pipeline = name,
                        first_page = extent.range().first,
                        error = %e,
                        "extent flush failed"
                    );
                    state.error.get_or_insert_with(|| Arc::new(e));
                }
            }
            drop(state);
            self.not_full.notify_all();
            self.recycle(extent);
        }
        tracing::debug!(pipeline = name, "flush worker stopped");
    }

    /// Write every committed run of the extent. Returns the number of requests issued.
    fn write_extent(&self, extent: &Extent) -> Result<u64, StorageError> {
        let mut requests = 0;
        for (first, pages) in extent.runs() {
            if self.vectored && self.store.supports_vectored() {
                self.store.write_pages(first, &pages)?;
                requests += 1;
            } else {
                for (page_id, page) in (first..).zip(&pages) {
                    self.store.write_page(page_id, page)?;
                    requests += 1;
                }
            }
        }
        Ok(requests)
    }

    fn recycle(&self, mut extent: Extent) {
        extent.clear();
        self.extents.release(extent);
    }
}

/// A builder's flush queue and its worker.
pub struct FlushPipeline {
    name: String,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FlushPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushPipeline")
            .field("name", &self.name)
            .field("depth", &self.shared.depth)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl FlushPipeline {
    /// Start a pipeline writing to `store`.
    ///
    /// Flushed extent objects are released into `extents`.
    pub fn start(
        name: impl Into<String>,
        store: Arc<dyn PageStore>,
        extents: ObjectPool<Extent>,
        depth: usize,
        vectored: bool,
        counter: Option<Arc<IoCounter>>,
    ) -> Result<Self, BulkError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            store,
            extents,
            counter,
            depth: depth.max(1),
            vectored,
            state: Mutex::new(FlushState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("flush-{name}"))
            .spawn(move || worker_shared.run_worker(&worker_name))
            .map_err(StorageError::from)?;
        Ok(Self {
            name,
            shared,
            worker: Some(worker),
        })
    }

    /// Queue an extent for writing.
    ///
    /// Blocks while the queue is full, calling `observer` around the wait.
    /// Ownership of the extent passes to the pipeline even when an error is
    /// returned.
    pub fn add(&self, extent: Extent, observer: &dyn WaitObserver) -> Result<(), BulkError> {
        let pages = extent.committed();
        let mut state = self.shared.state.lock();
        if let Some(err) = &state.error {
            let err = BulkError::Flush(Arc::clone(err));
            drop(state);
            self.shared.recycle(extent);
            return Err(err);
        }
        if state.queue.len() >= self.shared.depth {
            observer.wait_begin(WaitKind::Flush);
            while state.queue.len() >= self.shared.depth && state.error.is_none() {
                self.shared.not_full.wait(&mut state);
            }
            observer.wait_end(WaitKind::Flush);
            if let Some(err) = &state.error {
                let err = BulkError::Flush(Arc::clone(err));
                drop(state);
                self.shared.recycle(extent);
                return Err(err);
            }
        }
        if let Some(counter) = &self.shared.counter {
            counter.pending.fetch_add(pages, Ordering::Relaxed);
        }
        state.queue.push_back(extent);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Surface a sticky write error and wake the worker if work is queued.
    pub fn check_and_notify(&self) -> Result<(), BulkError> {
        let state = self.shared.state.lock();
        if let Some(err) = &state.error {
            return Err(BulkError::Flush(Arc::clone(err)));
        }
        let queued = !state.queue.is_empty();
        drop(state);
        if queued {
            self.shared.not_empty.notify_one();
        }
        Ok(())
    }

    /// Extents waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Drain the queue, join the worker and report the outcome.
    pub fn wait_to_stop(mut self) -> Result<FlushStats, BulkError> {
        self.stop_worker()?;
        let state = self.shared.state.lock();
        if let Some(err) = &state.error {
            return Err(BulkError::Flush(Arc::clone(err)));
        }
        tracing::debug!(pipeline = %self.name, stats = ?state.stats, "flush pipeline drained");
        Ok(state.stats)
    }

    fn stop_worker(&mut self) -> Result<(), BulkError> {
        self.shared.state.lock().stop = true;
        self.shared.not_empty.notify_all();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            return Err(BulkError::WorkerPanicked {
                worker: format!("flush-{}", self.name),
            });
        }
        Ok(())
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        if self.worker.is_some() && self.stop_worker().is_err() {
            tracing::error!(pipeline = %self.name, "flush worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::extent::ExtentKind;
    use crate::bulk::interrupt::NoopObserver;
    use crate::bulk::interrupt::recording::{Event, WaitLog};
    use crate::storage::{FaultConfig, MemoryStore, Page, PageId, PageRange};

    fn filled_extent(first: u64, count: u64, marker: u8) -> Extent {
        let mut extent = Extent::new(ExtentKind::Leaf, PageRange::new(first, count));
        while let Some(page_id) = extent.claim() {
            let mut page = Page::new();
            page.write_u8(100, marker);
            extent.commit(page_id, page);
        }
        extent
    }

    #[test]
    fn test_flush_writes_pages() {
        let store = Arc::new(MemoryStore::new(1));
        let pool = ObjectPool::new(8);
        let counter = Arc::new(IoCounter::default());
        let pipeline = FlushPipeline::start(
            "t0",
            store.clone(),
            pool.clone(),
            2,
            true,
            Some(Arc::clone(&counter)),
        )
        .expect("start");

        for i in 0..5u64 {
            pipeline
                .add(
                    filled_extent(1 + i * 4, 4, u8::try_from(i).expect("small")),
                    &NoopObserver,
                )
                .expect("add");
        }
        let stats = pipeline.wait_to_stop().expect("stop");
        assert_eq!(stats.extents, 5);
        assert_eq!(stats.pages, 20);
        // One vectored request per extent.
        assert_eq!(stats.write_requests, 5);
        assert_eq!(counter.written(), 20);
        assert_eq!(counter.pending(), 0);
        assert_eq!(store.read_page(9).expect("read").read_u8(100), 2);
        assert!(pool.idle() > 0);
    }

    #[test]
    fn test_page_by_page_when_not_vectored() {
        let store = Arc::new(MemoryStore::new(1));
        let pipeline =
            FlushPipeline::start("t1", store.clone(), ObjectPool::new(2), 4, false, None)
                .expect("start");
        pipeline
            .add(filled_extent(1, 3, 7), &NoopObserver)
            .expect("add");
        let stats = pipeline.wait_to_stop().expect("stop");
        assert_eq!(stats.write_requests, 3);
        assert_eq!(store.stats().vectored_writes, 0);
    }

    #[test]
    fn test_error_is_sticky() {
        let store = Arc::new(MemoryStore::with_config(1, FaultConfig::fail_after(2)));
        let pipeline = FlushPipeline::start("t2", store, ObjectPool::new(2), 1, true, None)
            .expect("start");

        // Keep adding until the failure surfaces; the worker never stalls producers.
        let mut surfaced = None;
        for i in 0..50u64 {
            if let Err(e) = pipeline.add(filled_extent(1 + i * 2, 2, 0), &NoopObserver) {
                surfaced = Some(e);
                break;
            }
        }
        while surfaced.is_none() {
            if let Err(e) = pipeline.check_and_notify() {
                surfaced = Some(e);
            } else {
                thread::yield_now();
            }
        }
        assert!(matches!(surfaced, Some(BulkError::Flush(_))));
        assert!(matches!(pipeline.check_and_notify(), Err(BulkError::Flush(_))));
        assert!(matches!(pipeline.wait_to_stop(), Err(BulkError::Flush(_))));
    }

    /// Holds every write until `open` is called.
    struct GatedStore {
        inner: MemoryStore,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(1),
                open: Mutex::new(false),
                opened: Condvar::new(),
            }
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }
    }

    impl PageStore for GatedStore {
        fn read_page(&self, page_id: PageId) -> Result<Page, StorageError> {
            self.inner.read_page(page_id)
        }

        fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
            drop(open);
            self.inner.write_page(page_id, page)
        }

        fn sync(&self) -> Result<(), StorageError> {
            self.inner.sync()
        }

        fn total_pages(&self) -> u64 {
            self.inner.total_pages()
        }
    }

    #[test]
    fn test_full_queue_reports_wait() {
        let store = Arc::new(GatedStore::new());
        let log = WaitLog::default();
        let pipeline = FlushPipeline::start("t3", store.clone(), ObjectPool::new(2), 1, true, None)
            .expect("start");

        // The worker holds one extent and the queue one more, so the third
        // add has to wait until writes go through.
        thread::scope(|s| {
            let producer = s.spawn(|| {
                for i in 0..3u64 {
                    pipeline
                        .add(filled_extent(1 + i * 2, 2, 0), &log)
                        .expect("add");
                }
            });
            while log.begins(WaitKind::Flush) == 0 {
                thread::yield_now();
            }
            store.open();
            producer.join().expect("producer");
        });

        let stats = pipeline.wait_to_stop().expect("stop");
        assert_eq!(stats.extents, 3);
        assert_eq!(stats.pages, 6);
        assert!(log.begins(WaitKind::Flush) >= 1);
        assert_eq!(log.begins(WaitKind::Allocation), 0);
        assert!(log.is_paired());
        assert!(log.events().iter().all(|e| matches!(
            e,
            Event::Begin(WaitKind::Flush) | Event::End(WaitKind::Flush)
        )));
    }
}
