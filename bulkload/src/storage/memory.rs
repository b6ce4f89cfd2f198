//! In-memory page store for deterministic testing.
//!
//! This module provides an in-memory implementation of the `PageStore` trait
//! with support for fault injection:
//! - Page-level read/write errors at a configurable rate
//! - A hard write failure after a fixed number of successful writes
//! - Sync failures

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{Page, PageId};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Fail every page write once this many pages have been written.
    pub fail_writes_after: Option<u64>,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail every write after the first `pages` page writes.
    #[must_use]
    pub fn fail_after(pages: u64) -> Self {
        Self {
            fail_writes_after: Some(pages),
            ..Self::default()
        }
    }
}

/// Statistics about in-memory store operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStoreStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes (a vectored write counts each page).
    pub writes: u64,
    /// Number of vectored write requests.
    pub vectored_writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected errors of any kind.
    pub injected_errors: u64,
}

struct MemoryState {
    pages: HashMap<PageId, Page>,
    total_pages: u64,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl MemoryState {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    fn check_write_fault(&mut self) -> Result<(), StorageError> {
        if let Some(limit) = self.fault_config.fail_writes_after
            && self.stats.writes >= limit
        {
            self.stats.injected_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "write limit of {limit} pages reached"
            )));
        }
        if self.should_inject_fault(self.fault_config.write_error_rate) {
            self.stats.injected_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }
        Ok(())
    }

    fn store(&mut self, page_id: PageId, page: &Page) {
        self.stats.writes += 1;
        self.pages.insert(page_id, page.clone());
        self.total_pages = self.total_pages.max(page_id + 1);
    }
}

/// In-memory page store.
///
/// The seed makes injected faults reproducible: the same seed produces the
/// same sequence of faults.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    vectored: bool,
}

impl MemoryStore {
    /// Create a new store with the given seed and no faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                pages: HashMap::new(),
                total_pages: 1,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
            vectored: true,
        }
    }

    /// Disable vectored writes so the flush path falls back to single pages.
    #[must_use]
    pub const fn without_vectored_io(mut self) -> Self {
        self.vectored = false;
        self
    }

    /// Get a snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.state.lock().stats.clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.state.lock().fault_config = config;
    }

    /// Whether a page has ever been written.
    #[must_use]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().pages.contains_key(&page_id)
    }

    /// Number of distinct pages written.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }
}

impl PageStore for MemoryStore {
    fn read_page(&self, page_id: PageId) -> Result<Page, StorageError> {
        let mut state = self.state.lock();
        state.stats.reads += 1;

        if page_id >= state.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: state.total_pages,
            });
        }

        let rate = state.fault_config.read_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        Ok(state.pages.get(&page_id).cloned().unwrap_or_default())
    }

    fn write_page(&self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.check_write_fault()?;
        state.store(page_id, page);
        Ok(())
    }

    fn write_pages(&self, first: PageId, pages: &[&Page]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.stats.vectored_writes += 1;
        for (page_id, page) in (first..).zip(pages) {
            state.check_write_fault()?;
            state.store(page_id, page);
        }
        Ok(())
    }

    fn supports_vectored(&self) -> bool {
        self.vectored
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.stats.syncs += 1;

        let rate = state.fault_config.sync_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.state.lock().total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let store = MemoryStore::new(7);
        let mut page = Page::new();
        page.write_u64(64, 99);
        store.write_page(5, &page).expect("write");

        assert_eq!(store.total_pages(), 6);
        assert_eq!(store.read_page(5).expect("read").read_u64(64), 99);
        // Unwritten pages inside the bounds read back as zeros.
        assert_eq!(store.read_page(3).expect("read").read_u64(64), 0);
        assert!(store.read_page(6).is_err());
    }

    #[test]
    fn test_fail_after_limit() {
        let store = MemoryStore::with_config(1, FaultConfig::fail_after(2));
        let page = Page::new();
        store.write_page(1, &page).expect("first");
        store.write_page(2, &page).expect("second");
        assert!(matches!(
            store.write_page(3, &page),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_errors, 1);
    }

    #[test]
    fn test_vectored_counts_pages() {
        let store = MemoryStore::new(1);
        let pages = [Page::new(), Page::new(), Page::new()];
        let refs: Vec<&Page> = pages.iter().collect();
        store.write_pages(10, &refs).expect("write");

        let stats = store.stats();
        assert_eq!(stats.writes, 3);
        assert_eq!(stats.vectored_writes, 1);
        assert!(store.contains(12));
    }

    #[test]
    fn test_deterministic_faults() {
        let config = FaultConfig {
            write_error_rate: 0.5,
            ..FaultConfig::default()
        };
        let run = |seed| {
            let store = MemoryStore::with_config(seed, config.clone());
            (1..50u64)
                .map(|id| store.write_page(id, &Page::new()).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }
}
