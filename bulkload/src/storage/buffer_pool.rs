//! Buffer pool for page buffers.
//!
//! The buffer pool bounds the memory held by in-flight pages. Builders lease
//! 8KB buffers for the pages they assemble; the buffers return to the pool
//! automatically when the page is dropped (typically right after the flush
//! pipeline has written it).
//!
//! # Design
//!
//! - Buffers are allocated lazily, up to a fixed capacity
//! - Uses a free list (Vec) for O(1) lease/return
//! - Returns buffers automatically via RAII (Drop trait on Page)
//! - Thread-safe: uses a mutex for internal synchronization
//!
//! # Invariants
//!
//! - Pool capacity is fixed after construction
//! - `free_list.len() + leased == allocated <= capacity`

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::page::{PAGE_SIZE, Page};

/// Default buffer pool capacity in pages (16,384 pages = 128MB).
pub const DEFAULT_POOL_CAPACITY: usize = 16_384;

struct PoolState {
    /// Buffers available for leasing. All are `PAGE_SIZE` bytes.
    free_list: Vec<Box<[u8]>>,
    /// Buffers created so far.
    allocated: usize,
}

/// A buffer pool handing out page buffers.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Invariants
/// - Never more than `capacity` buffers exist at once
pub struct BufferPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool with the given capacity.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        Arc::new(Self {
            state: Mutex::new(PoolState {
                free_list: Vec::new(),
                allocated: 0,
            }),
            capacity,
        })
    }

    /// Lease a buffer from the pool.
    ///
    /// Returns `None` if the pool is exhausted. Buffer contents are undefined.
    pub fn lease(&self) -> Option<Box<[u8]>> {
        let mut state = self.state.lock();
        if let Some(buffer) = state.free_list.pop() {
            return Some(buffer);
        }
        if state.allocated >= self.capacity {
            return None;
        }
        state.allocated += 1;
        drop(state);
        Some(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    /// Lease a zeroed buffer from the pool.
    pub fn lease_zeroed(&self) -> Option<Box<[u8]>> {
        let mut buffer = self.lease()?;
        buffer.fill(0);
        Some(buffer)
    }

    /// Lease a zeroed page from the pool.
    ///
    /// # Post-conditions
    /// - If Some, page contents are all zeros and the buffer goes back to
    ///   this pool when the page is dropped
    pub fn lease_page_zeroed(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease_zeroed()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    /// Panics if returning would exceed the number of buffers handed out
    /// (indicates a bug).
    pub fn return_buffer(&self, buffer: Box<[u8]>) {
        let mut state = self.state.lock();
        assert!(
            state.free_list.len() < state.allocated,
            "Buffer pool overflow: returning buffer to full pool"
        );
        if buffer.len() == PAGE_SIZE {
            state.free_list.push(buffer);
        } else {
            // Foreign buffer of the wrong size: forget the slot instead.
            state.allocated -= 1;
        }
    }

    /// Get the number of buffers that can still be leased.
    #[must_use]
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.free_list.len() + (self.capacity - state.allocated)
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
