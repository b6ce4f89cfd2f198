//! Extents and the objects that track them.
//!
//! An extent is a contiguous run of page numbers handed to one subtree
//! builder. Pages are claimed from it in order, filled in memory and
//! committed back. Once every page that will ever be claimed has been
//! committed, the extent moves to the flush pipeline, which writes it and
//! returns the emptied object to a shared [`ObjectPool`].
//!
//! Builders never hold an extent directly. They hold an [`ExtentHandle`]
//! into their [`ExtentArena`]; the handle carries a generation so that a
//! handle to an extent that has already been retired is rejected instead of
//! touching a recycled object.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bulk::error::BulkError;
use crate::storage::{Page, PageId, PageRange, SegmentKind};

/// Which segment an extent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentKind {
    /// Level 0 pages and blob pages.
    Leaf,
    /// Pages of levels 1 and above.
    NonLeaf,
}

impl ExtentKind {
    #[must_use]
    pub const fn for_level(level: u16) -> Self {
        if level == 0 { Self::Leaf } else { Self::NonLeaf }
    }

    #[must_use]
    pub const fn segment_kind(self) -> SegmentKind {
        match self {
            Self::Leaf => SegmentKind::Leaf,
            Self::NonLeaf => SegmentKind::NonLeaf,
        }
    }
}

/// A run of pages `[first, first + count)` being filled by one builder.
#[derive(Debug)]
pub struct Extent {
    kind: ExtentKind,
    range: PageRange,
    /// Pages claimed so far; the next claim returns `range.first + claimed`.
    claimed: u64,
    committed: u64,
    pages: Vec<Option<Page>>,
}

impl Default for Extent {
    fn default() -> Self {
        Self {
            kind: ExtentKind::Leaf,
            range: PageRange::new(0, 0),
            claimed: 0,
            committed: 0,
            pages: Vec::new(),
        }
    }
}

impl Extent {
    #[must_use]
    pub fn new(kind: ExtentKind, range: PageRange) -> Self {
        let mut extent = Self::default();
        extent.reset(kind, range);
        extent
    }

    /// Reuse this object for a new range. Any pages still held are dropped.
    pub fn reset(&mut self, kind: ExtentKind, range: PageRange) {
        self.kind = kind;
        self.range = range;
        self.claimed = 0;
        self.committed = 0;
        self.pages.clear();
        self.pages.resize_with(range.count as usize, || None);
    }

    #[must_use]
    pub const fn kind(&self) -> ExtentKind {
        self.kind
    }

    #[must_use]
    pub const fn range(&self) -> PageRange {
        self.range
    }

    /// Pages claimed so far, as a range starting at the extent's first page.
    #[must_use]
    pub const fn used_range(&self) -> PageRange {
        PageRange::new(self.range.first, self.claimed)
    }

    /// Pages never claimed.
    #[must_use]
    pub const fn unused_range(&self) -> PageRange {
        PageRange::new(
            self.range.first + self.claimed,
            self.range.count - self.claimed,
        )
    }

    /// Claim the next page number, if any remain.
    ///
    /// # Post-conditions
    ///
    /// Each page number of the range is returned at most once.
    pub const fn claim(&mut self) -> Option<PageId> {
        if self.claimed == self.range.count {
            return None;
        }
        let page_id = self.range.first + self.claimed;
        self.claimed += 1;
        Some(page_id)
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.claimed == self.range.count
    }

    /// Every page of the range has been claimed and committed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.is_exhausted() && self.committed == self.claimed
    }

    /// Every claimed page has been committed.
    #[must_use]
    pub const fn all_claimed_committed(&self) -> bool {
        self.committed == self.claimed
    }

    /// Store a finished page.
    ///
    /// # Panics
    ///
    /// Panics if the page was never claimed from this extent or was already
    /// committed.
    pub fn commit(&mut self, page_id: PageId, page: Page) {
        assert!(
            self.range.contains(page_id) && page_id < self.range.first + self.claimed,
            "page {page_id} was not claimed from extent {:?}",
            self.range
        );
        let slot = &mut self.pages[(page_id - self.range.first) as usize];
        assert!(slot.is_none(), "page {page_id} committed twice");
        *slot = Some(page);
        self.committed += 1;
    }

    /// Number of pages held.
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.committed
    }

    /// Maximal runs of consecutive committed pages, in page order.
    #[must_use]
    pub fn runs(&self) -> Vec<(PageId, Vec<&Page>)> {
        let mut runs: Vec<(PageId, Vec<&Page>)> = Vec::new();
        let mut expected_next = None;
        for (offset, slot) in self.pages.iter().enumerate() {
            let Some(page) = slot else {
                expected_next = None;
                continue;
            };
            let page_id = self.range.first + offset as u64;
            if expected_next == Some(page_id)
                && let Some((_, pages)) = runs.last_mut()
            {
                pages.push(page);
            } else {
                runs.push((page_id, vec![page]));
            }
            expected_next = Some(page_id + 1);
        }
        runs
    }

    /// Drop every held page. Pooled buffers go back to their pool.
    pub fn clear(&mut self) {
        self.pages.iter_mut().for_each(|slot| *slot = None);
        self.committed = 0;
    }
}

/// Typed index of an extent in an [`ExtentArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    extent: Option<Extent>,
}

/// Extents owned by one builder, addressed by generation-checked handles.
#[derive(Debug, Default)]
pub struct ExtentArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ExtentArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an extent.
    pub fn insert(&mut self, extent: Extent) -> ExtentHandle {
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(Slot::default());
            (self.slots.len() - 1) as u32
        };
        let slot = &mut self.slots[index as usize];
        slot.extent = Some(extent);
        ExtentHandle {
            index,
            generation: slot.generation,
        }
    }

    fn slot_mut(&mut self, handle: ExtentHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.extent.is_some())
    }

    /// Borrow a live extent.
    pub fn get_mut(&mut self, handle: ExtentHandle) -> Result<&mut Extent, BulkError> {
        self.slot_mut(handle)
            .and_then(|slot| slot.extent.as_mut())
            .ok_or(BulkError::StaleExtent {
                index: handle.index,
                generation: handle.generation,
            })
    }

    /// Claim a page from a live extent.
    ///
    /// Returns `None` when the extent is exhausted or has been retired.
    pub fn try_claim(&mut self, handle: ExtentHandle) -> Option<PageId> {
        self.slot_mut(handle)
            .and_then(|slot| slot.extent.as_mut())
            .and_then(Extent::claim)
    }

    /// Give up ownership of an extent. The handle becomes stale.
    pub fn remove(&mut self, handle: ExtentHandle) -> Result<Extent, BulkError> {
        let stale = BulkError::StaleExtent {
            index: handle.index,
            generation: handle.generation,
        };
        let slot = self.slot_mut(handle).ok_or_else(|| stale.clone())?;
        let extent = slot.extent.take().ok_or(stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(extent)
    }

    /// Remove every remaining extent, in insertion slot order.
    pub fn drain(&mut self) -> Vec<Extent> {
        let mut extents = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(extent) = slot.extent.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                extents.push(extent);
            }
        }
        extents
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.extent.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shared pool of reusable objects.
///
/// `checkout` hands out an owned object; `release` takes ownership back.
#[derive(Debug)]
pub struct ObjectPool<T> {
    items: Arc<Mutex<Vec<T>>>,
    capacity: usize,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            capacity: self.capacity,
        }
    }
}

impl<T: Default> ObjectPool<T> {
    /// A pool that keeps at most `capacity` idle objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Take an idle object, or create one.
    #[must_use]
    pub fn checkout(&self) -> T {
        self.items.lock().pop().unwrap_or_default()
    }

    /// Return an object. It is dropped if the pool is full.
    pub fn release(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Number of idle objects.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_order_and_exhaustion() {
        let mut extent = Extent::new(ExtentKind::Leaf, PageRange::new(10, 3));
        assert_eq!(extent.claim(), Some(10));
        assert_eq!(extent.claim(), Some(11));
        assert_eq!(extent.claim(), Some(12));
        assert_eq!(extent.claim(), None);
        assert!(extent.is_exhausted());
        assert!(!extent.is_complete());
    }

    #[test]
    fn test_complete_after_commits() {
        let mut extent = Extent::new(ExtentKind::NonLeaf, PageRange::new(4, 2));
        let a = extent.claim().expect("a");
        let b = extent.claim().expect("b");
        extent.commit(b, Page::new());
        assert!(!extent.is_complete());
        extent.commit(a, Page::new());
        assert!(extent.is_complete());
    }

    #[test]
    #[should_panic(expected = "was not claimed")]
    fn test_commit_unclaimed_panics() {
        let mut extent = Extent::new(ExtentKind::Leaf, PageRange::new(4, 2));
        extent.commit(5, Page::new());
    }

    #[test]
    fn test_runs_split_on_gaps() {
        let mut extent = Extent::new(ExtentKind::Leaf, PageRange::new(100, 6));
        for _ in 0..6 {
            extent.claim();
        }
        for page_id in [100, 101, 103, 104, 105] {
            extent.commit(page_id, Page::new());
        }
        let runs: Vec<(PageId, usize)> = extent
            .runs()
            .into_iter()
            .map(|(first, pages)| (first, pages.len()))
            .collect();
        assert_eq!(runs, vec![(100, 2), (103, 3)]);
    }

    #[test]
    fn test_used_and_unused_ranges() {
        let mut extent = Extent::new(ExtentKind::Leaf, PageRange::new(20, 8));
        extent.claim();
        extent.claim();
        extent.claim();
        assert_eq!(extent.used_range(), PageRange::new(20, 3));
        assert_eq!(extent.unused_range(), PageRange::new(23, 5));
    }

    #[test]
    fn test_arena_rejects_stale_handle() {
        let mut arena = ExtentArena::new();
        let handle = arena.insert(Extent::new(ExtentKind::Leaf, PageRange::new(1, 4)));
        assert_eq!(arena.try_claim(handle), Some(1));

        let extent = arena.remove(handle).expect("remove");
        assert_eq!(extent.range(), PageRange::new(1, 4));
        assert!(matches!(
            arena.get_mut(handle),
            Err(BulkError::StaleExtent { .. })
        ));
        assert_eq!(arena.try_claim(handle), None);

        // The slot is reused with a new generation; the old handle stays stale.
        let fresh = arena.insert(Extent::new(ExtentKind::Leaf, PageRange::new(9, 1)));
        assert_ne!(fresh, handle);
        assert!(arena.get_mut(handle).is_err());
        assert_eq!(arena.try_claim(fresh), Some(9));
    }

    #[test]
    fn test_arena_drain() {
        let mut arena = ExtentArena::new();
        let a = arena.insert(Extent::new(ExtentKind::Leaf, PageRange::new(1, 1)));
        arena.insert(Extent::new(ExtentKind::NonLeaf, PageRange::new(2, 1)));
        assert_eq!(arena.len(), 2);

        let drained = arena.drain();
        assert_eq!(drained.len(), 2);
        assert!(arena.is_empty());
        assert!(arena.get_mut(a).is_err());
    }

    #[test]
    fn test_object_pool_reuse() {
        let pool: ObjectPool<Extent> = ObjectPool::new(1);
        let mut extent = pool.checkout();
        extent.reset(ExtentKind::Leaf, PageRange::new(5, 2));
        pool.release(extent);
        pool.release(Extent::default());
        assert_eq!(pool.idle(), 1);

        let reused = pool.checkout();
        assert_eq!(reused.range(), PageRange::new(5, 2));
        assert_eq!(pool.idle(), 0);
    }
}
