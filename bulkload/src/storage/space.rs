//! Tablespace page accounting.
//!
//! A bitmap tracks which pages of the file are in use: 0 = free, 1 = used.
//! Page 0 holds the space header and is always reserved.
//!
//! Pages are handed out to *segments*. An index owns one segment for its
//! leaf pages and one for everything else, so a failed build can give back
//! every page it ever took by releasing its two segments.
//!
//! Every mutation happens under a single lock, which makes each call atomic
//! with respect to the others: a range is either fully recorded in both the
//! bitmap and its segment, or not at all.

// Page IDs are u64 but bitmap indices are usize. On 64-bit systems these are the same size.
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::storage::page::PageId;

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Pages added to the space whenever it has to grow.
pub const DEFAULT_GROWTH_PAGES: u64 = 1024;

/// A half-open run of consecutive pages `[first, first + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRange {
    pub first: PageId,
    pub count: u64,
}

impl PageRange {
    #[must_use]
    pub const fn new(first: PageId, count: u64) -> Self {
        Self { first, count }
    }

    /// One past the last page of the range.
    #[must_use]
    pub const fn end(&self) -> PageId {
        self.first + self.count
    }

    #[must_use]
    pub const fn contains(&self, page_id: PageId) -> bool {
        page_id >= self.first && page_id < self.end()
    }

    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        other.first >= self.first && other.end() <= self.end()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Leaf,
    NonLeaf,
}

/// Identifier of a segment within a tablespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u32);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg#{}", self.0)
    }
}

/// Errors from tablespace operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceError {
    /// The space cannot grow enough to satisfy a request.
    Exhausted { requested: u64, max_pages: u64 },
    /// The segment does not exist (or was already released).
    UnknownSegment(SegmentId),
    /// A range being freed is not owned by the segment.
    NotOwned { segment: SegmentId, range: PageRange },
}

impl std::fmt::Display for SpaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                requested,
                max_pages,
            } => write!(
                f,
                "tablespace exhausted: cannot allocate {requested} pages (limit {max_pages})"
            ),
            Self::UnknownSegment(id) => write!(f, "unknown segment {id}"),
            Self::NotOwned { segment, range } => write!(
                f,
                "pages {}..{} are not owned by {segment}",
                range.first,
                range.end()
            ),
        }
    }
}

impl std::error::Error for SpaceError {}

#[derive(Debug)]
struct Segment {
    kind: SegmentKind,
    ranges: Vec<PageRange>,
}

impl Segment {
    fn page_count(&self) -> u64 {
        self.ranges.iter().map(|r| r.count).sum()
    }
}

#[derive(Debug)]
struct SpaceState {
    bitmap: Vec<u8>,
    total_pages: u64,
    free_count: u64,
    next_search_hint: u64,
    segments: HashMap<SegmentId, Segment>,
    next_segment: u32,
}

impl SpaceState {
    fn find_run(&self, count: u64) -> Option<PageId> {
        if count > self.free_count {
            return None;
        }
        let scan = |from: u64, to: u64| {
            let mut run_start = from;
            let mut run_length = 0u64;
            for page_id in from..to {
                if get_bit(&self.bitmap, page_id as usize) {
                    run_start = page_id + 1;
                    run_length = 0;
                } else {
                    run_length += 1;
                    if run_length >= count {
                        return Some(run_start);
                    }
                }
            }
            None
        };
        scan(self.next_search_hint, self.total_pages).or_else(|| scan(1, self.total_pages))
    }

    fn expand(&mut self, new_total_pages: u64) {
        if new_total_pages <= self.total_pages {
            return;
        }
        let new_bitmap_bytes = (new_total_pages as usize).div_ceil(BITS_PER_BYTE);
        self.bitmap.resize(new_bitmap_bytes, 0);
        self.free_count += new_total_pages - self.total_pages;
        self.total_pages = new_total_pages;
    }

    fn mark(&mut self, range: PageRange) {
        for page_id in range.first..range.end() {
            set_bit(&mut self.bitmap, page_id as usize);
        }
        self.free_count -= range.count;
        self.next_search_hint = range.end();
    }

    fn unmark(&mut self, range: PageRange) {
        for page_id in range.first..range.end() {
            if get_bit(&self.bitmap, page_id as usize) {
                clear_bit(&mut self.bitmap, page_id as usize);
                self.free_count += 1;
            }
        }
        if range.first < self.next_search_hint {
            self.next_search_hint = range.first.max(1);
        }
    }
}

/// Thread-safe page space shared by every builder and the extent allocator.
#[derive(Debug)]
pub struct Tablespace {
    state: Mutex<SpaceState>,
    max_pages: u64,
    growth_pages: u64,
}

impl Tablespace {
    /// Create a space whose first `reserved` pages are already in use.
    ///
    /// At least page 0 is always reserved. The space grows without limit.
    #[must_use]
    pub fn new(reserved: u64) -> Self {
        Self::with_limit(reserved, u64::MAX)
    }

    /// Create a space that will never grow past `max_pages` pages.
    #[must_use]
    pub fn with_limit(reserved: u64, max_pages: u64) -> Self {
        let reserved = reserved.max(1);
        let mut state = SpaceState {
            bitmap: Vec::new(),
            total_pages: 0,
            free_count: 0,
            next_search_hint: reserved,
            segments: HashMap::new(),
            next_segment: 1,
        };
        state.expand(reserved);
        state.mark(PageRange::new(0, reserved));
        Self {
            state: Mutex::new(state),
            max_pages,
            growth_pages: DEFAULT_GROWTH_PAGES,
        }
    }

    /// Create a new, empty segment.
    pub fn create_segment(&self, kind: SegmentKind) -> SegmentId {
        let mut state = self.state.lock();
        let id = SegmentId(state.next_segment);
        state.next_segment += 1;
        state.segments.insert(
            id,
            Segment {
                kind,
                ranges: Vec::new(),
            },
        );
        tracing::debug!(segment = %id, ?kind, "created segment");
        id
    }

    /// Kind of an existing segment.
    #[must_use]
    pub fn segment_kind(&self, segment: SegmentId) -> Option<SegmentKind> {
        self.state.lock().segments.get(&segment).map(|s| s.kind)
    }

    /// Allocate `count` contiguous pages to `segment`.
    ///
    /// Grows the space when no free run is large enough.
    ///
    /// # Post-conditions
    ///
    /// On success the whole range is marked used and recorded in the
    /// segment. On failure nothing changes.
    pub fn allocate(&self, segment: SegmentId, count: u64) -> Result<PageRange, SpaceError> {
        debug_assert!(count > 0, "empty allocation");
        let mut state = self.state.lock();
        if !state.segments.contains_key(&segment) {
            return Err(SpaceError::UnknownSegment(segment));
        }

        let first = match state.find_run(count) {
            Some(first) => first,
            None => {
                // Grow so that a run of `count` pages exists at the tail.
                let tail_free = trailing_free(&state.bitmap, state.total_pages);
                let needed = count - tail_free.min(count);
                let grow = needed.max(self.growth_pages);
                let limit = self.max_pages;
                let target = state
                    .total_pages
                    .saturating_add(grow)
                    .min(limit)
                    .max(state.total_pages);
                if target - state.total_pages < needed {
                    return Err(SpaceError::Exhausted {
                        requested: count,
                        max_pages: limit,
                    });
                }
                let first = state.total_pages - tail_free;
                state.expand(target);
                first
            }
        };

        let range = PageRange::new(first, count);
        state.mark(range);
        if let Some(seg) = state.segments.get_mut(&segment) {
            seg.ranges.push(range);
        }
        Ok(range)
    }

    /// Give back part or all of a range previously allocated to `segment`.
    pub fn free_range(&self, segment: SegmentId, range: PageRange) -> Result<(), SpaceError> {
        if range.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let seg = state
            .segments
            .get_mut(&segment)
            .ok_or(SpaceError::UnknownSegment(segment))?;
        let index = seg
            .ranges
            .iter()
            .position(|owned| owned.contains_range(&range))
            .ok_or(SpaceError::NotOwned { segment, range })?;

        let owned = seg.ranges.swap_remove(index);
        let head = PageRange::new(owned.first, range.first - owned.first);
        let tail = PageRange::new(range.end(), owned.end() - range.end());
        for part in [head, tail] {
            if !part.is_empty() {
                seg.ranges.push(part);
            }
        }
        state.unmark(range);
        Ok(())
    }

    /// Drop a segment and free every page it owns.
    ///
    /// Returns the number of pages freed.
    pub fn release_segment(&self, segment: SegmentId) -> Result<u64, SpaceError> {
        let mut state = self.state.lock();
        let seg = state
            .segments
            .remove(&segment)
            .ok_or(SpaceError::UnknownSegment(segment))?;
        let freed = seg.page_count();
        for range in seg.ranges {
            state.unmark(range);
        }
        tracing::debug!(segment = %segment, pages = freed, "released segment");
        Ok(freed)
    }

    /// Number of pages owned by a segment.
    #[must_use]
    pub fn segment_pages(&self, segment: SegmentId) -> Option<u64> {
        self.state
            .lock()
            .segments
            .get(&segment)
            .map(Segment::page_count)
    }

    /// Check if a page is allocated.
    #[must_use]
    pub fn is_allocated(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        page_id < state.total_pages && get_bit(&state.bitmap, page_id as usize)
    }

    /// Get the number of free pages.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.state.lock().free_count
    }

    /// Get the total number of pages being tracked.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.state.lock().total_pages
    }

    /// Number of pages in use, including reserved ones.
    #[must_use]
    pub fn used_pages(&self) -> u64 {
        let state = self.state.lock();
        state.total_pages - state.free_count
    }
}

/// Number of free pages at the end of the bitmap.
fn trailing_free(bitmap: &[u8], total_pages: u64) -> u64 {
    (0..total_pages)
        .rev()
        .take_while(|&p| !get_bit(bitmap, p as usize))
        .count() as u64
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << bit_index;
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << bit_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_zero_reserved() {
        let space = Tablespace::new(0);
        assert!(space.is_allocated(0));
        assert_eq!(space.used_pages(), 1);

        let seg = space.create_segment(SegmentKind::Leaf);
        let range = space.allocate(seg, 1).expect("allocate");
        assert_eq!(range.first, 1);
    }

    #[test]
    fn test_allocate_grows_space() {
        let space = Tablespace::new(1);
        let seg = space.create_segment(SegmentKind::Leaf);

        let a = space.allocate(seg, 8).expect("a");
        let b = space.allocate(seg, 8).expect("b");
        assert_eq!(a, PageRange::new(1, 8));
        assert_eq!(b, PageRange::new(9, 8));
        assert!(space.total_pages() >= 17);
        assert_eq!(space.segment_pages(seg), Some(16));
    }

    #[test]
    fn test_allocate_larger_than_growth() {
        let space = Tablespace::new(1);
        let seg = space.create_segment(SegmentKind::NonLeaf);
        let range = space
            .allocate(seg, DEFAULT_GROWTH_PAGES * 3)
            .expect("allocate");
        assert_eq!(range.count, DEFAULT_GROWTH_PAGES * 3);
        assert!(space.is_allocated(range.end() - 1));
    }

    #[test]
    fn test_exhausted_at_limit() {
        let space = Tablespace::with_limit(1, 20);
        let seg = space.create_segment(SegmentKind::Leaf);

        space.allocate(seg, 16).expect("fits");
        let err = space.allocate(seg, 8).expect_err("over limit");
        assert_eq!(
            err,
            SpaceError::Exhausted {
                requested: 8,
                max_pages: 20
            }
        );
        // A failed request changes nothing.
        assert_eq!(space.segment_pages(seg), Some(16));
        space.allocate(seg, 3).expect("still room for 3");
    }

    #[test]
    fn test_free_range_splits_owned_range() {
        let space = Tablespace::new(1);
        let seg = space.create_segment(SegmentKind::Leaf);
        let range = space.allocate(seg, 10).expect("allocate");

        space
            .free_range(seg, PageRange::new(range.first + 4, 2))
            .expect("free middle");
        assert!(!space.is_allocated(range.first + 4));
        assert!(space.is_allocated(range.first + 3));
        assert!(space.is_allocated(range.first + 6));
        assert_eq!(space.segment_pages(seg), Some(8));

        // The hole is reused.
        let again = space.allocate(seg, 2).expect("reuse");
        assert_eq!(again.first, range.first + 4);
    }

    #[test]
    fn test_free_range_not_owned() {
        let space = Tablespace::new(1);
        let a = space.create_segment(SegmentKind::Leaf);
        let b = space.create_segment(SegmentKind::NonLeaf);
        let range = space.allocate(a, 4).expect("allocate");

        assert!(matches!(
            space.free_range(b, range),
            Err(SpaceError::NotOwned { .. })
        ));
        assert!(space.is_allocated(range.first));
    }

    #[test]
    fn test_release_segment() {
        let space = Tablespace::new(1);
        let leaf = space.create_segment(SegmentKind::Leaf);
        let other = space.create_segment(SegmentKind::NonLeaf);
        space.allocate(leaf, 5).expect("a");
        let kept = space.allocate(other, 2).expect("b");
        space.allocate(leaf, 3).expect("c");

        let used_before = space.used_pages();
        assert_eq!(space.release_segment(leaf), Ok(8));
        assert_eq!(space.used_pages(), used_before - 8);
        assert!(space.is_allocated(kept.first));
        assert_eq!(
            space.release_segment(leaf),
            Err(SpaceError::UnknownSegment(leaf))
        );
    }

    #[test]
    fn test_concurrent_allocations_disjoint() {
        let space = std::sync::Arc::new(Tablespace::new(1));
        let seg = space.create_segment(SegmentKind::Leaf);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let space = std::sync::Arc::clone(&space);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| space.allocate(seg, 3).expect("allocate"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ranges: Vec<PageRange> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        ranges.sort_by_key(|r| r.first);
        for pair in ranges.windows(2) {
            assert!(pair[0].end() <= pair[1].first, "overlap: {pair:?}");
        }
        assert_eq!(space.segment_pages(seg), Some(600));
    }

    #[test]
    fn test_bit_operations() {
        let mut bitmap = vec![0u8; 10];

        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 79);
        assert!(get_bit(&bitmap, 0));
        assert!(get_bit(&bitmap, 79));
        assert!(!get_bit(&bitmap, 80));

        clear_bit(&mut bitmap, 0);
        assert!(!get_bit(&bitmap, 0));
        assert_eq!(trailing_free(&bitmap, 80), 0);
        assert_eq!(trailing_free(&bitmap, 79), 79);
    }
}
