//! Joins independently built subtrees into one tree.
//!
//! Subtrees are ordered by worker id and must hold disjoint, ascending key
//! ranges. Shorter subtrees are lifted to the height of the tallest one by
//! stacking single-pointer internal pages on their roots. Every level is
//! then linked across subtree boundaries, the old roots are demoted, and a
//! fresh upper builder indexes the subtree roots.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::btree::node::{clear_min_rec, clear_root, set_siblings};
use crate::btree::reader::{ReadError, TreeReader};
use crate::btree::record::Record;
use crate::bulk::context::{BuildContext, BuildEnv, PageCursor};
use crate::bulk::error::BulkError;
use crate::bulk::extent::{ExtentHandle, ExtentKind};
use crate::bulk::page_builder::{Inserted, PageBuilder};
use crate::bulk::subtree::{SubtreeBuilder, SubtreeInfo};
use crate::storage::{NULL_PAGE, Page, PageId, PageStore};

/// Root of a finished index. `page` is `NULL_PAGE` for an empty index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub page: PageId,
    pub level: u16,
}

impl TreeRoot {
    pub const EMPTY: Self = Self {
        page: NULL_PAGE,
        level: 0,
    };
}

/// First and last page of one level of one subtree.
type Chain = (PageId, PageId);

struct Bounds {
    min: Vec<u8>,
    max: Vec<u8>,
}

/// A lifted page whose number is known but whose contents are not yet written.
struct LiftedPage {
    subtree: usize,
    level: u16,
    page_id: PageId,
    extent: ExtentHandle,
}

/// Merges the subtrees of one build.
#[derive(Debug)]
pub struct Merger<'a> {
    env: &'a BuildEnv,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub const fn new(env: &'a BuildEnv) -> Self {
        Self { env }
    }

    /// Merge `subtrees`, ordered by worker id.
    pub fn merge(&self, subtrees: Vec<SubtreeInfo>) -> Result<TreeRoot, BulkError> {
        let subtrees: Vec<SubtreeInfo> = subtrees
            .into_iter()
            .filter(|s| {
                if s.is_empty() {
                    tracing::debug!(subtree = s.id, "empty subtree dropped");
                }
                !s.is_empty()
            })
            .collect();
        let Some(first) = subtrees.first() else {
            return Ok(TreeRoot::EMPTY);
        };
        let bounds = self.boundaries(&subtrees)?;
        if subtrees.len() == 1 {
            return Ok(TreeRoot {
                page: first.root,
                level: first.root_level,
            });
        }

        let height = subtrees.iter().map(|s| s.root_level).max().unwrap_or(0);
        let chains = self.lift(&subtrees, &bounds, height)?;
        self.stitch(&subtrees, &chains)?;
        let root = self.build_root(&subtrees, &chains, &bounds, height)?;
        tracing::info!(
            subtrees = subtrees.len(),
            root = root.page,
            level = root.level,
            "subtrees merged"
        );
        Ok(root)
    }

    /// Read each subtree's smallest and largest key back from its leaves and
    /// check that neighbouring ranges do not overlap.
    fn boundaries(&self, subtrees: &[SubtreeInfo]) -> Result<Vec<Bounds>, BulkError> {
        let reader = TreeReader::new(self.env.store.as_ref(), self.env.comparator.as_ref());
        let mut bounds: Vec<Bounds> = Vec::with_capacity(subtrees.len());
        for (index, subtree) in subtrees.iter().enumerate() {
            let Some(leaves) = subtree.span(0) else {
                return Err(missing(subtree.root, "subtree has no leaf level"));
            };
            let min = reader
                .first_key(leaves.first)?
                .ok_or_else(|| missing(leaves.first, "empty leaf"))?;
            let max = reader
                .last_key(leaves.last)?
                .ok_or_else(|| missing(leaves.last, "empty leaf"))?;

            if self.env.config.validate_merge
                && let Some(left) = index.checked_sub(1).map(|i| &subtrees[i])
                && let Some(prev) = bounds.last()
            {
                let ordered = match self.env.comparator.compare(&prev.max, &min) {
                    Ordering::Less => true,
                    Ordering::Equal => self.env.comparator.on_duplicate(&min),
                    Ordering::Greater => false,
                };
                if !ordered {
                    return Err(BulkError::OrderViolation {
                        left: left.id,
                        right: subtree.id,
                        left_max: prev.max.clone(),
                        right_min: min,
                    });
                }
            }
            bounds.push(Bounds { min, max });
        }
        Ok(bounds)
    }

    /// Give every subtree `height + 1` levels. Returns, per subtree, the
    /// first and last page of each level.
    fn lift(
        &self,
        subtrees: &[SubtreeInfo],
        bounds: &[Bounds],
        height: u16,
    ) -> Result<Vec<Vec<Chain>>, BulkError> {
        let mut chains: Vec<Vec<Chain>> = subtrees
            .iter()
            .map(|s| s.levels.iter().map(|span| (span.first, span.last)).collect())
            .collect();
        if subtrees.iter().all(|s| s.root_level == height) {
            return Ok(chains);
        }

        let mut ctx = BuildContext::new("merge-lift", self.env.clone())?;
        match self.write_lifted(&mut ctx, subtrees, bounds, height, &mut chains) {
            Ok(()) => {
                ctx.finish()?;
                Ok(chains)
            }
            Err(e) => {
                ctx.abort();
                Err(e)
            }
        }
    }

    fn write_lifted(
        &self,
        ctx: &mut BuildContext,
        subtrees: &[SubtreeInfo],
        bounds: &[Bounds],
        height: u16,
        chains: &mut [Vec<Chain>],
    ) -> Result<(), BulkError> {
        // Number every lifted page first so that siblings can be linked as
        // the pages are written.
        let mut cursor = PageCursor::new(ExtentKind::NonLeaf);
        let mut lifted = Vec::new();
        for (index, subtree) in subtrees.iter().enumerate() {
            for level in subtree.root_level + 1..=height {
                let (page_id, extent) = cursor.next_page(ctx)?;
                chains[index].push((page_id, page_id));
                lifted.push(LiftedPage {
                    subtree: index,
                    level,
                    page_id,
                    extent,
                });
            }
        }

        let reserve = ctx.env.config.page_reserve();
        for page in lifted {
            let (i, level) = (page.subtree, usize::from(page.level));
            let (prev, next) = neighbours(chains, i, level);
            let child = chains[i][level - 1].0;
            let mut record = Record::node_pointer(bounds[i].min.clone(), child);
            if i == 0 {
                record.set_min_rec();
            }
            let mut builder = PageBuilder::init(
                ctx.lease_page()?,
                page.page_id,
                page.extent,
                page.level,
                prev,
                reserve,
            );
            if builder.insert(&record) == Inserted::PageFull {
                return Err(BulkError::RecordTooLarge {
                    size: record.encoded_len(),
                    key: record.key,
                    limit: PageBuilder::max_record(reserve),
                });
            }
            builder.set_next(next);
            builder.finish();
            builder.commit(ctx)?;
        }
        Ok(())
    }

    /// Link each subtree's original levels to its neighbours, demote its
    /// root and clear the minimum-record marks on all but the first subtree.
    fn stitch(&self, subtrees: &[SubtreeInfo], chains: &[Vec<Chain>]) -> Result<(), BulkError> {
        let store = self.env.store.as_ref();
        let mut pages: BTreeMap<PageId, Page> = BTreeMap::new();
        for (i, subtree) in subtrees.iter().enumerate() {
            for span in &subtree.levels {
                let level = usize::from(span.level);
                let (prev, next) = neighbours(chains, i, level);
                let first = load(&mut pages, store, span.first)?;
                set_siblings(first, Some(prev), None);
                if i > 0 && span.level > 0 {
                    clear_min_rec(first);
                }
                let last = load(&mut pages, store, span.last)?;
                set_siblings(last, None, Some(next));
            }
            clear_root(load(&mut pages, store, subtree.root)?);
        }

        let count = pages.len();
        for (page_id, mut page) in pages {
            page.seal();
            store.write_page(page_id, &page)?;
        }
        tracing::debug!(pages = count, "subtree boundaries linked");
        Ok(())
    }

    fn build_root(
        &self,
        subtrees: &[SubtreeInfo],
        chains: &[Vec<Chain>],
        bounds: &[Bounds],
        height: u16,
    ) -> Result<TreeRoot, BulkError> {
        let mut upper = SubtreeBuilder::upper("merge-root", self.env.clone(), height + 1)?;
        let top = usize::from(height);
        for (i, chain) in chains.iter().enumerate() {
            let key = if i == 0 {
                bounds[0].min.clone()
            } else {
                self.env
                    .comparator
                    .separator(&bounds[i - 1].max, &bounds[i].min)
            };
            if let Err(e) = upper.insert_pointer(Record::node_pointer(key, chain[top].0)) {
                return Err(upper.abort(e));
            }
        }
        let info = upper.finish()?;
        tracing::debug!(
            subtrees = subtrees.len(),
            root = info.root,
            "upper levels built"
        );
        Ok(TreeRoot {
            page: info.root,
            level: info.root_level,
        })
    }
}

/// Merge `subtrees` into one tree.
pub fn merge(env: &BuildEnv, subtrees: Vec<SubtreeInfo>) -> Result<TreeRoot, BulkError> {
    Merger::new(env).merge(subtrees)
}

/// Last page of the left neighbour and first page of the right neighbour at
/// `level`, or `NULL_PAGE` at the edges.
fn neighbours(chains: &[Vec<Chain>], subtree: usize, level: usize) -> (PageId, PageId) {
    let prev = subtree
        .checked_sub(1)
        .and_then(|i| chains[i].get(level))
        .map_or(NULL_PAGE, |chain| chain.1);
    let next = chains
        .get(subtree + 1)
        .and_then(|c| c.get(level))
        .map_or(NULL_PAGE, |chain| chain.0);
    (prev, next)
}

/// A page to rewrite, read from the store on first use.
fn load<'m>(
    pages: &'m mut BTreeMap<PageId, Page>,
    store: &dyn PageStore,
    page_id: PageId,
) -> Result<&'m mut Page, BulkError> {
    match pages.entry(page_id) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(store.read_page(page_id)?)),
    }
}

fn missing(page: PageId, reason: &str) -> BulkError {
    ReadError::Structure {
        page,
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::record::Row;
    use crate::bulk::context::fixture::{fixture, small_config};
    use crate::bulk::subtree::build_subtree;

    fn rows(range: std::ops::Range<u32>, value_len: usize) -> Vec<Row> {
        range
            .map(|i| Row::new(format!("m{i:07}"), vec![1u8; value_len]))
            .collect()
    }

    #[test]
    fn test_merges_subtrees_of_different_heights() {
        let fx = fixture(small_config());
        let parts = [rows(0..3, 10), rows(3..6_000, 120), rows(6_000..6_040, 10)];
        let subtrees: Vec<SubtreeInfo> = parts
            .iter()
            .enumerate()
            .map(|(id, part)| build_subtree(id, &fx.env, part.clone()).expect("subtree"))
            .collect();
        let height = subtrees.iter().map(|s| s.root_level).max().expect("three");
        assert!(height >= 1);
        assert_eq!(subtrees[0].root_level, 0);

        let root = merge(&fx.env, subtrees).expect("merge");
        assert_eq!(root.level, height + 1);

        let reader = TreeReader::new(fx.store.as_ref(), fx.env.comparator.as_ref());
        let stats = reader.verify(root.page).expect("valid tree");
        assert_eq!(stats.records, 6_040);
        let expected: Vec<Vec<u8>> = parts.iter().flatten().map(|r| r.key.clone()).collect();
        assert_eq!(reader.keys(root.page).expect("keys"), expected);
    }

    #[test]
    fn test_single_subtree_is_its_own_root() {
        let fx = fixture(small_config());
        let info = build_subtree(0, &fx.env, rows(0..100, 10)).expect("subtree");
        let empty = build_subtree(1, &fx.env, Vec::new()).expect("empty");
        let expected = TreeRoot {
            page: info.root,
            level: info.root_level,
        };
        assert_eq!(merge(&fx.env, vec![info, empty]).expect("merge"), expected);
    }

    #[test]
    fn test_nothing_to_merge_gives_an_empty_root() {
        let fx = fixture(small_config());
        let empty = build_subtree(0, &fx.env, Vec::new()).expect("empty");
        assert_eq!(merge(&fx.env, vec![empty]).expect("merge"), TreeRoot::EMPTY);
    }

    #[test]
    fn test_overlapping_ranges_are_rejected() {
        let fx = fixture(small_config());
        let left = build_subtree(0, &fx.env, rows(0..100, 10)).expect("left");
        let right = build_subtree(1, &fx.env, rows(50..150, 10)).expect("right");
        let err = merge(&fx.env, vec![left, right]).expect_err("overlap");
        match err {
            BulkError::OrderViolation {
                left,
                right,
                left_max,
                right_min,
            } => {
                assert_eq!((left, right), (0, 1));
                assert_eq!(left_max, b"m0000099");
                assert_eq!(right_min, b"m0000050");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
