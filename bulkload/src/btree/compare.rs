//! Key ordering.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Orders index keys.
///
/// Used to validate input order inside a subtree (when requested), to check
/// subtree boundaries at merge time, and to pick separator keys for node
/// pointers.
pub trait KeyComparator: Send + Sync {
    /// Compare two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Called when two adjacent input rows carry equal keys.
    ///
    /// Returns `true` if the duplicate is acceptable. The default rejects it.
    fn on_duplicate(&self, _key: &[u8]) -> bool {
        false
    }

    /// A key `s` with `left_last < s <= right_first`.
    ///
    /// Requires `left_last < right_first`. The default returns `right_first`.
    fn separator(&self, _left_last: &[u8], right_first: &[u8]) -> Vec<u8> {
        right_first.to_vec()
    }
}

/// Lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    /// Shortest prefix of `right_first` that still sorts after `left_last`.
    fn separator(&self, left_last: &[u8], right_first: &[u8]) -> Vec<u8> {
        if left_last >= right_first {
            return right_first.to_vec();
        }
        let common = left_last
            .iter()
            .zip(right_first)
            .take_while(|(l, r)| l == r)
            .count();
        right_first[..(common + 1).min(right_first.len())].to_vec()
    }
}

/// Bytewise order that accepts duplicates and counts them.
#[derive(Debug, Default)]
pub struct DuplicateCounting {
    duplicates: AtomicU64,
}

impl DuplicateCounting {
    #[must_use]
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(AtomicOrdering::Relaxed)
    }
}

impl KeyComparator for DuplicateCounting {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn on_duplicate(&self, _key: &[u8]) -> bool {
        self.duplicates.fetch_add(1, AtomicOrdering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_order() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"", b""), Ordering::Equal);
    }

    #[test]
    fn test_separator_shortest_prefix() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.separator(b"apple", b"banana"), b"b");
        assert_eq!(cmp.separator(b"key0099", b"key0100"), b"key01");
        // Left is a prefix of right.
        assert_eq!(cmp.separator(b"abc", b"abcd"), b"abcd");
    }

    #[test]
    fn test_separator_bounds() {
        let cmp = BytewiseComparator;
        let pairs: [(&[u8], &[u8]); 4] = [
            (b"a", b"b"),
            (b"aaaa", b"ab"),
            (b"\x00", b"\x00\x00"),
            (b"zz", b"zzz\xff"),
        ];
        for (left, right) in pairs {
            let sep = cmp.separator(left, right);
            assert!(left < sep.as_slice(), "{left:?} < {sep:?}");
            assert!(sep.as_slice() <= right, "{sep:?} <= {right:?}");
        }
    }

    #[test]
    fn test_separator_equal_keys_falls_back() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.separator(b"same", b"same"), b"same");
    }

    #[test]
    fn test_duplicate_hook() {
        assert!(!BytewiseComparator.on_duplicate(b"k"));

        let counting = DuplicateCounting::default();
        assert!(counting.on_duplicate(b"k"));
        assert!(counting.on_duplicate(b"k"));
        assert_eq!(counting.duplicates(), 2);
    }
}
