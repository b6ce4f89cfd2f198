//! Errors of the bulk-load engine.

use std::sync::Arc;

use crate::btree::node::NodeError;
use crate::btree::reader::ReadError;
use crate::storage::{SpaceError, StorageError};

/// Errors that abandon a bulk load.
///
/// None of these is retried: a half-built index is unusable, so the caller
/// drops everything allocated for it.
#[derive(Debug, Clone)]
pub enum BulkError {
    /// The tablespace could not supply pages.
    OutOfSpace(SpaceError),
    /// Any other tablespace failure.
    Space(SpaceError),
    /// A flush pipeline failed to write pages. Shared by every caller that observes it.
    Flush(Arc<StorageError>),
    /// A foreground store access failed.
    Storage(Arc<StorageError>),
    /// The operation was cancelled.
    Interrupted,
    /// A record does not fit an empty page.
    RecordTooLarge { key: Vec<u8>, size: usize, limit: usize },
    /// Adjacent subtrees overlap or are out of order.
    OrderViolation {
        left: usize,
        right: usize,
        left_max: Vec<u8>,
        right_min: Vec<u8>,
    },
    /// A subtree's input is not sorted.
    UnsortedInput { previous: Vec<u8>, key: Vec<u8> },
    /// A subtree's input repeats a key the comparator rejects.
    DuplicateKey { key: Vec<u8> },
    /// No page buffer was available.
    BufferPoolExhausted,
    /// An extent handle outlived its extent.
    StaleExtent { index: u32, generation: u32 },
    /// A blob was opened while another one is still open.
    BlobAlreadyOpen,
    /// A blob handle does not name the open blob.
    BlobHandleMismatch,
    /// A level or builder was finished twice.
    AlreadyFinished { level: u16 },
    /// A worker thread panicked.
    WorkerPanicked { worker: String },
    /// A page read back during merge could not be decoded.
    Node(NodeError),
    /// Reading a built subtree failed.
    Read(Arc<ReadError>),
}

impl std::fmt::Display for BulkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfSpace(e) => write!(f, "out of space: {e}"),
            Self::Space(e) => write!(f, "tablespace error: {e}"),
            Self::Flush(e) => write!(f, "flush failed: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Interrupted => write!(f, "bulk load interrupted"),
            Self::RecordTooLarge { key, size, limit } => write!(
                f,
                "record with key {} is {size} bytes, larger than the {limit} bytes a page can hold",
                display_key(key)
            ),
            Self::OrderViolation {
                left,
                right,
                left_max,
                right_min,
            } => write!(
                f,
                "subtree {left} ends at {} but subtree {right} starts at {}",
                display_key(left_max),
                display_key(right_min)
            ),
            Self::UnsortedInput { previous, key } => write!(
                f,
                "input not sorted: {} follows {}",
                display_key(key),
                display_key(previous)
            ),
            Self::DuplicateKey { key } => write!(f, "duplicate key {}", display_key(key)),
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
            Self::StaleExtent { index, generation } => {
                write!(f, "stale extent handle {index}@{generation}")
            }
            Self::BlobAlreadyOpen => write!(f, "another blob is already open"),
            Self::BlobHandleMismatch => write!(f, "blob handle does not match the open blob"),
            Self::AlreadyFinished { level } => write!(f, "level {level} already finished"),
            Self::WorkerPanicked { worker } => write!(f, "worker {worker} panicked"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Read(e) => write!(f, "read error: {e}"),
        }
    }
}

impl std::error::Error for BulkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OutOfSpace(e) | Self::Space(e) => Some(e),
            Self::Flush(e) | Self::Storage(e) => Some(e.as_ref()),
            Self::Node(e) => Some(e),
            Self::Read(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<StorageError> for BulkError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::BufferPoolExhausted => Self::BufferPoolExhausted,
            other => Self::Storage(Arc::new(other)),
        }
    }
}

impl From<SpaceError> for BulkError {
    fn from(e: SpaceError) -> Self {
        match e {
            SpaceError::Exhausted { .. } => Self::OutOfSpace(e),
            other => Self::Space(other),
        }
    }
}

impl From<NodeError> for BulkError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<ReadError> for BulkError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Storage(e) => e.into(),
            ReadError::Node { source, .. } => Self::Node(source),
            other @ ReadError::Structure { .. } => Self::Read(Arc::new(other)),
        }
    }
}

/// Printable form of a key: UTF-8 when possible, hex otherwise.
fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => format!("{s:?}"),
        _ => key.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

impl BulkError {
    /// Whether this error was caused by cancellation rather than a failure.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_error_mapping() {
        let exhausted = SpaceError::Exhausted {
            requested: 64,
            max_pages: 100,
        };
        assert!(matches!(
            BulkError::from(exhausted),
            BulkError::OutOfSpace(_)
        ));
        let unknown = SpaceError::UnknownSegment(crate::storage::SegmentId(3));
        assert!(matches!(BulkError::from(unknown), BulkError::Space(_)));
    }

    #[test]
    fn test_storage_error_mapping() {
        assert!(matches!(
            BulkError::from(StorageError::BufferPoolExhausted),
            BulkError::BufferPoolExhausted
        ));
        assert!(matches!(
            BulkError::from(StorageError::InjectedFault("x".to_string())),
            BulkError::Storage(_)
        ));
    }

    #[test]
    fn test_order_violation_display() {
        let err = BulkError::OrderViolation {
            left: 0,
            right: 1,
            left_max: b"k100".to_vec(),
            right_min: b"k050".to_vec(),
        };
        let text = err.to_string();
        assert!(text.contains("\"k100\""));
        assert!(text.contains("\"k050\""));
    }

    #[test]
    fn test_binary_key_display() {
        let err = BulkError::DuplicateKey {
            key: vec![0x00, 0xff],
        };
        assert!(err.to_string().contains("00ff"));
    }
}
