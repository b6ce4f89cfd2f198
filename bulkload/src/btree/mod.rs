//! B-tree page format shared by the bulk loader and the read path.
//!
//! Pages written by the bulk loader use the same node layout as pages
//! produced by ordinary insertion, so a finished tree can be handed to the
//! regular access path as is.

pub mod compare;
pub mod node;
pub mod reader;
pub mod record;

pub use compare::{BytewiseComparator, DuplicateCounting, KeyComparator};
pub use node::{NodeError, NodeHeader, NodeView, SegmentHeader};
pub use reader::{LeafCursor, LeafEntry, LeafValue, ReadError, TreeReader, TreeStats};
pub use record::{BlobRef, MAX_KEY_LEN, Record, RecordRef, Row};
