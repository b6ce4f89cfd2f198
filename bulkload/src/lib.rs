// Life of a bulk load:
// 1. Sorted rows arrive split into disjoint, ordered partitions
// 2. One thread per partition builds a complete subtree bottom-up:
//     - Records fill leaf pages; every closed page pushes a node pointer up
//     - Large values go to blob page chains
//     - Finished extents are written by the builder's flush pipeline
// 3. The subtrees are lifted to one height, linked level by level and
//    indexed by fresh upper levels
//
// System components:
//  - Tablespace and page store
//  - Extent allocator with a background prefetch thread
//  - Subtree builders and their flush pipelines
//  - Merger

pub mod btree;
pub mod bulk;
pub mod config;
pub mod storage;

pub use btree::{BytewiseComparator, KeyComparator, Row, TreeReader, TreeStats};
pub use bulk::{BuildOutput, BulkError, IndexBuild, TreeRoot};
pub use config::BulkLoadConfig;
