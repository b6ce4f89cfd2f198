//! Bottom-up bulk loading of sorted rows into a B-tree.
//!
//! # Pipeline
//!
//! ```text
//! partition 0 ──> SubtreeBuilder ──> FlushPipeline ──┐
//! partition 1 ──> SubtreeBuilder ──> FlushPipeline ──┼──> PageStore
//! partition N ──> SubtreeBuilder ──> FlushPipeline ──┘
//!                       │
//!                       └── pages from ExtentAllocator (background thread)
//!
//! subtrees ──> Merger ──> root
//! ```
//!
//! Every builder owns its levels, its extents and its flush pipeline. The
//! only state shared while building is the extent allocator and the
//! tablespace behind it.

mod allocator;
mod blob;
mod build;
mod context;
mod error;
mod extent;
mod flush;
mod interrupt;
mod level;
mod merge;
mod page_builder;
mod subtree;

pub use allocator::{AllocUnit, AllocatorHandle, AllocatorStats, ExtentAllocator, cache_capacities};
pub use blob::{BlobHandle, BlobInserter, BlobStats};
pub use build::{BuildOutput, BuildStats, IndexBuild};
pub use context::{BuildContext, BuildEnv, PageCursor};
pub use error::BulkError;
pub use extent::{Extent, ExtentArena, ExtentHandle, ExtentKind, ObjectPool};
pub use flush::{FlushPipeline, FlushStats, IoCounter};
pub use interrupt::{
    InterruptCheck, InterruptFlag, NeverInterrupt, NoopObserver, StallCounter, StallStats,
    WaitKind, WaitObserver,
};
pub use level::{LevelContext, LevelSpan};
pub use merge::{Merger, TreeRoot, merge};
pub use page_builder::{Inserted, PageBuilder, leaf_record};
pub use subtree::{SubtreeBuilder, SubtreeInfo, build_subtree};
