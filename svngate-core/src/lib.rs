//! svngate core library
//!
//! Translation engine for presenting a changeset-based upstream server
//! through the SVN WebDAV dialect:
//! - Item and operation-tree model
//! - Server path and transcoding helpers
//! - Revision-partitioned metadata cache with single-flight population
//! - Bounded-memory async item loader
//! - Changeset replay (update diff) engine
//! - Upstream collaborator trait and an in-memory implementation

pub mod error;
pub mod item;
pub mod loader;
pub mod memory_source;
pub mod meta_cache;
pub mod pathing;
pub mod source;
pub mod update_diff;

pub use error::{GateError, Result};
pub use item::{collect_file_loads, ContentSlot, FileNode, FolderNode, ItemMeta, LoadRequest, NodeKind, TreeNode};
pub use loader::{ItemLoader, LoaderLimits, LoaderStats, RobbedContent};
pub use memory_source::{MemChange, MemorySource};
pub use meta_cache::MetaCache;
pub use pathing::{CasePolicy, PathMatch};
pub use source::{
    ChangeFlags, ChangesetRecord, Credentials, DeletedState, ItemCategory, Recursion, SourceItem,
    SourceItemChange, SourceItemKind, SourceRepository, VersionSpec,
};
pub use update_diff::{ClientState, UpdateDiffEngine};
