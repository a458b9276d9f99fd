//! Upstream collaborator interface.
//!
//! The gateway core never talks to the changeset server directly; everything
//! goes through [`SourceRepository`]. Production code wires an RPC-backed
//! implementation, tests wire [`crate::memory_source::MemorySource`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Credential triple surfaced by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
        }
    }

    /// Stable identity key used to partition caches per user.
    pub fn identity(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}\\{}", self.domain, self.username)
        }
    }
}

/// Recursion depth of a metadata query, mapped from the `Depth:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recursion {
    None,
    OneLevel,
    Full,
}

/// Which revision a query addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Changeset(i64),
}

/// Whether deleted items are visible to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedState {
    NonDeleted,
    Any,
}

/// Item category filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCategory {
    Any,
    File,
    Folder,
}

/// Kind of an upstream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceItemKind {
    File,
    Folder,
}

/// One item as reported by the upstream server.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    /// Server-assigned item id, stable across renames.
    pub id: i64,
    /// Full server path (`$/proj/dir/file.c`).
    pub remote_name: String,
    /// Changeset that last touched this item.
    pub changeset_id: i64,
    pub kind: SourceItemKind,
    pub size: u64,
    pub author: String,
    pub remote_date: DateTime<Utc>,
}

impl SourceItem {
    pub fn is_folder(&self) -> bool {
        self.kind == SourceItemKind::Folder
    }
}

/// Set of change flags attached to a changeset record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeFlags(u16);

impl ChangeFlags {
    pub const ADD: ChangeFlags = ChangeFlags(1 << 0);
    pub const EDIT: ChangeFlags = ChangeFlags(1 << 1);
    pub const DELETE: ChangeFlags = ChangeFlags(1 << 2);
    pub const RENAME: ChangeFlags = ChangeFlags(1 << 3);
    pub const MERGE: ChangeFlags = ChangeFlags(1 << 4);
    pub const BRANCH: ChangeFlags = ChangeFlags(1 << 5);

    pub const fn union(self, other: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: ChangeFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ChangeFlags {
    type Output = ChangeFlags;
    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        self.union(rhs)
    }
}

/// A single changed item inside a changeset.
#[derive(Debug, Clone)]
pub struct SourceItemChange {
    pub item: SourceItem,
    pub flags: ChangeFlags,
}

/// One changeset, with its changes in server order.
#[derive(Debug, Clone)]
pub struct ChangesetRecord {
    pub id: i64,
    pub author: String,
    pub comment: String,
    pub date: DateTime<Utc>,
    pub changes: Vec<SourceItemChange>,
}

/// The upstream changeset server, as consumed by the core.
///
/// All calls are fallible with [`anyhow::Error`]; the core wraps them into
/// `GateError::Upstream` without retrying.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// List items at a path. Results are reported in server order; callers
    /// that need path order sort for themselves.
    async fn query_items(
        &self,
        creds: &Credentials,
        path: &str,
        recursion: Recursion,
        version: VersionSpec,
        deleted: DeletedState,
        category: ItemCategory,
    ) -> anyhow::Result<Vec<SourceItem>>;

    /// Resolve items by server id at a changeset.
    async fn query_items_by_id(
        &self,
        creds: &Credentials,
        ids: &[i64],
        changeset: i64,
    ) -> anyhow::Result<Vec<SourceItem>>;

    /// For each item, its identity in the version immediately preceding
    /// `changeset` (`None` when the item did not exist before it).
    async fn get_previous_version_of_items(
        &self,
        creds: &Credentials,
        items: &[SourceItem],
        changeset: i64,
    ) -> anyhow::Result<Vec<Option<SourceItem>>>;

    /// Changesets that touched `path`'s subtree within `[from, to]`,
    /// oldest first.
    async fn query_history(
        &self,
        creds: &Credentials,
        path: &str,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<ChangesetRecord>>;

    /// Fetch file content. The upstream buffers the full response; the item
    /// loader bounds concurrency for exactly that reason.
    async fn read_file(&self, creds: &Credentials, item: &SourceItem) -> anyhow::Result<Bytes>;

    /// Write file content inside an activity. Returns `true` when the path
    /// was created rather than replaced.
    async fn write_file(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        data: Bytes,
    ) -> anyhow::Result<bool>;

    /// Create a directory inside an activity.
    async fn make_collection(&self, creds: &Credentials, activity: &str, path: &str) -> anyhow::Result<()>;

    /// Set a property blob value inside an activity.
    async fn set_property(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()>;

    /// Remove a property inside an activity.
    async fn remove_property(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
    ) -> anyhow::Result<()>;

    /// Attach the commit comment to an activity.
    async fn set_activity_comment(&self, creds: &Credentials, activity: &str, comment: &str)
        -> anyhow::Result<()>;

    /// Look up an item's pending state inside an activity.
    async fn get_item_in_activity(
        &self,
        creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> anyhow::Result<Option<SourceItem>>;

    /// Delete an item inside an activity. Returns `false` when the path was
    /// already absent.
    async fn delete_item(&self, creds: &Credentials, activity: &str, path: &str)
        -> anyhow::Result<bool>;

    /// Turn an activity's pending writes into a changeset. Returns the new
    /// changeset id.
    async fn commit_activity(&self, creds: &Credentials, activity: &str) -> anyhow::Result<i64>;

    /// Youngest changeset id on the server.
    async fn get_latest_changeset(&self, creds: &Credentials) -> anyhow::Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_flags_set_ops() {
        let flags = ChangeFlags::RENAME | ChangeFlags::EDIT;
        assert!(flags.contains(ChangeFlags::RENAME));
        assert!(flags.contains(ChangeFlags::EDIT));
        assert!(!flags.contains(ChangeFlags::DELETE));
        assert!(flags.intersects(ChangeFlags::MERGE | ChangeFlags::EDIT));
        assert!(!flags.intersects(ChangeFlags::ADD));
    }

    #[test]
    fn test_identity_key() {
        assert_eq!(Credentials::new("bob", "", "").identity(), "bob");
        assert_eq!(Credentials::new("bob", "", "CORP").identity(), "CORP\\bob");
    }
}
