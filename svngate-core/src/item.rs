//! Item and operation-tree model.
//!
//! A node in the virtual versioned filesystem the diff engine builds for one
//! request. Kinds are a tagged enum; ownership is a single-parent tree where
//! folders own their children by value, in insertion order (the traversal
//! order downstream consumers rely on).
//!
//! The only state shared across threads is the per-file [`ContentSlot`]: the
//! loader's fetch task writes it once, `try_rob` drains it once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::pathing::CasePolicy;
use crate::source::SourceItem;

/// Item kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    DeleteFile,
    DeleteFolder,
    StubFolder,
    Missing,
}

/// Versioned metadata shared by files and folders.
#[derive(Debug, Clone)]
pub struct ItemMeta {
    /// Full server-relative path, forward-slash separated.
    pub name: String,
    pub item_revision: i64,
    pub property_revision: i64,
    pub sub_item_revision: i64,
    pub last_modified: DateTime<Utc>,
    pub author: String,
    pub properties: HashMap<String, String>,
}

impl Default for ItemMeta {
    fn default() -> Self {
        Self::new("")
    }
}

impl ItemMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item_revision: 0,
            property_revision: 0,
            sub_item_revision: 0,
            last_modified: DateTime::<Utc>::MIN_UTC,
            author: String::new(),
            properties: HashMap::new(),
        }
    }

    pub fn from_source(item: &SourceItem) -> Self {
        Self {
            name: item.remote_name.clone(),
            item_revision: item.changeset_id,
            property_revision: 0,
            sub_item_revision: 0,
            last_modified: item.remote_date,
            author: item.author.clone(),
            properties: HashMap::new(),
        }
    }

    /// Effective revision: the maximum of the three revision components.
    pub fn revision(&self) -> i64 {
        self.item_revision
            .max(self.property_revision)
            .max(self.sub_item_revision)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    loaded: bool,
    data: Option<Bytes>,
    md5: Option<String>,
}

/// Shared content cell for one file item.
///
/// Written exactly once by the loader's fetch task (success or failure both
/// set `loaded`), drained exactly once by `try_rob`.
#[derive(Debug, Default)]
pub struct ContentSlot {
    state: Mutex<SlotState>,
}

impl ContentSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach fetched bytes and their hash, marking the slot loaded.
    pub fn attach(&self, data: Bytes, md5: String) {
        let mut st = self.state.lock().expect("content slot poisoned");
        st.data = Some(data);
        st.md5 = Some(md5);
        st.loaded = true;
    }

    /// Mark the slot loaded with no data (failed fetch).
    pub fn mark_failed(&self) {
        self.state.lock().expect("content slot poisoned").loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().expect("content slot poisoned").loaded
    }

    /// Bytes currently buffered and unconsumed.
    pub fn buffered_len(&self) -> u64 {
        let st = self.state.lock().expect("content slot poisoned");
        st.data.as_ref().map(|d| d.len() as u64).unwrap_or(0)
    }

    /// If loaded, move the bytes out, freeing buffer capacity. Returns
    /// `Some((data, md5))` once loaded; data is `None` for a failed fetch or
    /// a second take.
    pub fn take(&self) -> Option<(Option<Bytes>, Option<String>)> {
        let mut st = self.state.lock().expect("content slot poisoned");
        if !st.loaded {
            return None;
        }
        Some((st.data.take(), st.md5.clone()))
    }
}

/// File entry in the operation tree.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub meta: ItemMeta,
    /// Upstream identity used to fetch content.
    pub source: SourceItem,
    /// Set when this add cancels an earlier delete in the same replay.
    pub originally_deleted: bool,
    /// Placed only because a property blob changed.
    pub property_change_only: bool,
    pub edit: bool,
    /// Property blob backing this item, when a property change touched it.
    pub property_source: Option<SourceItem>,
    pub content: Arc<ContentSlot>,
}

impl FileNode {
    pub fn from_source(item: &SourceItem, edit: bool) -> Self {
        Self {
            meta: ItemMeta::from_source(item),
            source: item.clone(),
            originally_deleted: false,
            property_change_only: false,
            edit,
            property_source: None,
            content: ContentSlot::new(),
        }
    }
}

/// Folder entry; owns its children in insertion order.
#[derive(Debug, Clone, Default)]
pub struct FolderNode {
    pub meta: ItemMeta,
    pub originally_deleted: bool,
    pub property_change_only: bool,
    pub edit: bool,
    pub property_source: Option<SourceItem>,
    pub children: Vec<TreeNode>,
}

impl FolderNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ItemMeta::new(name),
            ..Default::default()
        }
    }

    pub fn from_source(item: &SourceItem, edit: bool) -> Self {
        Self {
            meta: ItemMeta::from_source(item),
            edit,
            ..Default::default()
        }
    }

    /// Index of the child whose full path matches `path` under `policy`.
    pub fn position_of(&self, path: &str, policy: CasePolicy) -> Option<usize> {
        self.children.iter().position(|c| policy.matches(c.name(), path))
    }

    pub fn child(&self, path: &str, policy: CasePolicy) -> Option<&TreeNode> {
        self.position_of(path, policy).map(|i| &self.children[i])
    }

    pub fn attach(&mut self, node: TreeNode) {
        self.children.push(node);
    }

    pub fn remove_child(&mut self, path: &str, policy: CasePolicy) -> Option<TreeNode> {
        self.position_of(path, policy).map(|i| self.children.remove(i))
    }
}

/// A node of the operation tree handed to the response generator.
#[derive(Debug, Clone)]
pub enum TreeNode {
    File(FileNode),
    Folder(FolderNode),
    /// Placeholder for an intermediate path segment no operation has been
    /// decided for yet; wraps the real folder it stands in for. Resolved
    /// before the tree is handed off.
    Stub(Box<FolderNode>),
    /// Tombstone: the client must remove this file path.
    DeleteFile { name: String },
    /// Tombstone folder; may own children placed by the rename post-pass.
    DeleteFolder(FolderNode),
    /// The changeset referenced a path that cannot be materialized at the
    /// target revision. `edit` distinguishes would-have-been-edit from
    /// would-have-been-add.
    Missing { name: String, edit: bool },
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::File(f) => &f.meta.name,
            TreeNode::Folder(f) => &f.meta.name,
            TreeNode::Stub(s) => &s.meta.name,
            TreeNode::DeleteFile { name } => name,
            TreeNode::DeleteFolder(f) => &f.meta.name,
            TreeNode::Missing { name, .. } => name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::File(_) => NodeKind::File,
            TreeNode::Folder(_) => NodeKind::Folder,
            TreeNode::Stub(_) => NodeKind::StubFolder,
            TreeNode::DeleteFile { .. } => NodeKind::DeleteFile,
            TreeNode::DeleteFolder(_) => NodeKind::DeleteFolder,
            TreeNode::Missing { .. } => NodeKind::Missing,
        }
    }

    /// Effective revision of this entry, zero for tombstones and markers.
    pub fn revision(&self) -> i64 {
        match self {
            TreeNode::File(f) => f.meta.revision(),
            TreeNode::Folder(f) => f.meta.revision(),
            TreeNode::Stub(s) => s.meta.revision(),
            _ => 0,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, TreeNode::DeleteFile { .. } | TreeNode::DeleteFolder(_))
    }

    /// Children of folder-like nodes (folders, stubs, tombstone folders).
    pub fn children_mut(&mut self) -> Option<&mut Vec<TreeNode>> {
        match self {
            TreeNode::Folder(f) => Some(&mut f.children),
            TreeNode::Stub(s) => Some(&mut s.children),
            TreeNode::DeleteFolder(f) => Some(&mut f.children),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&Vec<TreeNode>> {
        match self {
            TreeNode::Folder(f) => Some(&f.children),
            TreeNode::Stub(s) => Some(&s.children),
            TreeNode::DeleteFolder(f) => Some(&f.children),
            _ => None,
        }
    }
}

/// One pending fetch in depth-first tree order.
#[derive(Clone)]
pub struct LoadRequest {
    pub path: String,
    pub source: SourceItem,
    pub slot: Arc<ContentSlot>,
}

/// Collect the non-deleted files of the tree in depth-first insertion order,
/// the exact order the loader produces and the generator consumes.
pub fn collect_file_loads(root: &FolderNode) -> Vec<LoadRequest> {
    let mut out = Vec::new();
    collect_into(&root.children, &mut out);
    out
}

fn collect_into(children: &[TreeNode], out: &mut Vec<LoadRequest>) {
    for child in children {
        match child {
            TreeNode::File(f) => out.push(LoadRequest {
                path: f.meta.name.clone(),
                source: f.source.clone(),
                slot: f.content.clone(),
            }),
            TreeNode::Folder(f) => collect_into(&f.children, out),
            // Tombstoned subtrees are never fetched; stubs must not survive
            // to hand-off, but skipping them here keeps the walk total.
            TreeNode::Stub(s) => collect_into(&s.children, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceItemKind;
    use chrono::TimeZone;

    fn file_item(path: &str, rev: i64) -> SourceItem {
        SourceItem {
            id: 1,
            remote_name: path.to_string(),
            changeset_id: rev,
            kind: SourceItemKind::File,
            size: 3,
            author: "alice".into(),
            remote_date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_effective_revision_is_max_of_triple() {
        let mut meta = ItemMeta::new("$/p/a");
        meta.item_revision = 4;
        meta.property_revision = 9;
        meta.sub_item_revision = 7;
        assert_eq!(meta.revision(), 9);
    }

    #[test]
    fn test_slot_take_is_a_move() {
        let slot = ContentSlot::new();
        assert!(slot.take().is_none());

        slot.attach(Bytes::from_static(b"abc"), "hash".into());
        let (data, md5) = slot.take().unwrap();
        assert_eq!(data.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(md5.as_deref(), Some("hash"));

        // second take sees the slot loaded but empty
        let (data, _) = slot.take().unwrap();
        assert!(data.is_none());
        assert_eq!(slot.buffered_len(), 0);
    }

    #[test]
    fn test_folder_lookup_respects_case_policy() {
        let mut folder = FolderNode::new("$/p");
        folder.attach(TreeNode::File(FileNode::from_source(&file_item("$/p/Foo.c", 2), false)));

        assert!(folder.position_of("$/p/foo.c", CasePolicy::Insensitive).is_some());
        assert!(folder.position_of("$/p/foo.c", CasePolicy::Sensitive).is_none());
    }

    #[test]
    fn test_collect_file_loads_depth_first() {
        let mut sub = FolderNode::new("$/p/sub");
        sub.attach(TreeNode::File(FileNode::from_source(&file_item("$/p/sub/b", 2), false)));

        let mut root = FolderNode::new("$/p");
        root.attach(TreeNode::File(FileNode::from_source(&file_item("$/p/a", 2), false)));
        root.attach(TreeNode::Folder(sub));
        root.attach(TreeNode::DeleteFile { name: "$/p/dead".into() });
        root.attach(TreeNode::File(FileNode::from_source(&file_item("$/p/z", 2), false)));

        let loads: Vec<_> = collect_file_loads(&root).into_iter().map(|l| l.path).collect();
        assert_eq!(loads, vec!["$/p/a", "$/p/sub/b", "$/p/z"]);
    }
}
