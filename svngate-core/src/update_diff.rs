//! Changeset replay engine.
//!
//! Mutates a per-request operation tree so that, applied on top of the
//! client's reported state, it yields the target revision. Changes are
//! applied strictly in caller order; forward replay walks changesets
//! oldest to newest, backward replay inverts each change to back a client
//! out of a future revision.
//!
//! The engine produces no output itself. Handlers serialize the finished
//! tree; stubs are resolved before hand-off.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::Result;
use crate::item::{FileNode, FolderNode, TreeNode};
use crate::meta_cache::MetaCache;
use crate::pathing::{self, CasePolicy};
use crate::source::{
    ChangeFlags, ChangesetRecord, Credentials, SourceItem, SourceItemChange, SourceItemKind,
    SourceRepository,
};

/// The two maps a client reports about its working copy.
#[derive(Debug, Clone)]
pub struct ClientState {
    policy: CasePolicy,
    /// normalized path → (reported path, revision)
    existing: HashMap<String, (String, i64)>,
    /// normalized path → client cookie
    missing: HashMap<String, String>,
}

impl ClientState {
    pub fn new(policy: CasePolicy) -> Self {
        Self {
            policy,
            existing: HashMap::new(),
            missing: HashMap::new(),
        }
    }

    pub fn add_existing(&mut self, path: impl Into<String>, revision: i64) {
        let path = path.into();
        self.existing.insert(self.policy.key(&path), (path, revision));
    }

    pub fn add_missing(&mut self, path: impl Into<String>, cookie: impl Into<String>) {
        let path = path.into();
        self.missing.insert(self.policy.key(&path), cookie.into());
    }

    /// The client already has `path` (or an ancestor) at `revision` or newer.
    pub fn has_at_or_above(&self, path: &str, revision: i64) -> bool {
        let mut cursor = path.to_string();
        loop {
            if let Some((_, rev)) = self.existing.get(&self.policy.key(&cursor)) {
                if *rev >= revision {
                    return true;
                }
            }
            if pathing::is_server_root(&cursor) {
                return false;
            }
            cursor = pathing::parent(&cursor);
        }
    }

    /// The client marked `path` (or an ancestor) as locally absent.
    pub fn is_marked_missing(&self, path: &str) -> bool {
        let mut cursor = path.to_string();
        loop {
            if self.missing.contains_key(&self.policy.key(&cursor)) {
                return true;
            }
            if pathing::is_server_root(&cursor) {
                return false;
            }
            cursor = pathing::parent(&cursor);
        }
    }

    /// Reported paths strictly under `prefix`.
    pub fn existing_under(&self, prefix: &str) -> Vec<String> {
        self.existing
            .values()
            .filter(|(path, _)| {
                !self.policy.matches(path, prefix) && self.policy.is_ancestor_or_self(prefix, path)
            })
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// Replays changeset deltas onto an operation tree.
pub struct UpdateDiffEngine {
    cache: Arc<MetaCache>,
    source: Arc<dyn SourceRepository>,
    creds: Credentials,
    policy: CasePolicy,
    checkout_root: String,
    target_revision: i64,
    client: ClientState,
    /// Folder renames seen this replay, for the child-delete post-pass.
    renamed_folders: Vec<(String, String)>,
}

impl UpdateDiffEngine {
    pub fn new(
        cache: Arc<MetaCache>,
        source: Arc<dyn SourceRepository>,
        creds: Credentials,
        checkout_root: impl Into<String>,
        target_revision: i64,
        client: ClientState,
    ) -> Self {
        let policy = cache.policy();
        Self {
            cache,
            source,
            creds,
            policy,
            checkout_root: checkout_root.into(),
            target_revision,
            client,
            renamed_folders: Vec::new(),
        }
    }

    /// New empty tree rooted at the checkout path.
    pub fn new_root(&self) -> FolderNode {
        let mut root = FolderNode::new(self.checkout_root.clone());
        root.meta.item_revision = self.target_revision;
        root
    }

    /// Replay changesets in the caller-supplied order. For backward replay
    /// the changes inside each changeset are inverted and walked in reverse.
    pub async fn replay(
        &mut self,
        root: &mut FolderNode,
        changesets: &[ChangesetRecord],
        forward: bool,
    ) -> Result<()> {
        for cs in changesets {
            trace!(changeset = cs.id, changes = cs.changes.len(), forward, "replaying");
            if forward {
                for change in &cs.changes {
                    self.apply_forward(root, change).await?;
                }
            } else {
                for change in cs.changes.iter().rev() {
                    self.apply_backward(root, change).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_forward(&mut self, root: &mut FolderNode, change: &SourceItemChange) -> Result<()> {
        let flags = change.flags;
        // The reserved property folder never reaches client trees.
        if pathing::is_property_folder(&change.item.remote_name) {
            return Ok(());
        }
        // Property blobs route through the add path: they attach to an
        // existing item or leave a would-have-been-add marker.
        if pathing::is_property_path(&change.item.remote_name) {
            if flags.contains(ChangeFlags::DELETE) {
                return self.apply_delete(root, change).await;
            }
            return self.add_or_update(root, change, true, false, false).await;
        }
        if flags.contains(ChangeFlags::RENAME) {
            self.apply_rename(root, change, true).await
        } else if flags.contains(ChangeFlags::DELETE) {
            self.apply_delete(root, change).await
        } else if flags.contains(ChangeFlags::EDIT) {
            self.add_or_update(root, change, true, true, false).await
        } else {
            self.add_or_update(root, change, true, false, false).await
        }
    }

    async fn apply_backward(&mut self, root: &mut FolderNode, change: &SourceItemChange) -> Result<()> {
        let flags = change.flags;
        if pathing::is_property_folder(&change.item.remote_name) {
            return Ok(());
        }
        if pathing::is_property_path(&change.item.remote_name) {
            // Property state at the older target revision, whatever the
            // forward change was.
            return self.add_or_update(root, change, false, false, false).await;
        }
        if flags.contains(ChangeFlags::RENAME) {
            self.apply_rename(root, change, false).await
        } else if flags.contains(ChangeFlags::DELETE) {
            // Walking backward over a delete resurrects the item at the
            // older target revision.
            self.add_or_update(root, change, false, false, false).await
        } else if flags.contains(ChangeFlags::EDIT) {
            self.add_or_update(root, change, false, true, false).await
        } else {
            // Walking backward over an add removes the item.
            self.apply_delete(root, change).await
        }
    }

    /// Process an Add (or the add side of a rename) that introduces a path.
    pub async fn apply_add(
        &mut self,
        root: &mut FolderNode,
        change: &SourceItemChange,
        forward: bool,
    ) -> Result<()> {
        self.add_or_update(root, change, forward, false, false).await
    }

    /// Same as an add, but marks the entry as an edit of content the client
    /// already has.
    pub async fn apply_edit(&mut self, root: &mut FolderNode, change: &SourceItemChange) -> Result<()> {
        self.add_or_update(root, change, true, true, false).await
    }

    async fn add_or_update(
        &mut self,
        root: &mut FolderNode,
        change: &SourceItemChange,
        forward: bool,
        edit: bool,
        rename_side: bool,
    ) -> Result<()> {
        let mut remote = change.item.remote_name.clone();
        let mut property_change = false;
        if let Some(owner) = pathing::property_owner(&remote) {
            property_change = true;
            remote = owner;
        }
        let revision = change.item.changeset_id;

        if forward && self.client.has_at_or_above(&remote, revision) {
            trace!(path = %remote, revision, "client already has this; skipping");
            return Ok(());
        }
        let Some(segments) = self.policy.segments_below(&self.checkout_root, &remote) else {
            trace!(path = %remote, "outside checkout root; skipping add");
            return Ok(());
        };
        if segments.is_empty() {
            if property_change {
                root.property_source = Some(change.item.clone());
                root.meta.property_revision = root.meta.property_revision.max(revision);
            }
            return Ok(());
        }

        let mut item_path = self.checkout_root.clone();
        let mut current: &mut Vec<TreeNode> = &mut root.children;
        for (i, segment) in segments.iter().enumerate() {
            item_path = pathing::join(&item_path, segment);
            let last = i + 1 == segments.len();
            let found = current
                .iter()
                .position(|c| self.policy.matches(c.name(), &item_path));

            let idx = match found {
                Some(idx) if last => {
                    self.resolve_final(
                        current,
                        idx,
                        change,
                        &item_path,
                        forward,
                        edit,
                        rename_side,
                        property_change,
                    )
                    .await?;
                    return Ok(());
                }
                Some(idx) => idx,
                None => {
                    // Never shortcut an unvisited level: a later delete must
                    // be able to cancel this step, so every segment records
                    // its state.
                    let fetched = self.cache.query_item(self.target_revision, &item_path).await?;
                    let node = match fetched {
                        None if last => TreeNode::Missing {
                            name: item_path.clone(),
                            edit,
                        },
                        None => TreeNode::DeleteFolder(FolderNode::new(item_path.clone())),
                        Some(src) => {
                            self.node_from_source(&src, last, edit, property_change, change)
                        }
                    };
                    current.push(node);
                    current.len() - 1
                }
            };
            if last {
                return Ok(());
            }
            current = match current[idx].children_mut() {
                Some(children) => children,
                // A file at an intermediate level: nothing to descend into.
                None => return Ok(()),
            };
        }
        Ok(())
    }

    fn node_from_source(
        &self,
        src: &SourceItem,
        last: bool,
        edit: bool,
        property_change: bool,
        change: &SourceItemChange,
    ) -> TreeNode {
        if !last {
            // Intermediate level: no operation decided for it yet.
            return TreeNode::Stub(Box::new(FolderNode::from_source(src, false)));
        }
        match src.kind {
            SourceItemKind::File => {
                let mut node = FileNode::from_source(src, edit);
                if property_change {
                    node.property_change_only = true;
                    node.property_source = Some(change.item.clone());
                    node.meta.property_revision = change.item.changeset_id;
                }
                TreeNode::File(node)
            }
            SourceItemKind::Folder => {
                let mut node = FolderNode::from_source(src, edit);
                if property_change {
                    node.property_change_only = true;
                    node.property_source = Some(change.item.clone());
                    node.meta.property_revision = change.item.changeset_id;
                }
                TreeNode::Folder(node)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_final(
        &mut self,
        current: &mut Vec<TreeNode>,
        idx: usize,
        change: &SourceItemChange,
        item_path: &str,
        forward: bool,
        edit: bool,
        rename_side: bool,
        property_change: bool,
    ) -> Result<()> {
        let revision = change.item.changeset_id;
        match &mut current[idx] {
            TreeNode::DeleteFile { .. } | TreeNode::DeleteFolder(_) => {
                let fetched = self.cache.query_item(self.target_revision, item_path).await?;
                match fetched {
                    Some(src) if rename_side => {
                        // Rename onto a tombstone keeps both: clients rely on
                        // the delete preceding the add (rename-with-history).
                        let node = self.node_from_source(&src, true, edit, property_change, change);
                        current.push(node);
                    }
                    Some(src) => {
                        // Resurrection: the add cancels the earlier delete.
                        let mut node = self.node_from_source(&src, true, edit, property_change, change);
                        match &mut node {
                            TreeNode::File(f) => f.originally_deleted = true,
                            TreeNode::Folder(f) => f.originally_deleted = true,
                            _ => {}
                        }
                        current[idx] = node;
                    }
                    None => {
                        // Cannot materialize at the target revision: the
                        // tombstone gives way to a missing marker.
                        current[idx] = TreeNode::Missing {
                            name: item_path.to_string(),
                            edit: false,
                        };
                    }
                }
            }
            TreeNode::Stub(stub) => {
                // The path is now visited as a final element: unwrap.
                let mut real = std::mem::take(stub.as_mut());
                real.edit = edit;
                real.meta.sub_item_revision = real.meta.sub_item_revision.max(revision);
                if property_change {
                    real.property_source = Some(change.item.clone());
                    real.meta.property_revision = real.meta.property_revision.max(revision);
                }
                current[idx] = TreeNode::Folder(real);
            }
            TreeNode::Missing { .. } => {
                // Promote the marker if the item materializes now.
                if let Some(src) = self.cache.query_item(self.target_revision, item_path).await? {
                    current[idx] = self.node_from_source(&src, true, edit, property_change, change);
                }
            }
            node @ (TreeNode::File(_) | TreeNode::Folder(_)) => {
                let existing_rev = node.revision();
                let replace = if forward {
                    existing_rev < revision
                } else {
                    existing_rev > revision
                };
                if replace {
                    if let Some(src) = self.cache.query_item(self.target_revision, item_path).await? {
                        let originally_deleted = match node {
                            TreeNode::File(f) => f.originally_deleted,
                            TreeNode::Folder(f) => f.originally_deleted,
                            _ => false,
                        };
                        let mut fresh = self.node_from_source(&src, true, edit, property_change, change);
                        match &mut fresh {
                            TreeNode::File(f) => f.originally_deleted = originally_deleted,
                            TreeNode::Folder(f) => f.originally_deleted = originally_deleted,
                            _ => {}
                        }
                        current[idx] = fresh;
                    }
                } else if property_change {
                    match node {
                        TreeNode::File(f) => {
                            f.property_source = Some(change.item.clone());
                            f.meta.property_revision = f.meta.property_revision.max(revision);
                        }
                        TreeNode::Folder(f) => {
                            f.property_source = Some(change.item.clone());
                            f.meta.property_revision = f.meta.property_revision.max(revision);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Process a delete change.
    pub async fn apply_delete(&mut self, root: &mut FolderNode, change: &SourceItemChange) -> Result<()> {
        let remote = change.item.remote_name.clone();
        if let Some(owner) = pathing::property_owner(&remote) {
            // A removed property blob is a property change on its owner;
            // it never introduces a path of its own.
            if let Some(node) = self.find_node_mut(root, &owner) {
                match node {
                    TreeNode::File(f) => {
                        f.meta.property_revision =
                            f.meta.property_revision.max(change.item.changeset_id);
                    }
                    TreeNode::Folder(f) => {
                        f.meta.property_revision =
                            f.meta.property_revision.max(change.item.changeset_id);
                    }
                    _ => {}
                }
            }
            return Ok(());
        }

        if self.client.is_marked_missing(&remote) {
            self.prune_missing(root, &remote);
            return Ok(());
        }
        let Some(segments) = self.policy.segments_below(&self.checkout_root, &remote) else {
            trace!(path = %remote, "outside checkout root; skipping delete");
            return Ok(());
        };
        if segments.is_empty() {
            return Ok(());
        }

        let mut item_path = self.checkout_root.clone();
        let mut current: &mut Vec<TreeNode> = &mut root.children;
        for (i, segment) in segments.iter().enumerate() {
            item_path = pathing::join(&item_path, segment);
            let last = i + 1 == segments.len();
            let found = current
                .iter()
                .position(|c| self.policy.matches(c.name(), &item_path));

            if last {
                self.resolve_delete(current, found, change, &item_path);
                return Ok(());
            }

            let idx = match found {
                Some(idx) => idx,
                None => {
                    // Record the intermediate level so the delete below it
                    // has a walkable parent.
                    let fetched = self.cache.query_item(self.target_revision, &item_path).await?;
                    let node = match fetched {
                        Some(src) if src.is_folder() => {
                            TreeNode::Stub(Box::new(FolderNode::from_source(&src, false)))
                        }
                        _ => TreeNode::DeleteFolder(FolderNode::new(item_path.clone())),
                    };
                    current.push(node);
                    current.len() - 1
                }
            };
            current = match current[idx].children_mut() {
                Some(children) => children,
                None => return Ok(()),
            };
        }
        Ok(())
    }

    fn resolve_delete(
        &self,
        current: &mut Vec<TreeNode>,
        found: Option<usize>,
        change: &SourceItemChange,
        item_path: &str,
    ) {
        let tombstone = |path: &str| match change.item.kind {
            SourceItemKind::File => TreeNode::DeleteFile {
                name: path.to_string(),
            },
            SourceItemKind::Folder => TreeNode::DeleteFolder(FolderNode::new(path)),
        };

        let Some(idx) = found else {
            current.push(tombstone(item_path));
            return;
        };
        match &mut current[idx] {
            // Already tombstoned: idempotent.
            TreeNode::DeleteFile { .. } | TreeNode::DeleteFolder(_) => {}
            TreeNode::File(f) if f.originally_deleted => {
                current[idx] = TreeNode::DeleteFile {
                    name: item_path.to_string(),
                };
            }
            TreeNode::Folder(f) if f.originally_deleted => {
                current[idx] = TreeNode::DeleteFolder(FolderNode::new(item_path));
            }
            TreeNode::Stub(stub) => {
                // No operation was ever decided for this level; now one is.
                let real = std::mem::take(stub.as_mut());
                let mut folder = FolderNode::new(item_path);
                folder.children = real.children;
                current[idx] = TreeNode::DeleteFolder(folder);
            }
            TreeNode::Missing { edit: true, .. } => {
                current[idx] = TreeNode::DeleteFile {
                    name: item_path.to_string(),
                };
            }
            TreeNode::Missing { edit: false, .. } => {
                current.remove(idx);
            }
            TreeNode::File(f) => {
                if f.property_change_only || f.edit {
                    current[idx] = tombstone(item_path);
                } else {
                    // A spurious add the client never saw.
                    current.remove(idx);
                }
            }
            TreeNode::Folder(f) => {
                if f.property_change_only || f.edit {
                    current[idx] = TreeNode::DeleteFolder(FolderNode::new(item_path));
                } else {
                    current.remove(idx);
                }
            }
        }
    }

    /// Process a rename. The pair is applied in fixed order, delete of the
    /// old name then add of the new one, regardless of replay direction.
    pub async fn apply_rename(
        &mut self,
        root: &mut FolderNode,
        change: &SourceItemChange,
        forward: bool,
    ) -> Result<()> {
        let previous = self
            .source
            .get_previous_version_of_items(
                &self.creds,
                std::slice::from_ref(&change.item),
                change.item.changeset_id,
            )
            .await
            .map_err(crate::error::GateError::Upstream)?
            .into_iter()
            .next()
            .flatten();

        let Some(previous) = previous else {
            // No prior identity recorded: behave like a plain add.
            return self.add_or_update(root, change, forward, false, false).await;
        };

        let (old_name, add_item) = if forward {
            (previous.remote_name.clone(), change.item.clone())
        } else {
            (change.item.remote_name.clone(), previous.clone())
        };
        let new_name = add_item.remote_name.clone();

        // A side whose path leaves the checkout root does not belong to the
        // client's view and is suppressed.
        let old_inside = self
            .policy
            .segments_below(&self.checkout_root, &old_name)
            .is_some();
        if old_inside {
            let delete = SourceItemChange {
                item: SourceItem {
                    remote_name: old_name.clone(),
                    ..change.item.clone()
                },
                flags: ChangeFlags::DELETE,
            };
            self.apply_delete(root, &delete).await?;
        } else {
            debug!(path = %old_name, "rename origin outside checkout root; delete suppressed");
        }

        let new_inside = self
            .policy
            .segments_below(&self.checkout_root, &new_name)
            .is_some();
        if new_inside {
            let add = SourceItemChange {
                item: add_item,
                flags: change.flags,
            };
            self.add_or_update(root, &add, forward, false, true).await?;
        } else {
            debug!(path = %new_name, "rename target outside checkout root; add suppressed");
        }

        if change.item.kind == SourceItemKind::Folder {
            self.renamed_folders.push((old_name, new_name));
        }
        Ok(())
    }

    /// Post-pass: children of renamed folders the client still has need
    /// explicit deletes, and no stub may survive to hand-off.
    pub async fn finish(&mut self, root: &mut FolderNode) -> Result<()> {
        let renames = std::mem::take(&mut self.renamed_folders);
        for (old_name, _new_name) in renames {
            for path in self.client.existing_under(&old_name) {
                let already_deleted = matches!(
                    self.find_node_mut(root, &path),
                    Some(node) if node.is_delete()
                );
                if already_deleted {
                    continue;
                }
                let delete = SourceItemChange {
                    item: SourceItem {
                        id: 0,
                        remote_name: path,
                        changeset_id: self.target_revision,
                        kind: SourceItemKind::File,
                        size: 0,
                        author: String::new(),
                        remote_date: chrono::DateTime::<chrono::Utc>::MIN_UTC,
                    },
                    flags: ChangeFlags::DELETE,
                };
                self.apply_delete(root, &delete).await?;
            }
        }
        resolve_stubs(&mut root.children);
        Ok(())
    }

    fn prune_missing(&self, root: &mut FolderNode, path: &str) {
        let Some(segments) = self.policy.segments_below(&self.checkout_root, path) else {
            return;
        };
        if segments.is_empty() {
            return;
        }
        let mut item_path = self.checkout_root.clone();
        let mut current: &mut Vec<TreeNode> = &mut root.children;
        for (i, segment) in segments.iter().enumerate() {
            item_path = pathing::join(&item_path, segment);
            let Some(idx) = current
                .iter()
                .position(|c| self.policy.matches(c.name(), &item_path))
            else {
                return;
            };
            if i + 1 == segments.len() {
                if matches!(current[idx], TreeNode::Missing { .. }) {
                    current.remove(idx);
                }
                return;
            }
            current = match current[idx].children_mut() {
                Some(children) => children,
                None => return,
            };
        }
    }

    fn find_node_mut<'t>(&self, root: &'t mut FolderNode, path: &str) -> Option<&'t mut TreeNode> {
        let segments = self.policy.segments_below(&self.checkout_root, path)?;
        if segments.is_empty() {
            return None;
        }
        let mut item_path = self.checkout_root.clone();
        let mut current: &mut Vec<TreeNode> = &mut root.children;
        for (i, segment) in segments.iter().enumerate() {
            item_path = pathing::join(&item_path, segment);
            let idx = current
                .iter()
                .position(|c| self.policy.matches(c.name(), &item_path))?;
            if i + 1 == segments.len() {
                return current.get_mut(idx);
            }
            current = current[idx].children_mut()?;
        }
        None
    }
}

/// Replace surviving stubs with the real folders they wrap. A surviving stub
/// was only ever an intermediate step, so the client already walks through
/// it: it resolves to an edit, not an add.
fn resolve_stubs(children: &mut Vec<TreeNode>) {
    for child in children.iter_mut() {
        if let TreeNode::Stub(stub) = child {
            let mut real = std::mem::take(stub.as_mut());
            real.edit = true;
            *child = TreeNode::Folder(real);
        }
        if let Some(grandchildren) = child.children_mut() {
            resolve_stubs(grandchildren);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_ancestor_lookup() {
        let mut state = ClientState::new(CasePolicy::Insensitive);
        state.add_existing("$/proj", 10);
        state.add_existing("$/proj/deep/file.c", 4);

        assert!(state.has_at_or_above("$/proj/anything/below", 10));
        assert!(!state.has_at_or_above("$/proj/anything/below", 11));
        // the deeper entry is older, but the ancestor wins
        assert!(state.has_at_or_above("$/PROJ/deep/file.c", 7));

        state.add_missing("$/proj/gone", "cookie");
        assert!(state.is_marked_missing("$/proj/gone/below"));
        assert!(!state.is_marked_missing("$/proj/present"));
    }

    #[test]
    fn test_existing_under_excludes_prefix_itself() {
        let mut state = ClientState::new(CasePolicy::Sensitive);
        state.add_existing("$/p/dir", 5);
        state.add_existing("$/p/dir/a", 5);
        state.add_existing("$/p/dir/b/c", 5);
        state.add_existing("$/p/other", 5);

        let mut under = state.existing_under("$/p/dir");
        under.sort();
        assert_eq!(under, vec!["$/p/dir/a", "$/p/dir/b/c"]);
    }

    #[test]
    fn test_resolve_stubs_unwraps_recursively() {
        let mut inner = FolderNode::new("$/p/a/b");
        inner.meta.item_revision = 3;
        let mut outer = FolderNode::new("$/p/a");
        outer.children.push(TreeNode::Stub(Box::new(inner)));
        let mut children = vec![TreeNode::Stub(Box::new(outer))];

        resolve_stubs(&mut children);
        let TreeNode::Folder(outer) = &children[0] else {
            panic!("outer stub not resolved");
        };
        assert!(matches!(outer.children[0], TreeNode::Folder(_)));
    }
}
