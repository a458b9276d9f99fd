//! In-memory upstream implementation.
//!
//! A revisioned, changeset-per-commit source used by integration tests and
//! the demo configuration. Each commit snapshots the whole item table, which
//! keeps revision addressing trivial at test scale.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio::sync::RwLock;

use crate::pathing::{self, CasePolicy, PROP_FOLDER, SERVER_ROOT};
use crate::source::{
    ChangeFlags, ChangesetRecord, Credentials, DeletedState, ItemCategory, Recursion, SourceItem,
    SourceItemChange, SourceItemKind, VersionSpec,
};

#[derive(Debug, Clone)]
struct MemItem {
    id: i64,
    kind: SourceItemKind,
    changeset_id: i64,
    data: Bytes,
    author: String,
}

#[derive(Debug, Default)]
struct Activity {
    comment: String,
    writes: Vec<PendingWrite>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    File { path: String, data: Bytes },
    Folder { path: String },
    Delete { path: String },
    SetProp { path: String, name: String, value: String },
    RemoveProp { path: String, name: String },
}

#[derive(Default)]
struct MemInner {
    next_id: i64,
    /// Snapshot per revision; index 0 is the empty initial state.
    snapshots: Vec<BTreeMap<String, MemItem>>,
    changesets: Vec<ChangesetRecord>,
    activities: HashMap<String, Activity>,
}

/// A change handed to [`MemorySource::commit`].
#[derive(Debug, Clone)]
pub enum MemChange {
    AddFile { path: String, data: Bytes },
    AddFolder { path: String },
    Edit { path: String, data: Bytes },
    Delete { path: String },
    Rename { from: String, to: String },
    /// Rename carrying a merge flag (branch-style move).
    RenameMerge { from: String, to: String },
}

/// In-memory [`crate::source::SourceRepository`].
pub struct MemorySource {
    policy: CasePolicy,
    inner: RwLock<MemInner>,
    /// Artificial per-read delay, for loader timing tests.
    read_delay: StdMutex<Option<Duration>>,
    /// Paths whose reads fail, for loader failure tests.
    failing_reads: StdMutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_policy(CasePolicy::Insensitive)
    }

    pub fn with_policy(policy: CasePolicy) -> Self {
        let mut inner = MemInner::default();
        inner.snapshots.push(BTreeMap::new());
        Self {
            policy,
            inner: RwLock::new(inner),
            read_delay: StdMutex::new(None),
            failing_reads: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().expect("read delay lock") = Some(delay);
    }

    pub fn fail_reads_of(&self, path: impl Into<String>) {
        self.failing_reads.lock().expect("failing reads lock").push(path.into());
    }

    fn stamp(rev: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + rev * 60, 0).single().expect("valid stamp")
    }

    fn to_source(path: &str, item: &MemItem) -> SourceItem {
        SourceItem {
            id: item.id,
            remote_name: path.to_string(),
            changeset_id: item.changeset_id,
            kind: item.kind,
            size: item.data.len() as u64,
            author: item.author.clone(),
            remote_date: Self::stamp(item.changeset_id),
        }
    }

    fn lookup<'a>(&self, snap: &'a BTreeMap<String, MemItem>, path: &str) -> Option<(&'a String, &'a MemItem)> {
        snap.iter().find(|(p, _)| self.policy.matches(p, path))
    }

    /// Apply one commit worth of changes, returning the new changeset id.
    pub async fn commit(&self, author: &str, comment: &str, changes: Vec<MemChange>) -> i64 {
        let mut inner = self.inner.write().await;
        let rev = inner.snapshots.len() as i64;
        let mut snap = inner.snapshots.last().expect("initial snapshot").clone();
        let mut records = Vec::new();
        let mut next_id = inner.next_id;

        let ensure_parents = |snap: &mut BTreeMap<String, MemItem>,
                                  records: &mut Vec<SourceItemChange>,
                                  next_id: &mut i64,
                                  path: &str| {
            let mut missing = Vec::new();
            let mut cursor = pathing::parent(path);
            while cursor != SERVER_ROOT && !snap.contains_key(&cursor) {
                missing.push(cursor.clone());
                cursor = pathing::parent(&cursor);
            }
            for dir in missing.into_iter().rev() {
                *next_id += 1;
                let item = MemItem {
                    id: *next_id,
                    kind: SourceItemKind::Folder,
                    changeset_id: rev,
                    data: Bytes::new(),
                    author: author.to_string(),
                };
                records.push(SourceItemChange {
                    item: Self::to_source(&dir, &item),
                    flags: ChangeFlags::ADD,
                });
                snap.insert(dir, item);
            }
        };

        for change in changes {
            match change {
                MemChange::AddFile { path, data } => {
                    ensure_parents(&mut snap, &mut records, &mut next_id, &path);
                    next_id += 1;
                    let item = MemItem {
                        id: next_id,
                        kind: SourceItemKind::File,
                        changeset_id: rev,
                        data,
                        author: author.to_string(),
                    };
                    records.push(SourceItemChange {
                        item: Self::to_source(&path, &item),
                        flags: ChangeFlags::ADD,
                    });
                    snap.insert(path, item);
                }
                MemChange::AddFolder { path } => {
                    ensure_parents(&mut snap, &mut records, &mut next_id, &path);
                    next_id += 1;
                    let item = MemItem {
                        id: next_id,
                        kind: SourceItemKind::Folder,
                        changeset_id: rev,
                        data: Bytes::new(),
                        author: author.to_string(),
                    };
                    records.push(SourceItemChange {
                        item: Self::to_source(&path, &item),
                        flags: ChangeFlags::ADD,
                    });
                    snap.insert(path, item);
                }
                MemChange::Edit { path, data } => {
                    let key = self
                        .lookup(&snap, &path)
                        .map(|(p, _)| p.clone())
                        .unwrap_or_else(|| path.clone());
                    if let Some(existing) = snap.get(&key).cloned() {
                        let item = MemItem {
                            changeset_id: rev,
                            data,
                            author: author.to_string(),
                            ..existing
                        };
                        records.push(SourceItemChange {
                            item: Self::to_source(&key, &item),
                            flags: ChangeFlags::EDIT,
                        });
                        snap.insert(key, item);
                    }
                }
                MemChange::Delete { path } => {
                    let keys: Vec<String> = snap
                        .keys()
                        .filter(|p| self.policy.is_ancestor_or_self(&path, p))
                        .cloned()
                        .collect();
                    for key in keys {
                        if let Some(removed) = snap.remove(&key) {
                            let mut gone = removed.clone();
                            gone.changeset_id = rev;
                            records.push(SourceItemChange {
                                item: Self::to_source(&key, &gone),
                                flags: ChangeFlags::DELETE,
                            });
                        }
                    }
                }
                renamed @ (MemChange::Rename { .. } | MemChange::RenameMerge { .. }) => {
                    let merge = matches!(renamed, MemChange::RenameMerge { .. });
                    let (from, to) = match renamed {
                        MemChange::Rename { from, to } | MemChange::RenameMerge { from, to } => (from, to),
                        _ => unreachable!(),
                    };
                    let key = match self.lookup(&snap, &from) {
                        Some((p, _)) => p.clone(),
                        None => continue,
                    };
                    let moved = snap.remove(&key).expect("looked up key");
                    // A folder rename moves the whole subtree but records a
                    // single rename change for the folder itself; children
                    // keep their changeset ids.
                    let child_keys: Vec<String> = snap
                        .keys()
                        .filter(|p| self.policy.is_ancestor_or_self(&key, p))
                        .cloned()
                        .collect();
                    for child_key in child_keys {
                        let child = snap.remove(&child_key).expect("listed key");
                        let suffix = &child_key[key.len()..];
                        snap.insert(format!("{to}{suffix}"), child);
                    }
                    ensure_parents(&mut snap, &mut records, &mut next_id, &to);
                    let item = MemItem {
                        changeset_id: rev,
                        author: author.to_string(),
                        ..moved
                    };
                    let flags = if merge {
                        ChangeFlags::RENAME | ChangeFlags::MERGE
                    } else {
                        ChangeFlags::RENAME
                    };
                    records.push(SourceItemChange {
                        item: Self::to_source(&to, &item),
                        flags,
                    });
                    snap.insert(to, item);
                }
            }
        }

        inner.next_id = next_id;
        inner.snapshots.push(snap);
        inner.changesets.push(ChangesetRecord {
            id: rev,
            author: author.to_string(),
            comment: comment.to_string(),
            date: Self::stamp(rev),
            changes: records,
        });
        rev
    }

    /// Current head changeset id.
    pub async fn head(&self) -> i64 {
        self.inner.read().await.snapshots.len() as i64 - 1
    }

    fn snapshot_at(inner: &MemInner, version: VersionSpec) -> &BTreeMap<String, MemItem> {
        let idx = match version {
            VersionSpec::Latest => inner.snapshots.len() - 1,
            VersionSpec::Changeset(rev) => (rev.max(0) as usize).min(inner.snapshots.len() - 1),
        };
        &inner.snapshots[idx]
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::source::SourceRepository for MemorySource {
    async fn query_items(
        &self,
        _creds: &Credentials,
        path: &str,
        recursion: Recursion,
        version: VersionSpec,
        _deleted: DeletedState,
        category: ItemCategory,
    ) -> anyhow::Result<Vec<SourceItem>> {
        let inner = self.inner.read().await;
        let snap = Self::snapshot_at(&inner, version);
        let mut out = Vec::new();
        for (p, item) in snap {
            let hit = if pathing::is_server_root(path) {
                true
            } else {
                match recursion {
                    Recursion::None => self.policy.matches(p, path),
                    Recursion::OneLevel => {
                        self.policy.matches(p, path) || self.policy.matches(&pathing::parent(p), path)
                    }
                    Recursion::Full => self.policy.is_ancestor_or_self(path, p),
                }
            };
            if !hit {
                continue;
            }
            let wanted = match category {
                ItemCategory::Any => true,
                ItemCategory::File => item.kind == SourceItemKind::File,
                ItemCategory::Folder => item.kind == SourceItemKind::Folder,
            };
            if wanted {
                out.push(Self::to_source(p, item));
            }
        }
        if pathing::is_server_root(path) && recursion == Recursion::OneLevel {
            out.retain(|i| pathing::parent(&i.remote_name) == SERVER_ROOT);
        }
        if pathing::is_server_root(path) && recursion == Recursion::None {
            out.clear();
        }
        Ok(out)
    }

    async fn query_items_by_id(
        &self,
        _creds: &Credentials,
        ids: &[i64],
        changeset: i64,
    ) -> anyhow::Result<Vec<SourceItem>> {
        let inner = self.inner.read().await;
        let snap = Self::snapshot_at(&inner, VersionSpec::Changeset(changeset));
        let mut out = Vec::new();
        for id in ids {
            if let Some((p, item)) = snap.iter().find(|(_, i)| i.id == *id) {
                out.push(Self::to_source(p, item));
            }
        }
        Ok(out)
    }

    async fn get_previous_version_of_items(
        &self,
        _creds: &Credentials,
        items: &[SourceItem],
        changeset: i64,
    ) -> anyhow::Result<Vec<Option<SourceItem>>> {
        let inner = self.inner.read().await;
        let snap = Self::snapshot_at(&inner, VersionSpec::Changeset(changeset - 1));
        Ok(items
            .iter()
            .map(|item| {
                snap.iter()
                    .find(|(_, i)| i.id == item.id)
                    .map(|(p, i)| Self::to_source(p, i))
            })
            .collect())
    }

    async fn query_history(
        &self,
        _creds: &Credentials,
        path: &str,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<ChangesetRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .changesets
            .iter()
            .filter(|cs| cs.id >= from && cs.id <= to)
            .filter(|cs| {
                cs.changes.iter().any(|c| {
                    self.policy.is_ancestor_or_self(path, &c.item.remote_name)
                        || self.policy.is_ancestor_or_self(&c.item.remote_name, path)
                })
            })
            .cloned()
            .collect())
    }

    async fn read_file(&self, _creds: &Credentials, item: &SourceItem) -> anyhow::Result<Bytes> {
        let delay = *self.read_delay.lock().expect("read delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let failing = self.failing_reads.lock().expect("failing reads lock");
            if failing.iter().any(|p| self.policy.matches(p, &item.remote_name)) {
                anyhow::bail!("simulated read failure for {}", item.remote_name);
            }
        }
        let inner = self.inner.read().await;
        let snap = Self::snapshot_at(&inner, VersionSpec::Changeset(item.changeset_id));
        match snap.iter().find(|(_, i)| i.id == item.id) {
            Some((_, i)) => Ok(i.data.clone()),
            None => anyhow::bail!("item {} absent at changeset {}", item.remote_name, item.changeset_id),
        }
    }

    async fn write_file(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        data: Bytes,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        let created = self
            .lookup(inner.snapshots.last().expect("snapshot"), path)
            .is_none();
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.writes.push(PendingWrite::File { path: path.to_string(), data });
        Ok(created)
    }

    async fn make_collection(&self, _creds: &Credentials, activity: &str, path: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.writes.push(PendingWrite::Folder { path: path.to_string() });
        Ok(())
    }

    async fn set_property(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.writes.push(PendingWrite::SetProp {
            path: path.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn remove_property(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.writes.push(PendingWrite::RemoveProp {
            path: path.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_activity_comment(
        &self,
        _creds: &Credentials,
        activity: &str,
        comment: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.comment = comment.to_string();
        Ok(())
    }

    async fn get_item_in_activity(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> anyhow::Result<Option<SourceItem>> {
        let inner = self.inner.read().await;
        if let Some(act) = inner.activities.get(activity) {
            for write in act.writes.iter().rev() {
                match write {
                    PendingWrite::File { path: p, data } if self.policy.matches(p, path) => {
                        return Ok(Some(SourceItem {
                            id: 0,
                            remote_name: p.clone(),
                            changeset_id: inner.snapshots.len() as i64,
                            kind: SourceItemKind::File,
                            size: data.len() as u64,
                            author: String::new(),
                            remote_date: Self::stamp(inner.snapshots.len() as i64),
                        }));
                    }
                    PendingWrite::Folder { path: p } if self.policy.matches(p, path) => {
                        return Ok(Some(SourceItem {
                            id: 0,
                            remote_name: p.clone(),
                            changeset_id: inner.snapshots.len() as i64,
                            kind: SourceItemKind::Folder,
                            size: 0,
                            author: String::new(),
                            remote_date: Self::stamp(inner.snapshots.len() as i64),
                        }));
                    }
                    _ => {}
                }
            }
        }
        let snap = inner.snapshots.last().expect("snapshot");
        Ok(self.lookup(snap, path).map(|(p, i)| Self::to_source(p, i)))
    }

    async fn delete_item(
        &self,
        _creds: &Credentials,
        activity: &str,
        path: &str,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.write().await;
        let present = self
            .lookup(inner.snapshots.last().expect("snapshot"), path)
            .is_some();
        let entry = inner.activities.entry(activity.to_string()).or_default();
        entry.writes.push(PendingWrite::Delete { path: path.to_string() });
        Ok(present)
    }

    async fn get_latest_changeset(&self, _creds: &Credentials) -> anyhow::Result<i64> {
        Ok(self.inner.read().await.snapshots.len() as i64 - 1)
    }

    async fn commit_activity(&self, _creds: &Credentials, activity: &str) -> anyhow::Result<i64> {
        let (comment, writes) = {
            let mut inner = self.inner.write().await;
            let act = inner
                .activities
                .remove(activity)
                .ok_or_else(|| anyhow::anyhow!("unknown activity {activity}"))?;
            (act.comment, act.writes)
        };

        // Fold property writes into their blob files so they land as
        // ordinary changes against the reserved property folder.
        let mut props: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut changes = Vec::new();
        for write in writes {
            match write {
                PendingWrite::File { path, data } => {
                    let exists = self
                        .lookup(self.inner.read().await.snapshots.last().expect("snapshot"), &path)
                        .is_some();
                    if exists {
                        changes.push(MemChange::Edit { path, data });
                    } else {
                        changes.push(MemChange::AddFile { path, data });
                    }
                }
                PendingWrite::Folder { path } => changes.push(MemChange::AddFolder { path }),
                PendingWrite::Delete { path } => changes.push(MemChange::Delete { path }),
                PendingWrite::SetProp { path, name, value } => {
                    props.entry(path).or_default().insert(name, value);
                }
                PendingWrite::RemoveProp { path, name } => {
                    props.entry(path).or_default().remove(&name);
                }
            }
        }
        for (owner, map) in props {
            let blob_path = property_blob_path(&owner, {
                let inner = self.inner.read().await;
                self.lookup(inner.snapshots.last().expect("snapshot"), &owner)
                    .map(|(_, i)| i.kind)
                    .unwrap_or(SourceItemKind::File)
            });
            let data = Bytes::from(serde_json::to_vec(&map)?);
            let exists = self
                .lookup(self.inner.read().await.snapshots.last().expect("snapshot"), &blob_path)
                .is_some();
            if exists {
                changes.push(MemChange::Edit { path: blob_path, data });
            } else {
                changes.push(MemChange::AddFile { path: blob_path, data });
            }
        }

        Ok(self.commit("activity", &comment, changes).await)
    }
}

/// Server path of the property blob for `owner`.
pub fn property_blob_path(owner: &str, kind: SourceItemKind) -> String {
    match kind {
        SourceItemKind::Folder => pathing::join(&pathing::join(owner, PROP_FOLDER), crate::pathing::DIR_PROP_FILE),
        SourceItemKind::File => {
            let (dir, name) = pathing::split(owner);
            pathing::join(&pathing::join(&dir, PROP_FOLDER), &name)
        }
    }
}
