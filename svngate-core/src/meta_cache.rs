//! Revision-partitioned metadata cache.
//!
//! Replay touches the same `(revision, directory)` pair from many code
//! paths; one recursive upstream fetch amortizes them all. Population is
//! single-flight per `(revision, path)`: the first caller installs a pending
//! entry and performs the upstream call, concurrent callers await the same
//! completion through a watch channel.
//!
//! Entries are immutable once inserted; invalidation is whole-cache `clear`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::error::Result;
use crate::pathing::{self, CasePolicy};
use crate::source::{
    Credentials, DeletedState, ItemCategory, Recursion, SourceItem, SourceRepository, VersionSpec,
};

type PopKey = (i64, String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListingKey {
    revision: i64,
    path: String,
    recursion: Recursion,
}

#[derive(Default)]
struct CacheState {
    /// Canonical `(revision, path) → item` entries.
    items: HashMap<PopKey, Arc<SourceItem>>,
    /// Listing fan-out: each key holds canonical-entry references in
    /// insertion order.
    listings: HashMap<ListingKey, Vec<PopKey>>,
    /// Roots whose subtree has been populated.
    populated: HashSet<PopKey>,
    /// Parents known not to exist at a revision.
    negative: HashSet<PopKey>,
}

/// Process-wide metadata cache, partitioned by the identity it was built
/// for (server connection + credentials are fixed at construction, so the
/// full cache key `(server, user, revision, path, recursion)` is implicit).
pub struct MetaCache {
    source: Arc<dyn SourceRepository>,
    creds: Credentials,
    policy: CasePolicy,
    state: Mutex<CacheState>,
    pending: AsyncMutex<HashMap<PopKey, watch::Receiver<bool>>>,
}

impl MetaCache {
    pub fn new(source: Arc<dyn SourceRepository>, creds: Credentials, policy: CasePolicy) -> Self {
        Self {
            source,
            creds,
            policy,
            state: Mutex::new(CacheState::default()),
            pending: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> CasePolicy {
        self.policy
    }

    /// Items at `path` for the given recursion, ascending by full path.
    pub async fn query_items(
        &self,
        revision: i64,
        path: &str,
        recursion: Recursion,
    ) -> Result<Vec<Arc<SourceItem>>> {
        // The root listing is too large and too frequently needed in narrow
        // form to benefit from full-depth caching.
        if pathing::is_server_root(path) && recursion == Recursion::None {
            let items = self
                .source
                .query_items(
                    &self.creds,
                    path,
                    recursion,
                    VersionSpec::Changeset(revision),
                    DeletedState::NonDeleted,
                    ItemCategory::Any,
                )
                .await?;
            return Ok(items.into_iter().map(Arc::new).collect());
        }

        self.ensure_populated(revision, path).await?;

        let key = ListingKey {
            revision,
            path: self.policy.key(path),
            recursion,
        };
        let state = self.state.lock().expect("cache state poisoned");
        let mut out: Vec<Arc<SourceItem>> = state
            .listings
            .get(&key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.items.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
        Ok(out)
    }

    /// Array variant: the union of per-path queries, in input order.
    pub async fn query_items_many(
        &self,
        revision: i64,
        paths: &[String],
        recursion: Recursion,
    ) -> Result<Vec<Arc<SourceItem>>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            for item in self.query_items(revision, path, recursion).await? {
                if seen.insert(self.policy.key(&item.remote_name)) {
                    out.push(item);
                }
            }
        }
        Ok(out)
    }

    /// Resolve items by server id. By-id lookups do not participate in the
    /// listing fan-out.
    pub async fn query_items_by_id(&self, revision: i64, ids: &[i64]) -> Result<Vec<SourceItem>> {
        Ok(self
            .source
            .query_items_by_id(&self.creds, ids, revision)
            .await?)
    }

    /// Single item at a path, if present at the revision.
    pub async fn query_item(&self, revision: i64, path: &str) -> Result<Option<Arc<SourceItem>>> {
        Ok(self
            .query_items(revision, path, Recursion::None)
            .await?
            .into_iter()
            .next())
    }

    /// True if `path` or any ancestor has been populated (or negatively
    /// cached) at `revision`.
    pub fn is_cached(&self, revision: i64, path: &str) -> bool {
        let state = self.state.lock().expect("cache state poisoned");
        self.covered(&state, revision, path)
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache state poisoned");
        *state = CacheState::default();
    }

    fn is_covered_now(&self, revision: i64, path: &str) -> bool {
        let state = self.state.lock().expect("cache state poisoned");
        self.covered(&state, revision, path)
    }

    fn covered(&self, state: &CacheState, revision: i64, path: &str) -> bool {
        let mut cursor = self.policy.key(path);
        loop {
            let key = (revision, cursor.clone());
            if state.populated.contains(&key) || state.negative.contains(&key) {
                return true;
            }
            if pathing::is_server_root(&cursor) {
                return false;
            }
            cursor = pathing::parent(&cursor);
        }
    }

    async fn ensure_populated(&self, revision: i64, path: &str) -> Result<()> {
        let key = (revision, self.policy.key(path));
        loop {
            if self.is_covered_now(revision, path) {
                return Ok(());
            }

            let waiter = {
                let mut pending = self.pending.lock().await;
                // Re-check: a populator may have finished between the state
                // probe and taking the pending lock.
                if self.is_covered_now(revision, path) {
                    return Ok(());
                }
                match pending.get(&key) {
                    Some(rx) => Some(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        pending.insert(key.clone(), rx);
                        // Hold the sender through population; waiters watch
                        // the receiver we just stored.
                        drop(pending);
                        let result = self.populate(revision, path).await;
                        self.pending.lock().await.remove(&key);
                        let _ = tx.send(true);
                        return result;
                    }
                }
            };

            if let Some(mut rx) = waiter {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        // Populator dropped without completing; take over.
                        break;
                    }
                }
                // Loop: either the state is covered now, or the populator
                // failed and this caller retries the population itself.
                if self.is_covered_now(revision, path) {
                    return Ok(());
                }
                let mut pending = self.pending.lock().await;
                pending.remove(&key);
            }
        }
    }

    async fn populate(&self, revision: i64, path: &str) -> Result<()> {
        debug!(revision, path, "populating metadata cache");
        let mut root = path.to_string();
        let mut items = self.fetch_recursive(revision, &root).await?;

        // A single file result means the caller asked for a file path;
        // retry once with the parent so siblings prefetch too.
        if items.len() == 1 && !items[0].is_folder() {
            root = pathing::parent(&root);
            items = self.fetch_recursive(revision, &root).await?;
        }

        if items.is_empty() {
            let parent = pathing::parent(&root);
            let parent_items = self
                .source
                .query_items(
                    &self.creds,
                    &parent,
                    Recursion::OneLevel,
                    VersionSpec::Changeset(revision),
                    DeletedState::NonDeleted,
                    ItemCategory::Any,
                )
                .await?;
            let mut state = self.state.lock().expect("cache state poisoned");
            state.populated.insert((revision, self.policy.key(&root)));
            if parent_items.is_empty() && !pathing::is_server_root(&parent) {
                trace!(revision, parent, "negative-caching absent parent");
                state.negative.insert((revision, self.policy.key(&parent)));
            }
            return Ok(());
        }

        let mut state = self.state.lock().expect("cache state poisoned");
        for item in items {
            let canonical = (revision, self.policy.key(&item.remote_name));
            let own = canonical.1.clone();
            state
                .items
                .entry(canonical.clone())
                .or_insert_with(|| Arc::new(item));

            // Fan-out must stay idempotent: overlapping population roots
            // revisit the same items, and every root's listings must end up
            // complete.
            let append = |state: &mut CacheState, path: String, recursion: Recursion| {
                let listing = state
                    .listings
                    .entry(ListingKey {
                        revision,
                        path,
                        recursion,
                    })
                    .or_default();
                if !listing.contains(&canonical) {
                    listing.push(canonical.clone());
                }
            };

            for recursion in [Recursion::None, Recursion::OneLevel, Recursion::Full] {
                append(&mut state, own.clone(), recursion);
            }

            let parent = self.policy.key(&pathing::parent(&own));
            for recursion in [Recursion::OneLevel, Recursion::Full] {
                append(&mut state, parent.clone(), recursion);
            }

            let mut ancestor = pathing::parent(&parent);
            loop {
                append(&mut state, ancestor.clone(), Recursion::Full);
                if pathing::is_server_root(&ancestor) {
                    break;
                }
                ancestor = pathing::parent(&ancestor);
            }
        }
        state.populated.insert((revision, self.policy.key(&root)));
        Ok(())
    }

    async fn fetch_recursive(&self, revision: i64, path: &str) -> Result<Vec<SourceItem>> {
        Ok(self
            .source
            .query_items(
                &self.creds,
                path,
                Recursion::Full,
                VersionSpec::Changeset(revision),
                DeletedState::NonDeleted,
                ItemCategory::Any,
            )
            .await?)
    }
}
