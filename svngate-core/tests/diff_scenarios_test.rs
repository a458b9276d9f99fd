//! Replay scenarios exercising the diff engine against an in-memory
//! upstream, including the boundary cases around renames, resurrection,
//! and property changes on deleted files.

use std::sync::Arc;

use bytes::Bytes;
use svngate_core::{
    CasePolicy, ClientState, Credentials, FolderNode, MemChange, MemorySource, MetaCache,
    NodeKind, SourceRepository, TreeNode, UpdateDiffEngine,
};

struct Fixture {
    source: Arc<MemorySource>,
    creds: Credentials,
}

impl Fixture {
    fn new() -> Self {
        Self::with_policy(CasePolicy::Insensitive)
    }

    fn with_policy(policy: CasePolicy) -> Self {
        Self {
            source: Arc::new(MemorySource::with_policy(policy)),
            creds: Credentials::new("alice", "secret", "CORP"),
        }
    }

    fn policy(&self) -> CasePolicy {
        CasePolicy::Insensitive
    }

    fn engine(&self, checkout_root: &str, target: i64, client: ClientState) -> UpdateDiffEngine {
        let cache = Arc::new(MetaCache::new(
            self.source.clone(),
            self.creds.clone(),
            self.policy(),
        ));
        UpdateDiffEngine::new(
            cache,
            self.source.clone(),
            self.creds.clone(),
            checkout_root,
            target,
            client,
        )
    }

    /// Replay `(from, to]` forward onto a fresh tree.
    async fn replay_forward(
        &self,
        checkout_root: &str,
        from: i64,
        to: i64,
        client: ClientState,
    ) -> FolderNode {
        let mut engine = self.engine(checkout_root, to, client);
        let mut root = engine.new_root();
        let history = self
            .source
            .query_history(&self.creds, checkout_root, from + 1, to)
            .await
            .unwrap();
        engine.replay(&mut root, &history, true).await.unwrap();
        engine.finish(&mut root).await.unwrap();
        root
    }

    /// Replay `(to, from]` backward onto a fresh tree (client backs out of a
    /// future revision).
    async fn replay_backward(
        &self,
        checkout_root: &str,
        from: i64,
        to: i64,
        client: ClientState,
    ) -> FolderNode {
        let mut engine = self.engine(checkout_root, to, client);
        let mut root = engine.new_root();
        let mut history = self
            .source
            .query_history(&self.creds, checkout_root, to + 1, from)
            .await
            .unwrap();
        history.reverse();
        engine.replay(&mut root, &history, false).await.unwrap();
        engine.finish(&mut root).await.unwrap();
        root
    }
}

/// Flat structural fingerprint of a tree, depth-first.
fn signature(root: &FolderNode) -> Vec<String> {
    fn walk(children: &[TreeNode], out: &mut Vec<String>) {
        for child in children {
            let extra = match child {
                TreeNode::File(f) => format!(":r{}:od={}", f.meta.revision(), f.originally_deleted),
                TreeNode::Folder(f) => format!(":r{}:od={}", f.meta.revision(), f.originally_deleted),
                TreeNode::Missing { edit, .. } => format!(":edit={edit}"),
                _ => String::new(),
            };
            out.push(format!("{:?}:{}{}", child.kind(), child.name(), extra));
            if let Some(kids) = child.children() {
                walk(kids, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(&root.children, &mut out);
    out
}

fn nodes_of_kind(root: &FolderNode, kind: NodeKind) -> Vec<String> {
    fn walk(children: &[TreeNode], kind: NodeKind, out: &mut Vec<String>) {
        for child in children {
            if child.kind() == kind {
                out.push(child.name().to_string());
            }
            if let Some(kids) = child.children() {
                walk(kids, kind, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(&root.children, kind, &mut out);
    out
}

fn find<'t>(root: &'t FolderNode, path: &str) -> Option<&'t TreeNode> {
    fn walk<'t>(children: &'t [TreeNode], path: &str) -> Option<&'t TreeNode> {
        for child in children {
            if child.name().eq_ignore_ascii_case(path) {
                return Some(child);
            }
            if let Some(kids) = child.children() {
                if let Some(hit) = walk(kids, path) {
                    return Some(hit);
                }
            }
        }
        None
    }
    walk(&root.children, path)
}

fn max_revision(root: &FolderNode) -> i64 {
    fn walk(children: &[TreeNode], acc: &mut i64) {
        for child in children {
            *acc = (*acc).max(child.revision());
            if let Some(kids) = child.children() {
                walk(kids, acc);
            }
        }
    }
    let mut acc = 0;
    walk(&root.children, &mut acc);
    acc
}

#[tokio::test]
async fn test_rename_across_checkout_root_emits_only_the_add() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "alice",
            "seed",
            vec![
                MemChange::AddFile {
                    path: "$/REPO1/a/file.h".into(),
                    data: Bytes::from_static(b"contents"),
                },
                MemChange::AddFile {
                    path: "$/REPO2/keep.txt".into(),
                    data: Bytes::from_static(b"k"),
                },
            ],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "alice",
            "move across roots",
            vec![MemChange::Rename {
                from: "$/REPO1/a/file.h".into(),
                to: "$/REPO2/a/file.h".into(),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/REPO2", 1);

    let tree = fx.replay_forward("$/REPO2", 1, r2, client).await;

    let files = nodes_of_kind(&tree, NodeKind::File);
    assert_eq!(files, vec!["$/REPO2/a/file.h"], "exactly one add");
    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty(), "no delete side");
    assert!(nodes_of_kind(&tree, NodeKind::DeleteFolder).is_empty());
    assert!(nodes_of_kind(&tree, NodeKind::StubFolder).is_empty(), "stubs resolved at hand-off");
}

#[tokio::test]
async fn test_delete_then_resurrect_within_one_replay() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "bob",
            "add x",
            vec![MemChange::AddFile {
                path: "$/proj/x".into(),
                data: Bytes::from_static(b"original"),
            }],
        )
        .await;
    fx.source
        .commit("bob", "drop x", vec![MemChange::Delete { path: "$/proj/x".into() }])
        .await;
    let r3 = fx
        .source
        .commit(
            "bob",
            "bring x back",
            vec![MemChange::AddFile {
                path: "$/proj/x".into(),
                data: Bytes::from_static(b"new content"),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);

    let tree = fx.replay_forward("$/proj", 1, r3, client).await;

    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty(), "no tombstone survives");
    let TreeNode::File(file) = find(&tree, "$/proj/x").expect("x present") else {
        panic!("x is not a file node");
    };
    assert!(file.originally_deleted, "resurrection is flagged");
    assert_eq!(file.meta.item_revision, r3);
}

#[tokio::test]
async fn test_property_only_change_on_deleted_file_leaves_missing_marker() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "carol",
            "add foo",
            vec![MemChange::AddFile {
                path: "$/proj/foo".into(),
                data: Bytes::from_static(b"f"),
            }],
        )
        .await;
    fx.source
        .commit("carol", "drop foo", vec![MemChange::Delete { path: "$/proj/foo".into() }])
        .await;
    // Property blob written against the now-deleted file.
    let r3 = fx
        .source
        .commit(
            "carol",
            "touch props of foo",
            vec![MemChange::AddFile {
                path: "$/proj/.svnprops/foo".into(),
                data: Bytes::from_static(b"{\"k\":\"v\"}"),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);

    let tree = fx.replay_forward("$/proj", 1, r3, client).await;

    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty(), "never a delete");
    let missing = nodes_of_kind(&tree, NodeKind::Missing);
    assert_eq!(missing, vec!["$/proj/foo"]);
    let Some(TreeNode::Missing { edit, .. }) = find(&tree, "$/proj/foo") else {
        panic!("foo is not a missing marker");
    };
    assert!(!edit, "would-have-been-add, not edit");
    // the reserved folder itself never reaches the tree
    assert!(find(&tree, "$/proj/.svnprops").is_none());
}

#[tokio::test]
async fn test_case_only_rename_emits_delete_then_add() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "dave",
            "add foo",
            vec![MemChange::AddFile {
                path: "$/P/foo".into(),
                data: Bytes::from_static(b"f"),
            }],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "dave",
            "recase",
            vec![MemChange::Rename {
                from: "$/P/foo".into(),
                to: "$/P/FOO".into(),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/P", 1);

    let tree = fx.replay_forward("$/P", 1, r2, client).await;

    // both sides present, delete strictly before the add in traversal order
    let order: Vec<_> = tree
        .children
        .iter()
        .map(|c| (c.kind(), c.name().to_string()))
        .collect();
    let delete_pos = order
        .iter()
        .position(|(k, _)| *k == NodeKind::DeleteFile)
        .expect("delete side present");
    let add_pos = order
        .iter()
        .position(|(k, _)| *k == NodeKind::File)
        .expect("add side present");
    assert!(delete_pos < add_pos, "delete precedes add: {order:?}");
    assert_eq!(order[delete_pos].1, "$/P/foo");
    assert_eq!(order[add_pos].1, "$/P/FOO");
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "erin",
            "seed",
            vec![
                MemChange::AddFile {
                    path: "$/proj/src/main.c".into(),
                    data: Bytes::from_static(b"main"),
                },
                MemChange::AddFile {
                    path: "$/proj/src/util.c".into(),
                    data: Bytes::from_static(b"util"),
                },
            ],
        )
        .await;
    fx.source
        .commit(
            "erin",
            "churn",
            vec![
                MemChange::Edit {
                    path: "$/proj/src/main.c".into(),
                    data: Bytes::from_static(b"main v2"),
                },
                MemChange::Delete {
                    path: "$/proj/src/util.c".into(),
                },
            ],
        )
        .await;
    let r3 = fx
        .source
        .commit(
            "erin",
            "more",
            vec![
                MemChange::AddFile {
                    path: "$/proj/src/util.c".into(),
                    data: Bytes::from_static(b"util back"),
                },
                MemChange::Rename {
                    from: "$/proj/src/main.c".into(),
                    to: "$/proj/src/entry.c".into(),
                },
            ],
        )
        .await;

    let client = || {
        let mut state = ClientState::new(fx.policy());
        state.add_existing("$/proj", 1);
        state.add_existing("$/proj/src/main.c", 1);
        state.add_existing("$/proj/src/util.c", 1);
        state
    };

    let first = signature(&fx.replay_forward("$/proj", 1, r3, client()).await);
    let second = signature(&fx.replay_forward("$/proj", 1, r3, client()).await);
    assert_eq!(first, second, "same inputs must yield a structurally identical tree");
    assert!(!first.is_empty());
}

#[tokio::test]
async fn test_effective_revision_bounded_by_target() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "frank",
            "seed",
            vec![MemChange::AddFile {
                path: "$/proj/a".into(),
                data: Bytes::from_static(b"1"),
            }],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "frank",
            "grow",
            vec![MemChange::AddFile {
                path: "$/proj/dir/b".into(),
                data: Bytes::from_static(b"2"),
            }],
        )
        .await;
    // a third changeset the replay must not see
    fx.source
        .commit(
            "frank",
            "future",
            vec![MemChange::Edit {
                path: "$/proj/a".into(),
                data: Bytes::from_static(b"3"),
            }],
        )
        .await;

    let client = ClientState::new(fx.policy());
    let tree = fx.replay_forward("$/proj", 0, r2, client).await;
    assert!(max_revision(&tree) <= r2);
}

#[tokio::test]
async fn test_client_state_suppresses_changes_it_already_has() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "gina",
            "seed",
            vec![MemChange::AddFile {
                path: "$/proj/a".into(),
                data: Bytes::from_static(b"1"),
            }],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "gina",
            "edit",
            vec![MemChange::Edit {
                path: "$/proj/a".into(),
                data: Bytes::from_static(b"2"),
            }],
        )
        .await;

    // client already reports the file at the target revision
    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);
    client.add_existing("$/proj/a", r2);

    let tree = fx.replay_forward("$/proj", 1, r2, client).await;
    assert!(tree.children.is_empty(), "nothing to send, got {:?}", signature(&tree));
}

#[tokio::test]
async fn test_delete_suppressed_when_client_marked_it_missing() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "hank",
            "seed",
            vec![MemChange::AddFile {
                path: "$/proj/gone.txt".into(),
                data: Bytes::from_static(b"x"),
            }],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "hank",
            "remove",
            vec![MemChange::Delete {
                path: "$/proj/gone.txt".into(),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);
    client.add_missing("$/proj/gone.txt", "tok");

    let tree = fx.replay_forward("$/proj", 1, r2, client).await;
    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty());
    assert!(nodes_of_kind(&tree, NodeKind::Missing).is_empty());
}

#[tokio::test]
async fn test_backward_replay_restores_prior_content_identity() {
    let fx = Fixture::new();
    let r1 = fx
        .source
        .commit(
            "ivan",
            "add",
            vec![MemChange::AddFile {
                path: "$/proj/x".into(),
                data: Bytes::from_static(b"old"),
            }],
        )
        .await;
    fx.source
        .commit("ivan", "drop", vec![MemChange::Delete { path: "$/proj/x".into() }])
        .await;
    let r3 = fx
        .source
        .commit(
            "ivan",
            "readd",
            vec![MemChange::AddFile {
                path: "$/proj/x".into(),
                data: Bytes::from_static(b"new"),
            }],
        )
        .await;

    // client sits at r3, backs out to r1
    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", r3);
    client.add_existing("$/proj/x", r3);

    let tree = fx.replay_backward("$/proj", r3, r1, client).await;

    let TreeNode::File(file) = find(&tree, "$/proj/x").expect("x restored") else {
        panic!("x is not a file");
    };
    assert_eq!(file.meta.item_revision, r1, "identity fetched at the older target");
    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty());
}

#[tokio::test]
async fn test_add_then_delete_in_one_replay_cancels_out() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "kira",
            "seed",
            vec![MemChange::AddFile {
                path: "$/proj/keep.txt".into(),
                data: Bytes::from_static(b"k"),
            }],
        )
        .await;
    fx.source
        .commit(
            "kira",
            "short-lived file",
            vec![MemChange::AddFile {
                path: "$/proj/tmp.txt".into(),
                data: Bytes::from_static(b"t"),
            }],
        )
        .await;
    let r3 = fx
        .source
        .commit(
            "kira",
            "gone again",
            vec![MemChange::Delete {
                path: "$/proj/tmp.txt".into(),
            }],
        )
        .await;

    // the client never saw tmp.txt, so no delete may be emitted for it
    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);
    client.add_existing("$/proj/keep.txt", 1);

    let tree = fx.replay_forward("$/proj", 1, r3, client).await;
    assert!(find(&tree, "$/proj/tmp.txt").is_none(), "{:?}", signature(&tree));
    assert!(nodes_of_kind(&tree, NodeKind::DeleteFile).is_empty());
}

#[tokio::test]
async fn test_folder_rename_post_pass_deletes_stranded_children() {
    let fx = Fixture::new();
    fx.source
        .commit(
            "judy",
            "seed",
            vec![
                MemChange::AddFile {
                    path: "$/proj/olddir/a.txt".into(),
                    data: Bytes::from_static(b"a"),
                },
                MemChange::AddFile {
                    path: "$/proj/olddir/b.txt".into(),
                    data: Bytes::from_static(b"b"),
                },
            ],
        )
        .await;
    let r2 = fx
        .source
        .commit(
            "judy",
            "rename dir",
            vec![MemChange::Rename {
                from: "$/proj/olddir".into(),
                to: "$/proj/newdir".into(),
            }],
        )
        .await;

    let mut client = ClientState::new(fx.policy());
    client.add_existing("$/proj", 1);
    client.add_existing("$/proj/olddir", 1);
    client.add_existing("$/proj/olddir/a.txt", 1);
    client.add_existing("$/proj/olddir/b.txt", 1);

    let tree = fx.replay_forward("$/proj", 1, r2, client).await;

    let mut deletes = nodes_of_kind(&tree, NodeKind::DeleteFile);
    deletes.sort();
    assert_eq!(
        deletes,
        vec!["$/proj/olddir/a.txt", "$/proj/olddir/b.txt"],
        "children the client still has get explicit deletes"
    );
    assert!(!nodes_of_kind(&tree, NodeKind::DeleteFolder).is_empty(), "the old folder is tombstoned");
}
