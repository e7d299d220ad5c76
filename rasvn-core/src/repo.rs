//! The repository oracle the edit machinery consumes, and an in-memory
//! implementation backing tests and the server.
//!
//! A repository is a sequence of immutable revision snapshots. Each
//! snapshot maps node-branch ids to node records; paths are derived by
//! walking parent links. Revision 0 is an empty root directory.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::editor::{EditOp, NodeBranchId, NodeContent, NodeKind, PegPath, TxnPath};
use crate::error::{Error, ErrorKind, Result};
use crate::item::Revnum;

/// A node's full versioned state: tree linkage plus content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevNode {
    /// `None` only for the root.
    pub parent: Option<NodeBranchId>,
    pub name: String,
    pub kind: NodeKind,
    pub content: NodeContent,
}

/// One revision's tree.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root: NodeBranchId,
    pub nodes: HashMap<NodeBranchId, RevNode>,
}

impl Snapshot {
    /// An empty tree: just a root directory.
    pub fn empty(root: NodeBranchId) -> Snapshot {
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            RevNode {
                parent: None,
                name: String::new(),
                kind: NodeKind::Dir,
                content: NodeContent::empty(NodeKind::Dir),
            },
        );
        Snapshot { root, nodes }
    }

    pub fn children<'a>(
        &'a self,
        parent: &'a NodeBranchId,
    ) -> impl Iterator<Item = (&'a NodeBranchId, &'a RevNode)> {
        self.nodes
            .iter()
            .filter(move |(_, node)| node.parent.as_ref() == Some(parent))
    }

    pub fn child_by_name<'a>(&'a self, parent: &'a NodeBranchId, name: &str) -> Option<&'a NodeBranchId> {
        self.children(parent)
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
    }

    /// Walk a slash-separated relative path down from the root.
    pub fn lookup_path(&self, relpath: &str) -> Option<&NodeBranchId> {
        let mut cur = &self.root;
        for comp in relpath.split('/').filter(|c| !c.is_empty()) {
            cur = self.child_by_name(cur, comp)?;
        }
        Some(cur)
    }

    /// The relative path of a node, built by walking parent links.
    pub fn path_of(&self, nbid: &NodeBranchId) -> Option<String> {
        let mut comps = Vec::new();
        let mut cur = nbid;
        loop {
            let node = self.nodes.get(cur)?;
            match &node.parent {
                None => break,
                Some(parent) => {
                    comps.push(node.name.as_str());
                    cur = parent;
                }
            }
        }
        comps.reverse();
        Some(comps.join("/"))
    }
}

/// How identical-effect concurrent changes are treated at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebasePolicy {
    /// Any conflicting intervening change is out-of-date.
    #[default]
    Strict,
    /// An intervening change with identical effect is a null merge.
    Permissive,
}

/// What happened to one node-branch between two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHistory {
    /// Own name, parent or content differ between the two revisions.
    pub changed: bool,
    /// Absent at the earlier revision, present at the later one.
    pub created: bool,
    /// Present at the earlier revision, absent at the later one.
    pub deleted: bool,
}

impl NodeHistory {
    pub fn conflicts(&self) -> bool {
        self.changed || self.created || self.deleted
    }
}

/// An out-of-date check recorded when an edit was applied, re-evaluated
/// against the then-current head at commit time.
#[derive(Debug, Clone)]
pub struct OodRecheck {
    pub nbid: NodeBranchId,
    pub since: Revnum,
}

/// Everything the repository needs to turn a finished transaction into a
/// revision.
pub struct CommitRequest {
    pub base_rev: Revnum,
    pub root: NodeBranchId,
    pub nodes: HashMap<NodeBranchId, RevNode>,
    pub rechecks: Vec<OodRecheck>,
    pub rebase: RebasePolicy,
    pub author: String,
    pub message: String,
}

/// The repository interface the edit state machine consumes.
#[async_trait]
pub trait RepoOracle: Send + Sync {
    fn uuid(&self) -> &str;

    async fn head_rev(&self) -> Revnum;

    async fn snapshot(&self, rev: Revnum) -> Result<Snapshot>;

    /// Resolve a peg to the node-branch that lived there.
    async fn resolve_peg(&self, rev: Revnum, relpath: &str) -> Result<NodeBranchId>;

    async fn node_at(&self, rev: Revnum, nbid: &NodeBranchId) -> Result<Option<RevNode>>;

    /// What happened to `nbid` in the window `(since, upto]`.
    async fn history_since(
        &self,
        nbid: &NodeBranchId,
        since: Revnum,
        upto: Revnum,
    ) -> Result<NodeHistory>;

    async fn fetch_content(&self, rev: Revnum, relpath: &str) -> Result<NodeContent>;

    /// Re-run the recorded out-of-date checks against the current head,
    /// merge the transaction with any intervening commits, and commit.
    async fn commit(&self, req: CommitRequest) -> Result<Revnum>;
}

struct Revision {
    snapshot: Snapshot,
    author: String,
    message: String,
    timestamp: i64,
}

/// Commit metadata for one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision: Revnum,
    pub author: String,
    pub message: String,
    pub timestamp: i64,
}

struct RepoState {
    revisions: Vec<Revision>,
}

impl RepoState {
    fn head(&self) -> Revnum {
        (self.revisions.len() - 1) as Revnum
    }

    fn snapshot_at(&self, rev: Revnum) -> Result<&Snapshot> {
        self.revisions
            .get(rev as usize)
            .map(|r| &r.snapshot)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no such revision {rev}")))
    }

    fn history(&self, nbid: &NodeBranchId, since: Revnum, upto: Revnum) -> Result<NodeHistory> {
        let earlier = self.snapshot_at(since)?.nodes.get(nbid);
        let later = self.snapshot_at(upto)?.nodes.get(nbid);
        Ok(match (earlier, later) {
            (None, None) => NodeHistory { changed: false, created: false, deleted: false },
            (None, Some(_)) => NodeHistory { changed: false, created: true, deleted: false },
            (Some(_), None) => NodeHistory { changed: false, created: false, deleted: true },
            (Some(a), Some(b)) => {
                NodeHistory { changed: a != b, created: false, deleted: false }
            }
        })
    }
}

/// In-memory repository: revisions held in a vector behind a lock, a UUID,
/// and nothing on disk.
pub struct InMemoryRepository {
    uuid: String,
    state: RwLock<RepoState>,
}

impl InMemoryRepository {
    pub fn new() -> InMemoryRepository {
        let root = NodeBranchId::new("root");
        let rev0 = Revision {
            snapshot: Snapshot::empty(root),
            author: "system".to_string(),
            message: "initial revision".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        InMemoryRepository {
            uuid: uuid::Uuid::new_v4().to_string(),
            state: RwLock::new(RepoState { revisions: vec![rev0] }),
        }
    }

    pub fn root_id() -> NodeBranchId {
        NodeBranchId::new("root")
    }

    pub async fn info(&self, rev: Revnum) -> Result<RevisionInfo> {
        let state = self.state.read().await;
        let revision = state
            .revisions
            .get(rev as usize)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no such revision {rev}")))?;
        Ok(RevisionInfo {
            revision: rev,
            author: revision.author.clone(),
            message: revision.message.clone(),
            timestamp: revision.timestamp,
        })
    }
}

impl Default for InMemoryRepository {
    fn default() -> InMemoryRepository {
        InMemoryRepository::new()
    }
}

#[async_trait]
impl RepoOracle for InMemoryRepository {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn head_rev(&self) -> Revnum {
        self.state.read().await.head()
    }

    async fn snapshot(&self, rev: Revnum) -> Result<Snapshot> {
        Ok(self.state.read().await.snapshot_at(rev)?.clone())
    }

    async fn resolve_peg(&self, rev: Revnum, relpath: &str) -> Result<NodeBranchId> {
        let state = self.state.read().await;
        state
            .snapshot_at(rev)?
            .lookup_path(relpath)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound, format!("path not found: {relpath}@{rev}"))
            })
    }

    async fn node_at(&self, rev: Revnum, nbid: &NodeBranchId) -> Result<Option<RevNode>> {
        let state = self.state.read().await;
        Ok(state.snapshot_at(rev)?.nodes.get(nbid).cloned())
    }

    async fn history_since(
        &self,
        nbid: &NodeBranchId,
        since: Revnum,
        upto: Revnum,
    ) -> Result<NodeHistory> {
        self.state.read().await.history(nbid, since, upto)
    }

    async fn fetch_content(&self, rev: Revnum, relpath: &str) -> Result<NodeContent> {
        let state = self.state.read().await;
        let snapshot = state.snapshot_at(rev)?;
        let nbid = snapshot.lookup_path(relpath).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, format!("path not found: {relpath}@{rev}"))
        })?;
        Ok(snapshot.nodes[nbid].content.clone())
    }

    async fn commit(&self, req: CommitRequest) -> Result<Revnum> {
        let mut state = self.state.write().await;
        let head = state.head();

        for recheck in &req.rechecks {
            let history = state.history(&recheck.nbid, recheck.since, head)?;
            if history.conflicts() {
                if req.rebase == RebasePolicy::Permissive {
                    // Identical-effect changes merge to nothing.
                    let theirs = state.snapshot_at(head)?.nodes.get(&recheck.nbid);
                    let ours = req.nodes.get(&recheck.nbid);
                    match (theirs, ours) {
                        (None, None) => continue,
                        (Some(a), Some(b)) if a == b => continue,
                        _ => {}
                    }
                }
                return Err(Error::new(
                    ErrorKind::OutOfDate,
                    format!("node {} changed since r{}", recheck.nbid, recheck.since),
                ));
            }
        }

        // Rebase: replay our per-node changes (relative to the txn base)
        // onto the head snapshot, so untouched intervening commits survive.
        let base = state.snapshot_at(req.base_rev)?.clone();
        let mut merged = state.snapshot_at(head)?.nodes.clone();
        for (nbid, node) in &req.nodes {
            match base.nodes.get(nbid) {
                Some(unchanged) if unchanged == node => {}
                _ => {
                    merged.insert(nbid.clone(), node.clone());
                }
            }
        }
        for nbid in base.nodes.keys() {
            if !req.nodes.contains_key(nbid) {
                merged.remove(nbid);
            }
        }
        sweep_orphans(&req.root, &mut merged)?;
        check_sibling_names(&merged)?;

        state.revisions.push(Revision {
            snapshot: Snapshot { root: req.root, nodes: merged },
            author: req.author,
            message: req.message,
            timestamp: chrono::Utc::now().timestamp(),
        });
        let new_rev = state.head();
        info!(revision = new_rev, "committed");
        Ok(new_rev)
    }
}

/// Drop subtrees orphaned by the merge (children added on one side under a
/// directory deleted on the other). Unreachable nodes whose parents are all
/// still present indicate a move cycle between the two sides.
fn sweep_orphans(root: &NodeBranchId, nodes: &mut HashMap<NodeBranchId, RevNode>) -> Result<()> {
    loop {
        let mut reachable = HashSet::new();
        let mut stack = vec![root.clone()];
        while let Some(cur) = stack.pop() {
            if !reachable.insert(cur.clone()) {
                continue;
            }
            for (id, node) in nodes.iter() {
                if node.parent.as_ref() == Some(&cur) {
                    stack.push(id.clone());
                }
            }
        }
        let unreachable: Vec<NodeBranchId> =
            nodes.keys().filter(|id| !reachable.contains(*id)).cloned().collect();
        if unreachable.is_empty() {
            return Ok(());
        }
        let droppable: Vec<NodeBranchId> = unreachable
            .iter()
            .filter(|id| match &nodes[*id].parent {
                Some(parent) => !nodes.contains_key(parent),
                None => true,
            })
            .cloned()
            .collect();
        if droppable.is_empty() {
            return Err(Error::new(
                ErrorKind::OutOfDate,
                "concurrent moves form a cycle",
            ));
        }
        for id in droppable {
            debug!(node = %id, "dropping orphaned node");
            nodes.remove(&id);
        }
    }
}

/// Sibling names must be unique under every parent.
fn check_sibling_names(nodes: &HashMap<NodeBranchId, RevNode>) -> Result<()> {
    let mut seen: HashSet<(&NodeBranchId, &str)> = HashSet::new();
    for node in nodes.values() {
        if let Some(parent) = &node.parent {
            if !seen.insert((parent, node.name.as_str())) {
                return Err(Error::new(
                    ErrorKind::OutOfDate,
                    format!("name collision on {:?}", node.name),
                ));
            }
        }
    }
    Ok(())
}

/// Express the difference between two snapshots as a path-addressed edit
/// drive against `base_rev`. Moves that rescue nodes out of deleted
/// subtrees run first, then deletions, creations, remaining moves, and
/// content changes.
pub fn diff_snapshots(base: &Snapshot, base_rev: Revnum, target: &Snapshot) -> Vec<EditOp> {
    let mut ops = Vec::new();

    // Roots of deleted subtrees: gone from target, parent not itself gone.
    let deleted_roots: Vec<&NodeBranchId> = base
        .nodes
        .keys()
        .filter(|id| !target.nodes.contains_key(*id))
        .filter(|id| match &base.nodes[*id].parent {
            Some(parent) => target.nodes.contains_key(parent),
            None => false,
        })
        .collect();
    let deleted: HashSet<&NodeBranchId> = base
        .nodes
        .keys()
        .filter(|id| !target.nodes.contains_key(*id))
        .collect();

    let moved: Vec<&NodeBranchId> = base
        .nodes
        .iter()
        .filter_map(|(id, node)| {
            let after = target.nodes.get(id)?;
            (after.parent != node.parent || after.name != node.name).then_some(id)
        })
        .collect();
    let needs_rescue = |id: &NodeBranchId| {
        // Does the node's base parent chain pass through a deleted node?
        let mut cur = base.nodes[id].parent.as_ref();
        while let Some(parent) = cur {
            if deleted.contains(parent) {
                return true;
            }
            cur = base.nodes.get(parent).and_then(|n| n.parent.as_ref());
        }
        false
    };

    let mv_op = |id: &NodeBranchId| {
        let after = &target.nodes[id];
        let parent = after.parent.as_ref().expect("moved node has a parent");
        EditOp::Mv {
            from: PegPath::committed(base_rev, base.path_of(id).expect("node in base")),
            new_parent: txn_path_for(base, base_rev, target, parent),
            name: after.name.clone(),
        }
    };

    for id in moved.iter().filter(|id| needs_rescue(id)) {
        ops.push(mv_op(id));
    }

    for id in deleted_roots {
        ops.push(EditOp::Rm {
            loc: PegPath::committed(base_rev, base.path_of(id).expect("node in base")),
        });
    }

    // Creations, parents before children.
    let mut added: Vec<&NodeBranchId> = target
        .nodes
        .keys()
        .filter(|id| !base.nodes.contains_key(*id))
        .collect();
    added.sort_by_key(|id| {
        (
            target.path_of(id).map(|p| p.matches('/').count() + 1).unwrap_or(0),
            target.path_of(id),
        )
    });
    for id in &added {
        let node = &target.nodes[*id];
        let parent = node.parent.as_ref().expect("added node has a parent");
        ops.push(EditOp::Mk {
            kind: node.kind,
            parent: txn_path_for(base, base_rev, target, parent),
            name: node.name.clone(),
        });
    }

    for id in moved.iter().filter(|id| !needs_rescue(id)) {
        ops.push(mv_op(id));
    }

    // Content changes on surviving nodes, plus content for new leaves.
    for (id, node) in &target.nodes {
        let wants_put = match base.nodes.get(id) {
            Some(before) => before.content != node.content,
            None => node.kind != NodeKind::Dir,
        };
        if wants_put {
            ops.push(EditOp::Put {
                loc: txn_path_for(base, base_rev, target, id),
                content: node.content.clone(),
            });
        }
    }

    ops
}

/// Address a node of `target` as a peg into `base` plus the components
/// created since: the peg names the nearest ancestor that already lived in
/// `base`, the extension walks down through created directories.
fn txn_path_for(
    base: &Snapshot,
    base_rev: Revnum,
    target: &Snapshot,
    nbid: &NodeBranchId,
) -> TxnPath {
    let mut created = Vec::new();
    let mut cur = nbid;
    while !base.nodes.contains_key(cur) {
        let node = &target.nodes[cur];
        created.push(node.name.clone());
        cur = node.parent.as_ref().expect("root exists in every revision");
    }
    created.reverse();
    TxnPath::new(
        PegPath::committed(base_rev, base.path_of(cur).expect("node in base")),
        created.join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn node(parent: &str, name: &str, kind: NodeKind) -> RevNode {
        RevNode {
            parent: Some(NodeBranchId::new(parent)),
            name: name.to_string(),
            kind,
            content: NodeContent::empty(kind),
        }
    }

    #[tokio::test]
    async fn fresh_repository_has_empty_root() {
        let repo = InMemoryRepository::new();
        assert_eq!(repo.head_rev().await, 0);
        assert_eq!(repo.uuid().len(), 36);
        let snap = repo.snapshot(0).await.unwrap();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.lookup_path(""), Some(&InMemoryRepository::root_id()));
    }

    #[tokio::test]
    async fn commit_and_resolve() {
        let repo = InMemoryRepository::new();
        let mut snap = repo.snapshot(0).await.unwrap();
        snap.nodes
            .insert(NodeBranchId::new("d1"), node("root", "trunk", NodeKind::Dir));
        snap.nodes
            .insert(NodeBranchId::new("f1"), node("d1", "a", NodeKind::File));
        let rev = repo
            .commit(CommitRequest {
                base_rev: 0,
                root: snap.root.clone(),
                nodes: snap.nodes,
                rechecks: vec![],
                rebase: RebasePolicy::Strict,
                author: "alice".to_string(),
                message: "add trunk".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rev, 1);
        assert_eq!(
            repo.resolve_peg(1, "trunk/a").await.unwrap(),
            NodeBranchId::new("f1")
        );
        assert!(repo.resolve_peg(0, "trunk/a").await.is_err());

        let info = repo.info(1).await.unwrap();
        assert_eq!(info.author, "alice");
        assert_eq!(info.message, "add trunk");
    }

    #[tokio::test]
    async fn recheck_detects_intervening_change() {
        let repo = InMemoryRepository::new();
        let base = repo.snapshot(0).await.unwrap();

        // r1: someone else renames nothing yet; we add a file.
        let mut r1 = base.clone();
        r1.nodes
            .insert(NodeBranchId::new("f1"), node("root", "a", NodeKind::File));
        repo.commit(CommitRequest {
            base_rev: 0,
            root: r1.root.clone(),
            nodes: r1.nodes.clone(),
            rechecks: vec![],
            rebase: RebasePolicy::Strict,
            author: "a".into(),
            message: "m".into(),
        })
        .await
        .unwrap();

        // r2: rename it.
        let mut r2 = repo.snapshot(1).await.unwrap();
        r2.nodes.get_mut(&NodeBranchId::new("f1")).unwrap().name = "b".to_string();
        repo.commit(CommitRequest {
            base_rev: 1,
            root: r2.root.clone(),
            nodes: r2.nodes,
            rechecks: vec![],
            rebase: RebasePolicy::Strict,
            author: "a".into(),
            message: "m".into(),
        })
        .await
        .unwrap();

        // A txn based on r1 that also renames f1 must be out of date.
        let mut stale = repo.snapshot(1).await.unwrap();
        stale.nodes.get_mut(&NodeBranchId::new("f1")).unwrap().name = "c".to_string();
        let err = repo
            .commit(CommitRequest {
                base_rev: 1,
                root: stale.root.clone(),
                nodes: stale.nodes,
                rechecks: vec![OodRecheck { nbid: NodeBranchId::new("f1"), since: 1 }],
                rebase: RebasePolicy::Strict,
                author: "a".into(),
                message: "m".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfDate);
    }

    #[tokio::test]
    async fn permissive_accepts_identical_change() {
        let repo = InMemoryRepository::new();
        let mut r1 = repo.snapshot(0).await.unwrap();
        r1.nodes
            .insert(NodeBranchId::new("f1"), node("root", "a", NodeKind::File));
        repo.commit(CommitRequest {
            base_rev: 0,
            root: r1.root.clone(),
            nodes: r1.nodes.clone(),
            rechecks: vec![],
            rebase: RebasePolicy::Strict,
            author: "a".into(),
            message: "m".into(),
        })
        .await
        .unwrap();

        // r2 renames a -> b.
        let mut r2 = repo.snapshot(1).await.unwrap();
        r2.nodes.get_mut(&NodeBranchId::new("f1")).unwrap().name = "b".to_string();
        repo.commit(CommitRequest {
            base_rev: 1,
            root: r2.root.clone(),
            nodes: r2.nodes.clone(),
            rechecks: vec![],
            rebase: RebasePolicy::Strict,
            author: "a".into(),
            message: "m".into(),
        })
        .await
        .unwrap();

        // A stale txn doing the identical rename merges to nothing under
        // the permissive policy and conflicts under the strict one.
        let recheck = vec![OodRecheck { nbid: NodeBranchId::new("f1"), since: 1 }];
        let make_req = |rebase| CommitRequest {
            base_rev: 1,
            root: r2.root.clone(),
            nodes: r2.nodes.clone(),
            rechecks: recheck.clone(),
            rebase,
            author: "a".into(),
            message: "m".into(),
        };
        let err = repo.commit(make_req(RebasePolicy::Strict)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfDate);
        let rev = repo.commit(make_req(RebasePolicy::Permissive)).await.unwrap();
        assert_eq!(rev, 3);
    }

    #[tokio::test]
    async fn merge_keeps_intervening_commits() {
        let repo = InMemoryRepository::new();

        // Two txns from base 0 touching different files.
        let base = repo.snapshot(0).await.unwrap();
        let mut ours = base.clone();
        ours.nodes
            .insert(NodeBranchId::new("f1"), node("root", "a", NodeKind::File));
        let mut theirs = base.clone();
        theirs.nodes
            .insert(NodeBranchId::new("f2"), node("root", "b", NodeKind::File));

        repo.commit(CommitRequest {
            base_rev: 0,
            root: theirs.root.clone(),
            nodes: theirs.nodes,
            rechecks: vec![],
            rebase: RebasePolicy::Strict,
            author: "a".into(),
            message: "m".into(),
        })
        .await
        .unwrap();
        let rev = repo
            .commit(CommitRequest {
                base_rev: 0,
                root: ours.root.clone(),
                nodes: ours.nodes,
                rechecks: vec![],
                rebase: RebasePolicy::Strict,
                author: "a".into(),
                message: "m".into(),
            })
            .await
            .unwrap();
        assert_eq!(rev, 2);

        // Both files survive in r2.
        let head = repo.snapshot(2).await.unwrap();
        assert!(head.lookup_path("a").is_some());
        assert!(head.lookup_path("b").is_some());
    }

    #[test]
    fn diff_expresses_adds_moves_deletes_and_puts() {
        let root = NodeBranchId::new("root");
        let mut base = Snapshot::empty(root.clone());
        base.nodes
            .insert(NodeBranchId::new("d1"), node("root", "trunk", NodeKind::Dir));
        base.nodes
            .insert(NodeBranchId::new("f1"), node("d1", "a", NodeKind::File));
        base.nodes
            .insert(NodeBranchId::new("f2"), node("d1", "old", NodeKind::File));

        let mut target = base.clone();
        // delete old, rename a -> b, add dir sub with file c, change content
        target.nodes.remove(&NodeBranchId::new("f2"));
        target.nodes.get_mut(&NodeBranchId::new("f1")).unwrap().name = "b".to_string();
        target
            .nodes
            .insert(NodeBranchId::new("d2"), node("d1", "sub", NodeKind::Dir));
        let mut file = node("d2", "c", NodeKind::File);
        file.content = NodeContent::file(BTreeMap::new(), Bytes::from_static(b"hi"));
        target.nodes.insert(NodeBranchId::new("f3"), file);

        let ops = diff_snapshots(&base, 1, &target);
        let names: Vec<&str> = ops.iter().map(|op| op.command_name()).collect();
        assert_eq!(names, vec!["rm", "mk", "mk", "mv", "put"]);
    }
}
