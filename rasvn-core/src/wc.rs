//! A minimal working copy: the receiving side of an update drive.
//!
//! The working copy holds a whole tree at a single base revision. An
//! update arrives as a path-addressed edit drive computed by the server;
//! pegs into the base revision are resolved against the pristine base
//! state and traced by identity, so moves already applied earlier in the
//! drive do not disturb later addressing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::conn::Connection;
use crate::editor::{
    receive_drive, DriveOutcome, EditDriver, EditReceiver, NodeBranchId, NodeContent,
    NodeKind, PegPath, TxnPath,
};
use crate::error::{Error, ErrorKind, Result};
use crate::item::Revnum;
use crate::repo::{diff_snapshots, RepoOracle, RevNode, Snapshot};
use crate::tuple::TupleArg;

pub struct WorkingCopy {
    base_rev: Revnum,
    /// Pristine state at `base_rev`, used for peg resolution.
    base: Snapshot,
    root: NodeBranchId,
    nodes: HashMap<NodeBranchId, RevNode>,
    fresh: u64,
}

impl WorkingCopy {
    /// Materialize a working copy from a checked-out snapshot.
    pub fn checkout(base_rev: Revnum, snapshot: Snapshot) -> WorkingCopy {
        WorkingCopy {
            base_rev,
            root: snapshot.root.clone(),
            nodes: snapshot.nodes.clone(),
            base: snapshot,
            fresh: 0,
        }
    }

    pub fn base_revision(&self) -> Revnum {
        self.base_rev
    }

    /// All paths currently present, sorted; handy for assertions.
    pub fn paths(&self) -> Vec<String> {
        let snap = Snapshot { root: self.root.clone(), nodes: self.nodes.clone() };
        let mut out: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|id| snap.path_of(id))
            .filter(|p| !p.is_empty())
            .collect();
        out.sort();
        out
    }

    pub fn node_at_path(&self, relpath: &str) -> Option<&RevNode> {
        let snap = Snapshot { root: self.root.clone(), nodes: self.nodes.clone() };
        let id = snap.lookup_path(relpath)?.clone();
        self.nodes.get(&id)
    }

    /// Fold the applied drive into a new pristine base.
    fn finish_update(&mut self, new_rev: Revnum) {
        self.base_rev = new_rev;
        self.base = Snapshot { root: self.root.clone(), nodes: self.nodes.clone() };
    }

    fn fresh_id(&mut self) -> NodeBranchId {
        self.fresh += 1;
        NodeBranchId::new(format!("wc-{}", self.fresh))
    }

    fn child_by_name(&self, parent: &NodeBranchId, name: &str) -> Option<NodeBranchId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.parent.as_ref() == Some(parent) && node.name == name)
            .map(|(id, _)| id.clone())
    }

    fn resolve_peg(&self, peg: &PegPath) -> Result<NodeBranchId> {
        match peg.rev {
            Some(rev) => {
                if rev != self.base_rev {
                    return Err(Error::new(
                        ErrorKind::Precondition,
                        format!("peg r{rev} does not match working copy base r{}", self.base_rev),
                    ));
                }
                self.base.lookup_path(&peg.relpath).cloned().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, format!("{peg} not in working copy base"))
                })
            }
            None => {
                let mut cur = self.root.clone();
                for comp in peg.relpath.split('/').filter(|c| !c.is_empty()) {
                    cur = self.child_by_name(&cur, comp).ok_or_else(|| {
                        Error::new(ErrorKind::NotFound, format!("{peg} not in working copy"))
                    })?;
                }
                Ok(cur)
            }
        }
    }

    fn resolve_txn_path(&self, loc: &TxnPath) -> Result<NodeBranchId> {
        let mut cur = self.resolve_peg(&loc.peg)?;
        if !self.nodes.contains_key(&cur) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{} no longer exists in the working copy", loc.peg),
            ));
        }
        for comp in loc.created.split('/').filter(|c| !c.is_empty()) {
            cur = self.child_by_name(&cur, comp).ok_or_else(|| {
                Error::new(
                    ErrorKind::Precondition,
                    format!("created path {:?} not found under {}", loc.created, loc.peg),
                )
            })?;
        }
        Ok(cur)
    }

    fn require_free(&self, parent: &NodeBranchId, name: &str) -> Result<()> {
        if self.child_by_name(parent, name).is_some() {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("name {name:?} already exists in the working copy"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EditReceiver for WorkingCopy {
    async fn mk(&mut self, kind: NodeKind, parent: TxnPath, name: String) -> Result<()> {
        let parent_id = self.resolve_txn_path(&parent)?;
        self.require_free(&parent_id, &name)?;
        let id = self.fresh_id();
        self.nodes.insert(
            id,
            RevNode {
                parent: Some(parent_id),
                name,
                kind,
                content: NodeContent::empty(kind),
            },
        );
        Ok(())
    }

    async fn mv(&mut self, from: PegPath, new_parent: TxnPath, name: String) -> Result<()> {
        let src = self.resolve_peg(&from)?;
        if !self.nodes.contains_key(&src) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{from} no longer exists in the working copy"),
            ));
        }
        let parent_id = self.resolve_txn_path(&new_parent)?;
        self.require_free(&parent_id, &name)?;
        let node = self.nodes.get_mut(&src).expect("checked above");
        node.parent = Some(parent_id);
        node.name = name;
        Ok(())
    }

    async fn rm(&mut self, loc: PegPath) -> Result<()> {
        let target = self.resolve_peg(&loc)?;
        if !self.nodes.contains_key(&target) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{loc} no longer exists in the working copy"),
            ));
        }
        let mut stack = vec![target];
        while let Some(cur) = stack.pop() {
            let children: Vec<NodeBranchId> = self
                .nodes
                .iter()
                .filter(|(_, node)| node.parent.as_ref() == Some(&cur))
                .map(|(id, _)| id.clone())
                .collect();
            stack.extend(children);
            self.nodes.remove(&cur);
        }
        Ok(())
    }

    async fn put(&mut self, loc: TxnPath, content: NodeContent) -> Result<()> {
        let target = self.resolve_txn_path(&loc)?;
        content.validate()?;
        let node = self.nodes.get_mut(&target).expect("resolved above");
        let mut content = content;
        if content.kind == NodeKind::Unknown {
            content.kind = node.kind;
        }
        node.content = content;
        Ok(())
    }

    async fn complete(&mut self) -> Result<Revnum> {
        Ok(self.base_rev)
    }

    async fn abort(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Client side of an update: report our base, receive the server's drive,
/// then read the one response. `target` of `None` asks for the head.
pub async fn run_update<S>(
    conn: &mut Connection<S>,
    wc: &mut WorkingCopy,
    target: Option<Revnum>,
) -> Result<Revnum>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    conn.write_cmd(
        "update",
        "[r]r",
        &[TupleArg::opt_rev(target), TupleArg::Rev(wc.base_revision())],
    )
    .await?;
    conn.flush().await?;
    match receive_drive(conn, wc).await {
        Ok(DriveOutcome::Complete) => {
            let vals = conn.read_cmd_response("r").await?;
            let new_rev = vals[0].number();
            wc.finish_update(new_rev);
            debug!(revision = new_rev, "working copy updated");
            Ok(new_rev)
        }
        // The server refused the update; its failure was the response.
        Ok(DriveOutcome::Refused(err)) => Err(err),
        Err(err) => {
            // Consume the pending response so the session stays usable.
            let _ = conn.read_cmd_response("r").await;
            Err(err)
        }
    }
}

/// Server side of an update: compute the difference between the client's
/// base and the requested target, drive it at the client, then answer.
/// The update-side drive runs inline; no cross-linked editors are needed.
pub async fn serve_update<S>(
    conn: &mut Connection<S>,
    repo: &dyn RepoOracle,
    target: Option<Revnum>,
    base: Revnum,
) -> Result<Revnum>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = match target {
        Some(rev) => rev,
        None => repo.head_rev().await,
    };
    let base_snap = repo.snapshot(base).await?;
    let target_snap = repo.snapshot(target).await?;
    let ops = diff_snapshots(&base_snap, base, &target_snap);
    debug!(base, target, ops = ops.len(), "driving update");
    let mut driver = EditDriver::new(conn);
    for op in ops {
        driver.send(op).await?;
    }
    driver.finish_drive().await?;
    conn.write_cmd_response("r", &[TupleArg::Rev(target)]).await?;
    conn.flush().await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::EditOp;
    use crate::repo::InMemoryRepository;
    use crate::txn::{TxnOptions, TxnTree};
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn apply_ops(wc: &mut WorkingCopy, ops: Vec<EditOp>) {
        for op in ops {
            op.apply(wc).await.unwrap();
        }
    }

    #[tokio::test]
    async fn diff_drive_converges_working_copy() {
        let repo = Arc::new(InMemoryRepository::new());

        // r1: build a small tree.
        let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
            .await
            .unwrap();
        let root = TxnPath::of(PegPath::committed(0, ""));
        txn.mk(NodeKind::Dir, root.clone(), "trunk".to_string()).await.unwrap();
        txn.mk(
            NodeKind::File,
            TxnPath::new(PegPath::committed(0, ""), "trunk"),
            "a".to_string(),
        )
        .await
        .unwrap();
        txn.put(
            TxnPath::new(PegPath::committed(0, ""), "trunk/a"),
            NodeContent::file(BTreeMap::new(), Bytes::from_static(b"v1")),
        )
        .await
        .unwrap();
        assert_eq!(txn.complete().await.unwrap(), 1);

        // Check out r1.
        let mut wc = WorkingCopy::checkout(1, repo.snapshot(1).await.unwrap());
        assert_eq!(wc.paths(), vec!["trunk".to_string(), "trunk/a".to_string()]);

        // r2: rename a, add a directory with a file, change content.
        let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
            .await
            .unwrap();
        txn.mv(
            PegPath::committed(1, "trunk/a"),
            TxnPath::of(PegPath::committed(1, "trunk")),
            "b".to_string(),
        )
        .await
        .unwrap();
        txn.mk(
            NodeKind::Dir,
            TxnPath::of(PegPath::committed(1, "trunk")),
            "docs".to_string(),
        )
        .await
        .unwrap();
        txn.mk(
            NodeKind::File,
            TxnPath::new(PegPath::committed(1, "trunk"), "docs"),
            "readme".to_string(),
        )
        .await
        .unwrap();
        txn.put(
            TxnPath::new(PegPath::committed(1, "trunk"), "docs/readme"),
            NodeContent::file(BTreeMap::new(), Bytes::from_static(b"hello")),
        )
        .await
        .unwrap();
        txn.put(
            TxnPath::of(PegPath::committed(1, "trunk/a")),
            NodeContent::file(BTreeMap::new(), Bytes::from_static(b"v2")),
        )
        .await
        .unwrap();
        assert_eq!(txn.complete().await.unwrap(), 2);

        // Drive the difference into the working copy.
        let base = repo.snapshot(1).await.unwrap();
        let target = repo.snapshot(2).await.unwrap();
        let ops = diff_snapshots(&base, 1, &target);
        apply_ops(&mut wc, ops).await;
        wc.finish_update(2);

        assert_eq!(
            wc.paths(),
            vec![
                "trunk".to_string(),
                "trunk/b".to_string(),
                "trunk/docs".to_string(),
                "trunk/docs/readme".to_string(),
            ]
        );
        assert_eq!(
            wc.node_at_path("trunk/b").unwrap().content.text,
            Some(Bytes::from_static(b"v2"))
        );
        assert_eq!(
            wc.node_at_path("trunk/docs/readme").unwrap().content.text,
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn rescue_move_survives_subtree_deletion() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
            .await
            .unwrap();
        let root = TxnPath::of(PegPath::committed(0, ""));
        txn.mk(NodeKind::Dir, root.clone(), "old".to_string()).await.unwrap();
        txn.mk(
            NodeKind::File,
            TxnPath::new(PegPath::committed(0, ""), "old"),
            "keep".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(txn.complete().await.unwrap(), 1);

        let mut wc = WorkingCopy::checkout(1, repo.snapshot(1).await.unwrap());

        // r2: move old/keep to the root, delete old.
        let mut txn = TxnTree::begin(repo.clone(), TxnOptions::default())
            .await
            .unwrap();
        txn.mv(
            PegPath::committed(1, "old/keep"),
            TxnPath::of(PegPath::committed(1, "")),
            "keep".to_string(),
        )
        .await
        .unwrap();
        txn.rm(PegPath::committed(1, "old")).await.unwrap();
        assert_eq!(txn.complete().await.unwrap(), 2);

        let base = repo.snapshot(1).await.unwrap();
        let target = repo.snapshot(2).await.unwrap();
        let ops = diff_snapshots(&base, 1, &target);
        // The rescue move must come before the deletion.
        assert_eq!(ops[0].command_name(), "mv");
        apply_ops(&mut wc, ops).await;

        assert_eq!(wc.paths(), vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn stale_peg_is_rejected() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut wc = WorkingCopy::checkout(0, repo.snapshot(0).await.unwrap());
        let err = wc
            .rm(PegPath::committed(7, "anything"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
    }
}
