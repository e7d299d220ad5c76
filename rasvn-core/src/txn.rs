//! The transactional tree: an in-memory mutation of one base revision,
//! driven by edit operations and finished by `complete` or `abort`.
//!
//! Path-addressed operations are ordered and keep the tree valid at every
//! step; id-addressed operations are unordered and only the final state is
//! validated. Out-of-date checks run twice: against the transaction base
//! when an operation is applied, and again against the then-current head
//! inside the repository's commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::editor::{
    EditReceiver, NodeBranchId, NodeContent, NodeKind, PegPath, TxnPath,
};
use crate::error::{Error, ErrorKind, Result};
use crate::item::Revnum;
use crate::repo::{
    CommitRequest, OodRecheck, RebasePolicy, RepoOracle, RevNode, Snapshot,
};

/// Whether `delete` removes surviving children itself, or treats them as a
/// sender mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    #[default]
    Recursive,
    RequireExplicit,
}

#[derive(Debug, Clone, Copy)]
pub struct TxnOptions {
    pub rebase: RebasePolicy,
    pub delete: DeletePolicy,
    /// Whether copy sources may name the current transaction.
    pub copy_from_txn: bool,
}

impl Default for TxnOptions {
    fn default() -> TxnOptions {
        TxnOptions {
            rebase: RebasePolicy::default(),
            delete: DeletePolicy::default(),
            copy_from_txn: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOrigin {
    /// Carried over from the base revision.
    Base,
    /// Made by `mk` or `add`; unrelated to any other node.
    Created,
    /// Root of a `cp`, `copy-one` or `copy-tree`.
    CopyRoot,
    /// Copied along with a subtree; not separately addressable when the
    /// copy was a tree copy.
    CopyChild,
    Resurrected,
}

#[derive(Debug, Clone)]
struct TxnNode {
    parent: Option<NodeBranchId>,
    name: String,
    kind: NodeKind,
    content: NodeContent,
    origin: NodeOrigin,
}

impl TxnNode {
    fn from_rev(node: RevNode) -> TxnNode {
        TxnNode {
            parent: node.parent,
            name: node.name,
            kind: node.kind,
            content: node.content,
            origin: NodeOrigin::Base,
        }
    }

    fn to_rev(&self) -> RevNode {
        RevNode {
            parent: self.parent.clone(),
            name: self.name.clone(),
            kind: self.kind,
            content: self.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Completed(Revnum),
    Aborted,
}

/// A tree copy whose source lives in this transaction; expanded from the
/// final state at `complete`.
struct PendingTreeCopy {
    src: NodeBranchId,
    root: NodeBranchId,
}

/// A single-node copy whose source lives in this transaction; its
/// existence (and the target's kind) is settled at `complete`.
struct PendingSource {
    src: NodeBranchId,
    kind_fixup: Option<NodeBranchId>,
}

pub struct TxnTree {
    repo: Arc<dyn RepoOracle>,
    opts: TxnOptions,
    author: String,
    message: String,
    base_rev: Revnum,
    root: NodeBranchId,
    nodes: HashMap<NodeBranchId, TxnNode>,
    /// Node-branches removed within this transaction.
    deleted: HashSet<NodeBranchId>,
    put_done: HashSet<NodeBranchId>,
    rechecks: Vec<OodRecheck>,
    pending_tree_copies: Vec<PendingTreeCopy>,
    pending_sources: Vec<PendingSource>,
    fresh: u64,
    state: TxnState,
}

impl TxnTree {
    /// Open a transaction on the repository head.
    pub async fn begin(repo: Arc<dyn RepoOracle>, opts: TxnOptions) -> Result<TxnTree> {
        let base_rev = repo.head_rev().await;
        let snapshot = repo.snapshot(base_rev).await?;
        let nodes = snapshot
            .nodes
            .into_iter()
            .map(|(id, node)| (id, TxnNode::from_rev(node)))
            .collect();
        Ok(TxnTree {
            repo,
            opts,
            author: "anonymous".to_string(),
            message: String::new(),
            base_rev,
            root: snapshot.root,
            nodes,
            deleted: HashSet::new(),
            put_done: HashSet::new(),
            rechecks: Vec::new(),
            pending_tree_copies: Vec::new(),
            pending_sources: Vec::new(),
            fresh: 0,
            state: TxnState::Open,
        })
    }

    pub fn set_commit_info(&mut self, author: &str, message: &str) {
        self.author = author.to_string();
        self.message = message.to_string();
    }

    pub fn base_rev(&self) -> Revnum {
        self.base_rev
    }

    /// The node-branch currently living at a slash-separated path in the
    /// transaction, if any.
    pub fn lookup(&self, relpath: &str) -> Option<NodeBranchId> {
        let mut cur = self.root.clone();
        for comp in relpath.split('/').filter(|c| !c.is_empty()) {
            cur = self.child_by_name(&cur, comp)?;
        }
        Some(cur)
    }

    // --- resolution ---

    fn check_open(&self) -> Result<()> {
        match self.state {
            TxnState::Open => Ok(()),
            _ => Err(Error::new(
                ErrorKind::EditFinished,
                "edit already completed or aborted",
            )),
        }
    }

    fn fresh_id(&mut self) -> NodeBranchId {
        // Skip over anything a sender happened to claim for itself.
        loop {
            self.fresh += 1;
            let id = NodeBranchId::new(format!("~{}", self.fresh));
            if !self.nodes.contains_key(&id) && !self.deleted.contains(&id) {
                return id;
            }
        }
    }

    fn child_by_name(&self, parent: &NodeBranchId, name: &str) -> Option<NodeBranchId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.parent.as_ref() == Some(parent) && node.name == name)
            .map(|(id, _)| id.clone())
    }

    fn children_of(&self, parent: &NodeBranchId) -> Vec<NodeBranchId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.parent.as_ref() == Some(parent))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn subtree_ids(&self, top: &NodeBranchId) -> Vec<NodeBranchId> {
        let mut out = Vec::new();
        let mut stack = vec![top.clone()];
        while let Some(cur) = stack.pop() {
            stack.extend(self.children_of(&cur));
            out.push(cur);
        }
        out
    }

    fn lookup_txn_path(&self, relpath: &str) -> Result<NodeBranchId> {
        self.lookup(relpath).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("path not found in transaction: {relpath}"),
            )
        })
    }

    /// Resolve a peg: a committed location is traced forward by identity,
    /// a bare location is walked in the current transaction.
    async fn resolve_peg(&self, peg: &PegPath) -> Result<NodeBranchId> {
        match peg.rev {
            Some(rev) => self.repo.resolve_peg(rev, &peg.relpath).await,
            None => self.lookup_txn_path(&peg.relpath),
        }
    }

    /// Resolve a txn path to a live node: the peg traced into the txn,
    /// extended along components created within the txn.
    async fn resolve_txn_path(&self, loc: &TxnPath) -> Result<NodeBranchId> {
        let pegged = self.resolve_peg(&loc.peg).await?;
        if !self.nodes.contains_key(&pegged) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{} is not in the transaction", loc.peg),
            ));
        }
        let mut cur = pegged;
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

    fn require_dir(&self, id: &NodeBranchId) -> Result<()> {
        match self.nodes.get(id) {
            Some(node) if node.kind == NodeKind::Dir => Ok(()),
            Some(_) => Err(Error::new(
                ErrorKind::Precondition,
                "target parent is not a directory",
            )),
            None => Err(Error::new(
                ErrorKind::Precondition,
                "target parent does not exist in the transaction",
            )),
        }
    }

    fn require_name_free(&self, parent: &NodeBranchId, name: &str) -> Result<()> {
        if self.child_by_name(parent, name).is_some() {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("name {name:?} already exists in the target directory"),
            ));
        }
        Ok(())
    }

    // --- out-of-date checking ---

    /// Check `nbid` for intervening changes in `(since, base]`. Under the
    /// permissive policy a change identical to `intended` (or a matching
    /// deletion, when `intended` is `None`) is a null merge, reported as
    /// `Ok(true)`.
    async fn ood_guard(
        &self,
        nbid: &NodeBranchId,
        since: Revnum,
        intended: Option<&RevNode>,
    ) -> Result<bool> {
        if since >= self.base_rev {
            return Ok(false);
        }
        let history = self.repo.history_since(nbid, since, self.base_rev).await?;
        if !history.conflicts() {
            return Ok(false);
        }
        if self.opts.rebase == RebasePolicy::Permissive {
            let at_base = self.repo.node_at(self.base_rev, nbid).await?;
            match (&at_base, intended) {
                (None, None) => return Ok(true),
                (Some(theirs), Some(ours)) if theirs == ours => return Ok(true),
                _ => {}
            }
        }
        Err(Error::new(
            ErrorKind::OutOfDate,
            format!("node {nbid} changed since r{since}"),
        ))
    }

    // --- copies ---

    /// Copy the subtree rooted at `src` in `source` under `parent`/`name`,
    /// assigning fresh identities throughout.
    fn copy_subtree(
        &mut self,
        source: &Snapshot,
        src: &NodeBranchId,
        parent: NodeBranchId,
        name: String,
    ) -> Result<NodeBranchId> {
        let new_root = self.fresh_id();
        let mut stack = vec![(src.clone(), new_root.clone(), parent, name, true)];
        while let Some((src_id, new_id, parent, name, is_root)) = stack.pop() {
            let node = source.nodes.get(&src_id).ok_or_else(|| {
                Error::new(ErrorKind::NotFound, format!("copy source {src_id} not found"))
            })?;
            self.nodes.insert(
                new_id.clone(),
                TxnNode {
                    parent: Some(parent),
                    name,
                    kind: node.kind,
                    content: node.content.clone(),
                    origin: if is_root {
                        NodeOrigin::CopyRoot
                    } else {
                        NodeOrigin::CopyChild
                    },
                },
            );
            for (child_id, child) in source.children(&src_id) {
                let fresh = self.fresh_id();
                stack.push((
                    child_id.clone(),
                    fresh,
                    new_id.clone(),
                    child.name.clone(),
                    false,
                ));
            }
        }
        Ok(new_root)
    }

    /// The transaction's current tree as a snapshot, used as a copy source.
    fn as_snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.root.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.to_rev()))
                .collect(),
        }
    }

    fn require_copy_from_txn(&self) -> Result<()> {
        if self.opts.copy_from_txn {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Unsupported,
                "copying from the current transaction is disabled",
            ))
        }
    }

    // --- content ---

    /// Materialize reference content: fetch the referenced node's content
    /// and lay the explicit overrides on top.
    async fn resolve_content(&self, content: NodeContent) -> Result<NodeContent> {
        let Some(peg) = content.ref_loc.clone() else {
            return Ok(content);
        };
        let mut merged = match peg.rev {
            Some(rev) => self.repo.fetch_content(rev, &peg.relpath).await?,
            None => {
                let id = self.lookup_txn_path(&peg.relpath)?;
                self.nodes[&id].content.clone()
            }
        };
        merged.ref_loc = None;
        if content.kind != NodeKind::Unknown {
            merged.kind = content.kind;
        }
        if !content.props.is_empty() {
            merged.props = content.props;
        }
        if content.checksum.is_some() {
            merged.checksum = content.checksum;
        }
        if content.text.is_some() {
            merged.text = content.text;
        }
        if content.target.is_some() {
            merged.target = content.target;
        }
        merged.validate()?;
        Ok(merged)
    }

    fn require_id_free(&self, nbid: &NodeBranchId) -> Result<()> {
        if self.nodes.contains_key(nbid) || self.deleted.contains(nbid) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("node-branch id {nbid} already in use in this edit"),
            ));
        }
        Ok(())
    }

    // --- completion ---

    async fn try_complete(&mut self) -> Result<Revnum> {
        // Tree copies from this transaction take the final state of their
        // source, regardless of operation order.
        let pending = std::mem::take(&mut self.pending_tree_copies);
        for copy in pending {
            let source = self.as_snapshot();
            let src_node = source.nodes.get(&copy.src).ok_or_else(|| {
                Error::new(
                    ErrorKind::Precondition,
                    format!("tree copy source {} does not exist in the final state", copy.src),
                )
            })?;
            let placeholder = self
                .nodes
                .get_mut(&copy.root)
                .expect("placeholder inserted at copy time");
            placeholder.kind = src_node.kind;
            placeholder.content = src_node.content.clone();
            for child in source
                .children(&copy.src)
                .map(|(id, node)| (id.clone(), node.name.clone()))
                .collect::<Vec<_>>()
            {
                self.copy_subtree(&source, &child.0, copy.root.clone(), child.1)?;
            }
        }
        for pending in std::mem::take(&mut self.pending_sources) {
            let src = self.nodes.get(&pending.src).ok_or_else(|| {
                Error::new(
                    ErrorKind::Precondition,
                    format!("copy source {} does not exist in the final state", pending.src),
                )
            })?;
            let kind = src.kind;
            if let Some(target) = pending.kind_fixup {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.kind = kind;
                }
            }
        }

        self.resolve_deletions()?;
        self.validate_final()?;

        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.to_rev()))
            .collect();
        self.repo
            .commit(CommitRequest {
                base_rev: self.base_rev,
                root: self.root.clone(),
                nodes,
                rechecks: std::mem::take(&mut self.rechecks),
                rebase: self.opts.rebase,
                author: self.author.clone(),
                message: self.message.clone(),
            })
            .await
    }

    /// Settle children left behind by id-addressed deletes: removed under
    /// the recursive policy, a violation under the explicit one.
    fn resolve_deletions(&mut self) -> Result<()> {
        loop {
            let orphans: Vec<NodeBranchId> = self
                .nodes
                .iter()
                .filter(|(_, node)| {
                    node.parent
                        .as_ref()
                        .is_some_and(|p| self.deleted.contains(p))
                })
                .map(|(id, _)| id.clone())
                .collect();
            if orphans.is_empty() {
                return Ok(());
            }
            if self.opts.delete == DeletePolicy::RequireExplicit {
                return Err(Error::new(
                    ErrorKind::Precondition,
                    "delete left children behind and the recursive policy is disabled",
                ));
            }
            for id in orphans {
                debug!(node = %id, "removing child of deleted node");
                self.nodes.remove(&id);
                self.deleted.insert(id);
            }
        }
    }

    /// The final state must form a connected hierarchy: every parent
    /// exists and is a directory, sibling names are unique, and parent
    /// links contain no cycle.
    fn validate_final(&self) -> Result<()> {
        let mut names: HashSet<(&NodeBranchId, &str)> = HashSet::new();
        for (id, node) in &self.nodes {
            match &node.parent {
                None => {
                    if *id != self.root {
                        return Err(Error::new(
                            ErrorKind::Precondition,
                            format!("node {id} has no parent"),
                        ));
                    }
                }
                Some(parent) => {
                    let parent_node = self.nodes.get(parent).ok_or_else(|| {
                        Error::new(
                            ErrorKind::Precondition,
                            format!("parent {parent} of {id} does not exist in the final state"),
                        )
                    })?;
                    if parent_node.kind != NodeKind::Dir {
                        return Err(Error::new(
                            ErrorKind::Precondition,
                            format!("parent {parent} of {id} is not a directory"),
                        ));
                    }
                    if !names.insert((parent, node.name.as_str())) {
                        return Err(Error::new(
                            ErrorKind::Precondition,
                            format!("name {:?} is not unique under {parent}", node.name),
                        ));
                    }
                }
            }
        }

        // Every node must reach the root through parent links.
        let mut reachable: HashSet<&NodeBranchId> = HashSet::new();
        reachable.insert(&self.root);
        for id in self.nodes.keys() {
            let mut trail = Vec::new();
            let mut cur = id;
            while !reachable.contains(cur) {
                trail.push(cur);
                match &self.nodes[cur].parent {
                    Some(parent) => {
                        if trail.contains(&parent) {
                            return Err(Error::new(
                                ErrorKind::Precondition,
                                format!("parent links of {id} form a cycle"),
                            ));
                        }
                        cur = parent;
                    }
                    None => break,
                }
            }
            reachable.extend(trail);
        }
        Ok(())
    }
}

#[async_trait]
impl EditReceiver for TxnTree {
    // --- path-addressed style ---

    async fn mk(&mut self, kind: NodeKind, parent: TxnPath, name: String) -> Result<()> {
        self.check_open()?;
        let parent_id = self.resolve_txn_path(&parent).await?;
        self.require_dir(&parent_id)?;
        self.require_name_free(&parent_id, &name)?;
        let id = self.fresh_id();
        debug!(node = %id, name = %name, "mk");
        self.nodes.insert(
            id,
            TxnNode {
                parent: Some(parent_id),
                name,
                kind,
                content: NodeContent::empty(kind),
                origin: NodeOrigin::Created,
            },
        );
        Ok(())
    }

    async fn cp(&mut self, from: PegPath, parent: TxnPath, name: String) -> Result<()> {
        self.check_open()?;
        let parent_id = self.resolve_txn_path(&parent).await?;
        self.require_dir(&parent_id)?;
        self.require_name_free(&parent_id, &name)?;
        let source = match from.rev {
            Some(rev) => {
                // Source must exist in the committed revision.
                self.repo.resolve_peg(rev, &from.relpath).await?;
                self.repo.snapshot(rev).await?
            }
            None => {
                self.require_copy_from_txn()?;
                self.lookup_txn_path(&from.relpath)?;
                self.as_snapshot()
            }
        };
        let src_id = source
            .lookup_path(&from.relpath)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("copy source {from} not found")))?;
        debug!(source = %from, name = %name, "cp");
        self.copy_subtree(&source, &src_id, parent_id, name)?;
        Ok(())
    }

    async fn mv(&mut self, from: PegPath, new_parent: TxnPath, name: String) -> Result<()> {
        self.check_open()?;
        let since = from.rev.ok_or_else(|| {
            Error::new(
                ErrorKind::Precondition,
                "move source must be addressed through a committed revision",
            )
        })?;
        let src = self.repo.resolve_peg(since, &from.relpath).await?;
        if !self.nodes.contains_key(&src) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("move source {from} is not in the transaction"),
            ));
        }
        let parent_id = self.resolve_txn_path(&new_parent).await?;
        self.require_dir(&parent_id)?;
        self.require_name_free(&parent_id, &name)?;

        // A node cannot become its own ancestor.
        let mut cur = Some(parent_id.clone());
        while let Some(id) = cur {
            if id == src {
                return Err(Error::new(
                    ErrorKind::Precondition,
                    "cannot move a node into its own subtree",
                ));
            }
            cur = self.nodes.get(&id).and_then(|n| n.parent.clone());
        }

        let node = &self.nodes[&src];
        let intended = RevNode {
            parent: Some(parent_id.clone()),
            name: name.clone(),
            kind: node.kind,
            content: node.content.clone(),
        };
        if self.ood_guard(&src, since, Some(&intended)).await? {
            return Ok(());
        }
        debug!(source = %from, name = %name, "mv");
        let node = self.nodes.get_mut(&src).expect("checked above");
        node.parent = Some(parent_id);
        node.name = name;
        self.rechecks.push(OodRecheck { nbid: src, since });
        Ok(())
    }

    async fn res(&mut self, from: PegPath, parent: TxnPath, name: String) -> Result<()> {
        self.check_open()?;
        let rev = from.rev.ok_or_else(|| {
            Error::new(
                ErrorKind::Precondition,
                "resurrection source must be a committed location",
            )
        })?;
        let src = self.repo.resolve_peg(rev, &from.relpath).await?;
        if self.nodes.contains_key(&src) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("node-branch {from} still exists in the transaction"),
            ));
        }
        let parent_id = self.resolve_txn_path(&parent).await?;
        self.require_dir(&parent_id)?;
        self.require_name_free(&parent_id, &name)?;
        let old = self
            .repo
            .node_at(rev, &src)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{from} not found")))?;
        debug!(source = %from, name = %name, "res");
        self.deleted.remove(&src);
        self.nodes.insert(
            src,
            TxnNode {
                parent: Some(parent_id),
                name,
                kind: old.kind,
                content: old.content,
                origin: NodeOrigin::Resurrected,
            },
        );
        Ok(())
    }

    async fn rm(&mut self, loc: PegPath) -> Result<()> {
        self.check_open()?;
        let target = self.resolve_peg(&loc).await?;
        if !self.nodes.contains_key(&target) {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{loc} is not in the transaction"),
            ));
        }
        let since = loc.rev.unwrap_or(self.base_rev);
        let victims = self.subtree_ids(&target);
        for id in &victims {
            if self.nodes[id].origin == NodeOrigin::Base {
                self.ood_guard(id, since, None).await?;
            }
        }
        debug!(target = %loc, count = victims.len(), "rm");
        for id in victims {
            match self.nodes.remove(&id) {
                Some(node) if matches!(node.origin, NodeOrigin::Created | NodeOrigin::CopyRoot) => {
                    // Removing what this edit created is legal but usually a
                    // sender inefficiency.
                    debug!(node = %id, "removed a node created within this edit");
                }
                _ => {}
            }
            if self.deleted.insert(id.clone()) {
                self.rechecks.push(OodRecheck { nbid: id, since });
            }
        }
        Ok(())
    }

    async fn put(&mut self, loc: TxnPath, content: NodeContent) -> Result<()> {
        self.check_open()?;
        let target = self.resolve_txn_path(&loc).await?;
        if self.put_done.contains(&target) {
            return Err(Error::new(
                ErrorKind::Precondition,
                "content already set for this node-branch in this edit",
            ));
        }
        let node_kind = self.nodes[&target].kind;
        if content.kind != NodeKind::Unknown && content.kind != node_kind {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!(
                    "content kind {} does not match node kind {}",
                    content.kind.as_word(),
                    node_kind.as_word()
                ),
            ));
        }
        content.validate()?;
        let mut resolved = self.resolve_content(content).await?;
        resolved.kind = node_kind;

        if self.nodes[&target].origin == NodeOrigin::Base {
            let since = loc.peg.rev.unwrap_or(self.base_rev);
            let node = &self.nodes[&target];
            let intended = RevNode {
                parent: node.parent.clone(),
                name: node.name.clone(),
                kind: node.kind,
                content: resolved.clone(),
            };
            if self.ood_guard(&target, since, Some(&intended)).await? {
                self.put_done.insert(target);
                return Ok(());
            }
            self.rechecks.push(OodRecheck { nbid: target.clone(), since });
        }
        debug!(node = %target, "put");
        self.nodes.get_mut(&target).expect("resolved above").content = resolved;
        self.put_done.insert(target);
        Ok(())
    }

    // --- id-addressed style ---

    async fn add(
        &mut self,
        nbid: NodeBranchId,
        kind: NodeKind,
        parent: NodeBranchId,
        name: String,
        content: NodeContent,
    ) -> Result<()> {
        self.check_open()?;
        self.require_id_free(&nbid)?;
        if self.repo.node_at(self.base_rev, &nbid).await?.is_some() {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("node-branch id {nbid} already exists in the repository"),
            ));
        }
        content.validate()?;
        let mut resolved = self.resolve_content(content).await?;
        resolved.kind = kind;
        debug!(node = %nbid, name = %name, "add");
        // Structure is settled at complete; the parent may arrive later.
        self.nodes.insert(
            nbid,
            TxnNode {
                parent: Some(parent),
                name,
                kind,
                content: resolved,
                origin: NodeOrigin::Created,
            },
        );
        Ok(())
    }

    async fn copy_one(
        &mut self,
        nbid: NodeBranchId,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: String,
        content: NodeContent,
    ) -> Result<()> {
        self.check_open()?;
        self.require_id_free(&nbid)?;
        content.validate()?;
        let mut resolved = self.resolve_content(content).await?;
        let mut kind = resolved.kind;
        match src_rev {
            Some(rev) => {
                let src_node = self.repo.node_at(rev, &src).await?.ok_or_else(|| {
                    Error::new(
                        ErrorKind::NotFound,
                        format!("copy source {src} not found at r{rev}"),
                    )
                })?;
                if kind == NodeKind::Unknown {
                    kind = src_node.kind;
                }
            }
            None => {
                self.require_copy_from_txn()?;
                self.pending_sources.push(PendingSource {
                    src: src.clone(),
                    kind_fixup: (kind == NodeKind::Unknown).then(|| nbid.clone()),
                });
            }
        }
        resolved.kind = kind;
        debug!(node = %nbid, source = %src, "copy-one");
        self.nodes.insert(
            nbid,
            TxnNode {
                parent: Some(parent),
                name,
                kind,
                content: resolved,
                origin: NodeOrigin::CopyRoot,
            },
        );
        Ok(())
    }

    async fn copy_tree(
        &mut self,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: String,
    ) -> Result<()> {
        self.check_open()?;
        match src_rev {
            Some(rev) => {
                let source = self.repo.snapshot(rev).await?;
                if !source.nodes.contains_key(&src) {
                    return Err(Error::new(
                        ErrorKind::NotFound,
                        format!("copy source {src} not found at r{rev}"),
                    ));
                }
                debug!(source = %src, rev, "copy-tree");
                self.copy_subtree(&source, &src, parent, name)?;
            }
            None => {
                self.require_copy_from_txn()?;
                // The copied subtree is the final state of the source; put
                // down a placeholder and expand when the edit completes.
                let root = self.fresh_id();
                debug!(source = %src, "copy-tree (deferred)");
                self.nodes.insert(
                    root.clone(),
                    TxnNode {
                        parent: Some(parent),
                        name,
                        kind: NodeKind::Unknown,
                        content: NodeContent::empty(NodeKind::Unknown),
                        origin: NodeOrigin::CopyRoot,
                    },
                );
                self.pending_tree_copies.push(PendingTreeCopy { src, root });
            }
        }
        Ok(())
    }

    async fn delete(&mut self, since_rev: Revnum, nbid: NodeBranchId) -> Result<()> {
        self.check_open()?;
        if self.ood_guard(&nbid, since_rev, None).await? {
            return Ok(());
        }
        if self.nodes.remove(&nbid).is_none() {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("node-branch {nbid} is not in the transaction"),
            ));
        }
        debug!(node = %nbid, "delete");
        self.deleted.insert(nbid.clone());
        self.rechecks.push(OodRecheck { nbid, since: since_rev });
        Ok(())
    }

    async fn alter(
        &mut self,
        since_rev: Revnum,
        nbid: NodeBranchId,
        new_parent: NodeBranchId,
        name: String,
        content: NodeContent,
    ) -> Result<()> {
        self.check_open()?;
        content.validate()?;
        let resolved = self.resolve_content(content).await?;

        if let Some(node) = self.nodes.get(&nbid) {
            let kind = node.kind;
            let mut new_content = resolved;
            if new_content.kind == NodeKind::Unknown {
                new_content.kind = kind;
            }
            let intended = RevNode {
                parent: Some(new_parent.clone()),
                name: name.clone(),
                kind,
                content: new_content.clone(),
            };
            if self.ood_guard(&nbid, since_rev, Some(&intended)).await? {
                return Ok(());
            }
            // A no-op must be accepted (though the sender should not send it).
            if node.to_rev() == intended {
                return Ok(());
            }
            debug!(node = %nbid, name = %name, "alter");
            let node = self.nodes.get_mut(&nbid).expect("checked above");
            node.parent = Some(new_parent);
            node.name = name;
            node.content = new_content;
            self.rechecks.push(OodRecheck { nbid, since: since_rev });
        } else {
            // Resurrection: the node-branch must have existed at since_rev.
            let old = self.repo.node_at(since_rev, &nbid).await?.ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("node-branch {nbid} does not exist at r{since_rev}"),
                )
            })?;
            let mut new_content = resolved;
            if new_content.kind == NodeKind::Unknown {
                new_content.kind = old.kind;
            }
            debug!(node = %nbid, name = %name, "alter (resurrect)");
            self.deleted.remove(&nbid);
            self.nodes.insert(
                nbid,
                TxnNode {
                    parent: Some(new_parent),
                    name,
                    kind: old.kind,
                    content: new_content,
                    origin: NodeOrigin::Resurrected,
                },
            );
        }
        Ok(())
    }

    // --- terminals ---

    async fn complete(&mut self) -> Result<Revnum> {
        self.check_open()?;
        match self.try_complete().await {
            Ok(rev) => {
                self.state = TxnState::Completed(rev);
                Ok(rev)
            }
            Err(err) => {
                self.state = TxnState::Aborted;
                Err(err)
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        match self.state {
            TxnState::Completed(_) => Err(Error::new(
                ErrorKind::EditFinished,
                "edit already completed",
            )),
            _ => {
                self.state = TxnState::Aborted;
                Ok(())
            }
        }
    }
}
