//! The tree-edit protocol: addressing types, node content, the operation
//! set in both addressing styles, and the wiring that carries operations
//! over a connection.
//!
//! Edit operations are ordinary commands on the dispatcher. They are
//! pipelined: no operation gets an individual success response; the first
//! failure, or the terminal `complete`/`abort` response, is the single
//! response a drive produces.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::{
    handle_commands, parse_failure_params, BoxFuture, CmdEntry, DispatchOptions,
};
use crate::conn::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::item::{Item, Revnum};
use crate::tuple::{parse_tuple, TupleArg};

/// Identity of a line of node history across copies and moves. Scoped to
/// one edit session; the sender assigns ids at creation and the receiver
/// accepts any unique token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeBranchId(String);

impl NodeBranchId {
    pub fn new(id: impl Into<String>) -> NodeBranchId {
        NodeBranchId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeBranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeBranchId {
    fn from(s: &str) -> NodeBranchId {
        NodeBranchId::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
    #[default]
    Unknown,
}

impl NodeKind {
    pub fn as_word(self) -> &'static str {
        match self {
            NodeKind::Dir => "dir",
            NodeKind::File => "file",
            NodeKind::Symlink => "symlink",
            NodeKind::Unknown => "unknown",
        }
    }

    pub fn from_word(w: &str) -> Result<NodeKind> {
        match w {
            "dir" => Ok(NodeKind::Dir),
            "file" => Ok(NodeKind::File),
            "symlink" => Ok(NodeKind::Symlink),
            "unknown" => Ok(NodeKind::Unknown),
            other => Err(Error::malformed(format!("unknown node kind {other:?}"))),
        }
    }
}

/// SHA-1 over raw file text.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Checksum([u8; 20]);

impl Checksum {
    pub fn of_text(data: &[u8]) -> Checksum {
        let digest = Sha1::digest(data);
        Checksum(digest.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Checksum> {
        let bytes = hex::decode(s).map_err(|_| Error::malformed("bad checksum hex"))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::malformed("checksum must be 20 bytes"))?;
        Ok(Checksum(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A location in a committed revision, or in the current transaction when
/// `rev` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PegPath {
    pub rev: Option<Revnum>,
    pub relpath: String,
}

impl PegPath {
    pub fn committed(rev: Revnum, relpath: impl Into<String>) -> PegPath {
        PegPath { rev: Some(rev), relpath: relpath.into() }
    }

    pub fn in_txn(relpath: impl Into<String>) -> PegPath {
        PegPath { rev: None, relpath: relpath.into() }
    }

    /// Wire form: `( ( [rev] ) relpath )`.
    pub fn to_item(&self) -> Item {
        Item::List(vec![
            Item::List(self.rev.map(Item::Number).into_iter().collect()),
            Item::str(self.relpath.clone().into_bytes()),
        ])
    }

    pub fn from_items(items: &[Item]) -> Result<PegPath> {
        let vals = parse_tuple(items, "lc")?;
        Ok(PegPath {
            rev: opt_rev(vals[0].list())?,
            relpath: vals[1].cstr().to_string(),
        })
    }
}

impl fmt::Display for PegPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rev {
            Some(rev) => write!(f, "^/{}@{}", self.relpath, rev),
            None => write!(f, "^/{}@txn", self.relpath),
        }
    }
}

/// A node in the transaction: a peg locating a pre-existing node, extended
/// by zero or more path components created within the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnPath {
    pub peg: PegPath,
    pub created: String,
}

impl TxnPath {
    pub fn new(peg: PegPath, created: impl Into<String>) -> TxnPath {
        TxnPath { peg, created: created.into() }
    }

    /// A txn path with no created extension.
    pub fn of(peg: PegPath) -> TxnPath {
        TxnPath { peg, created: String::new() }
    }

    /// Wire form: `( peg created )`.
    pub fn to_item(&self) -> Item {
        Item::List(vec![
            self.peg.to_item(),
            Item::str(self.created.clone().into_bytes()),
        ])
    }

    pub fn from_items(items: &[Item]) -> Result<TxnPath> {
        let vals = parse_tuple(items, "lc")?;
        Ok(TxnPath {
            peg: PegPath::from_items(vals[0].list())?,
            created: vals[1].cstr().to_string(),
        })
    }
}

/// Versioned content of a node, excluding its tree linkage. Content may be
/// given directly or by reference to an existing committed node, with
/// field-level overrides on top of the reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeContent {
    pub kind: NodeKind,
    /// Reference content, or `None` for an empty base.
    pub ref_loc: Option<PegPath>,
    pub props: BTreeMap<String, Bytes>,
    /// Text checksum; only for files.
    pub checksum: Option<Checksum>,
    /// File text; only for files.
    pub text: Option<Bytes>,
    /// Symlink target; only for symlinks.
    pub target: Option<Bytes>,
}

impl NodeContent {
    pub fn empty(kind: NodeKind) -> NodeContent {
        NodeContent { kind, ..NodeContent::default() }
    }

    pub fn dir(props: BTreeMap<String, Bytes>) -> NodeContent {
        NodeContent { kind: NodeKind::Dir, props, ..NodeContent::default() }
    }

    pub fn file(props: BTreeMap<String, Bytes>, text: Bytes) -> NodeContent {
        let checksum = Checksum::of_text(&text);
        NodeContent {
            kind: NodeKind::File,
            props,
            checksum: Some(checksum),
            text: Some(text),
            ..NodeContent::default()
        }
    }

    pub fn symlink(props: BTreeMap<String, Bytes>, target: Bytes) -> NodeContent {
        NodeContent {
            kind: NodeKind::Symlink,
            props,
            target: Some(target),
            ..NodeContent::default()
        }
    }

    /// Content borrowed wholesale from an existing committed node.
    pub fn reference(peg: PegPath) -> NodeContent {
        NodeContent { ref_loc: Some(peg), ..NodeContent::default() }
    }

    /// Check the kind/field coherence rules: kind-specific fields only with
    /// their kind, nothing kind-specific under `unknown`, and the checksum
    /// must identify the text when both are present.
    pub fn validate(&self) -> Result<()> {
        let err = |msg: &str| Err(Error::new(ErrorKind::Precondition, msg.to_string()));
        match self.kind {
            NodeKind::File => {
                if self.target.is_some() {
                    return err("file content carries a symlink target");
                }
            }
            NodeKind::Symlink => {
                if self.checksum.is_some() || self.text.is_some() {
                    return err("symlink content carries file text");
                }
            }
            NodeKind::Dir => {
                if self.checksum.is_some() || self.text.is_some() || self.target.is_some() {
                    return err("directory content carries leaf fields");
                }
            }
            NodeKind::Unknown => {
                if self.checksum.is_some() || self.text.is_some() || self.target.is_some() {
                    return err("unknown-kind content carries kind-specific fields");
                }
            }
        }
        if let (Some(checksum), Some(text)) = (&self.checksum, &self.text) {
            if *checksum != Checksum::of_text(text) {
                return err("checksum does not identify the text");
            }
        }
        Ok(())
    }

    /// Wire form:
    /// `( kind ref-peg ( (name value)... ) ( [checksum] ) ( [target] ) ( [text] ) )`.
    pub fn to_item(&self) -> Item {
        let empty_ref = PegPath::in_txn("");
        let props = self
            .props
            .iter()
            .map(|(name, value)| {
                Item::List(vec![
                    Item::str(name.clone().into_bytes()),
                    Item::Str(value.clone()),
                ])
            })
            .collect();
        Item::List(vec![
            Item::word(self.kind.as_word()),
            self.ref_loc.as_ref().unwrap_or(&empty_ref).to_item(),
            Item::List(props),
            Item::List(
                self.checksum
                    .iter()
                    .map(|c| Item::str(c.to_hex().into_bytes()))
                    .collect(),
            ),
            Item::List(self.target.iter().map(|t| Item::Str(t.clone())).collect()),
            Item::List(self.text.iter().map(|t| Item::Str(t.clone())).collect()),
        ])
    }

    pub fn from_items(items: &[Item]) -> Result<NodeContent> {
        let vals = parse_tuple(items, "wlllll")?;
        let kind = NodeKind::from_word(vals[0].word())?;
        let ref_peg = PegPath::from_items(vals[1].list())?;
        let ref_loc = if ref_peg.rev.is_none() && ref_peg.relpath.is_empty() {
            None
        } else {
            Some(ref_peg)
        };
        let mut props = BTreeMap::new();
        for entry in vals[2].list() {
            let pair = parse_tuple(entry.expect_list()?, "cs")?;
            props.insert(pair[0].cstr().to_string(), pair[1].bytes().clone());
        }
        let checksum = match vals[3].list() {
            [] => None,
            [item, ..] => Some(Checksum::from_hex(&item.expect_utf8()?)?),
        };
        let target = match vals[4].list() {
            [] => None,
            [item, ..] => Some(
                item.as_str()
                    .ok_or_else(|| Error::malformed("symlink target must be a string"))?
                    .clone(),
            ),
        };
        let text = match vals[5].list() {
            [] => None,
            [item, ..] => Some(
                item.as_str()
                    .ok_or_else(|| Error::malformed("file text must be a string"))?
                    .clone(),
            ),
        };
        Ok(NodeContent { kind, ref_loc, props, checksum, text, target })
    }
}

/// Decode an optional revision group `( [rev] )`.
pub fn opt_rev(items: &[Item]) -> Result<Option<Revnum>> {
    match items {
        [] => Ok(None),
        [item, ..] => item
            .as_number()
            .map(Some)
            .ok_or_else(|| Error::malformed("revision must be a number")),
    }
}

fn unsupported(op: &str) -> Error {
    Error::new(
        ErrorKind::Unsupported,
        format!("edit operation {op} not supported by this receiver"),
    )
}

/// The receiving end of an edit drive. Implementations may support either
/// addressing style or both; unimplemented operations report themselves as
/// unsupported.
#[async_trait]
pub trait EditReceiver: Send {
    // Path-addressed style.

    async fn mk(&mut self, kind: NodeKind, parent: TxnPath, name: String) -> Result<()> {
        let _ = (kind, parent, name);
        Err(unsupported("mk"))
    }

    async fn cp(&mut self, from: PegPath, parent: TxnPath, name: String) -> Result<()> {
        let _ = (from, parent, name);
        Err(unsupported("cp"))
    }

    async fn mv(&mut self, from: PegPath, new_parent: TxnPath, name: String) -> Result<()> {
        let _ = (from, new_parent, name);
        Err(unsupported("mv"))
    }

    async fn res(&mut self, from: PegPath, parent: TxnPath, name: String) -> Result<()> {
        let _ = (from, parent, name);
        Err(unsupported("res"))
    }

    async fn rm(&mut self, loc: PegPath) -> Result<()> {
        let _ = loc;
        Err(unsupported("rm"))
    }

    async fn put(&mut self, loc: TxnPath, content: NodeContent) -> Result<()> {
        let _ = (loc, content);
        Err(unsupported("put"))
    }

    // Id-addressed style.

    async fn add(
        &mut self,
        nbid: NodeBranchId,
        kind: NodeKind,
        parent: NodeBranchId,
        name: String,
        content: NodeContent,
    ) -> Result<()> {
        let _ = (nbid, kind, parent, name, content);
        Err(unsupported("add"))
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
        let _ = (nbid, src_rev, src, parent, name, content);
        Err(unsupported("copy-one"))
    }

    async fn copy_tree(
        &mut self,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: String,
    ) -> Result<()> {
        let _ = (src_rev, src, parent, name);
        Err(unsupported("copy-tree"))
    }

    async fn delete(&mut self, since_rev: Revnum, nbid: NodeBranchId) -> Result<()> {
        let _ = (since_rev, nbid);
        Err(unsupported("delete"))
    }

    async fn alter(
        &mut self,
        since_rev: Revnum,
        nbid: NodeBranchId,
        new_parent: NodeBranchId,
        name: String,
        content: NodeContent,
    ) -> Result<()> {
        let _ = (since_rev, nbid, new_parent, name, content);
        Err(unsupported("alter"))
    }

    // Terminals.

    /// Declare the edit ready; attempt the commit and return the new
    /// revision number.
    async fn complete(&mut self) -> Result<Revnum>;

    /// Discard the edit.
    async fn abort(&mut self) -> Result<()>;
}

/// One edit operation, decoupled from transport so the sending and
/// receiving sides share a single encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Mk { kind: NodeKind, parent: TxnPath, name: String },
    Cp { from: PegPath, parent: TxnPath, name: String },
    Mv { from: PegPath, new_parent: TxnPath, name: String },
    Res { from: PegPath, parent: TxnPath, name: String },
    Rm { loc: PegPath },
    Put { loc: TxnPath, content: NodeContent },
    Add {
        nbid: NodeBranchId,
        kind: NodeKind,
        parent: NodeBranchId,
        name: String,
        content: NodeContent,
    },
    CopyOne {
        nbid: NodeBranchId,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: String,
        content: NodeContent,
    },
    CopyTree {
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: String,
    },
    Delete { since_rev: Revnum, nbid: NodeBranchId },
    Alter {
        since_rev: Revnum,
        nbid: NodeBranchId,
        new_parent: NodeBranchId,
        name: String,
        content: NodeContent,
    },
}

impl EditOp {
    pub fn command_name(&self) -> &'static str {
        match self {
            EditOp::Mk { .. } => "mk",
            EditOp::Cp { .. } => "cp",
            EditOp::Mv { .. } => "mv",
            EditOp::Res { .. } => "res",
            EditOp::Rm { .. } => "rm",
            EditOp::Put { .. } => "put",
            EditOp::Add { .. } => "add",
            EditOp::CopyOne { .. } => "copy-one",
            EditOp::CopyTree { .. } => "copy-tree",
            EditOp::Delete { .. } => "delete",
            EditOp::Alter { .. } => "alter",
        }
    }

    pub fn to_params(&self) -> Vec<Item> {
        let id = |nbid: &NodeBranchId| Item::str(nbid.as_str().as_bytes().to_vec());
        let name_item = |name: &String| Item::str(name.clone().into_bytes());
        let rev_item = |rev: &Option<Revnum>| {
            Item::List(rev.map(Item::Number).into_iter().collect())
        };
        match self {
            EditOp::Mk { kind, parent, name } => vec![
                Item::word(kind.as_word()),
                parent.to_item(),
                name_item(name),
            ],
            EditOp::Cp { from, parent, name }
            | EditOp::Res { from, parent, name } => vec![
                from.to_item(),
                parent.to_item(),
                name_item(name),
            ],
            EditOp::Mv { from, new_parent, name } => vec![
                from.to_item(),
                new_parent.to_item(),
                name_item(name),
            ],
            EditOp::Rm { loc } => vec![loc.to_item()],
            EditOp::Put { loc, content } => vec![loc.to_item(), content.to_item()],
            EditOp::Add { nbid, kind, parent, name, content } => vec![
                id(nbid),
                Item::word(kind.as_word()),
                id(parent),
                name_item(name),
                content.to_item(),
            ],
            EditOp::CopyOne { nbid, src_rev, src, parent, name, content } => vec![
                id(nbid),
                rev_item(src_rev),
                id(src),
                id(parent),
                name_item(name),
                content.to_item(),
            ],
            EditOp::CopyTree { src_rev, src, parent, name } => vec![
                rev_item(src_rev),
                id(src),
                id(parent),
                name_item(name),
            ],
            EditOp::Delete { since_rev, nbid } => vec![Item::Number(*since_rev), id(nbid)],
            EditOp::Alter { since_rev, nbid, new_parent, name, content } => vec![
                Item::Number(*since_rev),
                id(nbid),
                id(new_parent),
                name_item(name),
                content.to_item(),
            ],
        }
    }

    /// Decode a command into an edit operation. An unrecognized name is an
    /// unknown command; bad parameter shapes are framing errors.
    pub fn parse(name: &str, params: &[Item]) -> Result<EditOp> {
        match name {
            "mk" => {
                let vals = parse_tuple(params, "wlc")?;
                Ok(EditOp::Mk {
                    kind: NodeKind::from_word(vals[0].word())?,
                    parent: TxnPath::from_items(vals[1].list())?,
                    name: vals[2].cstr().to_string(),
                })
            }
            "cp" | "mv" | "res" => {
                let vals = parse_tuple(params, "llc")?;
                let from = PegPath::from_items(vals[0].list())?;
                let parent = TxnPath::from_items(vals[1].list())?;
                let new_name = vals[2].cstr().to_string();
                Ok(match name {
                    "cp" => EditOp::Cp { from, parent, name: new_name },
                    "mv" => EditOp::Mv { from, new_parent: parent, name: new_name },
                    _ => EditOp::Res { from, parent, name: new_name },
                })
            }
            "rm" => {
                let vals = parse_tuple(params, "l")?;
                Ok(EditOp::Rm { loc: PegPath::from_items(vals[0].list())? })
            }
            "put" => {
                let vals = parse_tuple(params, "ll")?;
                Ok(EditOp::Put {
                    loc: TxnPath::from_items(vals[0].list())?,
                    content: NodeContent::from_items(vals[1].list())?,
                })
            }
            "add" => {
                let vals = parse_tuple(params, "cwccl")?;
                Ok(EditOp::Add {
                    nbid: NodeBranchId::new(vals[0].cstr()),
                    kind: NodeKind::from_word(vals[1].word())?,
                    parent: NodeBranchId::new(vals[2].cstr()),
                    name: vals[3].cstr().to_string(),
                    content: NodeContent::from_items(vals[4].list())?,
                })
            }
            "copy-one" => {
                let vals = parse_tuple(params, "clcccl")?;
                Ok(EditOp::CopyOne {
                    nbid: NodeBranchId::new(vals[0].cstr()),
                    src_rev: opt_rev(vals[1].list())?,
                    src: NodeBranchId::new(vals[2].cstr()),
                    parent: NodeBranchId::new(vals[3].cstr()),
                    name: vals[4].cstr().to_string(),
                    content: NodeContent::from_items(vals[5].list())?,
                })
            }
            "copy-tree" => {
                let vals = parse_tuple(params, "lccc")?;
                Ok(EditOp::CopyTree {
                    src_rev: opt_rev(vals[0].list())?,
                    src: NodeBranchId::new(vals[1].cstr()),
                    parent: NodeBranchId::new(vals[2].cstr()),
                    name: vals[3].cstr().to_string(),
                })
            }
            "delete" => {
                let vals = parse_tuple(params, "nc")?;
                Ok(EditOp::Delete {
                    since_rev: vals[0].number(),
                    nbid: NodeBranchId::new(vals[1].cstr()),
                })
            }
            "alter" => {
                let vals = parse_tuple(params, "ncccl")?;
                Ok(EditOp::Alter {
                    since_rev: vals[0].number(),
                    nbid: NodeBranchId::new(vals[1].cstr()),
                    new_parent: NodeBranchId::new(vals[2].cstr()),
                    name: vals[3].cstr().to_string(),
                    content: NodeContent::from_items(vals[4].list())?,
                })
            }
            other => Err(Error::new(
                ErrorKind::UnknownCmd,
                format!("unknown edit command {other}"),
            )),
        }
    }

    pub async fn apply<R: EditReceiver + ?Sized>(self, rx: &mut R) -> Result<()> {
        match self {
            EditOp::Mk { kind, parent, name } => rx.mk(kind, parent, name).await,
            EditOp::Cp { from, parent, name } => rx.cp(from, parent, name).await,
            EditOp::Mv { from, new_parent, name } => rx.mv(from, new_parent, name).await,
            EditOp::Res { from, parent, name } => rx.res(from, parent, name).await,
            EditOp::Rm { loc } => rx.rm(loc).await,
            EditOp::Put { loc, content } => rx.put(loc, content).await,
            EditOp::Add { nbid, kind, parent, name, content } => {
                rx.add(nbid, kind, parent, name, content).await
            }
            EditOp::CopyOne { nbid, src_rev, src, parent, name, content } => {
                rx.copy_one(nbid, src_rev, src, parent, name, content).await
            }
            EditOp::CopyTree { src_rev, src, parent, name } => {
                rx.copy_tree(src_rev, src, parent, name).await
            }
            EditOp::Delete { since_rev, nbid } => rx.delete(since_rev, nbid).await,
            EditOp::Alter { since_rev, nbid, new_parent, name, content } => {
                rx.alter(since_rev, nbid, new_parent, name, content).await
            }
        }
    }
}

/// Drives an edit over a connection. Operations are pipelined; only the
/// terminal reads a response.
pub struct EditDriver<'c, S> {
    conn: &'c mut Connection<S>,
}

impl<'c, S: AsyncRead + AsyncWrite + Unpin + Send> EditDriver<'c, S> {
    pub fn new(conn: &'c mut Connection<S>) -> EditDriver<'c, S> {
        EditDriver { conn }
    }

    pub async fn send(&mut self, op: EditOp) -> Result<()> {
        let cmd = Item::List(vec![
            Item::word(op.command_name()),
            Item::List(op.to_params()),
        ]);
        self.conn.write_item(&cmd).await
    }

    pub async fn mk(&mut self, kind: NodeKind, parent: TxnPath, name: &str) -> Result<()> {
        self.send(EditOp::Mk { kind, parent, name: name.to_string() }).await
    }

    pub async fn cp(&mut self, from: PegPath, parent: TxnPath, name: &str) -> Result<()> {
        self.send(EditOp::Cp { from, parent, name: name.to_string() }).await
    }

    pub async fn mv(&mut self, from: PegPath, new_parent: TxnPath, name: &str) -> Result<()> {
        self.send(EditOp::Mv { from, new_parent, name: name.to_string() }).await
    }

    pub async fn res(&mut self, from: PegPath, parent: TxnPath, name: &str) -> Result<()> {
        self.send(EditOp::Res { from, parent, name: name.to_string() }).await
    }

    pub async fn rm(&mut self, loc: PegPath) -> Result<()> {
        self.send(EditOp::Rm { loc }).await
    }

    pub async fn put(&mut self, loc: TxnPath, content: NodeContent) -> Result<()> {
        self.send(EditOp::Put { loc, content }).await
    }

    pub async fn add(
        &mut self,
        nbid: NodeBranchId,
        kind: NodeKind,
        parent: NodeBranchId,
        name: &str,
        content: NodeContent,
    ) -> Result<()> {
        self.send(EditOp::Add { nbid, kind, parent, name: name.to_string(), content })
            .await
    }

    pub async fn copy_one(
        &mut self,
        nbid: NodeBranchId,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: &str,
        content: NodeContent,
    ) -> Result<()> {
        self.send(EditOp::CopyOne {
            nbid,
            src_rev,
            src,
            parent,
            name: name.to_string(),
            content,
        })
        .await
    }

    pub async fn copy_tree(
        &mut self,
        src_rev: Option<Revnum>,
        src: NodeBranchId,
        parent: NodeBranchId,
        name: &str,
    ) -> Result<()> {
        self.send(EditOp::CopyTree { src_rev, src, parent, name: name.to_string() })
            .await
    }

    pub async fn delete(&mut self, since_rev: Revnum, nbid: NodeBranchId) -> Result<()> {
        self.send(EditOp::Delete { since_rev, nbid }).await
    }

    pub async fn alter(
        &mut self,
        since_rev: Revnum,
        nbid: NodeBranchId,
        new_parent: NodeBranchId,
        name: &str,
        content: NodeContent,
    ) -> Result<()> {
        self.send(EditOp::Alter {
            since_rev,
            nbid,
            new_parent,
            name: name.to_string(),
            content,
        })
        .await
    }

    /// Declare the edit complete and wait for the commit result.
    pub async fn complete(self) -> Result<Revnum> {
        self.conn.write_cmd("complete", "", &[]).await?;
        self.conn.flush().await?;
        let vals = self.conn.read_cmd_response("r").await?;
        Ok(vals[0].number())
    }

    /// Discard the edit and wait for the acknowledgement.
    pub async fn abort(self) -> Result<()> {
        self.conn.write_cmd("abort", "", &[]).await?;
        self.conn.flush().await?;
        self.conn.read_cmd_response("").await?;
        Ok(())
    }

    /// End a drive without reading a response; used when the drive's
    /// receiver is not the peer that answers (the update direction).
    pub async fn finish_drive(self) -> Result<()> {
        self.conn.write_cmd("complete", "", &[]).await?;
        self.conn.flush().await
    }
}

/// How an edit drive ended on the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Committed(Revnum),
    Aborted,
    Failed,
}

/// Dispatcher context for a served edit. Once an operation has failed and
/// the failure has been reported, the remaining pipelined commands are
/// consumed without effect so the stream stays in sync — the drive produces
/// exactly one response.
pub struct EditSession<R> {
    receiver: R,
    failed: bool,
    outcome: EditOutcome,
}

async fn run_op<R: EditReceiver>(
    sess: &mut EditSession<R>,
    name: &'static str,
    params: Vec<Item>,
) -> Result<()> {
    if sess.failed {
        return Ok(());
    }
    let op = EditOp::parse(name, &params)?;
    match op.apply(&mut sess.receiver).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind.is_fatal() => Err(err),
        Err(err) => {
            sess.failed = true;
            Err(err.into_cmd_err())
        }
    }
}

macro_rules! op_handler {
    ($fn_name:ident, $cmd:literal) => {
        fn $fn_name<'a, S, R>(
            _conn: &'a mut Connection<S>,
            sess: &'a mut EditSession<R>,
            params: Vec<Item>,
        ) -> BoxFuture<'a, Result<()>>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send,
            R: EditReceiver,
        {
            Box::pin(run_op(sess, $cmd, params))
        }
    };
}

op_handler!(mk_cmd, "mk");
op_handler!(cp_cmd, "cp");
op_handler!(mv_cmd, "mv");
op_handler!(res_cmd, "res");
op_handler!(rm_cmd, "rm");
op_handler!(put_cmd, "put");
op_handler!(add_cmd, "add");
op_handler!(copy_one_cmd, "copy-one");
op_handler!(copy_tree_cmd, "copy-tree");
op_handler!(delete_cmd, "delete");
op_handler!(alter_cmd, "alter");

fn complete_cmd<'a, S, R>(
    conn: &'a mut Connection<S>,
    sess: &'a mut EditSession<R>,
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: EditReceiver,
{
    Box::pin(async move {
        if sess.failed {
            // The failure response is already on the wire; quietly discard.
            let _ = sess.receiver.abort().await;
            return Ok(());
        }
        match sess.receiver.complete().await {
            Ok(rev) => {
                sess.outcome = EditOutcome::Committed(rev);
                conn.write_cmd_response("r", &[TupleArg::Rev(rev)]).await?;
                conn.flush().await
            }
            Err(err) if err.kind.is_fatal() => Err(err),
            Err(err) => {
                sess.failed = true;
                Err(err.into_cmd_err())
            }
        }
    })
}

fn abort_cmd<'a, S, R>(
    conn: &'a mut Connection<S>,
    sess: &'a mut EditSession<R>,
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: EditReceiver,
{
    Box::pin(async move {
        let result = sess.receiver.abort().await;
        if sess.failed {
            return Ok(());
        }
        match result {
            Ok(()) => {
                sess.outcome = EditOutcome::Aborted;
                conn.write_cmd_response("", &[]).await?;
                conn.flush().await
            }
            Err(err) if err.kind.is_fatal() => Err(err),
            Err(err) => {
                sess.failed = true;
                Err(err.into_cmd_err())
            }
        }
    })
}

/// The handler table for one served edit.
pub fn edit_command_table<S, R>() -> Vec<CmdEntry<S, EditSession<R>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: EditReceiver,
{
    vec![
        CmdEntry { name: "mk", handler: mk_cmd::<S, R>, terminal: false },
        CmdEntry { name: "cp", handler: cp_cmd::<S, R>, terminal: false },
        CmdEntry { name: "mv", handler: mv_cmd::<S, R>, terminal: false },
        CmdEntry { name: "res", handler: res_cmd::<S, R>, terminal: false },
        CmdEntry { name: "rm", handler: rm_cmd::<S, R>, terminal: false },
        CmdEntry { name: "put", handler: put_cmd::<S, R>, terminal: false },
        CmdEntry { name: "add", handler: add_cmd::<S, R>, terminal: false },
        CmdEntry { name: "copy-one", handler: copy_one_cmd::<S, R>, terminal: false },
        CmdEntry { name: "copy-tree", handler: copy_tree_cmd::<S, R>, terminal: false },
        CmdEntry { name: "delete", handler: delete_cmd::<S, R>, terminal: false },
        CmdEntry { name: "alter", handler: alter_cmd::<S, R>, terminal: false },
        CmdEntry { name: "complete", handler: complete_cmd::<S, R>, terminal: true },
        CmdEntry { name: "abort", handler: abort_cmd::<S, R>, terminal: true },
    ]
}

/// Serve one inbound edit drive against `receiver`, returning it together
/// with how the drive ended.
pub async fn serve_edit<S, R>(
    conn: &mut Connection<S>,
    receiver: R,
) -> Result<(R, EditOutcome)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: EditReceiver,
{
    let mut sess = EditSession {
        receiver,
        failed: false,
        outcome: EditOutcome::Failed,
    };
    let table = edit_command_table::<S, R>();
    handle_commands(conn, &mut sess, &table, DispatchOptions::default()).await?;
    Ok((sess.receiver, sess.outcome))
}

/// How an inbound drive ended on the receiving side.
#[derive(Debug)]
pub enum DriveOutcome {
    /// The sender completed the drive; its response is still pending.
    Complete,
    /// The sender reported a failure instead of (or during) the drive; no
    /// further response is pending.
    Refused(Error),
}

/// Receive an edit drive without answering it: the client side of an
/// update, where the driving peer sends the one response after the drive.
/// On a local apply failure the remaining drive is drained so the stream
/// stays parseable, then the first failure is returned as `Err`.
pub async fn receive_drive<S, R>(conn: &mut Connection<S>, rx: &mut R) -> Result<DriveOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    R: EditReceiver,
{
    let mut first_err: Option<Error> = None;
    loop {
        let (name, params) = conn.read_command().await?;
        match name.as_str() {
            "complete" => {
                return match first_err {
                    None => {
                        rx.complete().await?;
                        Ok(DriveOutcome::Complete)
                    }
                    Some(err) => {
                        let _ = rx.abort().await;
                        Err(err)
                    }
                };
            }
            "abort" => {
                let _ = rx.abort().await;
                return Err(first_err.unwrap_or_else(|| {
                    Error::new(ErrorKind::EditFinished, "edit drive aborted by peer")
                }));
            }
            // The sender may answer with a failure response instead of
            // driving at all; it arrives here shaped like a command.
            "failure" => {
                let _ = rx.abort().await;
                return Ok(DriveOutcome::Refused(parse_failure_params(&params)?));
            }
            "success" => {
                return Err(Error::malformed("success response in place of an edit drive"));
            }
            _ => {}
        }
        if first_err.is_some() {
            continue;
        }
        let result = match EditOp::parse(&name, &params) {
            Ok(op) => op.apply(rx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            if err.kind.is_fatal() {
                return Err(err);
            }
            first_err = Some(err);
        }
    }
}
