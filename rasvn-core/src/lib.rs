//! rasvn core library
//!
//! Core functionality for rasvn:
//! - Self-describing wire items and buffered incremental framing
//! - Format-driven tuple encoding
//! - Command dispatch with failure-chain responses
//! - The tree-edit protocol in both addressing styles
//! - A transactional tree with rebase / out-of-date checking
//! - The repository oracle and an in-memory implementation
//! - A working copy and the update drive

pub mod command;
pub mod conn;
pub mod editor;
pub mod error;
pub mod item;
pub mod repo;
pub mod tuple;
pub mod txn;
pub mod wc;

pub use command::{
    handle_commands, parse_failure_params, BoxFuture, CmdEntry, CmdHandler, DispatchOptions,
};
pub use conn::{CancelFn, Connection};
pub use editor::{
    opt_rev, receive_drive, serve_edit, Checksum, DriveOutcome, EditDriver, EditOp,
    EditOutcome, EditReceiver, EditSession, NodeBranchId, NodeContent, NodeKind, PegPath,
    TxnPath,
};
pub use error::{Error, ErrorKind, Result};
pub use item::{Item, Revnum};
pub use repo::{
    diff_snapshots, CommitRequest, InMemoryRepository, NodeHistory, OodRecheck,
    RebasePolicy, RepoOracle, RevNode, RevisionInfo, Snapshot,
};
pub use tuple::{parse_tuple, TupleArg, TupleValue};
pub use txn::{DeletePolicy, TxnOptions, TxnTree};
pub use wc::{run_update, serve_update, WorkingCopy};
