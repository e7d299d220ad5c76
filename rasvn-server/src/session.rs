//! One protocol session per connection: the top-level command table and
//! the glue between the dispatcher, the edit machinery and the repository.

use std::sync::Arc;

use rasvn_core::{
    handle_commands, opt_rev, parse_tuple, serve_edit, serve_update, BoxFuture, CmdEntry,
    Connection, DispatchOptions, EditOutcome, Error, ErrorKind, InMemoryRepository, Item,
    RepoOracle, Result, Revnum, TupleArg, TxnOptions, TxnTree,
};
use rasvn_core::{DeletePolicy, RebasePolicy};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

pub struct SessionCtx {
    pub repo: Arc<InMemoryRepository>,
    pub opts: TxnOptions,
}

async fn resolve_rev(ctx: &SessionCtx, rev: Option<Revnum>) -> Revnum {
    match rev {
        Some(rev) => rev,
        None => ctx.repo.head_rev().await,
    }
}

fn ping_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    _ctx: &'a mut SessionCtx,
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move { conn.write_cmd_response("", &[]).await })
}

fn get_latest_rev_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let head = ctx.repo.head_rev().await;
        conn.write_cmd_response("r", &[TupleArg::Rev(head)]).await
    })
}

fn check_path_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let vals = parse_tuple(&params, "cl")?;
        let path = vals[0].cstr().to_string();
        let rev = resolve_rev(ctx, opt_rev(vals[1].list())?).await;
        let snapshot = ctx.repo.snapshot(rev).await?;
        let kind = snapshot
            .lookup_path(&path)
            .map(|id| snapshot.nodes[id].kind.as_word())
            .unwrap_or("none");
        conn.write_cmd_response("w", &[TupleArg::Word(kind)]).await
    })
}

fn stat_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let vals = parse_tuple(&params, "cl")?;
        let path = vals[0].cstr().to_string();
        let rev = resolve_rev(ctx, opt_rev(vals[1].list())?).await;
        let snapshot = ctx.repo.snapshot(rev).await?;
        match snapshot.lookup_path(&path) {
            Some(id) => {
                let kind = snapshot.nodes[id].kind.as_word();
                conn.write_cmd_response(
                    "(wr)",
                    &[TupleArg::Word(kind), TupleArg::Rev(rev)],
                )
                .await
            }
            None => conn.write_cmd_response("()", &[]).await,
        }
    })
}

fn capabilities_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    _params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let mut caps = vec!["edit-path", "edit-id"];
        if ctx.opts.copy_from_txn {
            caps.push("copy-from-txn");
        }
        caps.push(match ctx.opts.delete {
            DeletePolicy::Recursive => "delete-recursive",
            DeletePolicy::RequireExplicit => "delete-explicit",
        });
        caps.push(match ctx.opts.rebase {
            RebasePolicy::Strict => "rebase-strict",
            RebasePolicy::Permissive => "rebase-permissive",
        });
        let response = Item::List(vec![
            Item::word("success"),
            Item::List(vec![Item::List(caps.into_iter().map(Item::word).collect())]),
        ]);
        conn.write_item(&response).await
    })
}

fn commit_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let message = params
            .first()
            .and_then(|item| item.as_str())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let mut txn = TxnTree::begin(ctx.repo.clone(), ctx.opts).await?;
        txn.set_commit_info("anonymous", &message);
        debug!(base = txn.base_rev(), "entering commit edit");
        conn.write_cmd_response("", &[]).await?;
        // The edit loop's first read flushes the acknowledgement.
        let (_txn, outcome) = serve_edit(conn, txn).await?;
        match outcome {
            EditOutcome::Committed(rev) => info!(revision = rev, "commit finished"),
            EditOutcome::Aborted => info!("commit aborted by client"),
            EditOutcome::Failed => info!("commit failed"),
        }
        Ok(())
    })
}

fn update_cmd<'a, S>(
    conn: &'a mut Connection<S>,
    ctx: &'a mut SessionCtx,
    params: Vec<Item>,
) -> BoxFuture<'a, Result<()>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let vals = parse_tuple(&params, "ln")?;
        let target = opt_rev(vals[0].list())?;
        let base = vals[1].number();
        let rev = serve_update(conn, ctx.repo.as_ref(), target, base).await?;
        info!(base, target = rev, "update drive finished");
        Ok(())
    })
}

pub fn session_command_table<S>() -> Vec<CmdEntry<S, SessionCtx>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    vec![
        CmdEntry { name: "ping", handler: ping_cmd::<S>, terminal: false },
        CmdEntry { name: "get-latest-rev", handler: get_latest_rev_cmd::<S>, terminal: false },
        CmdEntry { name: "check-path", handler: check_path_cmd::<S>, terminal: false },
        CmdEntry { name: "stat", handler: stat_cmd::<S>, terminal: false },
        CmdEntry { name: "capabilities", handler: capabilities_cmd::<S>, terminal: false },
        CmdEntry { name: "commit", handler: commit_cmd::<S>, terminal: false },
        CmdEntry { name: "update", handler: update_cmd::<S>, terminal: false },
    ]
}

/// Serve one connection until the peer goes away.
pub async fn run_session<S>(stream: S, repo: Arc<InMemoryRepository>, opts: TxnOptions) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = Connection::new(stream);
    let mut ctx = SessionCtx { repo, opts };
    let table = session_command_table::<S>();
    match handle_commands(&mut conn, &mut ctx, &table, DispatchOptions::default()).await {
        // A peer hanging up between commands is the normal end of session.
        Err(Error { kind: ErrorKind::ConnectionClosed, .. }) => Ok(()),
        other => other,
    }
}
