//! Commands, responses and the dispatcher loop.
//!
//! A command is a tuple `(word params-list)`. A response is a tuple
//! `(success body)` or `(failure error-list)`. The dispatcher reads
//! commands, looks the word up in a fixed handler table, and reports
//! handler failures on the same stream. Handlers write their own success
//! responses; many commands (notably the pipelined edit operations) have
//! none.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::conn::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::item::Item;
use crate::tuple::{parse_tuple, TupleArg, TupleValue};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler signature: the connection (for writing a response), a typed
/// context in place of the original's opaque baton, and the parameter list.
pub type CmdHandler<S, C> =
    for<'a> fn(&'a mut Connection<S>, &'a mut C, Vec<Item>) -> BoxFuture<'a, Result<()>>;

/// One entry in a handler table.
pub struct CmdEntry<S, C> {
    pub name: &'static str,
    pub handler: CmdHandler<S, C>,
    /// The dispatcher loop ends after this command has been handled.
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Propagate handler errors out of the loop after reporting them,
    /// instead of continuing with the next command.
    pub pass_through_errors: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    /// Write a command tuple: `( word ( params... ) )`.
    pub async fn write_cmd(&mut self, name: &str, fmt: &str, args: &[TupleArg<'_>]) -> Result<()> {
        self.start_list().await?;
        self.write_word(name).await?;
        self.write_tuple(fmt, args).await?;
        self.end_list().await
    }

    /// Write a success response: `( success ( body... ) )`.
    pub async fn write_cmd_response(&mut self, fmt: &str, args: &[TupleArg<'_>]) -> Result<()> {
        self.start_list().await?;
        self.write_word("success").await?;
        self.write_tuple(fmt, args).await?;
        self.end_list().await
    }

    /// Write a failure response carrying the whole error chain, outermost
    /// cause first: `( failure ( ( code message file line )... ) )`.
    pub async fn write_cmd_failure(&mut self, err: &Error) -> Result<()> {
        self.start_list().await?;
        self.write_word("failure").await?;
        self.start_list().await?;
        for link in err.chain() {
            self.write_tuple(
                "nccn",
                &[
                    TupleArg::Number(link.kind.code()),
                    TupleArg::Cstr(&link.message),
                    TupleArg::Cstr(&link.file),
                    TupleArg::Number(link.line),
                ],
            )
            .await?;
        }
        self.end_list().await?;
        self.end_list().await
    }

    /// Read one command-shaped tuple, returning the word and its
    /// parameter list.
    pub async fn read_command(&mut self) -> Result<(String, Vec<Item>)> {
        let mut vals = self.read_tuple("wl").await?;
        let params = vals.pop().expect("two values parsed").into_list();
        let name = vals.pop().expect("two values parsed").into_word();
        Ok((name, params))
    }

    /// Read a command response. A success body is parsed with `fmt`; a
    /// failure is rebuilt into an error chain whose innermost cause is the
    /// sender's outermost-last entry.
    pub async fn read_cmd_response(&mut self, fmt: &str) -> Result<Vec<TupleValue>> {
        let (status, params) = self.read_command().await?;
        match status.as_str() {
            "success" => parse_tuple(&params, fmt),
            "failure" => Err(parse_failure_params(&params)?),
            other => Err(Error::malformed(format!(
                "unknown status {other:?} in command response"
            ))),
        }
    }
}

/// Rebuild the error chain carried by a `failure` body. Entries arrive
/// outermost cause first; building from the end restores cause order.
pub fn parse_failure_params(params: &[Item]) -> Result<Error> {
    if params.is_empty() {
        return Err(Error::malformed("empty error list"));
    }
    let mut err: Option<Error> = None;
    for entry in params.iter().rev() {
        let list = entry.expect_list()?;
        let vals = parse_tuple(list, "nccn")?;
        let mut link = Error::from_wire(
            vals[0].number(),
            vals[1].cstr().to_string(),
            vals[2].cstr().to_string(),
            vals[3].number(),
        );
        link.cause = err.take().map(Box::new);
        err = Some(link);
    }
    Ok(err.expect("non-empty error list"))
}

/// Run the command loop: read a command, dispatch it, report failures,
/// stop after a terminal command. Cancellation is polled between
/// iterations. Errors wrapped in the `CmdErr` sentinel are reported and
/// swallowed; transport-fatal errors and cancellation unwind; other errors
/// unwind only when `pass_through_errors` is set.
pub async fn handle_commands<S, C>(
    conn: &mut Connection<S>,
    ctx: &mut C,
    commands: &[CmdEntry<S, C>],
    opts: DispatchOptions,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Send,
{
    loop {
        conn.check_cancelled()?;
        let (name, params) = conn.read_command().await?;
        let entry = commands.iter().find(|e| e.name == name);
        let result = match entry {
            Some(entry) => {
                debug!(command = %name, "dispatching");
                (entry.handler)(conn, ctx, params).await
            }
            None => Err(Error::new(
                ErrorKind::UnknownCmd,
                format!("unknown command {name}"),
            )),
        };

        if let Err(err) = result {
            if err.kind == ErrorKind::CmdErr {
                let inner = err.unwrap_cmd_err();
                conn.write_cmd_failure(&inner).await?;
                conn.flush().await?;
            } else if err.kind.is_fatal() {
                return Err(err);
            } else {
                conn.write_cmd_failure(&err).await?;
                conn.flush().await?;
                if opts.pass_through_errors {
                    return Err(err);
                }
            }
        }

        if entry.is_some_and(|e| e.terminal) {
            break;
        }
    }
    conn.flush().await?;
    Ok(())
}
