//! Error type shared by the wire codec, dispatcher and edit machinery.
//!
//! Errors form a chain of causes, each link carrying a numeric wire code,
//! a message and the source location where it was raised. A `failure`
//! response serializes the chain outermost cause first; the receiving peer
//! rebuilds it innermost first.

use std::io;
use std::panic::Location;

pub type Result<T> = std::result::Result<T, Error>;

/// Classifies an error for dispatch decisions and wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Sentinel wrapper: report the inner cause as a `failure` response but
    /// do not propagate past the dispatcher.
    CmdErr,
    /// Command name absent from the handler table.
    UnknownCmd,
    /// Zero-byte read; the peer went away.
    ConnectionClosed,
    /// Transport read/write failure.
    Io,
    /// Framing violation: unexpected byte, bad tuple shape, missing
    /// whitespace terminator.
    MalformedData,
    /// Rebase conflict: the change's base is stale.
    OutOfDate,
    /// An edit operation's preconditions were not met.
    Precondition,
    /// Operation not supported by this receiver or disabled by policy.
    Unsupported,
    /// Edit operation after `complete` or `abort`.
    EditFinished,
    /// Cooperative cancellation fired.
    Cancelled,
    /// Peg path or node-branch does not exist at the stated coordinates.
    NotFound,
    /// A code received from the peer that this implementation does not know.
    Remote(u64),
}

impl ErrorKind {
    /// Numeric code transmitted in failure responses.
    pub fn code(self) -> u64 {
        match self {
            ErrorKind::CmdErr => 210000,
            ErrorKind::UnknownCmd => 210001,
            ErrorKind::ConnectionClosed => 210002,
            ErrorKind::Io => 210003,
            ErrorKind::MalformedData => 210004,
            ErrorKind::OutOfDate => 220000,
            ErrorKind::Precondition => 220001,
            ErrorKind::Unsupported => 220002,
            ErrorKind::EditFinished => 220003,
            ErrorKind::Cancelled => 200015,
            ErrorKind::NotFound => 160013,
            ErrorKind::Remote(code) => code,
        }
    }

    /// Map a wire code back to a kind. Unknown codes are preserved as
    /// `Remote` so foreign peers may extend the table.
    pub fn from_code(code: u64) -> ErrorKind {
        match code {
            210000 => ErrorKind::CmdErr,
            210001 => ErrorKind::UnknownCmd,
            210002 => ErrorKind::ConnectionClosed,
            210003 => ErrorKind::Io,
            210004 => ErrorKind::MalformedData,
            220000 => ErrorKind::OutOfDate,
            220001 => ErrorKind::Precondition,
            220002 => ErrorKind::Unsupported,
            220003 => ErrorKind::EditFinished,
            200015 => ErrorKind::Cancelled,
            160013 => ErrorKind::NotFound,
            other => ErrorKind::Remote(other),
        }
    }

    /// Errors that must unwind the dispatcher loop rather than be reported
    /// as a `failure` response: the connection is unusable or the caller
    /// asked to stop.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Io
                | ErrorKind::ConnectionClosed
                | ErrorKind::MalformedData
                | ErrorKind::Cancelled
        )
    }
}

/// One link in a chain of causes.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub file: String,
    pub line: u64,
    #[source]
    pub cause: Option<Box<Error>>,
}

impl Error {
    /// Create an error recording the caller's source location.
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        let loc = Location::caller();
        Error {
            kind,
            message: message.into(),
            file: loc.file().to_string(),
            line: u64::from(loc.line()),
            cause: None,
        }
    }

    /// Create an error chained onto `cause`.
    #[track_caller]
    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: Error) -> Error {
        let mut err = Error::new(kind, message);
        err.cause = Some(Box::new(cause));
        err
    }

    /// Rebuild a link received from the peer.
    pub fn from_wire(code: u64, message: String, file: String, line: u64) -> Error {
        Error {
            kind: ErrorKind::from_code(code),
            message,
            file,
            line,
            cause: None,
        }
    }

    #[track_caller]
    pub fn io(err: io::Error, what: &str) -> Error {
        Error::new(ErrorKind::Io, format!("{what}: {err}"))
    }

    #[track_caller]
    pub fn malformed(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::MalformedData, detail)
    }

    /// Wrap this error in the `CmdErr` sentinel so the dispatcher reports
    /// it as a `failure` response without tearing down the loop.
    #[track_caller]
    pub fn into_cmd_err(self) -> Error {
        Error::with_cause(ErrorKind::CmdErr, "command failed", self)
    }

    /// Strip a `CmdErr` wrapper, yielding the real cause.
    pub fn unwrap_cmd_err(mut self) -> Error {
        if self.kind == ErrorKind::CmdErr {
            if let Some(cause) = self.cause.take() {
                return *cause;
            }
        }
        self
    }

    /// Iterate the chain from this (outermost) link inward.
    pub fn chain(&self) -> impl Iterator<Item = &Error> {
        let mut next = Some(self);
        std::iter::from_fn(move || {
            let cur = next?;
            next = cur.cause.as_deref();
            Some(cur)
        })
    }

    /// The innermost cause in the chain.
    pub fn root_cause(&self) -> &Error {
        self.chain().last().expect("chain always yields self")
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::io(err, "I/O failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for kind in [
            ErrorKind::CmdErr,
            ErrorKind::UnknownCmd,
            ErrorKind::ConnectionClosed,
            ErrorKind::Io,
            ErrorKind::MalformedData,
            ErrorKind::OutOfDate,
            ErrorKind::Precondition,
            ErrorKind::Unsupported,
            ErrorKind::EditFinished,
            ErrorKind::Cancelled,
            ErrorKind::NotFound,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
        assert_eq!(ErrorKind::from_code(999999), ErrorKind::Remote(999999));
    }

    #[test]
    fn chain_order() {
        let inner = Error::new(ErrorKind::NotFound, "path not found");
        let outer = Error::with_cause(ErrorKind::OutOfDate, "no such revision", inner);
        let messages: Vec<&str> = outer.chain().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["no such revision", "path not found"]);
        assert_eq!(outer.root_cause().kind, ErrorKind::NotFound);
    }

    #[test]
    fn cmd_err_wrap_unwrap() {
        let err = Error::new(ErrorKind::Precondition, "name taken").into_cmd_err();
        assert_eq!(err.kind, ErrorKind::CmdErr);
        let inner = err.unwrap_cmd_err();
        assert_eq!(inner.kind, ErrorKind::Precondition);
        assert_eq!(inner.message, "name taken");
    }

    #[test]
    fn location_captured() {
        let err = Error::new(ErrorKind::Io, "write failure");
        assert!(err.file.ends_with("error.rs"));
        assert!(err.line > 0);
    }
}
