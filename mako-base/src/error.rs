// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A coarse `Kind` tag so callers can branch (retry, abort, close connection)
//    without downcasting strings, per the error taxonomy in the transaction
//    executor and RPC layers.

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification of an [`Error`], matching the taxonomy every
/// caller in the transaction/replication/RPC layers needs to branch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Kind {
    /// OCC validation failure or lock contention; recoverable by retry.
    Conflict,
    /// RPC deadline exceeded; the coordinator must abort known participants.
    Timeout,
    /// Session unusable; fatal to the current transaction.
    NotConnected,
    /// Replay saw a timestamp above the current watermark; queue and retry.
    SafetyFail,
    /// Malformed configuration; fatal at start-up.
    Config,
    /// Bad packet or unknown rpc_id; the connection must be closed.
    Protocol,
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error {
    inner: DynBacktraceError,
    kind: Option<Kind>,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "mako", "{:?}", err);
        let dbe = DynBacktraceError::from(err);
        Error { inner: dbe, kind: None }
    }

    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(kind: Kind, err: E) -> Error {
        let mut e = Error::new(err);
        e.kind = Some(kind);
        e
    }

    pub fn kind(&self) -> Option<Kind> {
        self.kind
    }

    pub fn is_kind(&self, kind: Kind) -> bool {
        self.kind == Some(kind)
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(err)
}

pub fn err_kind(kind: Kind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::with_kind(kind, err)
}

#[test]
fn test_error() {
    let _err = err("test error");
}

#[test]
fn test_error_kind() {
    let e = err_kind(Kind::Conflict, "lock held");
    assert!(e.is_kind(Kind::Conflict));
    assert!(!e.is_kind(Kind::Timeout));
}
