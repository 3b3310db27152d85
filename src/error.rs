//! Error taxonomy surfaced to callers (spec §7).
//!
//! Every future the crate hands back resolves to exactly one of `Ok(Value)` or
//! `Err(RedisCoreError)`. `RedisCoreError` never exposes an internal transport
//! error directly; transport failures are always folded into one of the
//! variants below first.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// The coarse classification of a server error frame's leading token, or a
/// client-side condition that prevented a command from ever reaching the wire.
///
/// Kept separate from [`RedisCoreError`] because the retry engine (C7) needs to
/// dispatch on this *before* deciding whether an error is terminal or
/// recoverable; most kinds never escape C7 and are never constructed into a
/// user-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    Moved,
    Ask,
    TryAgain,
    ClusterDown,
    NoScript,
    WrongType,
    NoPerm,
    ExecAbort,
    Other,
}

impl ServerErrorKind {
    /// Classify the leading whitespace-delimited token of a RESP error frame.
    pub fn from_token(token: &str) -> Self {
        match token {
            "MOVED" => Self::Moved,
            "ASK" => Self::Ask,
            "TRYAGAIN" => Self::TryAgain,
            "CLUSTERDOWN" => Self::ClusterDown,
            "NOSCRIPT" => Self::NoScript,
            "WRONGTYPE" => Self::WrongType,
            "NOPERM" => Self::NoPerm,
            "EXECABORT" => Self::ExecAbort,
            _ => Self::Other,
        }
    }
}

/// User-visible error taxonomy (spec §7).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RedisCoreError {
    /// A server-returned error other than MOVED/ASK/TRYAGAIN/CLUSTERDOWN/NOSCRIPT,
    /// or a client-side violation (argument, encoding, unsupported operation).
    #[error("request error: {message}")]
    Request { kind: String, message: String },

    /// Atomic batch aborted by the server (`EXECABORT`) or invalidated by `WATCH`.
    #[error("transaction aborted: {message}")]
    ExecAbort { message: String },

    /// Request deadline exceeded before a reply was matched to the waiter.
    #[error("request timed out")]
    Timeout,

    /// Transport torn down with no viable retry, or a `Closing` connection.
    #[error("disconnected: {reason}")]
    Disconnect { reason: String },

    /// Client is shutting down; outstanding calls surface this after drain.
    #[error("client is closing")]
    Closing,

    /// Admission rejected because the global in-flight cap was reached.
    #[error("global backpressure: {pending} pending requests at or above cap")]
    Backpressure { pending: usize },

    /// Admission rejected because this client's own in-flight cap was reached.
    #[error("per-client inflight cap exceeded: {pending} pending requests")]
    ClientInflightExceeded { pending: usize },

    /// An atomic batch's keys span more than one slot in cluster mode.
    #[error("cross-slot: commands in an atomic batch map to different slots")]
    CrossSlot,

    /// Invalid or inconsistent configuration, detected at construction.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// A script the server does not know about; the script-cache collaborator
    /// (out of scope here) is expected to reload it and retry.
    #[error("NOSCRIPT: {sha}")]
    NoScript { sha: String },
}

impl RedisCoreError {
    /// Build a typed error from a decoded server error frame (§4.1), giving
    /// `NOSCRIPT` and `EXECABORT` their own variants and everything else the
    /// generic `Request` one.
    pub fn from_server_error(kind_token: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match ServerErrorKind::from_token(kind_token) {
            ServerErrorKind::NoScript => {
                let sha = message
                    .split_whitespace()
                    .last()
                    .unwrap_or_default()
                    .to_string();
                Self::NoScript { sha }
            }
            ServerErrorKind::ExecAbort => Self::ExecAbort { message },
            _ => Self::Request {
                kind: kind_token.to_string(),
                message,
            },
        }
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::Disconnect {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for the limited set of conditions C7 treats as locally recoverable
    /// (spec §7's propagation policy): callers of the retry engine never see
    /// these constructed as a final error except after the retry budget or hop
    /// cap is exhausted.
    pub fn is_retryable_server_error(&self) -> bool {
        match self {
            Self::Request { kind, .. } => matches!(
                ServerErrorKind::from_token(kind),
                ServerErrorKind::Moved
                    | ServerErrorKind::Ask
                    | ServerErrorKind::TryAgain
                    | ServerErrorKind::ClusterDown
            ),
            _ => false,
        }
    }
}

/// A MOVED/ASK target endpoint, carried on the error so the caller can see
/// where the last redirect pointed even after the hop cap surfaces a `Request`
/// error (spec §7: "for `MOVED/ASK`, the target endpoint at the time of the
/// error").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub slot: u16,
    pub addr: SocketAddr,
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.slot, self.addr)
    }
}

/// Errors produced purely by the RESP decoder (§4.1): malformed bytes on the
/// wire, distinct from a successfully decoded `Error` frame.
#[derive(Debug, Error, Clone)]
pub enum RespError {
    #[error("invalid RESP prefix byte {0:#x}")]
    InvalidPrefix(u8),
    #[error("invalid integer in RESP frame")]
    InvalidInteger,
    #[error("unterminated RESP frame")]
    UnterminatedFrame,
    #[error("bulk string length out of range: {0}")]
    InvalidBulkLength(i64),
}

impl From<RespError> for RedisCoreError {
    fn from(err: RespError) -> Self {
        RedisCoreError::disconnect(format!("protocol error: {err}"))
    }
}

impl From<std::io::Error> for RedisCoreError {
    fn from(err: std::io::Error) -> Self {
        RedisCoreError::disconnect(err.to_string())
    }
}

pub type RedisCoreResult<T> = Result<T, RedisCoreError>;
