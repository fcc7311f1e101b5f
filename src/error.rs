// src/error.rs

//! Defines the primary error type for the client: [`Error`], and the
//! server-error sub-classification used by the cluster and sentinel routers.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures the client can surface.
///
/// Using `thiserror` gives us clean `Display` impls and `From` conversions while
/// keeping every public operation returning a plain `Result<T, Error>` — no panics,
/// no thrown exceptions.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unexpected EOF while reading a frame")]
    UnexpectedEof,

    #[error("frame exceeds the configured maximum size")]
    OversizedFrame,

    #[error("connection is closed: {0}")]
    ConnectionClosed(String),

    #[error("pool timed out waiting for a connection")]
    PoolTimeout,

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("response was nil")]
    Nil,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("could not parse reply as the requested type: {0}")]
    Parse(String),

    #[error("failed to decode the binary cache format: {0}")]
    CacheUnmarshal(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("DoStream only supports string/integer/double replies, found {0}")]
    UnsupportedStreamType(String),

    #[error("invalid connection URL: {0}")]
    Url(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(Arc::clone(e)),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::UnexpectedEof => Error::UnexpectedEof,
            Error::OversizedFrame => Error::OversizedFrame,
            Error::ConnectionClosed(s) => Error::ConnectionClosed(s.clone()),
            Error::PoolTimeout => Error::PoolTimeout,
            Error::Server(e) => Error::Server(e.clone()),
            Error::Nil => Error::Nil,
            Error::Cancelled => Error::Cancelled,
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::Parse(s) => Error::Parse(s.clone()),
            Error::CacheUnmarshal(s) => Error::CacheUnmarshal(s.clone()),
            Error::Config(s) => Error::Config(s.clone()),
            Error::UnsupportedStreamType(s) => Error::UnsupportedStreamType(s.clone()),
            Error::Url(s) => Error::Url(s.clone()),
            Error::Internal(s) => Error::Internal(s.clone()),
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            (Error::Protocol(a), Error::Protocol(b)) => a == b,
            (Error::UnexpectedEof, Error::UnexpectedEof) => true,
            (Error::OversizedFrame, Error::OversizedFrame) => true,
            (Error::ConnectionClosed(a), Error::ConnectionClosed(b)) => a == b,
            (Error::PoolTimeout, Error::PoolTimeout) => true,
            (Error::Server(a), Error::Server(b)) => a == b,
            (Error::Nil, Error::Nil) => true,
            (Error::Cancelled, Error::Cancelled) => true,
            (Error::DeadlineExceeded, Error::DeadlineExceeded) => true,
            (Error::Parse(a), Error::Parse(b)) => a == b,
            (Error::CacheUnmarshal(a), Error::CacheUnmarshal(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            (Error::UnsupportedStreamType(a), Error::UnsupportedStreamType(b)) => a == b,
            (Error::Url(a), Error::Url(b)) => a == b,
            (Error::Internal(a), Error::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl Error {
    pub fn is_nil(&self) -> bool {
        matches!(self, Error::Nil)
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::Parse(_))
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
            || matches!(self, Error::Io(_))
            || matches!(self, Error::UnexpectedEof)
    }

    /// Whether this error is retryable for a readonly command, per the retry
    /// taxonomy in spec §4.6 / §7. Cluster `MOVED`/`ASK` are handled by the
    /// cluster router, not by the generic retry policy, so they are excluded here.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::UnexpectedEof | Error::ConnectionClosed(_) => true,
            Error::Server(kind) => matches!(
                kind,
                ServerError::Loading(_) | ServerError::ClusterDown(_) | ServerError::TryAgain(_)
            ),
            _ => false,
        }
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Error::ConnectionClosed(reason.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Url(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::closed("background task is no longer receiving")
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::closed("the wire dropped the completion channel before replying")
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DeadlineExceeded
    }
}

/// Sub-classification of a RESP error reply (`-ERR ...\r\n`). A server error is a
/// *value*, not a call-level failure — it rides inside [`Error::Server`] only once
/// a reply has actually been decoded as a RESP error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    #[error("TRYAGAIN {0}")]
    TryAgain(String),

    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    #[error("NOSCRIPT {0}")]
    NoScript(String),

    #[error("BUSYGROUP {0}")]
    BusyGroup(String),

    #[error("LOADING {0}")]
    Loading(String),

    #[error("REDIRECT {0}")]
    Redirect(String),

    #[error("NOAUTH {0}")]
    NoAuth(String),

    #[error("{0}")]
    Other(String),
}

impl ServerError {
    /// Classifies a raw RESP simple-error/blob-error message body by its leading
    /// token, mirroring the prefix dispatch a real server-error reply carries.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut parts = message.splitn(2, ' ');
        let prefix = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim().to_string();
        match prefix {
            "MOVED" => parse_redirect(&rest)
                .map(|(slot, addr)| ServerError::Moved { slot, addr })
                .unwrap_or(ServerError::Other(message)),
            "ASK" => parse_redirect(&rest)
                .map(|(slot, addr)| ServerError::Ask { slot, addr })
                .unwrap_or(ServerError::Other(message)),
            "TRYAGAIN" => ServerError::TryAgain(rest),
            "CLUSTERDOWN" => ServerError::ClusterDown(rest),
            "NOSCRIPT" => ServerError::NoScript(rest),
            "BUSYGROUP" => ServerError::BusyGroup(rest),
            "LOADING" => ServerError::Loading(rest),
            "REDIRECT" => ServerError::Redirect(rest),
            "NOAUTH" => ServerError::NoAuth(rest),
            _ => ServerError::Other(message),
        }
    }
}

fn parse_redirect(rest: &str) -> Option<(u16, String)> {
    let mut it = rest.split_whitespace();
    let slot = it.next()?.parse::<u16>().ok()?;
    let addr = it.next()?.to_string();
    Some((slot, addr))
}

pub type Result<T> = std::result::Result<T, Error>;
