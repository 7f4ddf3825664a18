//! Error types for blocking connections.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! side is [`ConnectionError`]. Errors are cheap to clone because a transport
//! failure recorded by the callback adapter is handed out again to every later
//! caller that asks for response data (failures are *sticky*).
//!
//! # Categories
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | [`ConnectionError::IllegalState`] | configuration is touched after the request started |
//! | [`ConnectionError::Unsupported`] | the same header is added twice |
//! | [`ConnectionError::Protocol`] | body length or output-stream preconditions are violated |
//! | [`ConnectionError::RedirectBody`] | a redirect body is read while redirects are disabled |
//! | [`ConnectionError::NotFound`] | the input stream is requested for a status >= 400 |
//! | [`ConnectionError::StreamClosed`] | the request was canceled |
//! | [`ConnectionError::Timeout`] | a body read exceeded the read timeout |
//! | [`ConnectionError::Request`] | the engine reported a transport failure |
//! | [`ConnectionError::Invariant`] | the adapter and the bridge disagree (a bug) |

use std::fmt;
use std::io;

/// Classification of a transport failure reported by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    /// The request or one of its phases timed out.
    TimedOut,
    /// The connection could not be established.
    Connect,
    /// The engine refused or failed to follow a redirect.
    Redirect,
    /// Sending the request body failed.
    Body,
    /// The response body could not be decoded.
    Decode,
    /// The request could not be built or sent.
    Request,
    /// Anything the engine could not classify.
    Other,
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestErrorKind::TimedOut => "timed out",
            RequestErrorKind::Connect => "connect",
            RequestErrorKind::Redirect => "redirect",
            RequestErrorKind::Body => "body",
            RequestErrorKind::Decode => "decode",
            RequestErrorKind::Request => "request",
            RequestErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A transport failure delivered through the engine's `failed` callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request failed ({kind}): {message}")]
pub struct RequestError {
    kind: RequestErrorKind,
    message: String,
}

impl RequestError {
    /// Create a new request error.
    pub fn new(kind: RequestErrorKind, message: impl Into<String>) -> Self {
        RequestError {
            kind,
            message: message.into(),
        }
    }

    /// The failure classification.
    pub fn kind(&self) -> RequestErrorKind {
        self.kind
    }

    /// Human readable failure message from the engine.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether repeating the same request right away has a reasonable chance
    /// of succeeding.
    ///
    /// This layer never retries on its own; the hint is surfaced for callers.
    pub fn is_immediately_retryable(&self) -> bool {
        matches!(self.kind, RequestErrorKind::TimedOut | RequestErrorKind::Connect)
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RequestErrorKind::TimedOut
        } else if err.is_connect() {
            RequestErrorKind::Connect
        } else if err.is_redirect() {
            RequestErrorKind::Redirect
        } else if err.is_body() {
            RequestErrorKind::Body
        } else if err.is_decode() {
            RequestErrorKind::Decode
        } else if err.is_request() || err.is_builder() {
            RequestErrorKind::Request
        } else {
            RequestErrorKind::Other
        };
        RequestError::new(kind, err.to_string())
    }
}

/// Errors produced by a blocking connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The operation is not allowed in the connection's current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The operation cannot be carried by the engine.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An HTTP-level precondition was violated.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The body of a redirect was requested while redirects are disabled.
    #[error("cannot read response body of a redirect")]
    RedirectBody,

    /// The server answered with a status code of 400 or above.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The request was canceled before the response completed.
    #[error("stream closed")]
    StreamClosed,

    /// A body read did not complete within the read timeout.
    #[error("read timed out")]
    Timeout,

    /// The engine reported a transport failure.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A request header was rejected when the request was built.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// The engine could not be created.
    #[error("engine error: {0}")]
    Engine(String),

    /// Internal consistency violation between the callback adapter and the
    /// blocking bridge. Never expected in correct operation.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

impl ConnectionError {
    /// Shorthand for [`ConnectionError::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        ConnectionError::IllegalState(message.into())
    }

    /// Shorthand for [`ConnectionError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        ConnectionError::Protocol(message.into())
    }

    /// Whether the error indicates a bug rather than a recoverable failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Invariant(_))
    }
}

impl From<ConnectionError> for io::Error {
    fn from(err: ConnectionError) -> Self {
        let kind = match &err {
            ConnectionError::Timeout => io::ErrorKind::TimedOut,
            ConnectionError::NotFound(_) => io::ErrorKind::NotFound,
            ConnectionError::StreamClosed => io::ErrorKind::ConnectionAborted,
            ConnectionError::Protocol(_) => io::ErrorKind::InvalidData,
            ConnectionError::IllegalState(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;
