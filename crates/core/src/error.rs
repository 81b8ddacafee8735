//! Error types for the RTSP relay library.

use std::fmt;

/// Errors that can occur in the RTSP relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`ProtocolViolation`](Self::ProtocolViolation),
///   [`UnsupportedVersion`](Self::UnsupportedVersion) — malformed or
///   unsupported RTSP messages.
/// - **Connection**: [`PeerClosed`](Self::PeerClosed) — clean EOF between
///   messages (not a fault), [`PeerReset`](Self::PeerReset) — EOF in the
///   middle of a message, [`Io`](Self::Io) — socket failures.
/// - **Registry**: [`NotFound`](Self::NotFound),
///   [`AlreadyExists`](Self::AlreadyExists).
/// - **State machine**: [`MethodNotValidInThisState`](Self::MethodNotValidInThisState),
///   [`Forbidden`](Self::Forbidden), [`SessionNotFound`](Self::SessionNotFound).
/// - **Resources**: [`ResourceExhausted`](Self::ResourceExhausted) — RTP
///   port range full.
/// - **Startup**: [`Config`](Self::Config), [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed RTSP message (bad start line, header, or framing).
    #[error("RTSP protocol violation: {kind}")]
    ProtocolViolation { kind: ParseErrorKind },

    /// Request used a version other than `RTSP/1.0`.
    #[error("unsupported RTSP version: {0}")]
    UnsupportedVersion(String),

    /// The peer closed the connection between messages. Clean shutdown,
    /// surfaced as an error so read loops can unwind.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The peer closed the connection in the middle of a message.
    #[error("peer reset the connection mid-message")]
    PeerReset,

    /// No mount registered at the requested path.
    #[error("mount not found: {0}")]
    NotFound(String),

    /// A mount already occupies the requested path.
    #[error("mount already exists: {0}")]
    AlreadyExists(String),

    /// The method is not allowed for the connection's current role/state.
    #[error("method {0} not valid in this state")]
    MethodNotValidInThisState(String),

    /// The request is understood but refused (e.g. duplicate ANNOUNCE).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The presented `Session` header does not match a live session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// RTP port allocation exhausted the configured range.
    #[error("RTP port range exhausted")]
    ResourceExhausted,

    /// Invalid or undecodable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a valid length.
    InvalidContentLength,
    /// An interleaved frame sentinel (`$`) arrived on a connection that
    /// never negotiated interleaved transport.
    UnexpectedInterleaved,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::UnexpectedInterleaved => {
                write!(f, "interleaved frame outside interleaved mode")
            }
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
