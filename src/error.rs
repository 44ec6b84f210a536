//! Error kinds surfaced by the cache core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while resolving a key.
///
/// Every variant carries owned strings so the value can be cloned and handed
/// to all waiters of a single-flighted load.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The key bytes do not describe a request. Never retried.
    #[error("malformed cache key: {0}")]
    KeyDecode(String),

    /// A stored or transferred blob does not describe a response.
    #[error("malformed cached response: {0}")]
    ResponseDecode(String),

    /// Network failure or timeout talking to the origin.
    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    /// Network failure, timeout or bad status talking to a peer.
    #[error("peer {peer} unavailable: {reason}")]
    PeerUnavailable { peer: String, reason: String },

    /// The peer answered but does not serve the requested group.
    #[error("peer {peer} does not serve group {group}")]
    PeerNotFound { peer: String, group: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The shared load for this key died before producing a result.
    #[error("load aborted: {0}")]
    LoadAborted(String),

    /// The client went away while the body was being streamed.
    #[error("response stream closed")]
    StreamClosed,
}

impl From<crate::singleflight::CallAborted> for Error {
    fn from(err: crate::singleflight::CallAborted) -> Self {
        Error::LoadAborted(err.0)
    }
}

impl Error {
    pub fn is_peer_error(&self) -> bool {
        matches!(self, Error::PeerUnavailable { .. } | Error::PeerNotFound { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KeyDecode(_) => "key_decode",
            Error::ResponseDecode(_) => "response_decode",
            Error::OriginUnavailable(_) => "origin_unavailable",
            Error::PeerUnavailable { .. } => "peer_unavailable",
            Error::PeerNotFound { .. } => "peer_not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::LoadAborted(_) => "load_aborted",
            Error::StreamClosed => "stream_closed",
        }
    }
}
