// ABOUTME: Error types surfaced by the transport and peer layers
// ABOUTME: One variant per cause, thiserror-derived

use thiserror::Error;

/// Error surfaced by [`crate::transport::Transport`], [`crate::peer::Peer`], and
/// [`crate::agent::Agent`].
///
/// Every outstanding callback on a dying peer receives exactly one of these
/// (see [`Error::Disconnect`]); proxies invoked after disconnect receive
/// [`Error::NotConnected`]. Neither variant is ever thrown across an async
/// boundary — callers see it as a `Result` or as a terminal event.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Terminal transport loss, or the error a flushed callback receives when
    /// its peer disconnects while the call was outstanding.
    #[error("disconnected{}", .0.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
    Disconnect(Option<String>),

    /// A proxy was invoked while its peer was not `Live`.
    #[error("not connected")]
    NotConnected,

    /// A protocol violation: empty message, non-sequence message, unknown
    /// dispatch identifier, or a dispatch identifier that does not resolve
    /// to a callable.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The 32-bit callback handle space is fully occupied.
    #[error("ran out of callback keys")]
    KeysExhausted,

    /// The handshake did not complete within the configured timeout.
    #[error("connection handshake timed out")]
    HandshakeTimeout,

    /// A frame's payload failed to deserialize as a wire value.
    #[error("malformed payload: {0}")]
    Serialization(String),

    /// Underlying stream I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
