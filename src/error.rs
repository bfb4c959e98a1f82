//! Error kinds surfaced by the protocol engine. See spec §7.

use thiserror::Error;

/// Errors raised anywhere in the `rtas` runtime.
///
/// After any of these escapes a call, the [`Engine`](crate::engine::Engine)
/// that raised it must be considered unusable: none of these are recovered
/// silently and the protocol does not retry.
#[derive(Debug, Error)]
pub enum RtasError {
    /// A "host:port" string did not parse.
    #[error("address {0:?} is not valid")]
    Address(String),

    /// Binding the local listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Dialing a peer failed.
    #[error("failed to connect to {peer} at {addr}: {source}")]
    Connect {
        /// Peer name we tried to reach.
        peer: String,
        /// Address we tried to reach.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connection handshake (address claim) failed its checks.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A read or write exceeded the configured timeout.
    #[error("timed out waiting on {0}")]
    Timeout(String),

    /// A read or write failed on an already-established channel.
    #[error("transport error on channel to {peer}: {source}")]
    Transport {
        /// Peer the channel belonged to.
        peer: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A received frame failed to deserialize, or its header did not match
    /// the header the caller expected.
    #[error("envelope error: {0}")]
    Envelope(String),

    /// An illegal operand combination (mixing Shared with Private, mismatched
    /// Private owners, missing shape, etc).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad engine configuration (e.g. fewer than three parties supplied).
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RtasError>;
