use std::io;

/// Failures decoding or encoding a single envelope.
///
/// Never fatal to a connection: the offending message is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope(reason.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Inbound listener failed to bind.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("not connected")]
    NotConnected,

    /// The transport failed to flush a message.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The connection closed before a reply arrived.
    #[error("connection closed before a reply arrived")]
    Disconnected,

    #[error("no reply to seq {seq} within {millis}ms")]
    Timeout { seq: u64, millis: u128 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
