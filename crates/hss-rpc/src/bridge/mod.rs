//! Wire layer shared by the client and server roles.
//!
//! - **codec**: newline framing for AsyncRead/AsyncWrite
//! - **protocol**: the `{seq, command, payload}` envelope
//! - **correlator**: outstanding request table keyed by sequence number

pub mod codec;
pub mod correlator;
pub mod protocol;

use futures::{Sink, SinkExt};

use crate::error::RpcError;
use protocol::Envelope;

/// Encode `envelope` and write it as one frame.
pub(crate) async fn send_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), RpcError>
where
    W: Sink<String, Error = std::io::Error> + Unpin,
{
    let line = envelope.encode()?;
    writer.send(line).await.map_err(RpcError::Write)
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
