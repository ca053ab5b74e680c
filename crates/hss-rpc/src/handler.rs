//! Contract between the server role and the embedding application.
//!
//! The transport never interprets command names; it hands every decoded
//! request to a [`RequestHandler`] together with a [`Responder`] that can
//! answer it at most once.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::LineCodec;
use crate::bridge::protocol::{DEFAULT_RESPONSE_COMMAND, Envelope};
use crate::bridge::send_envelope;
use crate::error::RpcError;

pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one accepted connection, shared by all of its responders.
pub(crate) type SharedWriter = Arc<Mutex<FramedWrite<BoxedWrite, LineCodec>>>;

/// An inbound request decoded off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    pub payload: Value,
}

/// Successful outcome of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    /// Command tag for the response envelope; `"response"` when unset.
    pub command: Option<String>,
    pub payload: Value,
}

impl Reply {
    pub fn new(payload: Value) -> Self {
        Self {
            command: None,
            payload,
        }
    }

    /// Reply with a `null` payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// The handler could not complete a request. No response is sent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Application entry point for inbound requests.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// The responder may be moved elsewhere and completed later. Dropping it
    /// without responding leaves the request unanswered.
    async fn handle_request(&self, request: Request, responder: Responder);
}

/// Completes exactly one inbound request.
pub struct Responder {
    seq: u64,
    writer: Option<SharedWriter>,
}

impl Responder {
    pub(crate) fn new(seq: u64, writer: SharedWriter) -> Self {
        Self {
            seq,
            writer: Some(writer),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Finish the request.
    ///
    /// `Err` is logged and nothing goes back to the peer. `Ok` writes a
    /// response envelope echoing the request's sequence number; the returned
    /// future resolves once that write has completed.
    pub async fn respond(mut self, result: Result<Reply, HandlerError>) -> Result<(), RpcError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(seq = self.seq, error = %e, "Handling RPC request failed (HandlerFailed), no response sent");
                return Ok(());
            }
        };

        let command = reply
            .command
            .unwrap_or_else(|| DEFAULT_RESPONSE_COMMAND.to_string());
        let envelope = Envelope::new(self.seq, command, reply.payload);

        let mut w = writer.lock().await;
        match send_envelope(&mut *w, &envelope).await {
            Ok(()) => {
                tracing::debug!(seq = self.seq, command = %envelope.command, "RPC response sent");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(seq = self.seq, error = %e, "Error sending RPC response");
                Err(e)
            }
        }
    }

    pub async fn reply(self, reply: Reply) -> Result<(), RpcError> {
        self.respond(Ok(reply)).await
    }

    pub async fn fail(self, error: HandlerError) {
        // Failing never writes, so this cannot error.
        let _ = self.respond(Err(error)).await;
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.writer.is_some() {
            tracing::debug!(seq = self.seq, "Request dropped without a response");
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("seq", &self.seq)
            .field("answered", &self.writer.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn responder_over_duplex(seq: u64) -> (Responder, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let writer: SharedWriter = Arc::new(Mutex::new(FramedWrite::new(
            Box::new(ours) as BoxedWrite,
            LineCodec::new(),
        )));
        (Responder::new(seq, writer), theirs)
    }

    async fn read_available(stream: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn reply_builders() {
        let reply = Reply::new(json!({"text": "hi"})).with_command("answer");
        assert_eq!(reply.command.as_deref(), Some("answer"));
        assert_eq!(Reply::empty().payload, Value::Null);
    }

    #[tokio::test]
    async fn respond_uses_default_command() {
        let (responder, mut peer) = responder_over_duplex(0);

        responder
            .reply(Reply::new(json!({"text": "hi"})))
            .await
            .unwrap();

        assert_eq!(
            read_available(&mut peer).await,
            "{\"seq\":0,\"command\":\"response\",\"payload\":{\"text\":\"hi\"}}\n"
        );
    }

    #[tokio::test]
    async fn respond_with_custom_command() {
        let (responder, mut peer) = responder_over_duplex(5);

        responder
            .reply(Reply::empty().with_command("continue"))
            .await
            .unwrap();

        assert_eq!(
            read_available(&mut peer).await,
            "{\"seq\":5,\"command\":\"continue\",\"payload\":null}\n"
        );
    }

    #[tokio::test]
    async fn failure_writes_nothing() {
        let (responder, mut peer) = responder_over_duplex(1);

        responder.fail(HandlerError::new("boom")).await;

        // The responder held the last handle to the writer, so the peer sees
        // end of stream with no bytes before it.
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty(), "nothing should have been written");
    }

    #[tokio::test]
    async fn write_error_is_returned_to_caller() {
        let (responder, peer) = responder_over_duplex(2);
        drop(peer);

        let err = responder.reply(Reply::empty()).await.unwrap_err();

        assert!(matches!(err, RpcError::Write(_)));
    }
}
