//! Server role: accepts the host's connection and dispatches its requests.
//!
//! Each accepted connection runs on its own task with its own frame buffer.
//! Every decoded request is handed to the [`RequestHandler`] on a separate
//! task, so a slow handler never stalls reading.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, LineCodec};
use crate::bridge::join_host_port;
use crate::bridge::protocol::Envelope;
use crate::error::RpcError;
use crate::handler::{BoxedWrite, Request, RequestHandler, Responder, SharedWriter};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

pub struct RpcServer<H: RequestHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<H: RequestHandler> RpcServer<H> {
    pub fn new(config: ServerConfig, handler: Arc<H>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handler,
            local_addr: None,
            accept_task: None,
            shutdown_tx,
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address. Calling it again while running returns the
    /// existing address.
    pub async fn start(&mut self) -> Result<SocketAddr, RpcError> {
        if let (Some(addr), Some(_)) = (self.local_addr, &self.accept_task) {
            tracing::warn!(%addr, "RPC server already started");
            return Ok(addr);
        }

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RpcError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RpcError::Listen { addr, source })?;

        tracing::debug!(%local_addr, "RPC server started");

        // A previous shutdown() must not close connections accepted from now on.
        self.shutdown_tx.send_replace(false);

        let handler = Arc::clone(&self.handler);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let max_frame_length = self.config.max_frame_length;
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown_rx,
            max_frame_length,
        )));
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.is_some()
    }

    /// Serve requests arriving on an already-established stream.
    pub fn serve_stream<S>(&self, stream: S, peer: impl Into<String>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tokio::spawn(serve_connection(
            stream,
            peer.into(),
            Arc::clone(&self.handler),
            self.shutdown_tx.subscribe(),
            self.config.max_frame_length,
        ))
    }

    /// Close the listening socket. Accepted connections keep running.
    pub fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            tracing::debug!(addr = ?self.local_addr, "RPC server stopped");
        }
        self.local_addr = None;
    }

    /// Close the listening socket and every accepted connection.
    pub fn shutdown(&mut self) {
        self.stop();
        self.shutdown_tx.send_replace(true);
    }
}

impl<H: RequestHandler> Drop for RpcServer<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<H: RequestHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
    max_frame_length: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "Accepted RPC connection");
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::trace!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                tokio::spawn(serve_connection(
                    stream,
                    peer.to_string(),
                    Arc::clone(&handler),
                    shutdown_rx.clone(),
                    max_frame_length,
                ));
            }
            Err(e) => {
                tracing::error!(error = %e, "RPC server error");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection<S, H>(
    stream: S,
    peer: String,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_length: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: RequestHandler,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, LineCodec::with_max_length(max_frame_length));
    let writer: SharedWriter = Arc::new(Mutex::new(FramedWrite::new(
        Box::new(write_half) as BoxedWrite,
        LineCodec::with_max_length(max_frame_length),
    )));

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(frame)) => dispatch(&frame, &handler, &writer),
                Some(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "RPC connection read error");
                    break;
                }
                None => {
                    tracing::debug!(%peer, "RPC peer disconnected");
                    break;
                }
            },
            _ = wait_for_shutdown(&mut shutdown_rx) => {
                tracing::debug!(%peer, "Closing RPC connection on shutdown");
                break;
            }
        }
    }
}

fn dispatch<H: RequestHandler>(frame: &[u8], handler: &Arc<H>, writer: &SharedWriter) {
    let envelope = match Envelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed RPC request received, dropping");
            return;
        }
    };

    tracing::debug!(seq = envelope.seq, command = %envelope.command, "RPC request received");

    let responder = Responder::new(envelope.seq, Arc::clone(writer));
    let request = Request {
        seq: envelope.seq,
        command: envelope.command,
        payload: envelope.payload,
    };
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        handler.handle_request(request, responder).await;
    });
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, Reply};
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Answers `handle` with a greeting, fails `explode`, echoes `echo` under
    /// a custom tag, and ignores everything else.
    struct TestHandler;

    #[async_trait::async_trait]
    impl RequestHandler for TestHandler {
        async fn handle_request(&self, request: Request, responder: Responder) {
            match request.command.as_str() {
                "handle" => {
                    let _ = responder.reply(Reply::new(json!({"text": "hi"}))).await;
                }
                "explode" => responder.fail(HandlerError::new("kaboom")).await,
                "echo" => {
                    let _ = responder
                        .reply(Reply::new(request.payload).with_command("echoed"))
                        .await;
                }
                _ => drop(responder),
            }
        }
    }

    async fn started_server() -> (RpcServer<TestHandler>, SocketAddr) {
        let mut server = RpcServer::new(ServerConfig::default(), Arc::new(TestHandler));
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn next_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<String> {
        let mut line = String::new();
        let n = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a response")
            .unwrap();
        (n > 0).then(|| line.trim_end_matches('\n').to_string())
    }

    async fn connect(
        addr: SocketAddr,
    ) -> (
        BufReader<tokio::net::tcp::OwnedReadHalf>,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        (BufReader::new(read_half), write_half)
    }

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(config.addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn simple_request_response() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer
            .write_all(b"{\"seq\":0,\"command\":\"handle\",\"payload\":{\"intentName\":\"X\"}}\n")
            .await
            .unwrap();

        assert_eq!(
            next_line(&mut reader).await.unwrap(),
            r#"{"seq":0,"command":"response","payload":{"text":"hi"}}"#
        );
    }

    #[tokio::test]
    async fn reply_uses_handler_command_tag() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer
            .write_all(b"{\"seq\":12,\"command\":\"echo\",\"payload\":[1,2]}\n")
            .await
            .unwrap();

        let line = next_line(&mut reader).await.unwrap();
        let envelope = Envelope::decode(line.as_bytes()).unwrap();
        assert_eq!(envelope, Envelope::new(12, "echoed", json!([1, 2])));
    }

    #[tokio::test]
    async fn handler_error_sends_no_response() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer
            .write_all(b"{\"seq\":0,\"command\":\"explode\"}\n")
            .await
            .unwrap();
        writer
            .write_all(b"{\"seq\":1,\"command\":\"handle\"}\n")
            .await
            .unwrap();

        let line = next_line(&mut reader).await.unwrap();
        assert_eq!(Envelope::decode(line.as_bytes()).unwrap().seq, 1);

        // Nothing else may follow: the failed request stays unanswered.
        let extra = tokio::time::timeout(Duration::from_millis(100), async {
            let mut buf = String::new();
            reader.read_line(&mut buf).await
        })
        .await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn malformed_input_keeps_connection_usable() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer.write_all(b"this is not json\n").await.unwrap();
        writer.write_all(b"{\"command\":\"handle\"}\n").await.unwrap();
        writer.write_all(b"{\"seq\":3}\n").await.unwrap();
        writer
            .write_all(b"{\"seq\":4,\"command\":\"handle\"}\n")
            .await
            .unwrap();

        let line = next_line(&mut reader).await.unwrap();
        assert_eq!(Envelope::decode(line.as_bytes()).unwrap().seq, 4);
    }

    #[tokio::test]
    async fn several_requests_in_one_write_are_all_answered() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer
            .write_all(
                b"{\"seq\":0,\"command\":\"handle\"}\n{\"seq\":1,\"command\":\"handle\"}\n{\"seq\":2,\"com",
            )
            .await
            .unwrap();
        writer.write_all(b"mand\":\"handle\"}\n").await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let line = next_line(&mut reader).await.unwrap();
            seqs.push(Envelope::decode(line.as_bytes()).unwrap().seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unrecognized_command_is_ignored() {
        let (_server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;

        writer
            .write_all(b"{\"seq\":0,\"command\":\"mystery\"}\n{\"seq\":1,\"command\":\"handle\"}\n")
            .await
            .unwrap();

        let line = next_line(&mut reader).await.unwrap();
        assert_eq!(Envelope::decode(line.as_bytes()).unwrap().seq, 1);
    }

    #[tokio::test]
    async fn connections_have_independent_buffers() {
        let (_server, addr) = started_server().await;
        let (mut reader_a, mut writer_a) = connect(addr).await;
        let (mut reader_b, mut writer_b) = connect(addr).await;

        writer_a.write_all(b"{\"seq\":10,\"comm").await.unwrap();
        writer_b
            .write_all(b"{\"seq\":20,\"command\":\"handle\"}\n")
            .await
            .unwrap();
        writer_a.write_all(b"and\":\"handle\"}\n").await.unwrap();

        let b = next_line(&mut reader_b).await.unwrap();
        let a = next_line(&mut reader_a).await.unwrap();
        assert_eq!(Envelope::decode(b.as_bytes()).unwrap().seq, 20);
        assert_eq!(Envelope::decode(a.as_bytes()).unwrap().seq, 10);
    }

    #[tokio::test]
    async fn stop_keeps_accepted_connections() {
        let (mut server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;
        // Make sure the connection has been accepted before closing the listener.
        writer
            .write_all(b"{\"seq\":0,\"command\":\"handle\"}\n")
            .await
            .unwrap();
        next_line(&mut reader).await.unwrap();

        server.stop();
        assert!(!server.is_listening());

        writer
            .write_all(b"{\"seq\":1,\"command\":\"handle\"}\n")
            .await
            .unwrap();
        let line = next_line(&mut reader).await.unwrap();
        assert_eq!(Envelope::decode(line.as_bytes()).unwrap().seq, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_accepted_connections() {
        let (mut server, addr) = started_server().await;
        let (mut reader, mut writer) = connect(addr).await;
        writer
            .write_all(b"{\"seq\":0,\"command\":\"handle\"}\n")
            .await
            .unwrap();
        next_line(&mut reader).await.unwrap();

        server.shutdown();

        assert_eq!(next_line(&mut reader).await, None);
    }

    #[tokio::test]
    async fn restart_after_shutdown_serves_new_connections() {
        let (mut server, _) = started_server().await;
        server.shutdown();
        assert!(!server.is_listening());

        let addr = server.start().await.unwrap();
        let (mut reader, mut writer) = connect(addr).await;
        writer
            .write_all(b"{\"seq\":0,\"command\":\"handle\"}\n")
            .await
            .unwrap();

        assert_eq!(
            next_line(&mut reader).await.unwrap(),
            r#"{"seq":0,"command":"response","payload":{"text":"hi"}}"#
        );
    }

    #[tokio::test]
    async fn bind_failure_is_listen_error() {
        let (_server, addr) = started_server().await;
        let mut second = RpcServer::new(ServerConfig::new(addr.port()), Arc::new(TestHandler));

        let err = second.start().await.unwrap_err();

        assert!(matches!(err, RpcError::Listen { .. }));
    }

    #[tokio::test]
    async fn serve_stream_over_duplex() {
        let server = RpcServer::new(ServerConfig::default(), Arc::new(TestHandler));
        let (ours, theirs) = tokio::io::duplex(4096);
        server.serve_stream(ours, "duplex");

        let (read_half, mut write_half) = tokio::io::split(theirs);
        write_half
            .write_all(b"{\"seq\":7,\"command\":\"echo\",\"payload\":null}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(READ_TIMEOUT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            Envelope::decode(line.as_bytes()).unwrap(),
            Envelope::new(7, "echoed", Value::Null)
        );
    }
}
