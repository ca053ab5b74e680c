//! Client role: one outbound connection to the host.
//!
//! Lifecycle: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! Sequence numbers start at 0 on every fresh connection and only grow.
//! Replies are matched to callers through the connection's [`Correlator`];
//! when the connection ends, callers still waiting observe
//! [`RpcError::Disconnected`].

use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, LineCodec};
use crate::bridge::correlator::{Continuation, Correlator, Response};
use crate::bridge::protocol::Envelope;
use crate::bridge::{join_host_port, send_envelope};
use crate::error::RpcError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// How long [`PendingReply::wait`] waits for a reply. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub max_frame_length: usize,
}

impl ClientConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            request_timeout: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Current state plus a counter bumped on every connect, so a reader task
/// from an older connection cannot overwrite the state of a newer one.
///
/// `cancel` belongs to the current connection and lives outside the
/// connection lock, so a send stuck on a full socket can be interrupted.
#[derive(Debug)]
struct StateCell {
    state: ClientState,
    generation: u64,
    cancel: Option<CancellationToken>,
}

type SharedState = Arc<StdMutex<StateCell>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, StateCell> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Connection {
    writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    next_seq: u64,
    generation: u64,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Tear the connection down without flushing: every successful send has
    /// already flushed, and a peer that stopped reading must not block this.
    /// Dropping the write half shuts down the socket's write side.
    fn close(self) {
        self.cancel.cancel();
        self.reader.abort();
        self.correlator.close();
        drop(self.writer);
    }
}

/// A request that has been sent and is waiting for the host's reply.
#[derive(Debug)]
pub struct PendingReply {
    seq: u64,
    rx: oneshot::Receiver<Response>,
    correlator: Arc<Correlator>,
    timeout: Option<Duration>,
}

impl PendingReply {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(self) -> Result<Response, RpcError> {
        let Self {
            seq,
            rx,
            correlator,
            timeout,
        } = self;

        let Some(limit) = timeout else {
            return rx.await.map_err(|_| RpcError::Disconnected);
        };

        match tokio::time::timeout(limit, rx).await {
            Ok(result) => result.map_err(|_| RpcError::Disconnected),
            Err(_) => {
                correlator.forget(seq);
                tracing::warn!(seq, timeout_ms = limit.as_millis() as u64, "RPC request timed out");
                Err(RpcError::Timeout {
                    seq,
                    millis: limit.as_millis(),
                })
            }
        }
    }
}

pub struct RpcClient {
    config: ClientConfig,
    connection: Mutex<Option<Connection>>,
    state: SharedState,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            state: Arc::new(StdMutex::new(StateCell {
                state: ClientState::Disconnected,
                generation: 0,
                cancel: None,
            })),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        lock_state(&self.state).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Open the connection to the host and start reading replies.
    ///
    /// An existing connection is closed and replaced.
    pub async fn connect(&self) -> Result<(), RpcError> {
        let cancel = CancellationToken::new();
        let generation = {
            let mut cell = lock_state(&self.state);
            if let Some(old) = cell.cancel.replace(cancel.clone()) {
                old.cancel();
            }
            cell.generation += 1;
            cell.state = ClientState::Connecting;
            cell.generation
        };

        let mut guard = self.connection.lock().await;
        if let Some(old) = guard.take() {
            tracing::warn!("Replacing existing host connection");
            old.close();
        }

        let addr = self.config.addr();
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(source) => {
                set_state_if_current(&self.state, generation, ClientState::Disconnected);
                return Err(RpcError::Connect { addr, source });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let max_frame_length = self.config.max_frame_length;
        let correlator = Arc::new(Correlator::new());

        // Connected must be set before the reader runs: a host that hangs up
        // at once makes the reader move the state to Disconnected.
        set_state_if_current(&self.state, generation, ClientState::Connected);
        let reader = tokio::spawn(read_replies(
            FramedRead::new(read_half, LineCodec::with_max_length(max_frame_length)),
            Arc::clone(&correlator),
            Arc::clone(&self.state),
            generation,
        ));

        *guard = Some(Connection {
            writer: FramedWrite::new(write_half, LineCodec::with_max_length(max_frame_length)),
            next_seq: 0,
            generation,
            correlator,
            cancel,
            reader,
        });

        tracing::debug!(%addr, "Connected to host");
        Ok(())
    }

    /// Close the connection. Safe to call when already disconnected.
    ///
    /// A send blocked on a host that stopped reading is interrupted with
    /// [`RpcError::Disconnected`] first, so this never waits on the socket.
    pub async fn disconnect(&self) {
        let cancel = {
            let mut cell = lock_state(&self.state);
            cell.generation += 1;
            cell.state = ClientState::Disconnected;
            cell.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.close();
            tracing::debug!("Disconnected from host");
        }
    }

    /// Send a request and return a handle for awaiting the host's reply.
    pub async fn execute(&self, command: &str, payload: Value) -> Result<PendingReply, RpcError> {
        let (tx, rx) = oneshot::channel();
        let (seq, correlator) = self.send(command, payload, Some(tx)).await?;
        Ok(PendingReply {
            seq,
            rx,
            correlator,
            timeout: self.config.request_timeout,
        })
    }

    /// Send a request without waiting for a reply. Any reply that does come
    /// back is dropped as an unknown sequence. Returns the sequence used.
    pub async fn execute_detached(&self, command: &str, payload: Value) -> Result<u64, RpcError> {
        let (seq, _) = self.send(command, payload, None).await?;
        Ok(seq)
    }

    /// Send a request and wait for its reply.
    pub async fn call(&self, command: &str, payload: Value) -> Result<Response, RpcError> {
        self.execute(command, payload).await?.wait().await
    }

    async fn send(
        &self,
        command: &str,
        payload: Value,
        continuation: Option<Continuation>,
    ) -> Result<(u64, Arc<Correlator>), RpcError> {
        if !self.is_connected() {
            return Err(RpcError::NotConnected);
        }

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(RpcError::NotConnected)?;

        // Consumed even if the write fails: a sequence number is never reused.
        let seq = connection.next_seq;
        connection.next_seq += 1;
        let envelope = Envelope::new(seq, command, payload);

        // Register before writing so a fast reply cannot miss its caller.
        if let Some(continuation) = continuation {
            connection.correlator.register(seq, continuation);
        }

        let cancel = connection.cancel.clone();
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Disconnected),
            result = send_envelope(&mut connection.writer, &envelope) => result,
        };

        if let Err(e) = written {
            connection.correlator.forget(seq);
            tracing::warn!(seq, command, error = %e, "Error sending RPC request");

            // The writer may still hold part of the frame. Unless the codec
            // rejected the frame before buffering it, the connection is unusable.
            if !is_rejected_frame(&e) {
                let generation = connection.generation;
                if let Some(connection) = guard.take() {
                    connection.close();
                }
                set_state_if_current(&self.state, generation, ClientState::Disconnected);
            }
            return Err(e);
        }

        tracing::debug!(seq, command, "RPC request sent");
        Ok((seq, Arc::clone(&connection.correlator)))
    }
}

fn is_rejected_frame(error: &RpcError) -> bool {
    match error {
        RpcError::Write(e) => e.kind() == io::ErrorKind::InvalidInput,
        RpcError::Protocol(_) => true,
        _ => false,
    }
}

fn set_state_if_current(state: &SharedState, generation: u64, next: ClientState) {
    let mut cell = lock_state(state);
    if cell.generation == generation {
        cell.state = next;
    }
}

async fn read_replies(
    mut reader: FramedRead<OwnedReadHalf, LineCodec>,
    correlator: Arc<Correlator>,
    state: SharedState,
    generation: u64,
) {
    loop {
        match reader.next().await {
            Some(Ok(frame)) => match Envelope::decode(&frame) {
                Ok(envelope) => {
                    tracing::trace!(seq = envelope.seq, command = %envelope.command, "RPC reply received");
                    correlator.resolve(envelope.seq, envelope.command, envelope.payload);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed RPC reply from host received, dropping");
                }
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Host connection read error");
                break;
            }
            None => {
                tracing::debug!("Host closed the connection");
                break;
            }
        }
    }

    set_state_if_current(&state, generation, ClientState::Disconnected);
    correlator.close();
}
