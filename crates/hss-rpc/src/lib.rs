//! hss-rpc: bidirectional RPC between a skill process and its host.
//!
//! Every skill is both a server (the host sends it `handle` requests) and a
//! client (it pushes `say`/`ask` requests back to the host). Both directions
//! share the same newline-delimited JSON envelope.

pub mod bridge;
pub mod client;
mod error;
pub mod handler;
pub mod server;

pub use bridge::correlator::Response;
pub use bridge::protocol::{DEFAULT_RESPONSE_COMMAND, Envelope};
pub use client::{ClientConfig, ClientState, PendingReply, RpcClient};
pub use error::{ProtocolError, RpcError};
pub use handler::{HandlerError, Reply, Request, RequestHandler, Responder};
pub use server::{RpcServer, ServerConfig};
