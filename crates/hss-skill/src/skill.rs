//! Skill runtime: wires a [`Skill`] to the skill server over both RPC roles.

use std::net::SocketAddr;
use std::sync::Arc;

use hss_rpc::{
    ClientConfig, HandlerError, PendingReply, ProtocolError, Reply, Request, RequestHandler,
    Responder, RpcClient, RpcError, RpcServer, ServerConfig,
};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use crate::command::SkillCommand;
use crate::config::{ConfigError, SkillArgs};
use crate::intent::{IntentRequest, SkillReply};

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    Failed(String),
}

impl SkillError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Application logic of a skill.
#[async_trait::async_trait]
pub trait Skill: Send + Sync + 'static {
    /// Names of the intents this skill wants routed to it.
    async fn intent_list(&self) -> Result<Vec<String>, SkillError>;

    /// Handle one intent. An error leaves the request unanswered.
    ///
    /// `host` may be used to push `say`/`ask` requests while handling.
    async fn handle(
        &self,
        intent: &IntentRequest,
        host: SkillHost,
    ) -> Result<SkillReply, SkillError>;
}

/// Handle for pushing requests to the skill server.
#[derive(Clone)]
pub struct SkillHost {
    client: Arc<RpcClient>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SayPayload<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lang: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AskPayload<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lang: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent_filter: Option<&'a [String]>,
}

impl SkillHost {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Speak `text`, on `site_id` when given.
    pub async fn say(
        &self,
        text: &str,
        site_id: Option<&str>,
        lang: Option<&str>,
    ) -> Result<PendingReply, RpcError> {
        let payload = to_payload(&SayPayload {
            text,
            site_id,
            lang,
        })?;
        self.client.execute("say", payload).await
    }

    /// Start a new dialogue with a question. The answer comes back to the
    /// skill as a `handle` request, restricted to `intent_filter` if given.
    pub async fn ask(
        &self,
        text: &str,
        lang: Option<&str>,
        site_id: Option<&str>,
        intent_filter: Option<&[String]>,
    ) -> Result<PendingReply, RpcError> {
        let payload = to_payload(&AskPayload {
            text,
            lang,
            site_id,
            intent_filter,
        })?;
        self.client.execute("ask", payload).await
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Result<Value, RpcError> {
    serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e).into())
}

/// Routes the skill server's commands to a [`Skill`].
pub struct SkillAdapter<S> {
    skill: S,
    host: SkillHost,
}

impl<S: Skill> SkillAdapter<S> {
    pub fn new(skill: S, host: SkillHost) -> Self {
        Self { skill, host }
    }

    pub fn skill(&self) -> &S {
        &self.skill
    }
}

#[async_trait::async_trait]
impl<S: Skill> RequestHandler for SkillAdapter<S> {
    async fn handle_request(&self, request: Request, responder: Responder) {
        let seq = request.seq;

        match SkillCommand::parse(&request.command, request.payload) {
            SkillCommand::GetIntentList => {
                let result = self
                    .skill
                    .intent_list()
                    .await
                    .map(|intents| Reply::new(Value::from(intents)))
                    .map_err(|e| HandlerError::new(e.to_string()));
                let _ = responder.respond(result).await;
            }
            SkillCommand::Handle(intent) => {
                tracing::debug!(seq, intent = %intent.intent_name, "Handling intent");
                let result = self
                    .skill
                    .handle(&intent, self.host.clone())
                    .await
                    .map(|reply| Reply::new(reply.to_payload(&intent)))
                    .map_err(|e| HandlerError::new(e.to_string()));
                let _ = responder.respond(result).await;
            }
            SkillCommand::MalformedIntent(e) => {
                tracing::error!(seq, "{e}");
                let _ = responder.reply(Reply::empty()).await;
            }
            SkillCommand::Unknown(command) => {
                tracing::error!(seq, "Unknown/invalid command \"{command}\" received, must skip");
                drop(responder);
            }
        }
    }
}

/// A running skill: its server is listening and its client is connected.
pub struct SkillRuntime<S: Skill> {
    server: RpcServer<SkillAdapter<S>>,
    host: SkillHost,
    server_addr: SocketAddr,
}

impl<S: Skill> SkillRuntime<S> {
    pub async fn start(skill: S, args: &SkillArgs) -> Result<Self, SkillError> {
        Self::start_with(skill, args.server_config(), args.client_config()).await
    }

    /// Start the RPC server, then connect to the skill server.
    pub async fn start_with(
        skill: S,
        server_config: ServerConfig,
        client_config: ClientConfig,
    ) -> Result<Self, SkillError> {
        let host = SkillHost::new(Arc::new(RpcClient::new(client_config)));
        let adapter = Arc::new(SkillAdapter::new(skill, host.clone()));
        let mut server = RpcServer::new(server_config, adapter);

        tracing::debug!("Starting RPC server ...");
        let server_addr = match server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start RPC server");
                return Err(e.into());
            }
        };

        tracing::debug!("Connecting to skill server ...");
        if let Err(e) = host.client().connect().await {
            tracing::error!(error = %e, "Failed to connect to skill server");
            server.shutdown();
            return Err(e.into());
        }

        tracing::debug!(%server_addr, "Running.");
        Ok(Self {
            server,
            host,
            server_addr,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn host(&self) -> &SkillHost {
        &self.host
    }

    /// Disconnect from the skill server and close the RPC server.
    pub async fn shutdown(mut self) {
        self.host.client().disconnect().await;
        self.server.shutdown();
    }
}

/// Run `skill` until SIGINT or SIGTERM.
pub async fn run<S: Skill>(skill: S, args: SkillArgs) -> Result<(), SkillError> {
    let span = tracing::info_span!("skill", name = %args.skill_name);

    async move {
        let runtime = SkillRuntime::start(skill, &args).await?;
        shutdown_signal().await;
        runtime.shutdown().await;
        Ok(())
    }
    .instrument(span)
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::debug!("SIGINT signal received."),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGINT handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::debug!("SIGTERM signal received.");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
