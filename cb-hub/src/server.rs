use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use agent_abi::{AgentMessage, CommandEnvelope};
use axum::{
    Json, Router,
    extract::{
        Path, Query, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::correlator::RequestCorrelator;
use crate::mode::{Mode, ModeController};
use crate::registry::{AgentChannel, ConnectionRegistry};
use crate::relay::RelayFacade;
use crate::replay::ReplayEngine;
use crate::store::BackupStore;

mod handlers;

use handlers::*;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub default_agent_id: String,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub replay_timeout_ms: u64,
    pub state_path: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_agent_id: "classroom-pi".to_string(),
            default_timeout_ms: 10_000,
            max_timeout_ms: 30_000,
            replay_timeout_ms: 5_000,
            state_path: None,
        }
    }
}

pub struct HubMetrics {
    started_at: Instant,
    commands_total: AtomicU64,
    backup_served_total: AtomicU64,
    agent_connects_total: AtomicU64,
    replayed_entries_total: AtomicU64,
    agent_replies_total: AtomicU64,
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            commands_total: AtomicU64::new(0),
            backup_served_total: AtomicU64::new(0),
            agent_connects_total: AtomicU64::new(0),
            replayed_entries_total: AtomicU64::new(0),
            agent_replies_total: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
pub struct HubState {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<RequestCorrelator>,
    mode: Arc<ModeController>,
    store: Arc<BackupStore>,
    replay: Arc<ReplayEngine>,
    facade: Arc<RelayFacade>,
    metrics: Arc<HubMetrics>,
    config: HubConfig,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let correlator = Arc::new(RequestCorrelator::new(registry.clone()));
        let mode = Arc::new(ModeController::default());
        let store = Arc::new(BackupStore::new(config.state_path.clone()));
        let replay = Arc::new(ReplayEngine::new(
            correlator.clone(),
            store.clone(),
            config.replay_timeout_ms,
        ));
        let facade = Arc::new(RelayFacade::new(
            correlator.clone(),
            mode.clone(),
            store.clone(),
        ));
        Self {
            registry,
            correlator,
            mode,
            store,
            replay,
            facade,
            metrics: Arc::new(HubMetrics::default()),
            config,
        }
    }

    fn resolve_agent_id(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.config.default_agent_id.as_str())
            .to_string()
    }

    fn clamp_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.config.default_timeout_ms)
            .min(self.config.max_timeout_ms)
            .max(1)
    }

    /// Relays one command and keeps the per-call counters honest.
    async fn relay(
        &self,
        agent_id: Option<&str>,
        command: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> crate::relay::CommandOutcome {
        let identity = self.resolve_agent_id(agent_id);
        let timeout_ms = self.clamp_timeout(timeout_ms);
        let outcome = self
            .facade
            .send_command(&identity, command, payload, timeout_ms)
            .await;
        self.metrics.commands_total.fetch_add(1, Ordering::Relaxed);
        if outcome.served_from_backup() {
            self.metrics
                .backup_served_total
                .fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }
}

pub fn build_hub_app(state: HubState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/rpc/v1/agent/ws", get(agent_ws_handler))
        .route("/api/status", get(status_handler))
        .route("/api/groups", get(get_groups_handler))
        .route("/api/students/{group_name}", get(get_students_handler))
        .route("/api/login", post(login_handler))
        .route("/api/admin/add_group", post(add_group_handler))
        .route("/api/admin/add_student", post(add_student_handler))
        .route("/api/journal/entry", post(add_journal_entry_handler))
        .route(
            "/api/teacher/topics",
            get(get_teacher_topics_handler).post(add_teacher_topic_handler),
        )
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

// ---- agent transport -------------------------------------------------

async fn agent_ws_handler(
    State(state): State<HubState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

/// One connected agent. The socket is split into a writer task fed from the
/// registry channel and a read loop feeding replies to the correlator.
async fn handle_agent_socket(socket: WebSocket, state: HubState) {
    let (mut sink, mut stream) = socket.split();

    // First frame must identify the agent.
    let (agent_id, agent_name) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<AgentMessage>(text.as_str()) {
                    Ok(AgentMessage::Hello {
                        agent_id,
                        agent_name,
                    }) => break (agent_id, agent_name),
                    Ok(other) => {
                        warn!(message = ?other, "agent sent frame before hello, closing");
                        return;
                    }
                    Err(err) => {
                        warn!(%err, "unparseable agent hello, closing");
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue,
        }
    };
    info!(
        agent_id = %agent_id,
        agent_name = agent_name.as_deref().unwrap_or(""),
        "agent connected"
    );
    state
        .metrics
        .agent_connects_total
        .fetch_add(1, Ordering::Relaxed);

    let (envelope_tx, mut envelope_rx) = mpsc::unbounded_channel::<CommandEnvelope>();
    let channel = AgentChannel::new(envelope_tx);
    let channel_id = channel.channel_id;
    state.registry.register(&agent_id, channel).await;

    let writer = tokio::spawn(async move {
        while let Some(envelope) = envelope_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Reconnect event: leave backup mode and drain the outbox. The drain
    // runs as its own task because its replies arrive through the read loop
    // below; entries queued by a previous process run are replayed even when
    // the mode never left NORMAL.
    state.mode.restore_normal(&agent_id).await;
    {
        let replay = state.replay.clone();
        let metrics = state.metrics.clone();
        let identity = agent_id.clone();
        tokio::spawn(async move {
            let replayed = replay.drain(&identity).await;
            metrics
                .replayed_entries_total
                .fetch_add(replayed as u64, Ordering::Relaxed);
        });
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<AgentMessage>(text.as_str()) {
                    Ok(AgentMessage::Reply {
                        correlation_id,
                        result,
                    }) => {
                        state
                            .metrics
                            .agent_replies_total
                            .fetch_add(1, Ordering::Relaxed);
                        state.correlator.complete(correlation_id, result).await;
                    }
                    Ok(AgentMessage::Hello { .. }) => {
                        // Duplicate hello on a live channel carries no news.
                    }
                    Err(err) => {
                        warn!(agent_id = %agent_id, %err, "dropping unparseable agent frame");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    // Only tear down the mapping if this connection is still the current
    // one; a superseding reconnect must keep its fresh channel. The mode is
    // left untouched: the next direct call trips BACKUP via NotConnected.
    state
        .registry
        .unregister_if_current(&agent_id, channel_id)
        .await;
    info!(agent_id = %agent_id, "agent disconnected");
}

// ---- shared handler plumbing -----------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct CommandQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    teacher_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    status: &'static str,
}

/// Pulls relay options out of a JSON command body. The remaining object is
/// forwarded to the agent as the command payload.
fn split_body_options(body: &mut Value) -> (Option<String>, Option<u64>) {
    let Some(object) = body.as_object_mut() else {
        return (None, None);
    };
    let agent_id = object
        .remove("agent_id")
        .and_then(|value| value.as_str().map(ToOwned::to_owned));
    let timeout_ms = object.remove("timeout_ms").and_then(|value| value.as_u64());
    (agent_id, timeout_ms)
}

async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if path != "/rpc/v1/agent/ws" {
        info!(
            method = %method,
            uri = %uri,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}
