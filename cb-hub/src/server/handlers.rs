use super::*;

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

pub(super) async fn metrics_handler(State(state): State<HubState>) -> impl IntoResponse {
    let connected_agents = state.registry.connected_count().await;
    let pending_outbox = state.store.pending_outbox_count().await;
    let metrics = format!(
        concat!(
            "cb_hub_uptime_seconds {}\n",
            "cb_hub_connected_agents {}\n",
            "cb_hub_pending_outbox_entries {}\n",
            "cb_hub_commands_total {}\n",
            "cb_hub_backup_served_total {}\n",
            "cb_hub_agent_connects_total {}\n",
            "cb_hub_agent_replies_total {}\n",
            "cb_hub_replayed_entries_total {}\n"
        ),
        state.metrics.started_at.elapsed().as_secs(),
        connected_agents,
        pending_outbox,
        state.metrics.commands_total.load(Ordering::Relaxed),
        state.metrics.backup_served_total.load(Ordering::Relaxed),
        state.metrics.agent_connects_total.load(Ordering::Relaxed),
        state.metrics.agent_replies_total.load(Ordering::Relaxed),
        state.metrics.replayed_entries_total.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
}

#[derive(Serialize)]
pub(super) struct HubStatusResponse {
    pub status: &'static str,
    pub agent_connected: bool,
    pub backup_mode: bool,
    pub pending_sync_count: usize,
}

pub(super) async fn status_handler(
    State(state): State<HubState>,
    Query(query): Query<CommandQuery>,
) -> Json<HubStatusResponse> {
    let identity = state.resolve_agent_id(query.agent_id.as_deref());
    let backup_mode = state.mode.mode(&identity).await == Mode::Backup;
    Json(HubStatusResponse {
        status: "success",
        agent_connected: state.registry.is_connected(&identity).await && !backup_mode,
        backup_mode,
        pending_sync_count: state.store.pending_outbox_count().await,
    })
}

pub(super) async fn get_groups_handler(
    State(state): State<HubState>,
    Query(query): Query<CommandQuery>,
) -> Json<crate::relay::CommandOutcome> {
    let outcome = state
        .relay(
            query.agent_id.as_deref(),
            agent_abi::CMD_GET_GROUPS,
            serde_json::json!({}),
            query.timeout_ms,
        )
        .await;
    Json(outcome)
}

pub(super) async fn get_students_handler(
    State(state): State<HubState>,
    Path(group_name): Path<String>,
    Query(query): Query<CommandQuery>,
) -> Json<crate::relay::CommandOutcome> {
    let outcome = state
        .relay(
            query.agent_id.as_deref(),
            agent_abi::CMD_GET_STUDENTS,
            serde_json::json!({ "group_name": group_name }),
            query.timeout_ms,
        )
        .await;
    Json(outcome)
}

pub(super) async fn login_handler(
    State(state): State<HubState>,
    Json(mut body): Json<Value>,
) -> Json<crate::relay::CommandOutcome> {
    let (agent_id, timeout_ms) = split_body_options(&mut body);
    let outcome = state
        .relay(agent_id.as_deref(), agent_abi::CMD_LOGIN, body, timeout_ms)
        .await;
    Json(outcome)
}

pub(super) async fn add_group_handler(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Json<crate::relay::CommandOutcome> {
    relay_body_command(state, agent_abi::CMD_ADD_GROUP, body).await
}

pub(super) async fn add_student_handler(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Json<crate::relay::CommandOutcome> {
    relay_body_command(state, agent_abi::CMD_ADD_STUDENT, body).await
}

pub(super) async fn add_journal_entry_handler(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Json<crate::relay::CommandOutcome> {
    relay_body_command(state, agent_abi::CMD_ADD_JOURNAL_ENTRY, body).await
}

pub(super) async fn get_teacher_topics_handler(
    State(state): State<HubState>,
    Query(query): Query<CommandQuery>,
) -> Json<crate::relay::CommandOutcome> {
    let payload = serde_json::json!({
        "teacher_id": query.teacher_id.as_deref().unwrap_or(""),
        "subject": query.subject.as_deref().unwrap_or("Русский язык"),
    });
    let outcome = state
        .relay(
            query.agent_id.as_deref(),
            agent_abi::CMD_GET_TEACHER_TOPICS,
            payload,
            query.timeout_ms,
        )
        .await;
    Json(outcome)
}

pub(super) async fn add_teacher_topic_handler(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Json<crate::relay::CommandOutcome> {
    relay_body_command(state, agent_abi::CMD_ADD_TEACHER_TOPIC, body).await
}

async fn relay_body_command(
    state: HubState,
    command: &str,
    mut body: Value,
) -> Json<crate::relay::CommandOutcome> {
    let (agent_id, timeout_ms) = split_body_options(&mut body);
    let outcome = state
        .relay(agent_id.as_deref(), command, body, timeout_ms)
        .await;
    Json(outcome)
}
