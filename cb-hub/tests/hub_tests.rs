use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use hub::{AgentMessage, CommandEnvelope, CommandResult, HubConfig, HubState, build_hub_app};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_hub(config: HubConfig) -> (SocketAddr, JoinHandle<()>) {
    let state = HubState::new(config);
    let app = build_hub_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("hub should run");
    });
    (addr, handle)
}

async fn connect_agent(addr: SocketAddr, agent_id: &str) -> AgentSocket {
    let (mut socket, _) = connect_async(format!("ws://{addr}/rpc/v1/agent/ws"))
        .await
        .expect("agent should connect");
    let hello = json!({"type": "hello", "agent_id": agent_id, "agent_name": "test agent"});
    socket
        .send(Message::text(hello.to_string()))
        .await
        .expect("hello should send");
    socket
}

/// Answers every envelope with `respond` until the socket closes.
fn spawn_scripted_agent(
    mut socket: AgentSocket,
    respond: impl Fn(&CommandEnvelope) -> CommandResult + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(frame)) = socket.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(envelope) = serde_json::from_str::<CommandEnvelope>(text.as_str()) else {
                continue;
            };
            let reply = AgentMessage::Reply {
                correlation_id: envelope.correlation_id,
                result: respond(&envelope),
            };
            let text = serde_json::to_string(&reply).expect("reply should serialize");
            if socket.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    })
}

async fn wait_for_status(
    client: &reqwest::Client,
    addr: SocketAddr,
    predicate: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = client
            .get(format!("http://{addr}/api/status"))
            .send()
            .await
            .expect("status request should complete")
            .json::<Value>()
            .await
            .expect("status body should decode");
        if predicate(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "status predicate never held: {status}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn connected_agent_answers_reads_with_backup_mode_false() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    let socket = connect_agent(addr, "classroom-pi").await;
    let agent = spawn_scripted_agent(socket, |envelope| match envelope.command.as_str() {
        "get_groups" => CommandResult::success(Some(json!([
            {"name": "1П1", "course": "1 Курс"},
            {"name": "2П1", "course": "2 Курс"}
        ]))),
        _ => CommandResult::error("unexpected command"),
    });
    wait_for_status(&client, addr, |status| {
        status["agent_connected"] == json!(true)
    })
    .await;

    let body = client
        .get(format!("http://{addr}/api/groups"))
        .send()
        .await
        .expect("groups request should complete")
        .json::<Value>()
        .await
        .expect("groups body should decode");

    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["backup_mode"], json!(false));
    assert_eq!(body["data"][0]["name"], json!("1П1"));
    assert_eq!(body["data"][1]["name"], json!("2П1"));

    agent.abort();
    handle.abort();
}

#[tokio::test]
async fn disconnected_agent_serves_reads_from_backup_without_blocking() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let body = client
        .get(format!("http://{addr}/api/groups?timeout_ms=20000"))
        .send()
        .await
        .expect("groups request should complete")
        .json::<Value>()
        .await
        .expect("groups body should decode");

    // NotConnected is a fast failure; the caller must not wait out the
    // requested timeout before the fallback kicks in.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["backup_mode"], json!(true));
    assert!(body["data"].as_array().is_some_and(|data| !data.is_empty()));

    let status = wait_for_status(&client, addr, |_| true).await;
    assert_eq!(status["backup_mode"], json!(true));
    assert_eq!(status["agent_connected"], json!(false));

    handle.abort();
}

#[tokio::test]
async fn backup_mutation_is_acknowledged_and_queued() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    let body = client
        .post(format!("http://{addr}/api/admin/add_group"))
        .json(&json!({"group_name": "1П9", "course": "1 Курс"}))
        .send()
        .await
        .expect("add_group request should complete")
        .json::<Value>()
        .await
        .expect("add_group body should decode");
    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["backup_mode"], json!(true));

    let status = wait_for_status(&client, addr, |_| true).await;
    assert_eq!(status["pending_sync_count"], json!(1));

    // The queued group is immediately visible to backup reads.
    let groups = client
        .get(format!("http://{addr}/api/groups"))
        .send()
        .await
        .expect("groups request should complete")
        .json::<Value>()
        .await
        .expect("groups body should decode");
    let names = groups["data"]
        .as_array()
        .expect("data should be an array")
        .iter()
        .map(|group| group["name"].as_str().unwrap_or("").to_string())
        .collect::<Vec<_>>();
    assert!(names.contains(&"1П9".to_string()));

    handle.abort();
}

#[tokio::test]
async fn unresponsive_agent_trips_backup_mode_on_timeout() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    // Connect an agent that swallows every command.
    let mut socket = connect_agent(addr, "classroom-pi").await;
    let silent = tokio::spawn(async move { while socket.next().await.is_some() {} });
    wait_for_status(&client, addr, |status| {
        status["agent_connected"] == json!(true)
    })
    .await;

    let body = client
        .post(format!("http://{addr}/api/journal/entry"))
        .json(&json!({
            "timeout_ms": 200,
            "date": "2024-05-20",
            "student_name": "Иванов Алексей",
            "group_name": "1П1",
            "subject": "Русский язык",
            "topic": "Причастия",
            "grade": 5,
            "teacher_id": "teacher_001"
        }))
        .send()
        .await
        .expect("journal request should complete")
        .json::<Value>()
        .await
        .expect("journal body should decode");

    // Timeout tripped the mode and the same call was absorbed locally.
    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["backup_mode"], json!(true));

    let status = wait_for_status(&client, addr, |_| true).await;
    assert_eq!(status["backup_mode"], json!(true));
    assert_eq!(status["pending_sync_count"], json!(1));

    silent.abort();
    handle.abort();
}

#[tokio::test]
async fn concurrent_reads_receive_their_own_responses() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    // Buffer two envelopes, then answer them in reverse arrival order so
    // correlation ids are the only thing keeping callers and replies paired.
    let mut socket = connect_agent(addr, "classroom-pi").await;
    let agent = tokio::spawn(async move {
        let mut envelopes = Vec::new();
        while envelopes.len() < 2 {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = serde_json::from_str::<CommandEnvelope>(text.as_str())
                        .expect("envelope should parse");
                    envelopes.push(envelope);
                }
                Some(Ok(_)) => continue,
                _ => return,
            }
        }
        for envelope in envelopes.into_iter().rev() {
            let group = envelope.payload["group_name"].clone();
            let reply = AgentMessage::Reply {
                correlation_id: envelope.correlation_id,
                result: CommandResult::success(Some(json!([{ "group_name": group }]))),
            };
            socket
                .send(Message::text(
                    serde_json::to_string(&reply).expect("reply should serialize"),
                ))
                .await
                .expect("reply should send");
        }
    });
    wait_for_status(&client, addr, |status| {
        status["agent_connected"] == json!(true)
    })
    .await;

    let first = client.get(format!("http://{addr}/api/students/1П1"));
    let second = client.get(format!("http://{addr}/api/students/2П1"));
    let (first, second) = tokio::join!(first.send(), second.send());
    let first = first
        .expect("first request should complete")
        .json::<Value>()
        .await
        .expect("first body should decode");
    let second = second
        .expect("second request should complete")
        .json::<Value>()
        .await
        .expect("second body should decode");

    assert_eq!(first["data"][0]["group_name"], json!("1П1"));
    assert_eq!(second["data"][0]["group_name"], json!("2П1"));

    agent.await.expect("agent task should finish");
    handle.abort();
}

#[tokio::test]
async fn backup_login_and_unsupported_command() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    let login = client
        .post(format!("http://{addr}/api/login"))
        .json(&json!({"teacher_id": "teacher_001", "password": "changeme"}))
        .send()
        .await
        .expect("login request should complete")
        .json::<Value>()
        .await
        .expect("login body should decode");
    assert_eq!(login["status"], json!("success"));
    assert_eq!(login["backup_mode"], json!(true));
    assert_eq!(login["data"]["teacher"]["id"], json!("teacher_001"));

    let topics = client
        .post(format!("http://{addr}/api/teacher/topics"))
        .json(&json!({"teacher_id": "teacher_001", "topic": "Деепричастия"}))
        .send()
        .await
        .expect("topics request should complete")
        .json::<Value>()
        .await
        .expect("topics body should decode");
    assert_eq!(topics["status"], json!("error"));
    assert_eq!(topics["backup_mode"], json!(true));

    handle.abort();
}

#[tokio::test]
async fn healthz_and_metrics_respond() {
    let (addr, handle) = spawn_hub(HubConfig::default()).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .expect("healthz request should complete");
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    client
        .get(format!("http://{addr}/api/groups"))
        .send()
        .await
        .expect("groups request should complete");

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics request should complete")
        .text()
        .await
        .expect("metrics body should decode");
    assert!(metrics.contains("cb_hub_commands_total 1"));
    assert!(metrics.contains("cb_hub_backup_served_total 1"));

    handle.abort();
}
