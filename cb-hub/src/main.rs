use std::{env, net::SocketAddr};

use hub::{HubConfig, HubState, build_hub_app};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let addr = parse_addr("HUB_ADDR", "0.0.0.0:9200")?;
    let config = HubConfig {
        default_agent_id: parse_string("HUB_DEFAULT_AGENT_ID", "classroom-pi"),
        default_timeout_ms: parse_u64("HUB_DEFAULT_TIMEOUT_MS", 10_000)?,
        max_timeout_ms: parse_u64("HUB_MAX_TIMEOUT_MS", 30_000)?,
        replay_timeout_ms: parse_u64("HUB_REPLAY_TIMEOUT_MS", 5_000)?,
        state_path: parse_state_path("HUB_STATE_PATH", ".cb-hub/state.json"),
    };

    let state = HubState::new(config);
    let app = build_hub_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("hub listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(value.parse()?)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_state_path(key: &str, default: &str) -> Option<std::path::PathBuf> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(std::path::PathBuf::from(trimmed))
    }
}
