use agentmesh::{
    config::AppConfig,
    discovery::{DiscoveryEngine, HttpAgentRegistry},
    error::MarketError,
    logging::init_tracing,
    model::{DiscoveredAgent, DiscoveryQuery},
    trust::HttpReputationOracle,
    AgentId, ChainId,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Parser)]
#[command(name = "discovery")]
#[command(about = "Agent discovery service over an ERC-8004 registry")]
struct Args {
    #[arg(short, long, env = "AGENTMESH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, env = "REGISTRY_ENDPOINT")]
    registry_endpoint: Option<String>,

    #[arg(long, env = "REPUTATION_ENDPOINT")]
    reputation_endpoint: Option<String>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<DiscoveryEngine>,
    default_chain: ChainId,
    default_max_results: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(endpoint) = args.registry_endpoint {
        config.registry.endpoint = endpoint;
    }
    if let Some(endpoint) = args.reputation_endpoint {
        config.reputation.endpoint = endpoint;
    }
    config.validate()?;
    init_tracing(&config.logging);

    let registry = HttpAgentRegistry::new(config.registry.endpoint.clone(), config.registry_timeout())?;
    let reputation = HttpReputationOracle::new(config.reputation.endpoint.clone(), config.reputation_timeout())?;
    let engine = DiscoveryEngine::new(Arc::new(registry), Arc::new(reputation))
        .with_default_service(config.discovery.default_service.clone())
        .with_card_timeout(config.card_timeout());

    let app_state = AppState {
        engine: Arc::new(engine),
        default_chain: config.discovery.default_chain_id,
        default_max_results: config.discovery.default_max_results,
    };

    let app = Router::new()
        .route("/discover", post(discover))
        .route("/agents/:agent_id", get(get_agent))
        .route("/agents/:agent_id/card", get(get_agent_card))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "Discovery service listening");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn discover(
    State(state): State<AppState>,
    Json(mut raw): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<Vec<DiscoveredAgent>>, (StatusCode, Json<serde_json::Value>)> {
    if !raw.contains_key("chainId") && !raw.contains_key("chain") {
        raw.insert("chainId".to_string(), state.default_chain.into());
    }
    raw.entry("maxResults").or_insert_with(|| state.default_max_results.into());

    let query: DiscoveryQuery = serde_json::from_value(serde_json::Value::Object(raw)).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"status": "error", "message": e.to_string()})),
        )
    })?;

    Ok(Json(state.engine.discover(&query).await))
}

#[derive(Deserialize)]
struct ChainParam {
    chain: Option<ChainId>,
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
    Query(params): Query<ChainParam>,
) -> Result<Json<DiscoveredAgent>, StatusCode> {
    let chain_id = params.chain.unwrap_or(state.default_chain);
    match state.engine.get_agent(agent_id, chain_id).await {
        Ok(Some(agent)) => Ok(Json(agent)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get agent {}: {}", agent_id, e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn get_agent_card(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
) -> Result<Json<agentmesh::AgentCard>, StatusCode> {
    let agent = match state.engine.get_agent(agent_id, state.default_chain).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get agent {}: {}", agent_id, e);
            return Err(StatusCode::BAD_GATEWAY);
        }
    };
    let endpoint = agent.endpoint.ok_or(StatusCode::NOT_FOUND)?;

    match state.engine.fetch_agent_card(&endpoint).await {
        Ok(Some(card)) => Ok(Json(card)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(MarketError::InvalidInput(reason)) => {
            tracing::warn!(agent_id, %reason, "Agent advertises an unusable endpoint");
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(e) => {
            tracing::error!("Failed to fetch agent card: {}", e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}
