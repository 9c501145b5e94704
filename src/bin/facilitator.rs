use agentmesh::{
    config::AppConfig,
    error::MarketError,
    hooks::{HookBus, HookErrorEvent, SettleEvent},
    logging::init_tracing,
    model::{PaymentAssertion, PaymentReceipt, TokenInfo},
    pricing::to_human_readable,
    settlement::PaymentRequirement,
    ChainId, JsonRpcProvider, PaymentLedger, PricingRegistry, SettlementService,
};
use alloy_primitives::B256;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "facilitator")]
#[command(about = "Verifies on-chain payments for paywalled routes and keeps settlement receipts")]
struct Args {
    #[arg(short, long, env = "AGENTMESH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Write a default config to `--config` and exit.
    #[arg(long)]
    init: bool,
}

#[derive(Clone)]
struct AppState {
    service: SettlementService,
    config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init {
        let path = args.config.unwrap_or_else(|| PathBuf::from("agentmesh.toml"));
        agentmesh::config::create_default_config_file(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;
    init_tracing(&config.logging);

    let pricing = PricingRegistry::new(config.token_table());
    pricing.add_from_config(config.pricing.chain_id, &config.pricing.routes)?;
    tracing::info!(routes = pricing.len(), "Loaded pricing rules");

    let provider = JsonRpcProvider::new(config.rpc_timeout())?;
    let ledger = PaymentLedger::new(Arc::new(provider), config.token_list());

    let hooks = HookBus::new();
    hooks.on_after_settle(|event: SettleEvent| async move {
        tracing::info!(
            request_id = %event.payment.request_id,
            resource = %event.payment.resource,
            success = event.success,
            transaction = ?event.transaction,
            "Settlement finished"
        );
        Ok(())
    });
    hooks.on_error(|event: HookErrorEvent| async move {
        tracing::warn!(channel = event.channel.as_str(), error = %event.error, "Payment hook failed");
        Ok(())
    });

    let app_state = AppState {
        service: SettlementService::new(Arc::new(pricing), Arc::new(ledger), Arc::new(hooks)),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/verify", post(verify_payment))
        .route("/settle", post(settle_payment))
        .route("/requirements", get(get_requirement))
        .route("/receipts", get(list_receipts))
        .route("/receipts/:payment_id", get(get_receipt))
        .route("/revenue", get(get_revenue))
        .route("/tokens/:symbol", get(get_token))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state);

    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "Facilitator listening");

    axum::serve(listener, app).await?;

    Ok(())
}

struct ApiError(MarketError);

impl From<MarketError> for ApiError {
    fn from(error: MarketError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MarketError::RouteNotPaywalled(_) | MarketError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            MarketError::InsufficientPayment { .. }
            | MarketError::TokenMismatch { .. }
            | MarketError::VerificationFailed(_) => StatusCode::PAYMENT_REQUIRED,
            MarketError::DuplicateReceipt(_) => StatusCode::CONFLICT,
            MarketError::InvalidPrice(_)
            | MarketError::InvalidAmount(_)
            | MarketError::InvalidAddress(_)
            | MarketError::InvalidInput(_)
            | MarketError::UnknownChain(_)
            | MarketError::Serialization(_) => StatusCode::BAD_REQUEST,
            MarketError::Network(_) | MarketError::Provider(_) | MarketError::Registry(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({"status": "error", "message": self.0.to_string()}))).into_response()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest {
    request_id: Option<String>,
    route: String,
    chain_id: Option<ChainId>,
    payment: PaymentAssertion,
}

impl PaymentRequest {
    fn request_id(&self) -> String {
        self.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

#[derive(Serialize)]
struct VerifyResponse {
    valid: bool,
}

async fn verify_payment(
    State(state): State<AppState>,
    Json(request): Json<PaymentRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let chain_id = request.chain_id.unwrap_or(state.config.pricing.chain_id);
    let chain = state.config.chain(chain_id).ok_or(MarketError::UnknownChain(chain_id))?;

    let valid = state
        .service
        .verify(&request.request_id(), &request.route, &request.payment, chain)
        .await?;
    Ok(Json(VerifyResponse { valid }))
}

async fn settle_payment(
    State(state): State<AppState>,
    Json(request): Json<PaymentRequest>,
) -> Result<(StatusCode, Json<PaymentReceipt>), ApiError> {
    let chain_id = request.chain_id.unwrap_or(state.config.pricing.chain_id);
    let chain = state.config.chain(chain_id).ok_or(MarketError::UnknownChain(chain_id))?;

    let receipt = state
        .service
        .settle(&request.request_id(), &request.route, &request.payment, chain)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Deserialize)]
struct RouteParam {
    route: Option<String>,
}

async fn get_requirement(
    State(state): State<AppState>,
    Query(params): Query<RouteParam>,
) -> Result<Json<PaymentRequirement>, ApiError> {
    let route = params
        .route
        .ok_or_else(|| MarketError::InvalidInput("missing route parameter".to_string()))?;
    Ok(Json(state.service.requirement(&route)?))
}

async fn list_receipts(
    State(state): State<AppState>,
    Query(params): Query<RouteParam>,
) -> Json<Vec<PaymentReceipt>> {
    let ledger = state.service.ledger();
    match params.route {
        Some(route) => Json(ledger.get_receipts_for_route(&route)),
        None => Json(ledger.receipts()),
    }
}

async fn get_receipt(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentReceipt>, StatusCode> {
    // Receipts are keyed by the `0x`-prefixed lower-case hash.
    let payment_id = match B256::from_str(payment_id.trim()) {
        Ok(hash) => format!("{:#x}", hash),
        Err(_) => payment_id.to_lowercase(),
    };
    state
        .service
        .ledger()
        .get_receipt(&payment_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RevenueResponse {
    route: Option<String>,
    amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    formatted: Option<String>,
}

async fn get_revenue(
    State(state): State<AppState>,
    Query(params): Query<RouteParam>,
) -> Result<Json<RevenueResponse>, ApiError> {
    let service = &state.service;
    let Some(route) = params.route else {
        return Ok(Json(RevenueResponse {
            route: None,
            amount: service.ledger().get_total_revenue().to_string(),
            formatted: None,
        }));
    };

    let amount = service.ledger().get_route_revenue(&route).to_string();
    let formatted = match service.pricing().get_rule(&route) {
        Some(rule) => Some(to_human_readable(&amount, rule.decimals)?),
        None => None,
    };
    Ok(Json(RevenueResponse { route: Some(route), amount, formatted }))
}

async fn get_token(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<TokenInfo>, StatusCode> {
    state
        .service
        .ledger()
        .find_token(&symbol)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "routes": state.service.pricing().len(),
        "receipts": state.service.ledger().receipt_count(),
    }))
}
