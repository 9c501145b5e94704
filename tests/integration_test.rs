use agentmesh::{
    chain::{ChainProvider, Log, TransactionReceipt, TRANSFER_TOPIC},
    config::AppConfig,
    discovery::{AgentRegistry, DiscoveryEngine},
    error::{MarketError, Result},
    hooks::{HookBus, HookChannel, HookErrorEvent, SettleEvent},
    model::{ChainConfig, DiscoveryQuery, PaymentAssertion, RegistrationFile, RegistryEntry, ServiceEntry, TokenInfo},
    pricing::{to_human_readable, to_smallest_unit, PricingRegistry, RouteConfig, TokenTable},
    trust::ReputationOracle,
    AgentId, PaymentLedger, SettlementService,
};
use alloy_primitives::{address, Address, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

const USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
const PAYER: Address = address!("1111111111111111111111111111111111111111");
const PAYEE: Address = address!("2222222222222222222222222222222222222222");

struct FakeRegistry {
    entries: Vec<RegistryEntry>,
}

#[async_trait]
impl AgentRegistry for FakeRegistry {
    async fn find_agents_by_service(&self, service_type: &str, limit: usize) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| {
                e.registration
                    .as_ref()
                    .is_some_and(|r| r.services.iter().any(|s| s.name == service_type))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.iter().find(|e| e.agent_id == agent_id).cloned())
    }
}

struct FakeReputation {
    scores: HashMap<AgentId, f64>,
}

#[async_trait]
impl ReputationOracle for FakeReputation {
    async fn get_average_score(&self, agent_id: AgentId) -> Result<f64> {
        self.scores.get(&agent_id).copied().ok_or(MarketError::Reputation {
            agent_id,
            reason: "oracle unreachable".to_string(),
        })
    }
}

/// Serves one successful receipt per known transaction hash.
#[derive(Default)]
struct FakeChain {
    transfers: Mutex<HashMap<B256, (Address, Address, U256)>>,
    calls: AtomicUsize,
}

impl FakeChain {
    fn with_transfer(self, tx_hash: B256, from: Address, to: Address, value: u64) -> Self {
        self.transfers.lock().insert(tx_hash, (from, to, U256::from(value)));
        self
    }
}

#[async_trait]
impl ChainProvider for FakeChain {
    async fn transaction_receipt(&self, _chain: &ChainConfig, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let transfers = self.transfers.lock();
        Ok(transfers.get(&tx_hash).map(|(from, to, value)| TransactionReceipt {
            transaction_hash: tx_hash,
            status: Some("0x1".to_string()),
            logs: vec![Log {
                address: USDC,
                topics: vec![TRANSFER_TOPIC, from.into_word(), to.into_word()],
                data: format!("0x{}", hex::encode(value.to_be_bytes::<32>())),
            }],
        }))
    }
}

fn registered(agent_id: AgentId, x402: bool, trust: &[&str]) -> RegistryEntry {
    RegistryEntry {
        agent_id,
        owner: format!("0x{:040x}", agent_id),
        registration: Some(RegistrationFile {
            schema_type: "https://eips.ethereum.org/EIPS/eip-8004#registration-v1".to_string(),
            name: format!("agent-{}", agent_id),
            description: "integration agent".to_string(),
            services: vec![ServiceEntry {
                name: "A2A".to_string(),
                endpoint: format!("https://agent-{}.example", agent_id),
                version: None,
            }],
            x402_support: x402,
            supported_trust: trust.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }),
    }
}

fn base() -> ChainConfig {
    ChainConfig {
        chain_id: 8453,
        name: "base".to_string(),
        rpc_url: "http://localhost:8545".to_string(),
    }
}

fn tx(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}

fn assertion(tx_hash: B256, amount: &str) -> PaymentAssertion {
    PaymentAssertion {
        tx_hash: tx_hash.to_string(),
        payer: PAYER.to_string(),
        payee: PAYEE.to_string(),
        token: USDC.to_string(),
        amount: amount.to_string(),
    }
}

fn settlement(chain: FakeChain) -> SettlementService {
    let pricing = PricingRegistry::new(TokenTable::with_defaults());
    let mut routes: HashMap<String, RouteConfig> = HashMap::new();
    routes.insert(
        "/api/v1/coins".to_string(),
        serde_json::from_value(serde_json::json!({"price": "$0.001", "token": "USDC"})).unwrap(),
    );
    routes.insert(
        "/api/v1/news".to_string(),
        serde_json::from_value(serde_json::json!({"price": "0.01", "token": "USDC"})).unwrap(),
    );
    pricing.add_from_config(8453, &routes).unwrap();

    let ledger = PaymentLedger::new(Arc::new(chain), TokenTable::with_defaults().entries().to_vec());
    SettlementService::new(Arc::new(pricing), Arc::new(ledger), Arc::new(HookBus::new()))
}

#[tokio::test]
async fn test_discovery_filters_fail_closed() -> Result<()> {
    let registry = FakeRegistry {
        entries: vec![
            registered(1, true, &["reputation", "crypto-economic"]),
            registered(2, false, &["reputation"]),
            registered(3, true, &["reputation"]),
            registered(4, true, &["reputation"]),
            registered(5, true, &["tee-attestation"]),
        ],
    };
    // Agent 3 has no score: the oracle fails for it.
    let reputation = FakeReputation {
        scores: HashMap::from([(1, 91.0), (2, 99.0), (4, 40.0), (5, 88.0)]),
    };
    let engine = DiscoveryEngine::new(Arc::new(registry), Arc::new(reputation));

    let query = DiscoveryQuery::new(8453)
        .x402_only()
        .min_reputation(50.0)
        .trust_models(["reputation"]);
    let agents = engine.discover(&query).await;

    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, 1);
    assert_eq!(agents[0].reputation, Some(91.0));
    assert_eq!(agents[0].endpoint.as_deref(), Some("https://agent-1.example"));
    assert_eq!(agents[0].chain_id, 8453);

    let unfiltered = engine.discover(&DiscoveryQuery::new(8453).max_results(3)).await;
    let ids: Vec<AgentId> = unfiltered.iter().map(|a| a.agent_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(unfiltered.iter().all(|a| a.reputation.is_none()));

    assert!(engine.discover(&DiscoveryQuery::new(8453).max_results(0)).await.is_empty());
    assert!(engine.discover(&DiscoveryQuery::new(8453).service("MCP")).await.is_empty());

    let single = engine.get_agent(4, 84532).await?.unwrap();
    assert_eq!(single.chain_id, 84532);
    assert_eq!(single.reputation, Some(40.0));
    assert!(engine.get_agent(42, 8453).await?.is_none());

    Ok(())
}

#[test]
fn test_discovery_query_from_json() {
    let query: DiscoveryQuery = serde_json::from_value(serde_json::json!({
        "chain": 8453,
        "minReputation": 75.5,
        "x402Only": true,
        "trustModels": ["reputation"]
    }))
    .unwrap();

    assert_eq!(query.chain_id, 8453);
    assert_eq!(query.max_results, 50);
    assert_eq!(query.min_reputation, Some(75.5));
    assert!(query.x402_only);
    assert!(query.service.is_none());
}

#[test]
fn test_pricing_conversions() {
    assert_eq!(to_smallest_unit("$0.001", 6).unwrap(), "1000");
    assert_eq!(to_smallest_unit("1.5", 18).unwrap(), "1500000000000000000");
    assert_eq!(to_smallest_unit("0.0011", 2).unwrap(), "0");
    assert_eq!(to_human_readable("1500000", 6).unwrap(), "1.5");
    assert_err!(to_smallest_unit("one dollar", 6));

    let service = settlement(FakeChain::default());
    let pricing = service.pricing();
    assert_eq!(pricing.routes(), vec!["api/v1/coins".to_string(), "api/v1/news".to_string()]);
    assert!(pricing.is_paywalled("/API/V1/NEWS"));
    assert!(!pricing.is_paywalled("/api/v1/free"));
    assert_eq!(pricing.required_amount("api/v1/news").unwrap(), Some(U256::from(10_000u64)));

    let requirement = assert_ok!(service.requirement("/api/v1/coins"));
    assert_eq!(requirement.amount, "1000");
    assert_eq!(requirement.decimals, 6);
    assert_eq!(requirement.token_address, Some(USDC));
}

#[tokio::test]
async fn test_settlement_flow_with_hooks() -> Result<()> {
    let chain = FakeChain::default()
        .with_transfer(tx(0xaa), PAYER, PAYEE, 1_000)
        .with_transfer(tx(0xbb), PAYER, PAYEE, 25_000);
    let service = settlement(chain);

    let errors = Arc::new(Mutex::new(Vec::<HookErrorEvent>::new()));
    let settled = Arc::new(Mutex::new(Vec::<SettleEvent>::new()));

    service.hooks().on_after_settle(|_| async { Err::<(), _>(anyhow::anyhow!("webhook down")) });
    let s = settled.clone();
    service.hooks().on_after_settle(move |event| {
        let s = s.clone();
        async move {
            s.lock().push(event);
            Ok(())
        }
    });
    let e = errors.clone();
    service.hooks().on_error(move |event| {
        let e = e.clone();
        async move {
            e.lock().push(event);
            Ok(())
        }
    });

    let first = service.settle("req-1", "/api/v1/coins", &assertion(tx(0xaa), "1000"), &base()).await?;
    assert_eq!(first.payment_id, tx(0xaa).to_string().to_lowercase());
    assert!(first.outcome.success);
    assert_eq!(first.outcome.network, "base");

    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].channel, HookChannel::AfterSettle);
        assert!(errors[0].error.contains("webhook down"));
    }
    {
        let settled = settled.lock();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].payment.request_id, "req-1");
        assert_eq!(settled[0].transaction.as_deref(), Some(first.payment_id.as_str()));
    }

    service.settle("req-2", "/api/v1/news", &assertion(tx(0xbb), "20000"), &base()).await?;

    let ledger = service.ledger();
    assert_eq!(ledger.receipt_count(), 2);
    assert_eq!(ledger.get_route_revenue("/api/v1/coins"), U256::from(1_000u64));
    assert_eq!(ledger.get_route_revenue("api/v1/news"), U256::from(20_000u64));
    assert_eq!(ledger.get_total_revenue(), U256::from(21_000u64));
    assert_eq!(ledger.get_receipts_for_route("/api/v1/news").len(), 1);
    assert!(ledger.get_receipt(&first.payment_id).is_some());

    let replay = service.settle("req-3", "/api/v1/coins", &assertion(tx(0xaa), "1000"), &base()).await;
    assert!(matches!(replay, Err(MarketError::DuplicateReceipt(_))));
    assert_eq!(ledger.get_total_revenue(), U256::from(21_000u64));

    Ok(())
}

#[tokio::test]
async fn test_unverifiable_payments_are_not_recorded() -> Result<()> {
    let chain = FakeChain::default().with_transfer(tx(0x01), PAYER, PAYEE, 999);
    let service = settlement(chain);

    // Transfer is smaller than the claimed amount.
    let short = service.settle("r", "/api/v1/coins", &assertion(tx(0x01), "1000"), &base()).await;
    assert!(matches!(short, Err(MarketError::VerificationFailed(_))));

    // Unknown transaction.
    assert!(!service.verify("r", "/api/v1/coins", &assertion(tx(0x02), "1000"), &base()).await?);

    // No hash at all is a plain `false`, without asking the chain.
    let mut no_hash = assertion(tx(0x01), "1000");
    no_hash.tx_hash = String::new();
    assert!(!service.ledger().verify_on_chain_payment(&no_hash, &base()).await?);

    assert_eq!(service.ledger().receipt_count(), 0);
    assert_eq!(service.ledger().get_total_revenue(), U256::ZERO);
    Ok(())
}

#[tokio::test]
async fn test_verify_counts_chain_lookups() -> Result<()> {
    let chain = Arc::new(FakeChain::default().with_transfer(tx(0x0c), PAYER, PAYEE, 5_000));
    let ledger = PaymentLedger::new(
        chain.clone(),
        vec![TokenInfo { symbol: "USDC".to_string(), address: USDC, decimals: 6, chain_id: 8453 }],
    );

    assert!(ledger.verify_on_chain_payment(&assertion(tx(0x0c), "5000"), &base()).await?);
    assert!(!ledger.verify_on_chain_payment(&assertion(tx(0x0c), "5001"), &base()).await?);
    assert_eq!(chain.calls.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.find_token("usdc").map(|t| t.decimals), Some(6));
    Ok(())
}

#[test]
fn test_configuration_loading() -> Result<()> {
    let temp_file = NamedTempFile::new()?;
    std::fs::write(
        temp_file.path(),
        r#"
[server]
host = "0.0.0.0"
port = 9402

[discovery]
default_service = "MCP"

[pricing]
chain_id = 8453

[pricing.routes."/api/v1/premium"]
price = "$2.50"
token = "USDC"
"#,
    )?;

    let config = AppConfig::load(temp_file.path())?;
    config.validate()?;
    assert_eq!(config.get_server_address(), "0.0.0.0:9402");
    assert_eq!(config.discovery.default_service, "MCP");
    assert_eq!(config.discovery.default_max_results, 50);

    let pricing = PricingRegistry::new(config.token_table());
    pricing.add_from_config(config.pricing.chain_id, &config.pricing.routes)?;
    let rule = pricing.get_rule("api/v1/premium").unwrap();
    assert_eq!(rule.decimals, 6);
    assert_eq!(rule.token_address, Some(USDC));
    assert_eq!(pricing.required_amount("/api/v1/premium")?, Some(U256::from(2_500_000u64)));

    Ok(())
}
