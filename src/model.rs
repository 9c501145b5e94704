use crate::{AgentId, ChainId, MarketError, Result};
use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Service type used as the base discovery surface when a query names none.
pub const DEFAULT_SERVICE_TYPE: &str = "A2A";

pub const DEFAULT_MAX_RESULTS: usize = 50;

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryQuery {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub min_reputation: Option<f64>,
    #[serde(alias = "chain")]
    pub chain_id: ChainId,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub x402_only: bool,
    #[serde(default)]
    pub trust_models: Vec<String>,
    /// Attach reputation scores even when no minimum is requested.
    #[serde(default)]
    pub include_reputation: bool,
}

impl DiscoveryQuery {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            service: None,
            min_reputation: None,
            chain_id,
            max_results: DEFAULT_MAX_RESULTS,
            x402_only: false,
            trust_models: Vec::new(),
            include_reputation: false,
        }
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn min_reputation(mut self, min: f64) -> Self {
        self.min_reputation = Some(min);
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }

    pub fn x402_only(mut self) -> Self {
        self.x402_only = true;
        self
    }

    pub fn trust_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trust_models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_reputation(mut self) -> Self {
        self.include_reputation = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentService {
    pub service_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredAgent {
    pub agent_id: AgentId,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub chain_id: ChainId,
    pub endpoint: Option<String>,
    pub reputation: Option<f64>,
    pub x402_support: bool,
    pub services: Vec<AgentService>,
    pub trust_models: Vec<String>,
}

/// ERC-8004 registration payload as published by an agent owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistrationFile {
    #[serde(rename = "type", default)]
    pub schema_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, alias = "endpoints")]
    pub services: Vec<ServiceEntry>,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(rename = "x402support", alias = "x402Support", default)]
    pub x402_support: bool,

    #[serde(rename = "supportedTrust", default)]
    pub supported_trust: Vec<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RegistrationFile {
    /// The `A2A` service endpoint if advertised, otherwise the first listed one.
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.services
            .iter()
            .find(|s| s.name == DEFAULT_SERVICE_TYPE)
            .or_else(|| self.services.first())
            .map(|s| s.endpoint.as_str())
    }
}

/// A row returned by the on-chain identity registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub agent_id: AgentId,
    pub owner: String,
    #[serde(default, rename = "registrationData")]
    pub registration: Option<RegistrationFile>,
}

/// Self-description document served under `/.well-known/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub skills: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    pub chain_id: ChainId,
}

/// Caller-supplied, unverified claim that a transfer was made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAssertion {
    #[serde(default)]
    pub tx_hash: String,
    pub payer: String,
    pub payee: String,
    pub token: String,
    pub amount: String,
}

impl PaymentAssertion {
    pub fn payer_address(&self) -> Result<Address> {
        parse_address(&self.payer, "payer")
    }

    pub fn payee_address(&self) -> Result<Address> {
        parse_address(&self.payee, "payee")
    }

    pub fn token_address(&self) -> Result<Address> {
        parse_address(&self.token, "token")
    }

    pub fn amount_value(&self) -> Result<U256> {
        parse_amount(&self.amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub success: bool,
    pub network: String,
    pub transaction: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub payment_id: String,
    pub route: String,
    pub amount: String,
    pub payer: String,
    pub payee: String,
    pub outcome: SettlementOutcome,
    pub settled_at: DateTime<Utc>,
}

pub fn parse_address(value: &str, field: &str) -> Result<Address> {
    Address::from_str(value.trim())
        .map_err(|e| MarketError::InvalidAddress(format!("{}: {} ({})", field, value, e)))
}

/// Parses a non-negative decimal integer in smallest token units.
pub fn parse_amount(value: &str) -> Result<U256> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MarketError::InvalidAmount(value.to_string()));
    }
    U256::from_str_radix(value, 10).map_err(|e| MarketError::InvalidAmount(format!("{}: {}", value, e)))
}
