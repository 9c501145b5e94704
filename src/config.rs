use crate::{
    error::{MarketError, Result},
    model::{ChainConfig, TokenInfo, DEFAULT_MAX_RESULTS, DEFAULT_SERVICE_TYPE},
    pricing::{price_to_units, RouteConfig, TokenTable},
    ChainId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub reputation: ReputationConfig,
    pub discovery: DiscoveryConfig,
    pub chains: Vec<ChainConfig>,
    pub facilitator: FacilitatorConfig,
    pub pricing: PricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct ReputationConfig {
    pub endpoint: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Chain reported for discovered agents when a request names none.
    pub default_chain_id: ChainId,
    pub default_service: String,
    pub default_max_results: usize,
    pub card_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct FacilitatorConfig {
    /// Tokens accepted for payment; empty means the built-in table.
    pub tokens: Vec<TokenInfo>,
    pub rpc_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub chain_id: ChainId,
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            reputation: ReputationConfig::default(),
            discovery: DiscoveryConfig::default(),
            chains: vec![
                ChainConfig {
                    chain_id: 8453,
                    name: "base".to_string(),
                    rpc_url: "https://mainnet.base.org".to_string(),
                },
                ChainConfig {
                    chain_id: 84532,
                    name: "base-sepolia".to_string(),
                    rpc_url: "https://sepolia.base.org".to_string(),
                },
            ],
            facilitator: FacilitatorConfig::default(),
            pricing: PricingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8402,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            timeout_seconds: 15,
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            timeout_seconds: 15,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_chain_id: 8453,
            default_service: DEFAULT_SERVICE_TYPE.to_string(),
            default_max_results: DEFAULT_MAX_RESULTS,
            card_timeout_seconds: 10,
        }
    }
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            rpc_timeout_seconds: 20,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            chain_id: 8453,
            routes: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| MarketError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| MarketError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("REGISTRY_ENDPOINT") {
            self.registry.endpoint = endpoint;
        }

        if let Ok(endpoint) = std::env::var("REPUTATION_ENDPOINT") {
            self.reputation.endpoint = endpoint;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MarketError::Config("Server port cannot be 0".to_string()));
        }

        if self.registry.endpoint.is_empty() {
            return Err(MarketError::Config("Registry endpoint cannot be empty".to_string()));
        }

        if self.reputation.endpoint.is_empty() {
            return Err(MarketError::Config("Reputation endpoint cannot be empty".to_string()));
        }

        if self.discovery.default_service.is_empty() {
            return Err(MarketError::Config("Default discovery service cannot be empty".to_string()));
        }

        for chain in &self.chains {
            if chain.rpc_url.is_empty() {
                return Err(MarketError::Config(format!("Chain {} has no rpc_url", chain.chain_id)));
            }
        }

        for (route, rule) in &self.pricing.routes {
            let decimals = rule.decimals.unwrap_or(0);
            price_to_units(&rule.price, decimals)
                .map_err(|e| MarketError::Config(format!("Route {}: {}", route, e)))?;
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    /// Configured facilitator tokens, falling back to the built-in table.
    pub fn token_list(&self) -> Vec<TokenInfo> {
        if self.facilitator.tokens.is_empty() {
            TokenTable::with_defaults().entries().to_vec()
        } else {
            self.facilitator.tokens.clone()
        }
    }

    pub fn token_table(&self) -> TokenTable {
        let mut table = TokenTable::with_defaults();
        for token in &self.facilitator.tokens {
            table.register(token.clone());
        }
        table
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.timeout_seconds)
    }

    pub fn reputation_timeout(&self) -> Duration {
        Duration::from_secs(self.reputation.timeout_seconds)
    }

    pub fn card_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.card_timeout_seconds)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.facilitator.rpc_timeout_seconds)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| MarketError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| MarketError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
