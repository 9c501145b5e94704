use crate::{
    error::{MarketError, Result},
    model::{
        AgentCard, AgentService, DiscoveredAgent, DiscoveryQuery, RegistryEntry, DEFAULT_SERVICE_TYPE,
    },
    trust::{covers_trust_models, ReputationOracle},
    AgentId, ChainId,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Paths tried, in order, for an agent's self-description document.
pub const AGENT_CARD_PATHS: [&str; 2] = ["/.well-known/agent.json", "/.well-known/agent-card.json"];

pub const AGENT_CARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Read side of the on-chain identity registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Agents advertising `service_type`, in registry order, at most `limit`.
    async fn find_agents_by_service(&self, service_type: &str, limit: usize) -> Result<Vec<RegistryEntry>>;

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<RegistryEntry>>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub agents: Vec<RegistryEntry>,
}

/// Registry indexer reached over HTTP.
#[derive(Clone)]
pub struct HttpAgentRegistry {
    endpoint: String,
    client: Client,
}

impl HttpAgentRegistry {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentRegistry for HttpAgentRegistry {
    async fn find_agents_by_service(&self, service_type: &str, limit: usize) -> Result<Vec<RegistryEntry>> {
        let response = self
            .client
            .get(format!("{}/agents", self.endpoint))
            .query(&[("service", service_type.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MarketError::Registry(format!(
                "search for {} returned {}",
                service_type,
                response.status()
            )));
        }

        let search: SearchResponse = response.json().await?;
        Ok(search.agents)
    }

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<RegistryEntry>> {
        let response = self
            .client
            .get(format!("{}/agents/{}", self.endpoint, agent_id))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(MarketError::Registry(format!("lookup of agent {} returned {}", agent_id, status))),
        }
    }
}

/// Why a candidate was left out of a discovery result.
#[derive(Debug, Clone, PartialEq)]
enum Exclusion {
    NoRegistration,
    NoPaymentSupport,
    MissingTrustModels,
    ReputationUnavailable,
    ReputationBelowMinimum { score: f64, minimum: f64 },
}

pub struct DiscoveryEngine {
    registry: Arc<dyn AgentRegistry>,
    reputation: Arc<dyn ReputationOracle>,
    default_service: String,
    card_timeout: Duration,
    client: Client,
}

impl DiscoveryEngine {
    pub fn new(registry: Arc<dyn AgentRegistry>, reputation: Arc<dyn ReputationOracle>) -> Self {
        Self {
            registry,
            reputation,
            default_service: DEFAULT_SERVICE_TYPE.to_string(),
            card_timeout: AGENT_CARD_TIMEOUT,
            client: Client::new(),
        }
    }

    /// Service type searched when a query does not name one.
    pub fn with_default_service(mut self, service: impl Into<String>) -> Self {
        self.default_service = service.into();
        self
    }

    pub fn with_card_timeout(mut self, timeout: Duration) -> Self {
        self.card_timeout = timeout;
        self
    }

    pub fn default_service(&self) -> &str {
        &self.default_service
    }

    /// Filtered candidates in registry order, never more than `query.max_results`.
    ///
    /// Failures never abort the query: a registry failure yields an empty list
    /// and a reputation failure excludes only the candidate being evaluated.
    pub async fn discover(&self, query: &DiscoveryQuery) -> Vec<DiscoveredAgent> {
        if query.max_results == 0 {
            return Vec::new();
        }

        let service = query.service.as_deref().unwrap_or(&self.default_service);
        let candidates = match self.registry.find_agents_by_service(service, query.max_results).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(service, error = %e, "Registry search failed");
                return Vec::new();
            }
        };

        let mut agents = Vec::new();
        for entry in candidates {
            if agents.len() >= query.max_results {
                break;
            }
            let agent_id = entry.agent_id;
            match self.evaluate(entry, query).await {
                Ok(agent) => agents.push(agent),
                Err(reason) => tracing::debug!(agent_id, ?reason, "Candidate excluded"),
            }
        }

        tracing::info!(
            service,
            chain_id = query.chain_id,
            found = agents.len(),
            "Discovery completed"
        );
        agents
    }

    async fn evaluate(&self, entry: RegistryEntry, query: &DiscoveryQuery) -> std::result::Result<DiscoveredAgent, Exclusion> {
        let registration = entry.registration.as_ref().ok_or(Exclusion::NoRegistration)?;

        if query.x402_only && !registration.x402_support {
            return Err(Exclusion::NoPaymentSupport);
        }

        if !covers_trust_models(&registration.supported_trust, &query.trust_models) {
            return Err(Exclusion::MissingTrustModels);
        }

        let reputation = match query.min_reputation {
            Some(minimum) => {
                let score = match self.reputation.get_average_score(entry.agent_id).await {
                    Ok(score) => score,
                    Err(e) => {
                        tracing::warn!(agent_id = entry.agent_id, error = %e, "Reputation unavailable");
                        return Err(Exclusion::ReputationUnavailable);
                    }
                };
                // NaN compares false and is excluded along with low scores.
                if !(score >= minimum) {
                    return Err(Exclusion::ReputationBelowMinimum { score, minimum });
                }
                Some(score)
            }
            None if query.include_reputation => self.reputation.get_average_score(entry.agent_id).await.ok(),
            None => None,
        };

        Ok(to_discovered(&entry, query.chain_id, reputation))
    }

    /// Resolves a single agent without applying any filters.
    pub async fn get_agent(&self, agent_id: AgentId, chain_id: ChainId) -> Result<Option<DiscoveredAgent>> {
        let entry = match self.registry.get_agent(agent_id).await? {
            Some(entry) if entry.registration.is_some() => entry,
            _ => return Ok(None),
        };
        let reputation = self.reputation.get_average_score(agent_id).await.ok();
        Ok(Some(to_discovered(&entry, chain_id, reputation)))
    }

    /// Tries the well-known card paths under `base_url`.
    ///
    /// Returns `Ok(None)` when neither path yields a parseable card; errors only
    /// when `base_url` itself is unusable.
    pub async fn fetch_agent_card(&self, base_url: &str) -> Result<Option<AgentCard>> {
        let base = Url::parse(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(MarketError::InvalidInput(format!("unsupported scheme: {}", base.scheme())));
        }

        for path in AGENT_CARD_PATHS {
            let url = base.join(path)?;
            let response = match self.client.get(url.clone()).timeout(self.card_timeout).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    tracing::debug!(%url, status = %response.status(), "Agent card not served");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(%url, error = %e, "Agent card request failed");
                    continue;
                }
            };
            match response.json::<AgentCard>().await {
                Ok(card) => return Ok(Some(card)),
                Err(e) => tracing::debug!(%url, error = %e, "Agent card did not parse"),
            }
        }
        Ok(None)
    }
}

fn to_discovered(entry: &RegistryEntry, chain_id: ChainId, reputation: Option<f64>) -> DiscoveredAgent {
    let registration = entry.registration.clone().unwrap_or_default();
    DiscoveredAgent {
        agent_id: entry.agent_id,
        name: registration.name.clone(),
        description: registration.description.clone(),
        owner: entry.owner.clone(),
        chain_id,
        endpoint: registration.primary_endpoint().map(str::to_string),
        reputation,
        x402_support: registration.x402_support,
        services: registration
            .services
            .iter()
            .map(|s| AgentService {
                service_name: s.name.clone(),
                endpoint: s.endpoint.clone(),
            })
            .collect(),
        trust_models: registration.supported_trust,
    }
}
