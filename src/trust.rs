use crate::{
    error::{MarketError, Result},
    AgentId,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Source of aggregate reputation scores (e.g. an ERC-8004 reputation registry).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReputationOracle: Send + Sync {
    async fn get_average_score(&self, agent_id: AgentId) -> Result<f64>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationResponse {
    pub agent_id: AgentId,
    pub average_score: f64,
    #[serde(default)]
    pub feedback_count: u64,
}

/// Reputation oracle reached over HTTP at `{endpoint}/agents/{id}/reputation`.
#[derive(Clone)]
pub struct HttpReputationOracle {
    endpoint: String,
    client: Client,
}

impl HttpReputationOracle {
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
impl ReputationOracle for HttpReputationOracle {
    async fn get_average_score(&self, agent_id: AgentId) -> Result<f64> {
        let response = self
            .client
            .get(format!("{}/agents/{}/reputation", self.endpoint, agent_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MarketError::Reputation {
                agent_id,
                reason: format!("status {}", response.status()),
            });
        }

        let body: ReputationResponse = response.json().await?;
        if !body.average_score.is_finite() {
            return Err(MarketError::Reputation {
                agent_id,
                reason: "non-finite score".to_string(),
            });
        }
        Ok(body.average_score)
    }
}

/// True iff `supported` contains every model in `required`.
pub fn covers_trust_models(supported: &[String], required: &[String]) -> bool {
    required.iter().all(|r| supported.iter().any(|s| s == r))
}
