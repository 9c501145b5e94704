use alloy_primitives::U256;
use thiserror::Error;

use crate::AgentId;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Reputation lookup failed for agent {agent_id}: {reason}")]
    Reputation { agent_id: AgentId, reason: String },

    #[error("Chain provider error: {0}")]
    Provider(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Route is not paywalled: {0}")]
    RouteNotPaywalled(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(u64),

    #[error("Payment token {asserted} does not match route token {expected}")]
    TokenMismatch { expected: String, asserted: String },

    #[error("Insufficient payment: required {required}, asserted {asserted}")]
    InsufficientPayment { required: String, asserted: String },

    #[error("Payment verification failed: {0}")]
    VerificationFailed(String),

    #[error("Receipt already recorded: {0}")]
    DuplicateReceipt(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Reasons an on-chain payment proof is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("no transaction hash supplied")]
    MissingTransactionHash,

    #[error("malformed transaction hash: {0}")]
    InvalidTransactionHash(String),

    #[error("transaction receipt not found")]
    ReceiptNotFound,

    #[error("transaction did not succeed on chain")]
    TransactionFailed,

    #[error("no transfer events in transaction")]
    NoTransferEvents,

    #[error("no transfer from payer to payee")]
    NoMatchingTransfer,

    #[error("transferred {transferred} is less than required {required}")]
    InsufficientAmount { required: U256, transferred: U256 },

    #[error("provider failure: {0}")]
    Provider(String),
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MarketError {
    fn from(err: toml::de::Error) -> Self {
        MarketError::Config(err.to_string())
    }
}

impl From<url::ParseError> for MarketError {
    fn from(err: url::ParseError) -> Self {
        MarketError::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}
