//! # agentmesh
//!
//! Discovery and metered-payment settlement core for an agent-to-agent
//! marketplace.
//!
//! ## Architecture
//!
//! - **Pricing**: per-route monetization rules and token unit conversion
//! - **Discovery**: queries an ERC-8004 style registry, filters by payment support,
//!   trust models and reputation, and returns size-bounded candidate lists
//! - **Ledger**: verifies ERC-20 transfer proofs on chain and keeps settlement receipts
//! - **Hooks**: before/after/error notifications around verification and settlement
//! - **Settlement**: ties pricing, hooks and the ledger into one payment flow

pub mod chain;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod pricing;
pub mod settlement;
pub mod trust;

pub use chain::{ChainProvider, JsonRpcProvider};
pub use config::AppConfig;
pub use discovery::{AgentRegistry, DiscoveryEngine, HttpAgentRegistry};
pub use error::{MarketError, Result, VerificationError};
pub use hooks::{HookBus, HookChannel, HookEvent, PaymentEvent, SettleEvent, VerifyEvent};
pub use ledger::PaymentLedger;
pub use model::{
    AgentCard, ChainConfig, DiscoveredAgent, DiscoveryQuery, PaymentAssertion, PaymentReceipt, TokenInfo,
};
pub use pricing::{to_human_readable, to_smallest_unit, PricingRegistry, PricingRule};
pub use settlement::SettlementService;
pub use trust::{HttpReputationOracle, ReputationOracle};

/// ERC-8004 agent id (the identity NFT's token id).
pub type AgentId = u64;
pub type ChainId = u64;
