//! Per-route monetization rules and token unit conversion.
//!
//! Conversions from a human price to smallest units always floor: a price
//! finer than the token's decimals allow is truncated, never rounded up.
//! Because of that, `to_human_readable(to_smallest_unit(p, d), d)` only
//! reproduces `p` when `p` has at most `d` fractional digits.

use crate::{
    error::{MarketError, Result},
    model::{parse_amount, TokenInfo},
    ChainId,
};
use alloy_primitives::{address, Address, U256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Decimals assumed for a token symbol nobody has registered.
pub const DEFAULT_TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PricingRule {
    pub route: String,
    pub price: String,
    pub token: String,
    #[serde(default)]
    pub token_address: Option<Address>,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    DEFAULT_TOKEN_DECIMALS
}

/// Simplified rule as it appears in configuration, keyed by route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    pub price: String,
    pub token: String,
    #[serde(default, alias = "tokenAddress")]
    pub token_address: Option<Address>,
    #[serde(default)]
    pub decimals: Option<u8>,
}

/// Known token deployments, keyed by symbol and chain.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    entries: Vec<TokenInfo>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// USDC, USDT and DAI on Ethereum, Base, Base Sepolia and Arbitrum One.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        let deployments: [(&str, ChainId, Address, u8); 8] = [
            ("USDC", 1, address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"), 6),
            ("USDC", 8453, address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"), 6),
            ("USDC", 84532, address!("036CbD53842c5426634e7929541eC2318f3dCF7e"), 6),
            ("USDC", 42161, address!("af88d065e77c8cC2239327C5EDb3A432268e5831"), 6),
            ("USDT", 1, address!("dAC17F958D2ee523a2206206994597C13D831ec7"), 6),
            ("USDT", 42161, address!("Fd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"), 6),
            ("DAI", 1, address!("6B175474E89094C44Da98b954EedeAC495271d0F"), 18),
            ("DAI", 8453, address!("50c5725949A6F0c72E6C4a641F24049A917DB0Cb"), 18),
        ];
        for (symbol, chain_id, address, decimals) in deployments {
            table.register(TokenInfo {
                symbol: symbol.to_string(),
                address,
                decimals,
                chain_id,
            });
        }
        table
    }

    /// Adds a deployment, replacing any existing one for the same symbol and chain.
    pub fn register(&mut self, token: TokenInfo) {
        self.entries
            .retain(|t| !(t.chain_id == token.chain_id && t.symbol.eq_ignore_ascii_case(&token.symbol)));
        self.entries.push(token);
    }

    pub fn lookup(&self, symbol: &str, chain_id: ChainId) -> Option<&TokenInfo> {
        self.entries
            .iter()
            .find(|t| t.chain_id == chain_id && t.symbol.eq_ignore_ascii_case(symbol))
    }

    /// Decimals for a symbol on any chain, or [`DEFAULT_TOKEN_DECIMALS`].
    pub fn decimals_for(&self, symbol: &str) -> u8 {
        self.entries
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
            .map(|t| t.decimals)
            .unwrap_or(DEFAULT_TOKEN_DECIMALS)
    }

    pub fn entries(&self) -> &[TokenInfo] {
        &self.entries
    }
}

/// Route key form: no leading or trailing slashes, lower-cased.
pub fn normalize_route(route: &str) -> String {
    route.trim().trim_matches('/').to_lowercase()
}

pub struct PricingRegistry {
    rules: RwLock<HashMap<String, PricingRule>>,
    tokens: TokenTable,
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::new(TokenTable::with_defaults())
    }
}

impl PricingRegistry {
    pub fn new(tokens: TokenTable) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            tokens,
        }
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    /// Stores a rule under its normalized route, overwriting any existing rule.
    pub fn add_route(&self, mut rule: PricingRule) -> Result<()> {
        price_to_units(&rule.price, rule.decimals)?;
        rule.route = normalize_route(&rule.route);
        tracing::debug!(route = %rule.route, price = %rule.price, token = %rule.token, "Pricing rule added");
        self.rules.write().insert(rule.route.clone(), rule);
        Ok(())
    }

    /// Adds every configured route, resolving token address and decimals from
    /// the token table for `chain_id` when the config leaves them out.
    ///
    /// Nothing is stored if any route has a malformed price.
    pub fn add_from_config(&self, chain_id: ChainId, routes: &HashMap<String, RouteConfig>) -> Result<()> {
        let mut resolved = Vec::with_capacity(routes.len());
        for (route, config) in routes {
            let known = self.tokens.lookup(&config.token, chain_id);
            let decimals = config
                .decimals
                .or_else(|| known.map(|t| t.decimals))
                .unwrap_or_else(|| self.tokens.decimals_for(&config.token));
            let rule = PricingRule {
                route: normalize_route(route),
                price: config.price.clone(),
                token: config.token.clone(),
                token_address: config.token_address.or_else(|| known.map(|t| t.address)),
                decimals,
            };
            price_to_units(&rule.price, rule.decimals)?;
            resolved.push(rule);
        }

        let mut rules = self.rules.write();
        for rule in resolved {
            rules.insert(rule.route.clone(), rule);
        }
        tracing::info!(chain_id, count = routes.len(), "Loaded pricing routes from config");
        Ok(())
    }

    pub fn remove_route(&self, route: &str) -> Option<PricingRule> {
        self.rules.write().remove(&normalize_route(route))
    }

    pub fn is_paywalled(&self, route: &str) -> bool {
        self.rules.read().contains_key(&normalize_route(route))
    }

    pub fn get_rule(&self, route: &str) -> Option<PricingRule> {
        self.rules.read().get(&normalize_route(route)).cloned()
    }

    /// Route price in smallest units, or `None` for a route without a rule.
    pub fn required_amount(&self, route: &str) -> Result<Option<U256>> {
        match self.get_rule(route) {
            Some(rule) => price_to_units(&rule.price, rule.decimals).map(Some),
            None => Ok(None),
        }
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.rules.read().keys().cloned().collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

fn pow10(decimals: u8) -> Option<U256> {
    U256::from(10u64).checked_pow(U256::from(decimals))
}

/// Parses a human price (optionally `$`-prefixed) into smallest units, flooring.
pub fn price_to_units(price: &str, decimals: u8) -> Result<U256> {
    let invalid = || MarketError::InvalidPrice(price.to_string());

    let trimmed = price.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !all_digits(fraction) {
        return Err(invalid());
    }

    let scale = pow10(decimals).ok_or_else(invalid)?;
    let whole_units = if whole.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(whole, 10).map_err(|_| invalid())?
    };

    let width = decimals as usize;
    let kept: String = fraction.chars().take(width).collect();
    let padded = format!("{:0<width$}", kept, width = width);
    let fraction_units = if padded.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(&padded, 10).map_err(|_| invalid())?
    };

    whole_units
        .checked_mul(scale)
        .and_then(|v| v.checked_add(fraction_units))
        .ok_or_else(invalid)
}

pub fn to_smallest_unit(price: &str, decimals: u8) -> Result<String> {
    price_to_units(price, decimals).map(|units| units.to_string())
}

/// Renders an integer amount as a decimal string without trailing zeros.
pub fn to_human_readable(amount: &str, decimals: u8) -> Result<String> {
    let value = parse_amount(amount)?;
    let scale = pow10(decimals)
        .ok_or_else(|| MarketError::InvalidAmount(format!("decimals out of range: {}", decimals)))?;

    let whole = value / scale;
    let remainder = value % scale;
    if remainder.is_zero() {
        return Ok(whole.to_string());
    }
    let fraction = format!("{:0>width$}", remainder.to_string(), width = decimals as usize);
    Ok(format!("{}.{}", whole, fraction.trim_end_matches('0')))
}
