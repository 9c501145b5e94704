//! Payment ledger: on-chain transfer verification and the receipt store.

use crate::{
    chain::{decode_transfers, ChainProvider, TransferEvent},
    error::{MarketError, Result, VerificationError},
    model::{parse_amount, ChainConfig, PaymentAssertion, PaymentReceipt, TokenInfo},
    pricing::normalize_route,
};
use alloy_primitives::{Address, B256, U256};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// A payment assertion with its addresses and amount parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferClaim {
    pub tx_hash: String,
    pub payer: Address,
    pub payee: Address,
    pub token: Address,
    pub amount: U256,
}

impl TransferClaim {
    pub fn from_assertion(assertion: &PaymentAssertion) -> Result<Self> {
        Ok(Self {
            tx_hash: assertion.tx_hash.trim().to_string(),
            payer: assertion.payer_address()?,
            payee: assertion.payee_address()?,
            token: assertion.token_address()?,
            amount: assertion.amount_value()?,
        })
    }
}

pub struct PaymentLedger {
    provider: Arc<dyn ChainProvider>,
    tokens: Vec<TokenInfo>,
    receipts: RwLock<HashMap<String, PaymentReceipt>>,
}

impl PaymentLedger {
    pub fn new(provider: Arc<dyn ChainProvider>, tokens: Vec<TokenInfo>) -> Self {
        Self {
            provider,
            tokens,
            receipts: RwLock::new(HashMap::new()),
        }
    }

    /// Checks that the asserted transfer happened on chain.
    ///
    /// Every verification failure, including provider errors, yields
    /// `Ok(false)`. Only a malformed payer, payee, token or amount is an error.
    pub async fn verify_on_chain_payment(&self, assertion: &PaymentAssertion, chain: &ChainConfig) -> Result<bool> {
        if assertion.tx_hash.trim().is_empty() {
            tracing::info!(reason = %VerificationError::MissingTransactionHash, "Payment rejected");
            return Ok(false);
        }
        let claim = TransferClaim::from_assertion(assertion)?;

        match self.verify_transfer(&claim, chain).await {
            Ok(event) => {
                tracing::info!(
                    tx_hash = %claim.tx_hash,
                    payer = %claim.payer,
                    value = %event.value,
                    "Payment verified"
                );
                Ok(true)
            }
            Err(reason) => {
                tracing::info!(tx_hash = %claim.tx_hash, %reason, "Payment rejected");
                Ok(false)
            }
        }
    }

    /// Returns the first payer-to-payee transfer of `claim.token` in the
    /// transaction, provided it moved at least `claim.amount`.
    pub async fn verify_transfer(
        &self,
        claim: &TransferClaim,
        chain: &ChainConfig,
    ) -> std::result::Result<TransferEvent, VerificationError> {
        if claim.tx_hash.is_empty() {
            return Err(VerificationError::MissingTransactionHash);
        }
        let tx_hash = B256::from_str(&claim.tx_hash)
            .map_err(|_| VerificationError::InvalidTransactionHash(claim.tx_hash.clone()))?;

        let receipt = self
            .provider
            .transaction_receipt(chain, tx_hash)
            .await
            .map_err(|e| VerificationError::Provider(e.to_string()))?
            .ok_or(VerificationError::ReceiptNotFound)?;

        if !receipt.succeeded() {
            return Err(VerificationError::TransactionFailed);
        }

        let transfers = decode_transfers(&receipt, claim.token);
        if transfers.is_empty() {
            return Err(VerificationError::NoTransferEvents);
        }

        let event = transfers
            .into_iter()
            .find(|t| t.from == claim.payer && t.to == claim.payee)
            .ok_or(VerificationError::NoMatchingTransfer)?;

        if event.value < claim.amount {
            return Err(VerificationError::InsufficientAmount {
                required: claim.amount,
                transferred: event.value,
            });
        }
        Ok(event)
    }

    /// Stores a receipt, replacing any receipt with the same payment id.
    pub fn record_receipt(&self, receipt: PaymentReceipt) -> Result<()> {
        let receipt = normalized(receipt)?;
        tracing::info!(payment_id = %receipt.payment_id, route = %receipt.route, amount = %receipt.amount, "Receipt recorded");
        self.receipts.write().insert(receipt.payment_id.clone(), receipt);
        Ok(())
    }

    /// Stores a receipt unless one with the same payment id already exists.
    pub fn try_record_receipt(&self, receipt: PaymentReceipt) -> Result<()> {
        let receipt = normalized(receipt)?;
        let mut receipts = self.receipts.write();
        if receipts.contains_key(&receipt.payment_id) {
            return Err(MarketError::DuplicateReceipt(receipt.payment_id));
        }
        tracing::info!(payment_id = %receipt.payment_id, route = %receipt.route, amount = %receipt.amount, "Receipt recorded");
        receipts.insert(receipt.payment_id.clone(), receipt);
        Ok(())
    }

    pub fn get_receipt(&self, payment_id: &str) -> Option<PaymentReceipt> {
        self.receipts.read().get(payment_id).cloned()
    }

    pub fn get_receipts_for_route(&self, route: &str) -> Vec<PaymentReceipt> {
        let route = normalize_route(route);
        let mut receipts: Vec<PaymentReceipt> = self
            .receipts
            .read()
            .values()
            .filter(|r| r.route == route)
            .cloned()
            .collect();
        receipts.sort_by(|a, b| a.settled_at.cmp(&b.settled_at));
        receipts
    }

    pub fn receipts(&self) -> Vec<PaymentReceipt> {
        let mut receipts: Vec<PaymentReceipt> = self.receipts.read().values().cloned().collect();
        receipts.sort_by(|a, b| a.settled_at.cmp(&b.settled_at));
        receipts
    }

    pub fn receipt_count(&self) -> usize {
        self.receipts.read().len()
    }

    /// Sum of recorded amounts for `route`. A sum past `U256::MAX` is reported as `U256::MAX`.
    pub fn get_route_revenue(&self, route: &str) -> U256 {
        let route = normalize_route(route);
        sum_amounts(self.receipts.read().values().filter(|r| r.route == route))
    }

    /// Sum over every receipt, capped at `U256::MAX` like [`Self::get_route_revenue`].
    pub fn get_total_revenue(&self) -> U256 {
        sum_amounts(self.receipts.read().values())
    }

    pub fn find_token(&self, symbol: &str) -> Option<&TokenInfo> {
        self.tokens.iter().find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }

    pub fn tokens(&self) -> &[TokenInfo] {
        &self.tokens
    }
}

fn normalized(mut receipt: PaymentReceipt) -> Result<PaymentReceipt> {
    if receipt.payment_id.trim().is_empty() {
        return Err(MarketError::InvalidInput("receipt has no payment id".to_string()));
    }
    parse_amount(&receipt.amount)?;
    receipt.route = normalize_route(&receipt.route);
    Ok(receipt)
}

// Amounts were validated on insert, so parsing cannot fail here.
fn sum_amounts<'a>(receipts: impl Iterator<Item = &'a PaymentReceipt>) -> U256 {
    let mut total = U256::ZERO;
    for amount in receipts.filter_map(|r| parse_amount(&r.amount).ok()) {
        match total.checked_add(amount) {
            Some(sum) => total = sum,
            None => {
                tracing::warn!(%total, %amount, "Revenue overflows U256, reporting U256::MAX");
                return U256::MAX;
            }
        }
    }
    total
}
