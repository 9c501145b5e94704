use crate::{
    error::{MarketError, Result, VerificationError},
    hooks::{HookBus, PaymentEvent},
    ledger::{PaymentLedger, TransferClaim},
    model::{ChainConfig, PaymentAssertion, PaymentReceipt, SettlementOutcome},
    pricing::{price_to_units, PricingRegistry, PricingRule},
};
use alloy_primitives::{Address, B256};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// What a caller has to pay for a route, in smallest units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub route: String,
    pub price: String,
    pub token: String,
    pub token_address: Option<Address>,
    pub decimals: u8,
    pub amount: String,
}

#[derive(Clone)]
pub struct SettlementService {
    pricing: Arc<PricingRegistry>,
    ledger: Arc<PaymentLedger>,
    hooks: Arc<HookBus>,
}

impl SettlementService {
    pub fn new(pricing: Arc<PricingRegistry>, ledger: Arc<PaymentLedger>, hooks: Arc<HookBus>) -> Self {
        Self { pricing, ledger, hooks }
    }

    pub fn pricing(&self) -> &PricingRegistry {
        &self.pricing
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    pub fn requirement(&self, route: &str) -> Result<PaymentRequirement> {
        let rule = self.rule(route)?;
        let amount = price_to_units(&rule.price, rule.decimals)?;
        Ok(PaymentRequirement {
            route: rule.route,
            price: rule.price,
            token: rule.token,
            token_address: rule.token_address,
            decimals: rule.decimals,
            amount: amount.to_string(),
        })
    }

    fn rule(&self, route: &str) -> Result<PricingRule> {
        self.pricing
            .get_rule(route)
            .ok_or_else(|| MarketError::RouteNotPaywalled(route.to_string()))
    }

    /// Checks the assertion against the route's price and token, then verifies
    /// it on chain inside the verify hooks.
    ///
    /// A rejected proof is `Ok(false)`; `afterVerify` observers get the reason.
    pub async fn verify(
        &self,
        request_id: &str,
        route: &str,
        assertion: &PaymentAssertion,
        chain: &ChainConfig,
    ) -> Result<bool> {
        let (event, claim) = self.check_requirement(request_id, route, assertion, chain)?;
        match self.verify_claim(event, &claim, chain).await {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Verifies the payment and records its receipt, keyed by transaction hash.
    ///
    /// A transfer can only be settled once, however its hash is spelled; a
    /// second attempt fails with [`MarketError::DuplicateReceipt`].
    pub async fn settle(
        &self,
        request_id: &str,
        route: &str,
        assertion: &PaymentAssertion,
        chain: &ChainConfig,
    ) -> Result<PaymentReceipt> {
        let (event, claim) = self.check_requirement(request_id, route, assertion, chain)?;

        self.verify_claim(event.clone(), &claim, chain)
            .await
            .map_err(|reason| MarketError::VerificationFailed(format!("transaction {}: {}", claim.tx_hash, reason)))?;

        let receipt = PaymentReceipt {
            payment_id: claim.tx_hash.clone(),
            route: event.resource.clone(),
            amount: claim.amount.to_string(),
            payer: event.payer.clone(),
            payee: event.payee.clone(),
            outcome: SettlementOutcome {
                success: true,
                network: chain.name.clone(),
                transaction: Some(claim.tx_hash.clone()),
                error: None,
            },
            settled_at: Utc::now(),
        };

        let ledger = &self.ledger;
        let stored = receipt.clone();
        self.hooks
            .with_settle(event, || async move {
                let outcome = stored.outcome.clone();
                ledger.try_record_receipt(stored)?;
                Ok::<_, MarketError>(outcome)
            })
            .await?;

        Ok(receipt)
    }

    async fn verify_claim(
        &self,
        event: PaymentEvent,
        claim: &TransferClaim,
        chain: &ChainConfig,
    ) -> std::result::Result<(), VerificationError> {
        let ledger = &self.ledger;
        let result = self
            .hooks
            .with_verify(event, || async move { ledger.verify_transfer(claim, chain).await.map(|_| true) })
            .await;
        match result {
            Ok(_) => {
                tracing::info!(tx_hash = %claim.tx_hash, payer = %claim.payer, "Payment verified");
                Ok(())
            }
            Err(reason) => {
                tracing::info!(tx_hash = %claim.tx_hash, %reason, "Payment rejected");
                Err(reason)
            }
        }
    }

    fn check_requirement(
        &self,
        request_id: &str,
        route: &str,
        assertion: &PaymentAssertion,
        chain: &ChainConfig,
    ) -> Result<(PaymentEvent, TransferClaim)> {
        let rule = self.rule(route)?;
        let required = price_to_units(&rule.price, rule.decimals)?;
        let mut claim = TransferClaim::from_assertion(assertion)?;

        // One spelling per transaction: `0x`-prefixed lower-case hex.
        if !claim.tx_hash.is_empty() {
            let hash = B256::from_str(&claim.tx_hash)
                .map_err(|_| MarketError::InvalidInput(format!("malformed transaction hash: {}", claim.tx_hash)))?;
            claim.tx_hash = format!("{:#x}", hash);
        }

        if let Some(expected) = rule.token_address {
            if claim.token != expected {
                return Err(MarketError::TokenMismatch {
                    expected: expected.to_string(),
                    asserted: claim.token.to_string(),
                });
            }
        }

        if claim.amount < required {
            return Err(MarketError::InsufficientPayment {
                required: required.to_string(),
                asserted: claim.amount.to_string(),
            });
        }

        let event = PaymentEvent {
            request_id: request_id.to_string(),
            resource: rule.route,
            amount: claim.amount.to_string(),
            network: chain.name.clone(),
            payer: claim.payer.to_string(),
            payee: claim.payee.to_string(),
            timestamp: Utc::now(),
        };
        Ok((event, claim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Log, MockChainProvider, TransactionReceipt, TRANSFER_TOPIC};
    use crate::hooks::{HookChannel, VerifyEvent};
    use crate::model::TokenInfo;
    use alloy_primitives::{address, U256};
    use parking_lot::Mutex;

    const USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
    const PAYER: Address = address!("1111111111111111111111111111111111111111");
    const PAYEE: Address = address!("2222222222222222222222222222222222222222");
    const TX: &str = "0xCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCDCD";

    fn chain() -> ChainConfig {
        ChainConfig { chain_id: 8453, name: "base".into(), rpc_url: "http://localhost:8545".into() }
    }

    fn service(transferred: u64) -> SettlementService {
        let mut provider = MockChainProvider::new();
        provider.expect_transaction_receipt().returning(move |_, hash| {
            Ok(Some(TransactionReceipt {
                transaction_hash: hash,
                status: Some("0x1".into()),
                logs: vec![Log {
                    address: USDC,
                    topics: vec![TRANSFER_TOPIC, PAYER.into_word(), PAYEE.into_word()],
                    data: format!("0x{}", hex::encode(U256::from(transferred).to_be_bytes::<32>())),
                }],
            }))
        });

        let pricing = PricingRegistry::default();
        pricing
            .add_route(PricingRule {
                route: "/api/v1/coins".into(),
                price: "$0.001".into(),
                token: "USDC".into(),
                token_address: Some(USDC),
                decimals: 6,
            })
            .unwrap();
        let ledger = PaymentLedger::new(
            Arc::new(provider),
            vec![TokenInfo { symbol: "USDC".into(), address: USDC, decimals: 6, chain_id: 8453 }],
        );
        SettlementService::new(Arc::new(pricing), Arc::new(ledger), Arc::new(HookBus::new()))
    }

    fn assertion(amount: &str) -> PaymentAssertion {
        PaymentAssertion {
            tx_hash: TX.into(),
            payer: PAYER.to_string(),
            payee: PAYEE.to_string(),
            token: USDC.to_string(),
            amount: amount.into(),
        }
    }

    #[test]
    fn test_requirement() {
        let requirement = service(0).requirement("API/V1/COINS").unwrap();
        assert_eq!(requirement.amount, "1000");
        assert_eq!(requirement.route, "api/v1/coins");
        assert!(matches!(service(0).requirement("free"), Err(MarketError::RouteNotPaywalled(_))));
    }

    #[tokio::test]
    async fn test_settle_records_receipt_once() {
        let service = service(1000);
        let receipt = service.settle("r1", "/api/v1/coins", &assertion("1000"), &chain()).await.unwrap();

        assert_eq!(receipt.payment_id, TX.to_lowercase());
        assert_eq!(receipt.route, "api/v1/coins");
        assert_eq!(receipt.outcome.transaction.as_deref(), Some(TX.to_lowercase().as_str()));
        assert_eq!(service.ledger().get_route_revenue("api/v1/coins"), U256::from(1000u64));

        let again = service.settle("r2", "/api/v1/coins", &assertion("1000"), &chain()).await;
        assert!(matches!(again, Err(MarketError::DuplicateReceipt(_))));
        assert_eq!(service.ledger().receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_settle_rejects_before_touching_chain() {
        let service = service(1000);
        assert!(matches!(
            service.settle("r", "/api/v1/coins", &assertion("999"), &chain()).await,
            Err(MarketError::InsufficientPayment { .. })
        ));

        let mut wrong_token = assertion("1000");
        wrong_token.token = "0x3333333333333333333333333333333333333333".into();
        assert!(matches!(
            service.settle("r", "/api/v1/coins", &wrong_token, &chain()).await,
            Err(MarketError::TokenMismatch { .. })
        ));

        assert!(matches!(
            service.settle("r", "/unpriced", &assertion("1000"), &chain()).await,
            Err(MarketError::RouteNotPaywalled(_))
        ));
        assert_eq!(service.ledger().receipt_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_verification_is_observed() {
        // Chain shows 500 but the payer claims 1000.
        let service = service(500);
        let verified = Arc::new(Mutex::new(Vec::<VerifyEvent>::new()));
        let v = verified.clone();
        service.hooks().on_after_verify(move |event| {
            let v = v.clone();
            async move {
                v.lock().push(event);
                Ok(())
            }
        });

        let result = service.settle("r9", "/api/v1/coins", &assertion("1000"), &chain()).await;
        assert!(matches!(result, Err(MarketError::VerificationFailed(_))));
        assert_eq!(service.hooks().handler_count(HookChannel::AfterVerify), 1);

        let verified = verified.lock();
        assert_eq!(verified.len(), 1);
        assert!(!verified[0].valid);
        assert_eq!(verified[0].payment.request_id, "r9");
        let reason = verified[0].error.as_deref().unwrap();
        assert!(reason.contains("transferred 500"), "{}", reason);
        assert!(reason.contains("required 1000"), "{}", reason);
        assert_eq!(service.ledger().receipt_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_verify_reports_reason_and_returns_false() {
        let service = service(500);
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = reasons.clone();
        service.hooks().on_after_verify(move |event| {
            let r = r.clone();
            async move {
                r.lock().push(event.error);
                Ok(())
            }
        });

        let mut no_hash = assertion("1000");
        no_hash.tx_hash = String::new();
        assert!(!service.verify("r", "api/v1/coins", &no_hash, &chain()).await.unwrap());
        assert!(!service.verify("r", "api/v1/coins", &assertion("1000"), &chain()).await.unwrap());

        let reasons = reasons.lock();
        assert_eq!(reasons[0].as_deref(), Some("no transaction hash supplied"));
        assert!(reasons[1].as_deref().unwrap().contains("less than required"));
    }

    #[tokio::test]
    async fn test_hash_spelling_does_not_allow_second_settlement() {
        let service = service(1000);
        let prefixed = format!("0x{}", "cd".repeat(32));

        let mut first = assertion("1000");
        first.tx_hash = prefixed.clone();
        let receipt = service.settle("r1", "/api/v1/coins", &first, &chain()).await.unwrap();
        assert_eq!(receipt.payment_id, prefixed);

        for spelling in ["cd".repeat(32), format!("0x{}", "CD".repeat(32)), format!("  {}  ", prefixed)] {
            let mut again = assertion("1000");
            again.tx_hash = spelling;
            assert!(matches!(
                service.settle("r2", "/api/v1/coins", &again, &chain()).await,
                Err(MarketError::DuplicateReceipt(id)) if id == prefixed
            ));
        }
        assert_eq!(service.ledger().receipt_count(), 1);
        assert_eq!(service.ledger().get_total_revenue(), U256::from(1000u64));
    }

    #[tokio::test]
    async fn test_malformed_hash_is_rejected_as_input() {
        let service = service(1000);
        let mut bad = assertion("1000");
        bad.tx_hash = "0xnot-a-hash".into();
        assert!(matches!(
            service.settle("r", "/api/v1/coins", &bad, &chain()).await,
            Err(MarketError::InvalidInput(_))
        ));
        assert!(matches!(
            service.verify("r", "/api/v1/coins", &bad, &chain()).await,
            Err(MarketError::InvalidInput(_))
        ));
        assert_eq!(service.ledger().receipt_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_only_does_not_record() {
        let service = service(2000);
        assert!(service.verify("r", "api/v1/coins", &assertion("1000"), &chain()).await.unwrap());
        assert_eq!(service.ledger().receipt_count(), 0);
    }
}
