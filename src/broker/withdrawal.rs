//! Withdrawals from the withdrawable balance to mobile money

use super::{BrokerService, Compensation, RailStatus, WebhookOutcome};
use crate::{
    db::{Entry, Role, TxType, WithdrawalModel, WithdrawalQueries, WithdrawalStatus},
    gateway::{normalize_phone, PayoutRequest},
    BrokerError, BrokerResult,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// Withdrawal request body
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRequest {
    /// Amount in minor units, whole currency units only
    pub amount: i64,
    /// Destination phone
    pub phone: String,
}

/// Parsed payout callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalEvent {
    pub order_id: String,
    pub status: RailStatus,
    pub description: Option<String>,
}

impl WithdrawalEvent {
    /// Payout callback; the order id may arrive under any of three names
    pub fn from_payload(payload: &Value) -> BrokerResult<Self> {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let order_id = field("merchant_order_id")
            .or_else(|| field("order_id"))
            .or_else(|| field("reference_order_id"))
            .ok_or_else(|| BrokerError::MalformedWebhook("no order id in payload".to_string()))?;
        let status = match field("status").map(str::to_uppercase).as_deref() {
            Some("COMPLETED") => RailStatus::Succeeded,
            Some("FAILED") | Some("CANCELLED") | Some("EXPIRED") | Some("REVERSED") => RailStatus::Failed,
            _ => RailStatus::InProgress,
        };
        Ok(Self {
            order_id: order_id.to_string(),
            status,
            description: field("status_description").map(str::to_string),
        })
    }
}

impl BrokerService {
    /// Start a payout of part of a provider's withdrawable balance
    pub async fn request_withdrawal(
        &self,
        caller: &str,
        req: WithdrawalRequest,
    ) -> BrokerResult<WithdrawalModel> {
        if self.profiles.role(caller).await? != Some(Role::Provider) {
            return Err(BrokerError::Unauthorized(
                "Only providers can withdraw".to_string(),
            ));
        }
        let min_amount = self.config.withdrawal.min_amount;
        if req.amount < min_amount {
            return Err(BrokerError::Validation(format!(
                "Minimum withdrawal is {}",
                min_amount
            )));
        }
        if req.amount % 100 != 0 {
            return Err(BrokerError::Validation(
                "Withdrawals must be whole currency units".to_string(),
            ));
        }
        let phone = normalize_phone(&req.phone)
            .ok_or_else(|| BrokerError::Validation("Invalid phone number".to_string()))?;

        let now = Utc::now();
        let withdrawal = WithdrawalModel {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: caller.to_string(),
            amount: req.amount,
            phone: phone.clone(),
            order_id: format!("wd-{}", uuid::Uuid::new_v4()),
            status: WithdrawalStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.db
            .with_tx(|tx| -> BrokerResult<()> {
                if !self.wallets(tx).debit_withdrawable(
                    caller,
                    req.amount,
                    Entry::new(TxType::Withdrawal, &withdrawal.order_id),
                )? {
                    return Err(BrokerError::InsufficientBalance);
                }
                WithdrawalQueries::new(tx).insert(&withdrawal)?;
                Ok(())
            })
            .await?;

        let mut saga = self.saga(format!("withdrawal:{}", withdrawal.order_id));
        saga.on_abort(Compensation::RefundWithdrawable {
            user_id: caller.to_string(),
            amount: req.amount,
            reference: withdrawal.order_id.clone(),
        });
        saga.on_abort(Compensation::FailWithdrawal {
            order_id: withdrawal.order_id.clone(),
            reason: "payout rejected".to_string(),
        });

        let payout = PayoutRequest {
            order_id: withdrawal.order_id.clone(),
            amount: req.amount,
            phone,
            callback_url: self.config.callback_url("withdrawal"),
        };
        if let Err(e) = self.push.initiate_payout(&payout).await {
            error!("Withdrawal {}: payout rejected: {}", withdrawal.order_id, e);
            saga.abort().await;
            return Err(BrokerError::ProviderError(format!(
                "Payout could not be started: {}",
                e
            )));
        }
        saga.commit();

        info!(
            "Withdrawal {} of {} for {} sent to the payout rail",
            withdrawal.order_id, withdrawal.amount, caller
        );
        Ok(withdrawal)
    }

    /// Apply one payout callback
    pub async fn reconcile_withdrawal(&self, event: WithdrawalEvent) -> BrokerResult<WebhookOutcome> {
        let withdrawal = self
            .db
            .with_conn(|c| WithdrawalQueries::new(c).get_by_order_id(&event.order_id))
            .await?;
        let Some(withdrawal) = withdrawal else {
            warn!("Webhook[withdrawal]: no withdrawal for order {}", event.order_id);
            return Ok(WebhookOutcome::UnknownReference);
        };
        if withdrawal.status != WithdrawalStatus::Pending {
            info!(
                "Webhook[withdrawal]: {} already {}, ignoring",
                withdrawal.order_id, withdrawal.status
            );
            return Ok(WebhookOutcome::AlreadyFinal);
        }

        match event.status {
            RailStatus::InProgress => Ok(WebhookOutcome::Pending),
            RailStatus::Succeeded => {
                let won = self
                    .db
                    .with_conn(|c| {
                        WithdrawalQueries::new(c).finish(&withdrawal.order_id, WithdrawalStatus::Completed, None)
                    })
                    .await?;
                if !won {
                    return Ok(WebhookOutcome::AlreadyFinal);
                }
                info!("Webhook[withdrawal]: {} COMPLETED", withdrawal.order_id);
                Ok(WebhookOutcome::Completed)
            }
            RailStatus::Failed => {
                let reason = event.description.as_deref().unwrap_or("payout failed");
                let won = self
                    .db
                    .with_tx(|tx| -> anyhow::Result<bool> {
                        if !WithdrawalQueries::new(tx).finish(
                            &withdrawal.order_id,
                            WithdrawalStatus::Failed,
                            Some(reason),
                        )? {
                            return Ok(false);
                        }
                        self.wallets(tx).credit_withdrawable(
                            &withdrawal.user_id,
                            withdrawal.amount,
                            Entry::new(TxType::Refund, &withdrawal.order_id),
                        )?;
                        Ok(true)
                    })
                    .await?;
                if !won {
                    return Ok(WebhookOutcome::AlreadyFinal);
                }
                info!(
                    "Webhook[withdrawal]: {} FAILED, refunded {} to {}",
                    withdrawal.order_id, withdrawal.amount, withdrawal.user_id
                );
                Ok(WebhookOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testkit::Kit;
    use crate::config::Config;
    use crate::db::WalletQueries;
    use crate::gateway::fakes::FakePushGateway;
    use serde_json::json;

    async fn provider_with_earnings(kit: &Kit, amount: i64) {
        kit.pair().await;
        kit.db
            .with_conn(|c| {
                WalletQueries::new(c, "KES").credit_withdrawable(
                    "p1",
                    amount,
                    Entry::new(TxType::Earning, "seed"),
                )
            })
            .await
            .unwrap();
    }

    fn request(amount: i64) -> WithdrawalRequest {
        WithdrawalRequest {
            amount,
            phone: "0712345678".to_string(),
        }
    }

    #[tokio::test]
    async fn test_withdrawal_debits_and_completes() {
        let kit = Kit::new().await;
        provider_with_earnings(&kit, 100_000).await;

        let w = kit.service.request_withdrawal("p1", request(60_000)).await.unwrap();
        assert!(w.order_id.starts_with("wd-"));
        assert_eq!(kit.wallet("p1").await.withdrawable, 40_000);
        let payouts = kit.push.payouts.lock().unwrap().clone();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].phone, "254712345678");

        let event = WithdrawalEvent::from_payload(&json!({
            "merchant_order_id": w.order_id,
            "status": "COMPLETED"
        }))
        .unwrap();
        assert_eq!(
            kit.service.reconcile_withdrawal(event.clone()).await.unwrap(),
            WebhookOutcome::Completed
        );
        assert_eq!(
            kit.service.reconcile_withdrawal(event).await.unwrap(),
            WebhookOutcome::AlreadyFinal
        );
        assert_eq!(kit.wallet("p1").await.withdrawable, 40_000);
    }

    #[tokio::test]
    async fn test_failed_payout_callback_refunds_once() {
        let kit = Kit::new().await;
        provider_with_earnings(&kit, 100_000).await;
        let w = kit.service.request_withdrawal("p1", request(60_000)).await.unwrap();

        let event = WithdrawalEvent::from_payload(&json!({
            "order_id": w.order_id,
            "status": "FAILED",
            "status_description": "Recipient unreachable"
        }))
        .unwrap();
        assert_eq!(
            kit.service.reconcile_withdrawal(event.clone()).await.unwrap(),
            WebhookOutcome::Failed
        );
        kit.service.reconcile_withdrawal(event).await.unwrap();

        assert_eq!(kit.wallet("p1").await.withdrawable, 100_000);
        let stored = kit
            .db
            .with_conn(|c| WithdrawalQueries::new(c).get_by_order_id(&w.order_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("Recipient unreachable"));
    }

    #[tokio::test]
    async fn test_rejected_payout_is_compensated() {
        let kit = Kit::with(Config::default(), FakePushGateway::failing()).await;
        provider_with_earnings(&kit, 100_000).await;

        let err = kit.service.request_withdrawal("p1", request(60_000)).await.unwrap_err();
        assert!(matches!(err, BrokerError::ProviderError(_)));
        assert_eq!(kit.wallet("p1").await.withdrawable, 100_000);
    }

    #[tokio::test]
    async fn test_withdrawal_validation() {
        let kit = Kit::new().await;
        provider_with_earnings(&kit, 50_000).await;

        assert!(matches!(
            kit.service.request_withdrawal("p1", request(5_000)).await,
            Err(BrokerError::Validation(_))
        ));
        assert!(matches!(
            kit.service.request_withdrawal("p1", request(10_050)).await,
            Err(BrokerError::Validation(_))
        ));
        assert!(matches!(
            kit.service.request_withdrawal("p1", request(60_000)).await,
            Err(BrokerError::InsufficientBalance)
        ));
        assert!(matches!(
            kit.service.request_withdrawal("r1", request(10_000)).await,
            Err(BrokerError::Unauthorized(_))
        ));
        assert_eq!(kit.wallet("p1").await.withdrawable, 50_000);
        assert!(kit.push.payouts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_payload_without_order_id_is_malformed() {
        assert!(matches!(
            WithdrawalEvent::from_payload(&json!({"status": "COMPLETED"})),
            Err(BrokerError::MalformedWebhook(_))
        ));
    }
}
