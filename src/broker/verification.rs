//! Identity-verification release gate

use super::BrokerService;
use crate::{
    db::{InteractionModel, InteractionQueries, InteractionStatus},
    BrokerError, BrokerResult,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// What one verification event did to the requester's held requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseSummary {
    /// Held requests now PENDING
    pub released: usize,
    /// Held requests rejected and refunded
    pub refunded: usize,
}

/// How a single held request was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum HeldOutcome {
    Released,
    Refunded(i64),
}

impl HeldOutcome {
    /// Status the request ends up in
    pub(super) fn status(self) -> InteractionStatus {
        match self {
            HeldOutcome::Released => InteractionStatus::Pending,
            HeldOutcome::Refunded(_) => InteractionStatus::Rejected,
        }
    }
}

impl BrokerService {
    /// Mark `user_id` verified and settle every request held for them.
    ///
    /// A held request is released when its provider still accepts requests
    /// and is available, otherwise it is rejected and its payment refunded.
    pub async fn complete_verification(&self, user_id: &str) -> BrokerResult<ReleaseSummary> {
        if self.profiles.role(user_id).await?.is_none() {
            return Err(BrokerError::NotFound(format!("Profile {}", user_id)));
        }
        if self.profiles.mark_verified(user_id).await? {
            info!("Verification: {} verified", user_id);
        }

        let held = self
            .db
            .with_conn(|c| {
                InteractionQueries::new(c)
                    .list_for_requester(user_id, InteractionStatus::PendingVerification)
            })
            .await?;
        let mut summary = ReleaseSummary::default();
        if held.is_empty() {
            return Ok(summary);
        }

        let total = held.len();
        for (idx, ir) in held.into_iter().enumerate() {
            match self.settle_held(&ir).await? {
                Some(HeldOutcome::Released) => {
                    summary.released += 1;
                    info!("[Verification {}/{}] Released {} to {}", idx + 1, total, ir.id, ir.provider_id);
                }
                Some(HeldOutcome::Refunded(amount)) => {
                    summary.refunded += 1;
                    info!(
                        "[Verification {}/{}] Provider {} unavailable, rejected {} and refunded {}",
                        idx + 1,
                        total,
                        ir.provider_id,
                        ir.id,
                        amount
                    );
                }
                None => {}
            }
        }

        info!(
            "Verification: {} released {}, refunded {}",
            user_id, summary.released, summary.refunded
        );
        Ok(summary)
    }

    /// Settle a request just committed as held.
    ///
    /// The verified flag was read before that commit, so verification may
    /// have completed in between and its batch already run; nothing else
    /// would ever release the request. Errors are logged, since the payment
    /// behind the request has already committed.
    pub(super) async fn recheck_held(&self, requester_id: &str, interaction_id: &str) -> Option<HeldOutcome> {
        match self.try_recheck_held(requester_id, interaction_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Verification: recheck of held request {} failed: {}", interaction_id, e);
                None
            }
        }
    }

    async fn try_recheck_held(
        &self,
        requester_id: &str,
        interaction_id: &str,
    ) -> BrokerResult<Option<HeldOutcome>> {
        if !self.profiles.is_verified(requester_id).await? {
            return Ok(None);
        }
        let ir = self
            .db
            .with_conn(|c| InteractionQueries::new(c).get(interaction_id))
            .await?;
        let Some(ir) = ir.filter(|ir| ir.status == InteractionStatus::PendingVerification) else {
            return Ok(None);
        };
        let outcome = self.settle_held(&ir).await?;
        if let Some(outcome) = outcome {
            info!(
                "Verification: {} completed while {} was being held, now {}",
                requester_id,
                interaction_id,
                outcome.status()
            );
        }
        Ok(outcome)
    }

    /// Release one held request, or reject and refund it when its provider
    /// is no longer eligible. None if the request was no longer held.
    async fn settle_held(&self, ir: &InteractionModel) -> BrokerResult<Option<HeldOutcome>> {
        let now = Utc::now();
        if self.profiles.is_eligible(&ir.provider_id).await? {
            let expires_at = now + Duration::minutes(self.config.settlement.request_expiry_minutes);
            let released = self
                .db
                .with_conn(|c| InteractionQueries::new(c).release(&ir.id, expires_at))
                .await?;
            if !released {
                return Ok(None);
            }
            Self::log_notify_failure(
                "paid_request",
                self.notifier.paid_request(&ir.provider_id, &ir.id).await,
            );
            return Ok(Some(HeldOutcome::Released));
        }

        let refunded = self
            .db
            .with_tx(|tx| -> anyhow::Result<Option<i64>> {
                if !InteractionQueries::new(tx).reject(&ir.id, InteractionStatus::PendingVerification, now)? {
                    return Ok(None);
                }
                Ok(Some(self.refund_if_paid(tx, ir)?))
            })
            .await?;
        let Some(amount) = refunded else {
            return Ok(None);
        };
        Self::log_notify_failure(
            "verification_refund",
            self.notifier.verification_refund(&ir.requester_id, &ir.id, amount).await,
        );
        Ok(Some(HeldOutcome::Refunded(amount)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testkit::Kit;
    use crate::broker::{RailEvent, SettlementRequest, WebhookOutcome};
    use crate::db::{InteractionKind, ProviderTag, Role, TxType, WalletQueries};
    use crate::profiles::ProfileDirectory;

    async fn held_request(kit: &Kit, provider: &str, key: &str) -> String {
        kit.service
            .settle_wallet(
                "r1",
                SettlementRequest {
                    provider_id: provider.to_string(),
                    kind: InteractionKind::Booking,
                    amount: 70_000,
                    duration_minutes: None,
                    idempotency_key: key.to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap()
            .interaction_id
            .unwrap()
    }

    #[tokio::test]
    async fn test_release_and_refund_batch() {
        let kit = Kit::new().await;
        kit.user("r1", Role::Requester, false).await;
        kit.user("p1", Role::Provider, true).await;
        kit.user("p2", Role::Provider, true).await;
        kit.fund("r1", 140_000).await;

        let a = held_request(&kit, "p1", "k1").await;
        let b = held_request(&kit, "p2", "k2").await;
        assert_eq!(kit.interaction(&a).await.status, InteractionStatus::PendingVerification);
        kit.profiles.set_available("p2", false).await.unwrap();

        let summary = kit.service.complete_verification("r1").await.unwrap();
        assert_eq!(summary, ReleaseSummary { released: 1, refunded: 1 });

        let released = kit.interaction(&a).await;
        assert_eq!(released.status, InteractionStatus::Pending);
        assert!(released.expires_at > Utc::now() + Duration::minutes(29));
        assert_eq!(kit.interaction(&b).await.status, InteractionStatus::Rejected);

        assert_eq!(kit.wallet("r1").await.balance, 70_000);
        let refunds = kit
            .db
            .with_conn(|c| WalletQueries::new(c, "KES").count_by_reference(&b, Some(TxType::Refund)))
            .await
            .unwrap();
        assert_eq!(refunds, 1);
        assert_eq!(kit.notifier.count("PAID_REQUEST"), 1);
        assert_eq!(kit.notifier.count("KYC_REFUND"), 1);
        assert!(kit.profiles.is_verified("r1").await.unwrap());

        // a second verification event finds nothing held
        let again = kit.service.complete_verification("r1").await.unwrap();
        assert_eq!(again, ReleaseSummary::default());
        assert_eq!(kit.wallet("r1").await.balance, 70_000);
    }

    #[tokio::test]
    async fn test_webhook_racing_verification_still_releases() {
        let kit = Kit::with_lagging_verification(1).await;
        kit.user("r1", Role::Requester, false).await;
        kit.user("p1", Role::Provider, true).await;

        let outcome = kit
            .service
            .settle_onchain(
                "r1",
                SettlementRequest {
                    provider_id: "p1".to_string(),
                    kind: InteractionKind::Video,
                    amount: 150_000,
                    duration_minutes: None,
                    idempotency_key: "k1".to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap();

        // verification lands first and finds nothing held yet
        let summary = kit.service.complete_verification("r1").await.unwrap();
        assert_eq!(summary, ReleaseSummary::default());

        // the webhook's flag read predates the verification
        let deposit_id = kit.deposits.deposits.lock().unwrap()[0].deposit_id.clone();
        let result = kit
            .service
            .reconcile(RailEvent::succeeded(ProviderTag::OnChain, &deposit_id))
            .await
            .unwrap();
        assert_eq!(result, WebhookOutcome::Completed);

        let ir = kit
            .db
            .with_conn(|c| InteractionQueries::new(c).get_by_payment(&outcome.payment_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ir.status, InteractionStatus::Pending);
        assert_eq!(kit.notifier.count("PAID_REQUEST"), 1);
    }

    #[tokio::test]
    async fn test_wallet_settlement_racing_verification_still_releases() {
        let kit = Kit::with_lagging_verification(1).await;
        kit.user("r1", Role::Requester, true).await;
        kit.user("p1", Role::Provider, true).await;
        kit.fund("r1", 70_000).await;

        let id = held_request(&kit, "p1", "k1").await;
        assert_eq!(kit.interaction(&id).await.status, InteractionStatus::Pending);
        assert_eq!(kit.notifier.count("PAID_REQUEST"), 1);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let kit = Kit::new().await;
        assert!(matches!(
            kit.service.complete_verification("ghost").await,
            Err(BrokerError::NotFound(_))
        ));
    }
}
