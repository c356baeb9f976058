//! Interaction request state machine
//!
//! PENDING -> ACCEPTED | REJECTED | EXPIRED, and
//! PENDING_VERIFICATION -> PENDING | REJECTED (see `verification`).
//! Every transition is a compare-and-swap on the stored status, run in the
//! same transaction as the wallet movements it causes.

use super::BrokerService;
use crate::{
    db::{
        ChatMessageModel, ChatQueries, ChatSessionModel, Entry, InteractionModel,
        InteractionQueries, InteractionStatus, PaymentQueries, PaymentStatus, TxType,
    },
    BrokerError, BrokerResult,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

const MAX_MESSAGE_LEN: usize = 4000;

/// Interaction as returned to participants
#[derive(Debug, Clone, Serialize)]
pub struct InteractionView {
    #[serde(flatten)]
    pub interaction: InteractionModel,
    /// PENDING past expiry reads as EXPIRED
    pub effective_status: InteractionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<ChatSessionModel>,
}

/// Result of an accept
#[derive(Debug, Clone, Serialize)]
pub struct AcceptOutcome {
    pub interaction: InteractionModel,
    pub session: ChatSessionModel,
    /// Amount credited to the provider's gross balance
    pub credited: i64,
    /// Other requests rejected to keep one engagement per provider
    pub auto_rejected: Vec<String>,
}

/// Result of a service-done confirmation
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCompletion {
    pub interaction_id: String,
    /// Amount moved from gross to withdrawable
    pub cleared: i64,
    /// Referral commission paid on the provider side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission: Option<i64>,
}

fn refused(message: impl Into<String>) -> BrokerError {
    BrokerError::InvalidStateTransition(message.into())
}

impl BrokerService {
    async fn load_interaction(&self, interaction_id: &str) -> BrokerResult<InteractionModel> {
        self.db
            .with_conn(|c| InteractionQueries::new(c).get(interaction_id))
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Interaction {}", interaction_id)))
    }

    /// Expire a request readers already see as EXPIRED and report the refusal
    async fn refuse_expired(&self, ir: &InteractionModel) -> BrokerResult<BrokerError> {
        let expired = self
            .db
            .with_tx(|tx| -> anyhow::Result<bool> { self.expire_request(tx, ir) })
            .await?;
        if expired {
            info!("Interaction {} expired on access, payment refunded", ir.id);
        }
        Ok(refused("Request has expired"))
    }

    /// Provider accepts a paid PENDING request
    pub async fn accept(&self, caller: &str, interaction_id: &str) -> BrokerResult<AcceptOutcome> {
        let ir = self.load_interaction(interaction_id).await?;
        if ir.provider_id != caller {
            return Err(BrokerError::Unauthorized(
                "Only the provider can accept this request".to_string(),
            ));
        }
        let now = Utc::now();
        if ir.status == InteractionStatus::Pending && ir.effective_status(now) == InteractionStatus::Expired {
            return Err(self.refuse_expired(&ir).await?);
        }
        if ir.status != InteractionStatus::Pending {
            return Err(refused(format!("Cannot accept a {} request", ir.status)));
        }

        let (outcome, rejected) = self
            .db
            .with_tx(|tx| -> BrokerResult<(AcceptOutcome, Vec<InteractionModel>)> {
                let irs = InteractionQueries::new(tx);
                if !irs.accept(&ir.id, now)? {
                    return Err(Self::explain_refused_accept(tx, &ir.id, now)?);
                }
                let payment_id = ir.payment_id.as_deref().unwrap_or_default();
                let amount = PaymentQueries::new(tx)
                    .get(payment_id)?
                    .map(|p| p.amount)
                    .ok_or_else(|| BrokerError::NotFound(format!("Payment {}", payment_id)))?;

                let session = ChatQueries::new(tx).create_session(
                    &ir.id,
                    now,
                    now + Duration::minutes(ir.duration_minutes),
                )?;
                self.wallets(tx)
                    .credit(&ir.provider_id, amount, Entry::new(TxType::Earning, &ir.id))?;

                let mut rejected = Vec::new();
                for other in irs.list_pending_for_provider(&ir.provider_id, &ir.id)? {
                    if irs.reject(&other.id, InteractionStatus::Pending, now)? {
                        self.refund_if_paid(tx, &other)?;
                        rejected.push(other);
                    }
                }

                let interaction = irs
                    .get(&ir.id)?
                    .ok_or_else(|| BrokerError::NotFound(format!("Interaction {}", ir.id)))?;
                Ok((
                    AcceptOutcome {
                        interaction,
                        session,
                        credited: amount,
                        auto_rejected: rejected.iter().map(|r| r.id.clone()).collect(),
                    },
                    rejected,
                ))
            })
            .await?;

        info!(
            "Interaction {} accepted by {}: credited {}, auto-rejected {}",
            ir.id,
            caller,
            outcome.credited,
            rejected.len()
        );
        if let Err(e) = self.profiles.set_available(caller, false).await {
            warn!("Failed to mark provider {} unavailable: {}", caller, e);
        }
        Self::log_notify_failure(
            "request_accepted",
            self.notifier.request_accepted(&ir.requester_id, &ir.id).await,
        );
        for other in &rejected {
            Self::log_notify_failure(
                "request_rejected",
                self.notifier.request_rejected(&other.requester_id, &other.id).await,
            );
        }
        Ok(outcome)
    }

    /// Why the accept compare-and-swap did not match
    fn explain_refused_accept(
        conn: &Connection,
        interaction_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BrokerError> {
        let Some(current) = InteractionQueries::new(conn).get(interaction_id)? else {
            return Ok(BrokerError::NotFound(format!("Interaction {}", interaction_id)));
        };
        if current.status != InteractionStatus::Pending {
            return Ok(refused(format!("Cannot accept a {} request", current.status)));
        }
        if current.expires_at <= now {
            return Ok(refused("Request has expired"));
        }
        let paid = match current.payment_id.as_deref() {
            Some(id) => PaymentQueries::new(conn).status(id)? == Some(PaymentStatus::Completed),
            None => false,
        };
        if !paid {
            return Ok(refused("Payment for this request has not completed"));
        }
        Ok(refused("Provider already has an active engagement"))
    }

    /// Provider rejects a PENDING request; a completed payment is refunded
    pub async fn reject(&self, caller: &str, interaction_id: &str) -> BrokerResult<InteractionModel> {
        let ir = self.load_interaction(interaction_id).await?;
        if ir.provider_id != caller {
            return Err(BrokerError::Unauthorized(
                "Only the provider can reject this request".to_string(),
            ));
        }
        let now = Utc::now();
        if ir.status == InteractionStatus::Pending && ir.effective_status(now) == InteractionStatus::Expired {
            return Err(self.refuse_expired(&ir).await?);
        }

        let (rejected, refunded) = self
            .db
            .with_tx(|tx| -> BrokerResult<(InteractionModel, i64)> {
                let irs = InteractionQueries::new(tx);
                if !irs.reject(&ir.id, InteractionStatus::Pending, now)? {
                    let status = irs.get(&ir.id)?.map(|c| c.status).unwrap_or(ir.status);
                    return Err(refused(format!("Cannot reject a {} request", status)));
                }
                let refunded = self.refund_if_paid(tx, &ir)?;
                let rejected = irs
                    .get(&ir.id)?
                    .ok_or_else(|| BrokerError::NotFound(format!("Interaction {}", ir.id)))?;
                Ok((rejected, refunded))
            })
            .await?;

        info!(
            "Interaction {} rejected by {}, refunded {} to {}",
            ir.id, caller, refunded, ir.requester_id
        );
        Self::log_notify_failure(
            "request_rejected",
            self.notifier.request_rejected(&ir.requester_id, &ir.id).await,
        );
        Ok(rejected)
    }

    /// Requester confirms the service happened; clears the provider's earning
    pub async fn service_done(&self, caller: &str, interaction_id: &str) -> BrokerResult<ServiceCompletion> {
        let ir = self.load_interaction(interaction_id).await?;
        if ir.requester_id != caller {
            return Err(BrokerError::Unauthorized(
                "Only the requester can confirm the service".to_string(),
            ));
        }
        if ir.status != InteractionStatus::Accepted {
            return Err(refused(format!("Cannot complete a {} request", ir.status)));
        }
        if ir.service_completed_at.is_some() {
            return Err(refused("Service already marked done"));
        }
        let now = Utc::now();

        let (cleared, commission) = self
            .db
            .with_tx(|tx| -> BrokerResult<(i64, Option<(String, i64)>)> {
                if !InteractionQueries::new(tx).complete_service(&ir.id, now)? {
                    return Err(refused("Service already marked done"));
                }
                let chats = ChatQueries::new(tx);
                if let Some(session) = chats.get_session_by_interaction(&ir.id)? {
                    chats.end_session(&session.id, now)?;
                    chats.purge_messages(&session.id)?;
                }

                let Some(payment_id) = ir.payment_id.as_deref() else {
                    return Ok((0, None));
                };
                let amount = PaymentQueries::new(tx)
                    .get(payment_id)?
                    .filter(|p| p.status == PaymentStatus::Completed)
                    .map(|p| p.amount)
                    .unwrap_or(0);

                let wallets = self.wallets(tx);
                let moved =
                    wallets.debit_up_to(&ir.provider_id, amount, Entry::new(TxType::Earning, &ir.id))?;
                if moved < amount {
                    warn!(
                        "Provider {} gross balance covered only {} of {} for {}",
                        ir.provider_id, moved, amount, ir.id
                    );
                }
                wallets.credit_withdrawable(&ir.provider_id, moved, Entry::new(TxType::Earning, &ir.id))?;
                let commission = self.pay_commission(tx, &ir.provider_id, payment_id, amount)?;
                Ok((moved, commission))
            })
            .await?;

        info!(
            "Interaction {} service done: cleared {} for provider {}",
            ir.id, cleared, ir.provider_id
        );
        if let Some((referrer, amount)) = &commission {
            info!(
                "Referral commission {} paid to {} for provider {}",
                amount, referrer, ir.provider_id
            );
        }
        if let Err(e) = self.profiles.set_available(&ir.provider_id, true).await {
            warn!("Failed to mark provider {} available: {}", ir.provider_id, e);
        }
        Ok(ServiceCompletion {
            interaction_id: ir.id,
            cleared,
            commission: commission.map(|(_, amount)| amount),
        })
    }

    /// Get a request; participants only
    pub async fn get_interaction(&self, caller: &str, interaction_id: &str) -> BrokerResult<InteractionView> {
        let ir = self.load_participant(caller, interaction_id).await?;
        let session = self
            .db
            .with_conn(|c| ChatQueries::new(c).get_session_by_interaction(&ir.id))
            .await?;
        Ok(InteractionView {
            effective_status: ir.effective_status(Utc::now()),
            interaction: ir,
            session,
        })
    }

    /// Store a chat message on an open session
    pub async fn post_message(
        &self,
        caller: &str,
        interaction_id: &str,
        body: &str,
    ) -> BrokerResult<ChatMessageModel> {
        let body = body.trim();
        if body.is_empty() {
            return Err(BrokerError::Validation("Message body is empty".to_string()));
        }
        if body.chars().count() > MAX_MESSAGE_LEN {
            return Err(BrokerError::Validation(format!(
                "Message longer than {} characters",
                MAX_MESSAGE_LEN
            )));
        }
        let ir = self.load_participant(caller, interaction_id).await?;
        let now = Utc::now();
        self.db
            .with_conn(|c| -> BrokerResult<ChatMessageModel> {
                let chats = ChatQueries::new(c);
                let session = chats
                    .get_session_by_interaction(&ir.id)?
                    .filter(|s| s.is_open(now) && ir.service_completed_at.is_none())
                    .ok_or_else(|| refused("Chat session is not open"))?;
                Ok(chats.insert_message(&session.id, caller, body)?)
            })
            .await
    }

    /// Messages of a request's session, oldest first
    pub async fn list_messages(&self, caller: &str, interaction_id: &str) -> BrokerResult<Vec<ChatMessageModel>> {
        let ir = self.load_participant(caller, interaction_id).await?;
        self.db
            .with_conn(|c| -> BrokerResult<Vec<ChatMessageModel>> {
                let chats = ChatQueries::new(c);
                match chats.get_session_by_interaction(&ir.id)? {
                    Some(session) => Ok(chats.list_messages(&session.id)?),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    async fn load_participant(&self, caller: &str, interaction_id: &str) -> BrokerResult<InteractionModel> {
        let ir = self.load_interaction(interaction_id).await?;
        if ir.requester_id != caller && ir.provider_id != caller {
            return Err(BrokerError::Unauthorized(
                "Not a participant of this request".to_string(),
            ));
        }
        Ok(ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testkit::Kit;
    use crate::broker::SettlementRequest;
    use crate::db::{InteractionKind, Role};
    use crate::profiles::ProfileDirectory;

    async fn paid_request(kit: &Kit, requester: &str, amount: i64) -> String {
        kit.fund(requester, amount).await;
        let outcome = kit
            .service
            .settle_wallet(
                requester,
                SettlementRequest {
                    provider_id: "p1".to_string(),
                    kind: InteractionKind::Chat,
                    amount,
                    duration_minutes: Some(60),
                    idempotency_key: uuid::Uuid::new_v4().to_string(),
                    phone: None,
                },
            )
            .await
            .unwrap();
        outcome.interaction_id.unwrap()
    }

    async fn expire_now(kit: &Kit, interaction_id: &str) {
        kit.db
            .with_conn(|c| {
                c.execute(
                    "UPDATE interaction_requests SET expires_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now() - Duration::minutes(1), interaction_id],
                )
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_rejects_other_pending_requests() {
        let kit = Kit::new().await;
        kit.pair().await;
        kit.user("r2", Role::Requester, true).await;
        kit.user("r3", Role::Requester, true).await;

        let a = paid_request(&kit, "r1", 170_000).await;
        let b = paid_request(&kit, "r2", 70_000).await;
        let c = paid_request(&kit, "r3", 90_000).await;

        let outcome = kit.service.accept("p1", &a).await.unwrap();
        assert_eq!(outcome.interaction.status, InteractionStatus::Accepted);
        assert_eq!(outcome.credited, 170_000);
        assert_eq!(outcome.auto_rejected.len(), 2);
        assert_eq!(
            (outcome.session.ends_at - outcome.session.started_at).num_minutes(),
            60
        );

        assert_eq!(kit.interaction(&b).await.status, InteractionStatus::Rejected);
        assert_eq!(kit.interaction(&c).await.status, InteractionStatus::Rejected);
        assert_eq!(kit.wallet("p1").await.balance, 170_000);
        assert_eq!(kit.wallet("r2").await.balance, 70_000);
        assert_eq!(kit.wallet("r3").await.balance, 90_000);

        assert!(!kit.profiles.is_eligible("p1").await.unwrap());
        assert_eq!(kit.notifier.count("REQUEST_ACCEPTED"), 1);
        assert_eq!(kit.notifier.count("REQUEST_REJECTED"), 2);
    }

    #[tokio::test]
    async fn test_accept_twice_credits_once() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;

        kit.service.accept("p1", &a).await.unwrap();
        let err = kit.service.accept("p1", &a).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidStateTransition(_)));
        assert_eq!(kit.wallet("p1").await.balance, 70_000);
        assert_eq!(kit.tx_count("p1").await, 1);
    }

    #[tokio::test]
    async fn test_accept_reject_race_resolves_once() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;

        let (accepted, rejected) = tokio::join!(kit.service.accept("p1", &a), kit.service.reject("p1", &a));
        assert!(accepted.is_ok() ^ rejected.is_ok());

        let p1 = kit.wallet("p1").await.balance;
        let r1 = kit.wallet("r1").await.balance;
        assert_eq!(p1 + r1, 70_000);
        let status = kit.interaction(&a).await.status;
        assert!(matches!(status, InteractionStatus::Accepted | InteractionStatus::Rejected));
    }

    #[tokio::test]
    async fn test_only_provider_decides() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;
        assert!(matches!(
            kit.service.accept("r1", &a).await,
            Err(BrokerError::Unauthorized(_))
        ));
        assert!(matches!(
            kit.service.reject("r1", &a).await,
            Err(BrokerError::Unauthorized(_))
        ));
        assert!(matches!(
            kit.service.accept("p1", "missing").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_refunds_payment() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;

        let rejected = kit.service.reject("p1", &a).await.unwrap();
        assert_eq!(rejected.status, InteractionStatus::Rejected);
        assert!(rejected.rejected_at.is_some());
        assert_eq!(kit.wallet("r1").await.balance, 70_000);

        assert!(matches!(
            kit.service.accept("p1", &a).await,
            Err(BrokerError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            kit.service.reject("p1", &a).await,
            Err(BrokerError::InvalidStateTransition(_))
        ));
        assert_eq!(kit.wallet("r1").await.balance, 70_000);
    }

    #[tokio::test]
    async fn test_expired_request_cannot_be_accepted() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;
        expire_now(&kit, &a).await;

        let view = kit.service.get_interaction("r1", &a).await.unwrap();
        assert_eq!(view.effective_status, InteractionStatus::Expired);

        let err = kit.service.accept("p1", &a).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidStateTransition(_)));
        assert_eq!(kit.interaction(&a).await.status, InteractionStatus::Expired);
        assert_eq!(kit.wallet("r1").await.balance, 70_000);
        assert_eq!(kit.wallet("p1").await.balance, 0);
    }

    #[tokio::test]
    async fn test_service_done_clears_earning_and_purges_chat() {
        let kit = Kit::new().await;
        kit.pair().await;
        kit.user("ref", Role::Provider, true).await;
        kit.service.register_referral("p1", "ref").await.unwrap();
        let a = paid_request(&kit, "r1", 170_000).await;

        assert!(matches!(
            kit.service.post_message("r1", &a, "hi").await,
            Err(BrokerError::InvalidStateTransition(_))
        ));
        kit.service.accept("p1", &a).await.unwrap();
        kit.service.post_message("r1", &a, "hi").await.unwrap();
        kit.service.post_message("p1", &a, "hello").await.unwrap();
        assert_eq!(kit.service.list_messages("p1", &a).await.unwrap().len(), 2);
        assert!(matches!(
            kit.service.post_message("r2", &a, "intruder").await,
            Err(BrokerError::Unauthorized(_))
        ));

        assert!(matches!(
            kit.service.service_done("p1", &a).await,
            Err(BrokerError::Unauthorized(_))
        ));
        let done = kit.service.service_done("r1", &a).await.unwrap();
        assert_eq!(done.cleared, 170_000);
        assert_eq!(done.commission, Some(8_500));

        let wallet = kit.wallet("p1").await;
        assert_eq!(wallet.balance, 0);
        // 20_000 signup bonus plus the cleared earning
        assert_eq!(wallet.withdrawable, 190_000);
        assert_eq!(kit.wallet("ref").await.balance, 8_500);

        assert!(kit.service.list_messages("r1", &a).await.unwrap().is_empty());
        assert!(kit.service.post_message("r1", &a, "late").await.is_err());
        let view = kit.service.get_interaction("p1", &a).await.unwrap();
        assert!(view.session.unwrap().ended_at.is_some());
        assert!(kit.profiles.is_eligible("p1").await.unwrap());

        let err = kit.service.service_done("r1", &a).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidStateTransition(_)));
        assert_eq!(kit.wallet("p1").await.withdrawable, 190_000);
    }

    #[tokio::test]
    async fn test_service_done_requires_acceptance() {
        let kit = Kit::new().await;
        kit.pair().await;
        let a = paid_request(&kit, "r1", 70_000).await;
        assert!(matches!(
            kit.service.service_done("r1", &a).await,
            Err(BrokerError::InvalidStateTransition(_))
        ));
    }
}
