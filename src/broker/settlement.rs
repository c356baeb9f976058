//! Settlement flows
//!
//! Each flow ends in a Payment row and, once paid, an interaction request:
//! - wallet-only: one transaction, payment COMPLETED immediately
//! - push payment: wallet portion debited, STK prompt sent, then the call
//!   blocks polling the payment until it settles or the deadline passes
//! - on-chain: wallet portion debited, deposit page returned; the
//!   interaction is created by the reconciler on confirmation

use super::{BrokerService, Compensation};
use crate::{
    db::{
        Entry, InteractionModel, InteractionQueries, InteractionStatus, InteractionTarget,
        InteractionKind, PaymentContext, PaymentModel, PaymentQueries, PaymentStatus, ProviderTag,
        TxType,
    },
    gateway::{normalize_phone, DepositRequest, PushRequest},
    pricing, BrokerError, BrokerResult,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Settlement request, shared by all rails
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementRequest {
    /// Provider being paid
    pub provider_id: String,
    /// Interaction kind
    pub kind: InteractionKind,
    /// Client price in minor units
    pub amount: i64,
    /// Session length; configured default when absent
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    /// Caller-supplied key, unique per attempt
    pub idempotency_key: String,
    /// Payer phone, push payment only
    #[serde(default)]
    pub phone: Option<String>,
}

/// Result of a settlement call
#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    /// Payment ID
    pub payment_id: String,
    /// Rail the payment went through
    pub provider: ProviderTag,
    /// Payment status at return time
    pub payment_status: PaymentStatus,
    /// Client price
    pub amount: i64,
    /// Part taken from the requester's wallet
    pub wallet_portion: i64,
    /// Interaction, once one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Interaction status, once one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_status: Option<InteractionStatus>,
    /// Deposit page (on-chain)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    /// Asset amount to send (on-chain)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_amount: Option<f64>,
    /// True when an earlier call with the same idempotency key is returned
    pub replayed: bool,
}

impl SettlementOutcome {
    fn from_records(payment: &PaymentModel, ir: Option<&InteractionModel>, replayed: bool) -> Self {
        let asset_amount = match &payment.context {
            PaymentContext::OnChain { asset_amount, .. } => Some(*asset_amount),
            _ => None,
        };
        Self {
            payment_id: payment.id.clone(),
            provider: payment.provider,
            payment_status: payment.status,
            amount: payment.amount,
            wallet_portion: payment.context.wallet_portion(),
            interaction_id: ir.map(|ir| ir.id.clone()),
            interaction_status: ir.map(|ir| ir.effective_status(Utc::now())),
            page_url: None,
            asset_amount,
            replayed,
        }
    }
}

impl BrokerService {
    /// Settle entirely from the requester's gross balance
    pub async fn settle_wallet(
        &self,
        payer_id: &str,
        req: SettlementRequest,
    ) -> BrokerResult<SettlementOutcome> {
        info!(
            "Settlement[wallet]: payer={} provider={} amount={} key={}",
            payer_id, req.provider_id, req.amount, req.idempotency_key
        );
        if let Some(outcome) = self.lookup_replay(payer_id, &req.idempotency_key).await? {
            return Ok(outcome);
        }
        let target = self.validate_settlement(payer_id, &req).await?;
        self.settle_from_wallet(payer_id, &req, target).await
    }

    /// Settle through a mobile-money push prompt, blocking until the payment
    /// settles or the poll deadline passes
    pub async fn settle_push(
        &self,
        payer_id: &str,
        req: SettlementRequest,
    ) -> BrokerResult<SettlementOutcome> {
        info!(
            "Settlement[push]: payer={} provider={} amount={} key={}",
            payer_id, req.provider_id, req.amount, req.idempotency_key
        );
        if let Some(outcome) = self.lookup_replay(payer_id, &req.idempotency_key).await? {
            return Ok(outcome);
        }
        let target = self.validate_settlement(payer_id, &req).await?;

        let balance = self.db.with_conn(|c| self.wallets(c).balance(payer_id)).await?;
        let wallet_portion = balance.clamp(0, req.amount);
        if wallet_portion == req.amount {
            info!("Settlement[push]: wallet covers {}, settling from wallet", req.amount);
            return self.settle_from_wallet(payer_id, &req, target).await;
        }

        let phone = req
            .phone
            .as_deref()
            .and_then(normalize_phone)
            .ok_or_else(|| BrokerError::Validation("A valid phone number is required".to_string()))?;

        let payment_id = uuid::Uuid::new_v4().to_string();
        let order_id = uuid::Uuid::new_v4().to_string();
        let context = PaymentContext::PushPayment {
            target: target.clone(),
            wallet_portion,
            phone: phone.clone(),
        };
        if let Some(outcome) = self
            .open_pending_payment(
                payer_id,
                &req,
                &payment_id,
                ProviderTag::PushPayment,
                &order_id,
                context,
            )
            .await?
        {
            return Ok(outcome);
        }

        let mut saga = self.saga(format!("push:{}", payment_id));
        if wallet_portion > 0 {
            saga.on_abort(Compensation::RefundWallet {
                user_id: payer_id.to_string(),
                amount: wallet_portion,
                reference: payment_id.clone(),
            });
        }
        saga.on_abort(Compensation::FailPayment {
            payment_id: payment_id.clone(),
        });

        let push = PushRequest {
            order_id: order_id.clone(),
            amount: req.amount - wallet_portion,
            currency: self.currency().to_string(),
            phone,
            description: format!("{} request", target.kind),
            callback_url: self.config.callback_url("push"),
        };
        if let Err(e) = self.push.initiate_push(&push).await {
            error!("Settlement[push]: rail rejected payment {}: {}", payment_id, e);
            saga.abort().await;
            return Err(BrokerError::ProviderError(format!(
                "Push payment could not be started: {}",
                e
            )));
        }

        let now = Utc::now();
        let created = self
            .db
            .with_tx(|tx| -> BrokerResult<InteractionModel> {
                let irs = InteractionQueries::new(tx);
                // the webhook may have beaten us here
                if let Some(existing) = irs.get_by_payment(&payment_id)? {
                    return Ok(existing);
                }
                let ir = self.new_interaction(payer_id, &target, &payment_id, InteractionStatus::Pending, now);
                irs.insert(&ir)?;
                Ok(ir)
            })
            .await;
        let ir = match created {
            Ok(ir) => ir,
            Err(e) => {
                error!("Settlement[push]: failed to record interaction for {}: {}", payment_id, e);
                saga.abort().await;
                return Err(e);
            }
        };
        // from here on the webhook or the timeout path owns compensation
        saga.commit();

        info!(
            "Settlement[push]: payment {} (order {}) awaiting confirmation, interaction {}",
            payment_id, order_id, ir.id
        );
        self.await_confirmation(&payment_id).await
    }

    /// Settle through an on-chain deposit; returns the deposit page
    pub async fn settle_onchain(
        &self,
        payer_id: &str,
        req: SettlementRequest,
    ) -> BrokerResult<SettlementOutcome> {
        info!(
            "Settlement[onchain]: payer={} provider={} amount={} key={}",
            payer_id, req.provider_id, req.amount, req.idempotency_key
        );
        if let Some(outcome) = self.lookup_replay(payer_id, &req.idempotency_key).await? {
            return Ok(outcome);
        }
        let target = self.validate_settlement(payer_id, &req).await?;

        let balance = self.db.with_conn(|c| self.wallets(c).balance(payer_id)).await?;
        let wallet_portion = balance.clamp(0, req.amount);
        if wallet_portion == req.amount {
            info!("Settlement[onchain]: wallet covers {}, settling from wallet", req.amount);
            return self.settle_from_wallet(payer_id, &req, target).await;
        }
        let remainder = req.amount - wallet_portion;

        let rate = self
            .deposits
            .rate()
            .await
            .map_err(|e| BrokerError::ProviderError(format!("Exchange rate unavailable: {}", e)))?;
        let asset_amount = pricing::asset_amount(remainder, rate)
            .map_err(|e| BrokerError::ProviderError(e.to_string()))?;
        let asset = self.config.onchain.asset.clone();

        let payment_id = uuid::Uuid::new_v4().to_string();
        let deposit_id = uuid::Uuid::new_v4().to_string();
        let context = PaymentContext::OnChain {
            target: target.clone(),
            wallet_portion,
            asset: asset.clone(),
            asset_amount,
            rate,
        };
        if let Some(outcome) = self
            .open_pending_payment(
                payer_id,
                &req,
                &payment_id,
                ProviderTag::OnChain,
                &deposit_id,
                context,
            )
            .await?
        {
            return Ok(outcome);
        }

        let mut saga = self.saga(format!("onchain:{}", payment_id));
        if wallet_portion > 0 {
            saga.on_abort(Compensation::RefundWallet {
                user_id: payer_id.to_string(),
                amount: wallet_portion,
                reference: payment_id.clone(),
            });
        }
        saga.on_abort(Compensation::FailPayment {
            payment_id: payment_id.clone(),
        });

        let deposit = DepositRequest {
            deposit_id: deposit_id.clone(),
            expected_amount: asset_amount,
            webhook_url: self.config.callback_url("onchain"),
            notes: format!("{} request for {}", target.kind, target.provider_id),
        };
        let response = match self.deposits.initiate_deposit(&deposit).await {
            Ok(response) => response,
            Err(e) => {
                error!("Settlement[onchain]: rail rejected deposit {}: {}", deposit_id, e);
                saga.abort().await;
                return Err(BrokerError::ProviderError(format!(
                    "Deposit could not be started: {}",
                    e
                )));
            }
        };
        saga.commit();

        info!(
            "Settlement[onchain]: payment {} awaiting deposit {} of {} {} at rate {}",
            payment_id, deposit_id, asset_amount, asset, rate
        );
        let payment = self.payment_by_id(&payment_id).await?;
        let mut outcome = SettlementOutcome::from_records(&payment, None, false);
        outcome.page_url = Some(response.page_url);
        Ok(outcome)
    }

    /// Get a payment; only its payer may read it
    pub async fn get_payment(&self, caller: &str, payment_id: &str) -> BrokerResult<PaymentModel> {
        let payment = self.payment_by_id(payment_id).await?;
        if payment.payer_id != caller {
            return Err(BrokerError::Unauthorized("Not your payment".to_string()));
        }
        Ok(payment)
    }

    async fn payment_by_id(&self, payment_id: &str) -> BrokerResult<PaymentModel> {
        self.db
            .with_conn(|c| PaymentQueries::new(c).get(payment_id))
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Payment {}", payment_id)))
    }

    async fn validate_settlement(
        &self,
        payer_id: &str,
        req: &SettlementRequest,
    ) -> BrokerResult<InteractionTarget> {
        if req.amount <= 0 {
            return Err(BrokerError::Validation("Amount must be positive".to_string()));
        }
        if req.amount > self.pricing.max_amount() {
            return Err(BrokerError::Validation(format!(
                "Amount exceeds the maximum of {}",
                self.pricing.max_amount()
            )));
        }
        if req.idempotency_key.trim().is_empty() {
            return Err(BrokerError::Validation("idempotency_key is required".to_string()));
        }
        if payer_id == req.provider_id {
            return Err(BrokerError::Validation("Cannot pay yourself".to_string()));
        }
        let duration_minutes = req
            .duration_minutes
            .unwrap_or(self.config.settlement.default_duration_minutes);
        if duration_minutes <= 0 {
            return Err(BrokerError::Validation("Duration must be positive".to_string()));
        }
        if !self.profiles.is_eligible(&req.provider_id).await? {
            return Err(BrokerError::Validation(
                "Provider is not accepting requests".to_string(),
            ));
        }
        Ok(InteractionTarget {
            provider_id: req.provider_id.clone(),
            kind: req.kind,
            duration_minutes,
        })
    }

    /// Existing outcome for an idempotency key, if this payer used it before
    fn replay(
        &self,
        conn: &Connection,
        payer_id: &str,
        key: &str,
    ) -> BrokerResult<Option<SettlementOutcome>> {
        let Some(payment) = PaymentQueries::new(conn).get_by_idempotency_key(key)? else {
            return Ok(None);
        };
        if payment.payer_id != payer_id {
            return Err(BrokerError::Validation(
                "idempotency_key already used".to_string(),
            ));
        }
        let ir = InteractionQueries::new(conn).get_by_payment(&payment.id)?;
        info!("Settlement: replaying payment {} for key {}", payment.id, key);
        Ok(Some(SettlementOutcome::from_records(&payment, ir.as_ref(), true)))
    }

    async fn lookup_replay(&self, payer_id: &str, key: &str) -> BrokerResult<Option<SettlementOutcome>> {
        self.db.with_conn(|c| self.replay(c, payer_id, key)).await
    }

    pub(super) fn new_interaction(
        &self,
        requester_id: &str,
        target: &InteractionTarget,
        payment_id: &str,
        status: InteractionStatus,
        now: DateTime<Utc>,
    ) -> InteractionModel {
        InteractionModel {
            id: uuid::Uuid::new_v4().to_string(),
            requester_id: requester_id.to_string(),
            provider_id: target.provider_id.clone(),
            kind: target.kind,
            payment_id: Some(payment_id.to_string()),
            status,
            duration_minutes: target.duration_minutes,
            expires_at: now + chrono::Duration::minutes(self.config.settlement.request_expiry_minutes),
            created_at: now,
            accepted_at: None,
            rejected_at: None,
            service_completed_at: None,
        }
    }

    async fn settle_from_wallet(
        &self,
        payer_id: &str,
        req: &SettlementRequest,
        target: InteractionTarget,
    ) -> BrokerResult<SettlementOutcome> {
        let status = if self.profiles.is_verified(payer_id).await? {
            InteractionStatus::Pending
        } else {
            InteractionStatus::PendingVerification
        };
        let now = Utc::now();
        let payment_id = uuid::Uuid::new_v4().to_string();

        let mut outcome = self
            .db
            .with_tx(|tx| -> BrokerResult<SettlementOutcome> {
                if let Some(outcome) = self.replay(tx, payer_id, &req.idempotency_key)? {
                    return Ok(outcome);
                }
                if !self.wallets(tx).debit(
                    payer_id,
                    req.amount,
                    Entry::new(TxType::Payment, &payment_id),
                )? {
                    return Err(BrokerError::InsufficientBalance);
                }
                let payment = PaymentModel {
                    id: payment_id.clone(),
                    payer_id: payer_id.to_string(),
                    amount: req.amount,
                    currency: self.currency().to_string(),
                    provider: ProviderTag::Wallet,
                    provider_ref: format!("wallet-{}", payment_id),
                    idempotency_key: req.idempotency_key.clone(),
                    status: PaymentStatus::Completed,
                    context: PaymentContext::WalletOnly {
                        target: target.clone(),
                    },
                    created_at: now,
                    completed_at: Some(now),
                };
                PaymentQueries::new(tx).insert(&payment)?;
                let ir = self.new_interaction(payer_id, &target, &payment_id, status, now);
                InteractionQueries::new(tx).insert(&ir)?;
                Ok(SettlementOutcome::from_records(&payment, Some(&ir), false))
            })
            .await?;

        if outcome.replayed {
            return Ok(outcome);
        }
        info!(
            "Settlement[wallet]: payment {} completed, interaction {} is {}",
            outcome.payment_id,
            outcome.interaction_id.as_deref().unwrap_or("-"),
            status
        );
        Self::log_notify_failure(
            "payment_confirmed",
            self.notifier.payment_confirmed(payer_id, &outcome.payment_id).await,
        );
        match (status, outcome.interaction_id.clone()) {
            (InteractionStatus::Pending, Some(ir_id)) => {
                Self::log_notify_failure(
                    "paid_request",
                    self.notifier.paid_request(&target.provider_id, &ir_id).await,
                );
            }
            (InteractionStatus::PendingVerification, Some(ir_id)) => {
                if let Some(held) = self.recheck_held(payer_id, &ir_id).await {
                    outcome.interaction_status = Some(held.status());
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Debit the wallet portion and insert the PENDING payment in one
    /// transaction. Returns an earlier outcome if the key was already used.
    async fn open_pending_payment(
        &self,
        payer_id: &str,
        req: &SettlementRequest,
        payment_id: &str,
        provider: ProviderTag,
        provider_ref: &str,
        context: PaymentContext,
    ) -> BrokerResult<Option<SettlementOutcome>> {
        let wallet_portion = context.wallet_portion();
        self.db
            .with_tx(|tx| -> BrokerResult<Option<SettlementOutcome>> {
                if let Some(outcome) = self.replay(tx, payer_id, &req.idempotency_key)? {
                    return Ok(Some(outcome));
                }
                if !self.wallets(tx).debit(
                    payer_id,
                    wallet_portion,
                    Entry::new(TxType::Payment, payment_id),
                )? {
                    return Err(BrokerError::InsufficientBalance);
                }
                PaymentQueries::new(tx).insert(&PaymentModel {
                    id: payment_id.to_string(),
                    payer_id: payer_id.to_string(),
                    amount: req.amount,
                    currency: self.currency().to_string(),
                    provider,
                    provider_ref: provider_ref.to_string(),
                    idempotency_key: req.idempotency_key.clone(),
                    status: PaymentStatus::Pending,
                    context,
                    created_at: Utc::now(),
                    completed_at: None,
                })?;
                Ok(None)
            })
            .await
    }

    /// Poll a push payment until it leaves PENDING or the deadline passes
    async fn await_confirmation(&self, payment_id: &str) -> BrokerResult<SettlementOutcome> {
        let settings = &self.config.settlement;
        let interval = Duration::from_secs(settings.poll_interval_secs);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(settings.poll_deadline_secs);

        loop {
            tokio::time::sleep(interval).await;
            let status = self
                .db
                .with_conn(|c| PaymentQueries::new(c).status(payment_id))
                .await?
                .ok_or_else(|| BrokerError::NotFound(format!("Payment {}", payment_id)))?;
            debug!("Settlement[push]: payment {} is {}", payment_id, status);
            match status {
                PaymentStatus::Completed => return self.settled_outcome(payment_id).await,
                PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Expired => {
                    return Err(BrokerError::ProviderError(format!(
                        "Payment {}",
                        status.as_str().to_lowercase()
                    )));
                }
                PaymentStatus::Pending => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        warn!(
            "Settlement[push]: payment {} not confirmed within {}s, cancelling",
            payment_id, settings.poll_deadline_secs
        );
        let payment = self.payment_by_id(payment_id).await?;
        let cancelled = self
            .db
            .with_tx(|tx| -> anyhow::Result<bool> {
                self.unwind_pending_payment(tx, &payment, PaymentStatus::Cancelled)
            })
            .await?;
        if cancelled {
            return Err(BrokerError::ProviderError(format!(
                "Payment not confirmed within {}s and was cancelled",
                settings.poll_deadline_secs
            )));
        }

        // a webhook settled it between the last poll and the cancel
        let payment = self.payment_by_id(payment_id).await?;
        match payment.status {
            PaymentStatus::Completed => self.settled_outcome(payment_id).await,
            other => Err(BrokerError::ProviderError(format!(
                "Payment {}",
                other.as_str().to_lowercase()
            ))),
        }
    }

    async fn settled_outcome(&self, payment_id: &str) -> BrokerResult<SettlementOutcome> {
        self.db
            .with_conn(|c| -> BrokerResult<SettlementOutcome> {
                let payment = PaymentQueries::new(c)
                    .get(payment_id)?
                    .ok_or_else(|| BrokerError::NotFound(format!("Payment {}", payment_id)))?;
                let ir = InteractionQueries::new(c).get_by_payment(payment_id)?;
                Ok(SettlementOutcome::from_records(&payment, ir.as_ref(), false))
            })
            .await
    }
}
