//! Webhook reconciliation
//!
//! Rails deliver at least once. Every handler here resolves the payment by
//! its external reference and moves it out of PENDING with a
//! compare-and-swap inside the same transaction as the money movements it
//! triggers, so a replayed or racing delivery finds nothing left to do.

use super::BrokerService;
use crate::{
    db::{
        Entry, InteractionModel, InteractionQueries, InteractionStatus, PaymentModel,
        PaymentQueries, PaymentStatus, ProviderTag, TxType,
    },
    BrokerError, BrokerResult,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// What the rail says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailStatus {
    Succeeded,
    Failed,
    /// Anything the rail reports before a final answer
    InProgress,
}

/// A parsed webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailEvent {
    /// Rail that sent it
    pub rail: ProviderTag,
    /// Correlation id we handed the rail
    pub reference: String,
    /// Reported status
    pub status: RailStatus,
}

/// What a delivery did; returned to the rail in the acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Completed,
    Failed,
    /// Non-final status, nothing changed
    Pending,
    /// Payment already left PENDING
    AlreadyFinal,
    UnknownReference,
    /// Payload could not be understood
    Malformed,
}

fn str_field<'v>(payload: &'v Value, key: &str) -> Option<&'v str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn first_str<'v>(payload: &'v Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter().find_map(|k| str_field(payload, k))
}

impl RailEvent {
    pub fn succeeded(rail: ProviderTag, reference: &str) -> Self {
        Self {
            rail,
            reference: reference.to_string(),
            status: RailStatus::Succeeded,
        }
    }

    pub fn failed(rail: ProviderTag, reference: &str) -> Self {
        Self {
            rail,
            reference: reference.to_string(),
            status: RailStatus::Failed,
        }
    }

    /// Mobile-money STK callback
    pub fn from_push_payload(payload: &Value) -> BrokerResult<Self> {
        let reference = first_str(payload, &["merchant_order_id", "order_id", "reference_order_id"])
            .ok_or_else(|| BrokerError::MalformedWebhook("no order id in payload".to_string()))?;
        let status = match str_field(payload, "status").map(str::to_uppercase).as_deref() {
            Some("COMPLETED") => RailStatus::Succeeded,
            Some("FAILED") | Some("CANCELLED") | Some("EXPIRED") => RailStatus::Failed,
            _ => RailStatus::InProgress,
        };
        Ok(Self {
            rail: ProviderTag::PushPayment,
            reference: reference.to_string(),
            status,
        })
    }

    /// On-chain deposit callback
    pub fn from_onchain_payload(payload: &Value) -> BrokerResult<Self> {
        let reference = str_field(payload, "merchant_deposit_id").ok_or_else(|| {
            BrokerError::MalformedWebhook("no merchant_deposit_id in payload".to_string())
        })?;
        let status = match str_field(payload, "status").map(str::to_lowercase).as_deref() {
            Some("completed") => RailStatus::Succeeded,
            Some("expired") | Some("failed") | Some("cancelled") => RailStatus::Failed,
            _ => RailStatus::InProgress,
        };
        Ok(Self {
            rail: ProviderTag::OnChain,
            reference: reference.to_string(),
            status,
        })
    }

    /// `{reference, status}` from any other rail
    pub fn from_generic_payload(payload: &Value) -> BrokerResult<Self> {
        let reference = str_field(payload, "reference")
            .ok_or_else(|| BrokerError::MalformedWebhook("no reference in payload".to_string()))?;
        let status = match str_field(payload, "status").map(str::to_uppercase).as_deref() {
            Some("COMPLETED") | Some("SUCCESS") | Some("PAID") => RailStatus::Succeeded,
            Some("FAILED") | Some("CANCELLED") | Some("EXPIRED") => RailStatus::Failed,
            _ => RailStatus::InProgress,
        };
        Ok(Self {
            rail: ProviderTag::Generic,
            reference: reference.to_string(),
            status,
        })
    }
}

/// Check a hex HMAC-SHA256 of `body` under `secret`
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Follow-up owed after a completion commits
enum Followup {
    NotifyProvider { provider_id: String, interaction_id: String },
    Held { interaction_id: String },
    Refunded { interaction_id: String, amount: i64 },
    Nothing,
}

impl BrokerService {
    /// Apply one webhook delivery
    pub async fn reconcile(&self, event: RailEvent) -> BrokerResult<WebhookOutcome> {
        let rail = event.rail;
        let payment = self.db.with_conn(|c| self.find_payment(c, &event)).await?;
        let Some(payment) = payment else {
            warn!("Webhook[{}]: no payment for reference {}", rail, event.reference);
            return Ok(WebhookOutcome::UnknownReference);
        };
        if payment.status.is_terminal() {
            info!(
                "Webhook[{}]: payment {} already {}, ignoring",
                rail, payment.id, payment.status
            );
            return Ok(WebhookOutcome::AlreadyFinal);
        }

        match event.status {
            RailStatus::InProgress => {
                info!("Webhook[{}]: payment {} still in progress", rail, payment.id);
                Ok(WebhookOutcome::Pending)
            }
            RailStatus::Failed => self.fail_payment(rail, &payment).await,
            RailStatus::Succeeded => self.complete_payment(rail, &payment).await,
        }
    }

    fn find_payment(&self, conn: &Connection, event: &RailEvent) -> anyhow::Result<Option<PaymentModel>> {
        let payments = PaymentQueries::new(conn);
        if event.rail == ProviderTag::Generic {
            return match payments.get_by_provider_ref(&event.reference)? {
                Some(p) => Ok(Some(p)),
                None => payments.get(&event.reference),
            };
        }
        match payments.get_by_provider_ref(&event.reference)? {
            Some(p) if p.provider == event.rail => Ok(Some(p)),
            Some(p) => {
                warn!(
                    "Webhook[{}]: reference {} belongs to a {} payment",
                    event.rail, event.reference, p.provider
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn fail_payment(&self, rail: ProviderTag, payment: &PaymentModel) -> BrokerResult<WebhookOutcome> {
        let won = self
            .db
            .with_tx(|tx| -> anyhow::Result<bool> {
                self.unwind_pending_payment(tx, payment, PaymentStatus::Failed)
            })
            .await?;
        if !won {
            info!("Webhook[{}]: payment {} settled concurrently", rail, payment.id);
            return Ok(WebhookOutcome::AlreadyFinal);
        }
        info!(
            "Webhook[{}]: payment {} FAILED, refunded wallet portion {}",
            rail,
            payment.id,
            payment.context.wallet_portion()
        );
        Ok(WebhookOutcome::Failed)
    }

    async fn complete_payment(
        &self,
        rail: ProviderTag,
        payment: &PaymentModel,
    ) -> BrokerResult<WebhookOutcome> {
        let verified = self.profiles.is_verified(&payment.payer_id).await?;
        let now = Utc::now();

        let committed = self
            .db
            .with_tx(|tx| -> anyhow::Result<Option<(Followup, Option<(String, i64)>)>> {
                if !PaymentQueries::new(tx).transition(
                    &payment.id,
                    PaymentStatus::Pending,
                    PaymentStatus::Completed,
                    Some(now),
                )? {
                    return Ok(None);
                }
                let commission = self.pay_commission(tx, &payment.payer_id, &payment.id, payment.amount)?;
                let followup = self.advance_paid_interaction(tx, payment, verified, now)?;
                Ok(Some((followup, commission)))
            })
            .await?;

        let Some((followup, commission)) = committed else {
            info!("Webhook[{}]: payment {} settled concurrently", rail, payment.id);
            return Ok(WebhookOutcome::AlreadyFinal);
        };

        info!("Webhook[{}]: payment {} COMPLETED", rail, payment.id);
        if let Some((referrer, amount)) = commission {
            info!(
                "Webhook[{}]: referral commission {} paid to {} for payment {}",
                rail, amount, referrer, payment.id
            );
        }
        Self::log_notify_failure(
            "payment_confirmed",
            self.notifier.payment_confirmed(&payment.payer_id, &payment.id).await,
        );
        match followup {
            Followup::NotifyProvider {
                provider_id,
                interaction_id,
            } => {
                Self::log_notify_failure(
                    "paid_request",
                    self.notifier.paid_request(&provider_id, &interaction_id).await,
                );
            }
            Followup::Held { interaction_id } => {
                info!(
                    "Webhook[{}]: interaction {} held until {} completes verification",
                    rail, interaction_id, payment.payer_id
                );
                self.recheck_held(&payment.payer_id, &interaction_id).await;
            }
            Followup::Refunded {
                interaction_id,
                amount,
            } => {
                warn!(
                    "Webhook[{}]: interaction {} no longer open, refunded {} to {}",
                    rail, interaction_id, amount, payment.payer_id
                );
            }
            Followup::Nothing => {}
        }
        Ok(WebhookOutcome::Completed)
    }

    /// Create or advance the interaction a just-completed payment pays for
    fn advance_paid_interaction(
        &self,
        conn: &Connection,
        payment: &PaymentModel,
        verified: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Followup> {
        let irs = InteractionQueries::new(conn);
        let Some(ir) = irs.get_by_payment(&payment.id)? else {
            let Some(target) = payment.context.target() else {
                return Ok(Followup::Nothing);
            };
            let status = if verified {
                InteractionStatus::Pending
            } else {
                InteractionStatus::PendingVerification
            };
            let ir = self.new_interaction(&payment.payer_id, target, &payment.id, status, now);
            irs.insert(&ir)?;
            return Ok(Self::announce(ir, verified));
        };

        match ir.status {
            InteractionStatus::Pending if ir.expires_at <= now => {
                self.expire_request(conn, &ir)?;
                Ok(Followup::Refunded {
                    interaction_id: ir.id,
                    amount: payment.amount,
                })
            }
            InteractionStatus::Pending if !verified => {
                irs.transition(&ir.id, InteractionStatus::Pending, InteractionStatus::PendingVerification)?;
                Ok(Followup::Held { interaction_id: ir.id })
            }
            InteractionStatus::Pending => Ok(Self::announce(ir, true)),
            InteractionStatus::Rejected | InteractionStatus::Expired => {
                self.wallets(conn).credit(
                    &payment.payer_id,
                    payment.amount,
                    Entry::new(TxType::Refund, &ir.id),
                )?;
                Ok(Followup::Refunded {
                    interaction_id: ir.id,
                    amount: payment.amount,
                })
            }
            InteractionStatus::PendingVerification | InteractionStatus::Accepted => Ok(Followup::Nothing),
        }
    }

    fn announce(ir: InteractionModel, verified: bool) -> Followup {
        if verified {
            Followup::NotifyProvider {
                provider_id: ir.provider_id,
                interaction_id: ir.id,
            }
        } else {
            Followup::Held { interaction_id: ir.id }
        }
    }

    /// Move a PENDING payment to `to` and undo what its initiation did:
    /// refund the wallet portion and expire a PENDING interaction.
    /// False if the payment had already left PENDING.
    pub(super) fn unwind_pending_payment(
        &self,
        conn: &Connection,
        payment: &PaymentModel,
        to: PaymentStatus,
    ) -> anyhow::Result<bool> {
        if !PaymentQueries::new(conn).transition(&payment.id, PaymentStatus::Pending, to, None)? {
            return Ok(false);
        }
        let portion = payment.context.wallet_portion();
        if portion > 0 {
            self.wallets(conn).credit(
                &payment.payer_id,
                portion,
                Entry::new(TxType::Refund, &payment.id),
            )?;
        }
        let irs = InteractionQueries::new(conn);
        if let Some(ir) = irs.get_by_payment(&payment.id)? {
            irs.transition(&ir.id, InteractionStatus::Pending, InteractionStatus::Expired)?;
        }
        Ok(true)
    }
}
