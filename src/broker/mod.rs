//! Settlement and reconciliation core
//!
//! This module implements:
//! - The three settlement flows (wallet-only, push payment, on-chain deposit)
//! - Idempotent webhook reconciliation for every rail
//! - The interaction request state machine
//! - Referral commissions and signup bonuses
//! - The identity-verification release gate
//! - Withdrawals to mobile money

use crate::{
    config::Config,
    db::{
        Database, Entry, InteractionModel, InteractionQueries, InteractionStatus, PaymentQueries,
        PaymentStatus, ProviderTag, TxType, WalletQueries,
    },
    gateway::{DepositGateway, PushPaymentGateway},
    notify::Notifier,
    pricing::Pricing,
    profiles::ProfileDirectory,
    BrokerError, BrokerResult,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{error, info, warn};

mod interaction;
mod reconcile;
mod referral;
mod saga;
mod settlement;
mod verification;
mod wallet;
mod withdrawal;

pub use interaction::{AcceptOutcome, InteractionView, ServiceCompletion};
pub use reconcile::{verify_signature, RailEvent, RailStatus, WebhookOutcome};
pub use saga::{Compensation, Saga};
pub use settlement::{SettlementOutcome, SettlementRequest};
pub use verification::ReleaseSummary;
pub use wallet::TransactionPage;
pub use withdrawal::{WithdrawalEvent, WithdrawalRequest};

fn cutoff(now: DateTime<Utc>, secs: u64) -> BrokerResult<DateTime<Utc>> {
    chrono::Duration::from_std(std::time::Duration::from_secs(secs))
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| BrokerError::Config(format!("Sweep window of {}s is out of range", secs)))
}

/// The settlement service shared by every handler
pub struct BrokerService {
    /// Configuration
    config: Arc<Config>,
    /// Database connection
    db: Arc<Database>,
    /// Fee calculator
    pricing: Pricing,
    /// Mobile-money rail
    push: Arc<dyn PushPaymentGateway>,
    /// On-chain deposit rail
    deposits: Arc<dyn DepositGateway>,
    /// Profile flags
    profiles: Arc<dyn ProfileDirectory>,
    /// Notification sink
    notifier: Arc<dyn Notifier>,
}

impl BrokerService {
    /// Create a new settlement service
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        push: Arc<dyn PushPaymentGateway>,
        deposits: Arc<dyn DepositGateway>,
        profiles: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pricing = Pricing::new(&config.pricing);
        Self {
            config,
            db,
            pricing,
            push,
            deposits,
            profiles,
            notifier,
        }
    }

    /// Fee calculator
    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Initialize the service
    pub async fn init(&self) -> BrokerResult<()> {
        info!("Initializing settlement service...");
        self.sweep().await?;
        info!("Settlement service initialized");
        Ok(())
    }

    /// Finalise everything no callback will arrive for: stale rail
    /// payments, then expired requests. Runs at startup and on the
    /// configured interval.
    pub async fn sweep(&self) -> BrokerResult<()> {
        self.reconcile_stale_payments().await?;
        self.reconcile_expired_requests().await
    }

    fn currency(&self) -> &str {
        &self.config.pricing.currency
    }

    fn wallets<'c>(&'c self, conn: &'c Connection) -> WalletQueries<'c> {
        WalletQueries::new(conn, &self.config.pricing.currency)
    }

    fn saga(&self, name: impl Into<String>) -> Saga<'_> {
        Saga::new(name, &self.db, self.currency())
    }

    /// Expire a stored-PENDING request past its expiry and refund its
    /// completed payment. False if the request was no longer PENDING.
    fn expire_request(&self, conn: &Connection, ir: &InteractionModel) -> anyhow::Result<bool> {
        let irs = InteractionQueries::new(conn);
        if !irs.transition(&ir.id, InteractionStatus::Pending, InteractionStatus::Expired)? {
            return Ok(false);
        }
        self.refund_if_paid(conn, ir)?;
        Ok(true)
    }

    /// Refund the requester the full amount of the interaction's payment,
    /// if that payment completed. Returns the refunded amount.
    fn refund_if_paid(&self, conn: &Connection, ir: &InteractionModel) -> anyhow::Result<i64> {
        let Some(payment_id) = ir.payment_id.as_deref() else {
            return Ok(0);
        };
        let Some(payment) = PaymentQueries::new(conn).get(payment_id)? else {
            return Ok(0);
        };
        if payment.status != PaymentStatus::Completed {
            return Ok(0);
        }
        self.wallets(conn).credit(
            &ir.requester_id,
            payment.amount,
            Entry::new(TxType::Refund, &ir.id),
        )?;
        Ok(payment.amount)
    }

    /// Startup sweep: finalise PENDING requests whose expiry has passed
    async fn reconcile_expired_requests(&self) -> BrokerResult<()> {
        info!("Reconciling expired interaction requests on startup...");
        let now = Utc::now();
        let expired = self
            .db
            .with_conn(|c| InteractionQueries::new(c).list_expired_pending(now))
            .await?;

        if expired.is_empty() {
            info!("No expired requests to reconcile");
            return Ok(());
        }

        let total = expired.len();
        let mut refunded = 0;
        for (idx, ir) in expired.into_iter().enumerate() {
            let result = self
                .db
                .with_tx(|tx| -> anyhow::Result<bool> { self.expire_request(tx, &ir) })
                .await;
            match result {
                Ok(true) => {
                    refunded += 1;
                    info!("[Expired Requests {}/{}] Expired request {}", idx + 1, total, ir.id);
                }
                Ok(false) => {
                    info!(
                        "[Expired Requests {}/{}] Request {} already moved on",
                        idx + 1,
                        total,
                        ir.id
                    );
                }
                Err(e) => error!("Failed to expire request {}: {}", ir.id, e),
            }
        }
        info!("Expired request reconciliation complete: {}/{} expired", refunded, total);
        Ok(())
    }

    /// Unwind PENDING rail payments nothing will confirm: push payments
    /// past the poll deadline (the polling call died with its client or the
    /// process) and on-chain deposits past their expiry window. Each unwind
    /// refunds the wallet portion.
    async fn reconcile_stale_payments(&self) -> BrokerResult<()> {
        let now = Utc::now();
        let settings = &self.config.settlement;
        let onchain_secs = u64::try_from(settings.onchain_expiry_minutes)
            .ok()
            .and_then(|m| m.checked_mul(60))
            .ok_or_else(|| BrokerError::Config("Invalid on-chain expiry".to_string()))?;
        let rails = [
            (
                ProviderTag::PushPayment,
                cutoff(now, settings.poll_deadline_secs)?,
                PaymentStatus::Cancelled,
            ),
            (ProviderTag::OnChain, cutoff(now, onchain_secs)?, PaymentStatus::Expired),
        ];

        for (rail, created_before, to) in rails {
            let stale = self
                .db
                .with_conn(|c| PaymentQueries::new(c).list_stale_pending(rail, created_before))
                .await?;
            if stale.is_empty() {
                continue;
            }

            let total = stale.len();
            info!("Reconciling {} stale {} payments...", total, rail);
            let mut unwound = 0;
            for (idx, payment) in stale.into_iter().enumerate() {
                let result = self
                    .db
                    .with_tx(|tx| -> anyhow::Result<bool> { self.unwind_pending_payment(tx, &payment, to) })
                    .await;
                match result {
                    Ok(true) => {
                        unwound += 1;
                        info!(
                            "[Stale Payments {}/{}] Payment {} {}, refunded {}",
                            idx + 1,
                            total,
                            payment.id,
                            to,
                            payment.context.wallet_portion()
                        );
                    }
                    Ok(false) => {
                        info!(
                            "[Stale Payments {}/{}] Payment {} settled concurrently",
                            idx + 1,
                            total,
                            payment.id
                        );
                    }
                    Err(e) => error!("Failed to unwind payment {}: {}", payment.id, e),
                }
            }
            info!("Stale {} payment reconciliation complete: {}/{} unwound", rail, unwound, total);
        }
        Ok(())
    }

    /// Log-and-continue wrapper for notifications
    fn log_notify_failure(what: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!("Notification {} failed: {}", what, e);
        }
    }
}
