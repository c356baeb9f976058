//! Compensating-action coordinator for multi-step settlement flows
//!
//! A flow registers the inverse of each forward step right after that step
//! commits. If a later step fails, [`Saga::abort`] applies the registered
//! inverses newest-first in one transaction. [`Saga::commit`] discards them
//! once the flow has handed ownership of the money to the reconciler.
//!
//! Guard compensations ([`Compensation::FailPayment`],
//! [`Compensation::FailWithdrawal`]) are compare-and-swap transitions; if a
//! guard loses, something else already finalised the record and the
//! remaining compensations are skipped.

use crate::db::{
    Database, Entry, PaymentQueries, PaymentStatus, TxType, WalletQueries, WithdrawalQueries,
    WithdrawalStatus,
};
use rusqlite::Connection;
use tracing::{error, info, warn};

/// Inverse of a committed forward step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Credit back a gross-balance debit
    RefundWallet {
        /// Wallet owner
        user_id: String,
        /// Amount debited
        amount: i64,
        /// Ledger reference
        reference: String,
    },
    /// Credit back a withdrawable-balance debit
    RefundWithdrawable {
        /// Wallet owner
        user_id: String,
        /// Amount debited
        amount: i64,
        /// Ledger reference
        reference: String,
    },
    /// PENDING payment -> FAILED; guard
    FailPayment {
        /// Payment ID
        payment_id: String,
    },
    /// PENDING withdrawal -> FAILED; guard
    FailWithdrawal {
        /// Withdrawal order ID
        order_id: String,
        /// Stored failure reason
        reason: String,
    },
}

impl Compensation {
    /// Apply on a connection; false means a guard lost
    fn apply(&self, conn: &Connection, currency: &str) -> anyhow::Result<bool> {
        match self {
            Compensation::RefundWallet {
                user_id,
                amount,
                reference,
            } => {
                WalletQueries::new(conn, currency).credit(
                    user_id,
                    *amount,
                    Entry::new(TxType::Refund, reference),
                )?;
                Ok(true)
            }
            Compensation::RefundWithdrawable {
                user_id,
                amount,
                reference,
            } => {
                WalletQueries::new(conn, currency).credit_withdrawable(
                    user_id,
                    *amount,
                    Entry::new(TxType::Refund, reference),
                )?;
                Ok(true)
            }
            Compensation::FailPayment { payment_id } => PaymentQueries::new(conn).transition(
                payment_id,
                PaymentStatus::Pending,
                PaymentStatus::Failed,
                None,
            ),
            Compensation::FailWithdrawal { order_id, reason } => WithdrawalQueries::new(conn)
                .finish(order_id, WithdrawalStatus::Failed, Some(reason)),
        }
    }
}

/// Ordered list of compensations for one flow
pub struct Saga<'a> {
    name: String,
    db: &'a Database,
    currency: &'a str,
    compensations: Vec<Compensation>,
    finished: bool,
}

impl<'a> Saga<'a> {
    /// Start a saga
    pub fn new(name: impl Into<String>, db: &'a Database, currency: &'a str) -> Self {
        Self {
            name: name.into(),
            db,
            currency,
            compensations: Vec::new(),
            finished: false,
        }
    }

    /// Register the inverse of a step that just committed
    pub fn on_abort(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Keep the forward steps
    pub fn commit(mut self) {
        self.finished = true;
        info!("Saga {} committed", self.name);
    }

    /// Undo every registered step, newest first.
    ///
    /// Returns whether the compensations ran; false when a guard lost.
    /// A storage failure here is logged, not returned, since the caller is
    /// already reporting the original error.
    pub async fn abort(mut self) -> bool {
        self.finished = true;
        let steps = std::mem::take(&mut self.compensations);
        if steps.is_empty() {
            return true;
        }
        let name = self.name.clone();
        let currency = self.currency;
        let result: anyhow::Result<bool> = self
            .db
            .with_tx(|tx| {
                for step in steps.iter().rev() {
                    if !step.apply(tx, currency)? {
                        warn!("Saga {}: guard {:?} lost, skipping remaining compensations", name, step);
                        return Ok(false);
                    }
                }
                Ok(true)
            })
            .await;
        match result {
            Ok(true) => {
                info!("Saga {} aborted, {} compensations applied", name, steps.len());
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("Saga {}: compensation failed: {}", name, e);
                false
            }
        }
    }
}

impl Drop for Saga<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.compensations.is_empty() {
            warn!(
                "Saga {} dropped with {} compensations outstanding",
                self.name,
                self.compensations.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        InteractionKind, InteractionTarget, PaymentContext, PaymentModel, ProviderTag,
    };
    use chrono::Utc;

    async fn seeded() -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.with_tx(|tx| {
            let w = WalletQueries::new(tx, "KES");
            w.credit("u1", 10_000, Entry::new(TxType::Refund, "seed"))?;
            assert!(w.debit("u1", 4_000, Entry::new(TxType::Earning, "pay1"))?);
            PaymentQueries::new(tx).insert(&PaymentModel {
                id: "pay1".to_string(),
                payer_id: "u1".to_string(),
                amount: 9_000,
                currency: "KES".to_string(),
                provider: ProviderTag::PushPayment,
                provider_ref: "order1".to_string(),
                idempotency_key: "k1".to_string(),
                status: PaymentStatus::Pending,
                context: PaymentContext::PushPayment {
                    target: InteractionTarget {
                        provider_id: "p1".to_string(),
                        kind: InteractionKind::Chat,
                        duration_minutes: 60,
                    },
                    wallet_portion: 4_000,
                    phone: "254700000000".to_string(),
                },
                created_at: Utc::now(),
                completed_at: None,
            })?;
            anyhow::Ok(())
        })
        .await
        .unwrap();
        db
    }

    fn steps(saga: &mut Saga<'_>) {
        saga.on_abort(Compensation::RefundWallet {
            user_id: "u1".to_string(),
            amount: 4_000,
            reference: "pay1".to_string(),
        });
        saga.on_abort(Compensation::FailPayment {
            payment_id: "pay1".to_string(),
        });
    }

    #[tokio::test]
    async fn test_abort_applies_inverses() {
        let db = seeded().await;
        let mut saga = Saga::new("push", &db, "KES");
        steps(&mut saga);
        assert!(saga.abort().await);

        db.with_conn(|c| {
            assert_eq!(WalletQueries::new(c, "KES").balance("u1")?, 10_000);
            assert_eq!(PaymentQueries::new(c).status("pay1")?, Some(PaymentStatus::Failed));
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_abort_skips_refund_when_payment_already_final() {
        let db = seeded().await;
        db.with_conn(|c| {
            PaymentQueries::new(c).transition(
                "pay1",
                PaymentStatus::Pending,
                PaymentStatus::Completed,
                Some(Utc::now()),
            )
        })
        .await
        .unwrap();

        let mut saga = Saga::new("push", &db, "KES");
        steps(&mut saga);
        assert!(!saga.abort().await);

        db.with_conn(|c| {
            assert_eq!(WalletQueries::new(c, "KES").balance("u1")?, 6_000);
            assert_eq!(PaymentQueries::new(c).status("pay1")?, Some(PaymentStatus::Completed));
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_commit_keeps_forward_steps() {
        let db = seeded().await;
        let mut saga = Saga::new("push", &db, "KES");
        steps(&mut saga);
        saga.commit();
        db.with_conn(|c| {
            assert_eq!(WalletQueries::new(c, "KES").balance("u1")?, 6_000);
            assert_eq!(PaymentQueries::new(c).status("pay1")?, Some(PaymentStatus::Pending));
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }
}
