//! Wallet ledger queries
//!
//! Balance changes are storage-level increments; debits carry a
//! `column >= amount` guard so a concurrent debit can never drive a balance
//! negative. Every mutation writes its ledger row on the same connection,
//! so callers running inside [`Database::with_tx`](super::Database::with_tx)
//! get the pair atomically.

use super::{Bucket, TxType, WalletModel, WalletTransactionModel};
use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

/// What a balance change is recorded as
#[derive(Debug, Clone, Copy)]
pub struct Entry<'r> {
    /// Ledger entry type
    pub tx_type: TxType,
    /// Free-text reference, usually a payment, interaction or withdrawal id
    pub reference: &'r str,
}

impl<'r> Entry<'r> {
    /// Build an entry
    pub fn new(tx_type: TxType, reference: &'r str) -> Self {
        Self { tx_type, reference }
    }
}

/// Wallet and ledger queries
pub struct WalletQueries<'a> {
    conn: &'a Connection,
    currency: &'a str,
}

impl<'a> WalletQueries<'a> {
    /// Create a new query instance; `currency` is used for wallets created on demand
    pub fn new(conn: &'a Connection, currency: &'a str) -> Self {
        Self { conn, currency }
    }

    /// Create the wallet if it does not exist yet
    pub fn ensure(&self, user_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO wallets (user_id, balance, withdrawable, currency, updated_at)
             VALUES (?1, 0, 0, ?2, ?3)",
            params![user_id, self.currency, Utc::now()],
        )?;
        Ok(())
    }

    /// Get a wallet, creating an empty one on first access
    pub fn get_or_create(&self, user_id: &str) -> Result<WalletModel> {
        self.ensure(user_id)?;
        let wallet = self.conn.query_row(
            "SELECT user_id, balance, withdrawable, currency, updated_at FROM wallets WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(WalletModel {
                    user_id: row.get(0)?,
                    balance: row.get(1)?,
                    withdrawable: row.get(2)?,
                    currency: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )?;
        Ok(wallet)
    }

    /// Gross balance, zero for a missing wallet
    pub fn balance(&self, user_id: &str) -> Result<i64> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance FROM wallets WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    /// Increase the gross balance
    pub fn credit(&self, user_id: &str, amount: i64, entry: Entry<'_>) -> Result<()> {
        self.increment(user_id, Bucket::Gross, amount, entry)
    }

    /// Decrease the gross balance; returns false and changes nothing when funds are short
    pub fn debit(&self, user_id: &str, amount: i64, entry: Entry<'_>) -> Result<bool> {
        self.decrement(user_id, Bucket::Gross, amount, entry)
    }

    /// Increase the withdrawable balance
    pub fn credit_withdrawable(&self, user_id: &str, amount: i64, entry: Entry<'_>) -> Result<()> {
        self.increment(user_id, Bucket::Withdrawable, amount, entry)
    }

    /// Decrease the withdrawable balance; returns false and changes nothing when funds are short
    pub fn debit_withdrawable(&self, user_id: &str, amount: i64, entry: Entry<'_>) -> Result<bool> {
        self.decrement(user_id, Bucket::Withdrawable, amount, entry)
    }

    /// Move up to `amount` out of the gross balance, returning what was moved
    pub fn debit_up_to(&self, user_id: &str, amount: i64, entry: Entry<'_>) -> Result<i64> {
        self.ensure(user_id)?;
        let available = self.balance(user_id)?;
        let take = amount.min(available).max(0);
        if take > 0 && !self.debit(user_id, take, entry)? {
            return Err(anyhow::anyhow!(
                "Gross balance of {} changed during debit",
                user_id
            ));
        }
        Ok(take)
    }

    fn increment(&self, user_id: &str, bucket: Bucket, amount: i64, entry: Entry<'_>) -> Result<()> {
        if amount <= 0 {
            return Ok(());
        }
        self.ensure(user_id)?;
        let sql = match bucket {
            Bucket::Gross => "UPDATE wallets SET balance = balance + ?1, updated_at = ?2 WHERE user_id = ?3",
            Bucket::Withdrawable => {
                "UPDATE wallets SET withdrawable = withdrawable + ?1, updated_at = ?2 WHERE user_id = ?3"
            }
        };
        self.conn.execute(sql, params![amount, Utc::now(), user_id])?;
        self.record_transaction(user_id, amount, bucket, entry)?;
        info!(
            "DB: Credited {} {} to {} ({}, ref={})",
            amount, bucket, user_id, entry.tx_type, entry.reference
        );
        Ok(())
    }

    fn decrement(&self, user_id: &str, bucket: Bucket, amount: i64, entry: Entry<'_>) -> Result<bool> {
        if amount <= 0 {
            return Ok(true);
        }
        self.ensure(user_id)?;
        let sql = match bucket {
            Bucket::Gross => {
                "UPDATE wallets SET balance = balance - ?1, updated_at = ?2 WHERE user_id = ?3 AND balance >= ?1"
            }
            Bucket::Withdrawable => {
                "UPDATE wallets SET withdrawable = withdrawable - ?1, updated_at = ?2 WHERE user_id = ?3 AND withdrawable >= ?1"
            }
        };
        let rows = self.conn.execute(sql, params![amount, Utc::now(), user_id])?;
        if rows == 0 {
            info!(
                "DB: Debit of {} {} refused for {}: insufficient balance",
                amount, bucket, user_id
            );
            return Ok(false);
        }
        self.record_transaction(user_id, -amount, bucket, entry)?;
        info!(
            "DB: Debited {} {} from {} ({}, ref={})",
            amount, bucket, user_id, entry.tx_type, entry.reference
        );
        Ok(true)
    }

    /// Append a ledger row
    pub fn record_transaction(
        &self,
        user_id: &str,
        amount: i64,
        bucket: Bucket,
        entry: Entry<'_>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO wallet_transactions (id, user_id, amount, bucket, tx_type, reference, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, user_id, amount, bucket, entry.tx_type, entry.reference, Utc::now()],
        )?;
        Ok(id)
    }

    /// List ledger rows, newest first
    pub fn list_transactions(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WalletTransactionModel>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, amount, bucket, tx_type, reference, created_at
             FROM wallet_transactions WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], map_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count ledger rows for a user
    pub fn count_transactions(&self, user_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM wallet_transactions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Count ledger rows referencing something, optionally of one type
    pub fn count_by_reference(&self, reference: &str, tx_type: Option<TxType>) -> Result<u64> {
        let count: i64 = match tx_type {
            Some(t) => self.conn.query_row(
                "SELECT COUNT(*) FROM wallet_transactions WHERE reference = ?1 AND tx_type = ?2",
                params![reference, t],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM wallet_transactions WHERE reference = ?1",
                [reference],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<WalletTransactionModel> {
    Ok(WalletTransactionModel {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        bucket: row.get(3)?,
        tx_type: row.get(4)?,
        reference: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_credit_then_debit_records_rows() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.with_conn(|c| {
            let w = WalletQueries::new(c, "KES");
            w.credit("u1", 30_000, Entry::new(TxType::Refund, "p1"))?;
            assert!(w.debit("u1", 10_000, Entry::new(TxType::Earning, "p2"))?);
            let wallet = w.get_or_create("u1")?;
            assert_eq!(wallet.balance, 20_000);
            assert_eq!(wallet.withdrawable, 0);
            assert_eq!(w.count_transactions("u1")?, 2);
            let rows = w.list_transactions("u1", 10, 0)?;
            assert_eq!(rows[0].amount, -10_000);
            assert_eq!(rows[1].amount, 30_000);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failed_debit_leaves_wallet_unchanged() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.with_conn(|c| {
            let w = WalletQueries::new(c, "KES");
            w.credit("u1", 30_000, Entry::new(TxType::Refund, "seed"))?;
            assert!(!w.debit("u1", 50_000, Entry::new(TxType::Earning, "p"))?);
            assert!(!w.debit_withdrawable("u1", 1, Entry::new(TxType::Withdrawal, "w"))?);
            let wallet = w.get_or_create("u1")?;
            assert_eq!(wallet.balance, 30_000);
            assert_eq!(wallet.withdrawable, 0);
            assert_eq!(w.count_transactions("u1")?, 1);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_debit_up_to_clamps_to_available() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.with_conn(|c| {
            let w = WalletQueries::new(c, "KES");
            w.credit("u1", 4_000, Entry::new(TxType::Earning, "seed"))?;
            assert_eq!(w.debit_up_to("u1", 10_000, Entry::new(TxType::Earning, "x"))?, 4_000);
            assert_eq!(w.balance("u1")?, 0);
            assert_eq!(w.debit_up_to("u1", 10_000, Entry::new(TxType::Earning, "x"))?, 0);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_withdrawable_bucket_is_separate() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.with_conn(|c| {
            let w = WalletQueries::new(c, "KES");
            w.credit_withdrawable("u1", 7_000, Entry::new(TxType::Earning, "i1"))?;
            assert_eq!(w.balance("u1")?, 0);
            assert!(w.debit_withdrawable("u1", 7_000, Entry::new(TxType::Withdrawal, "w1"))?);
            assert_eq!(w.get_or_create("u1")?.withdrawable, 0);
            assert_eq!(w.count_by_reference("w1", Some(TxType::Withdrawal))?, 1);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }
}
