//! Database module for meetpay
//!
//! This module handles persistent storage for:
//! - Wallets and the append-only wallet ledger
//! - Payments across all rails
//! - Interaction requests, chat sessions and messages
//! - Referrals, commissions and withdrawals
//! - The slice of user profiles the settlement core reads

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod ledger;
mod models;
mod queries;

pub use ledger::*;
pub use models::*;
pub use queries::*;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = database_url
            .strip_prefix("sqlite:")
            .unwrap_or(database_url);

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                verified BOOLEAN NOT NULL DEFAULT 0,
                accepting_requests BOOLEAN NOT NULL DEFAULT 1,
                available BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                withdrawable INTEGER NOT NULL DEFAULT 0 CHECK (withdrawable >= 0),
                currency TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                bucket TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                reference TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wallet_tx_user ON wallet_transactions(user_id, created_at);

            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                payer_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL,
                provider TEXT NOT NULL,
                provider_ref TEXT NOT NULL UNIQUE,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer_id);

            CREATE TABLE IF NOT EXISTS interaction_requests (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payment_id TEXT REFERENCES payments(id),
                status TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                accepted_at TEXT,
                rejected_at TEXT,
                service_completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_provider ON interaction_requests(provider_id, status);
            CREATE INDEX IF NOT EXISTS idx_interactions_requester ON interaction_requests(requester_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_interactions_payment ON interaction_requests(payment_id);

            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                interaction_id TEXT NOT NULL UNIQUE REFERENCES interaction_requests(id),
                started_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id),
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, created_at);

            CREATE TABLE IF NOT EXISTS referrals (
                id TEXT PRIMARY KEY,
                referrer_id TEXT NOT NULL,
                referred_user_id TEXT NOT NULL UNIQUE,
                completed_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS referral_commissions (
                payment_id TEXT PRIMARY KEY,
                referral_id TEXT NOT NULL REFERENCES referrals(id),
                referrer_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                phone TEXT NOT NULL,
                order_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Run a closure against the connection
    pub async fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run a closure inside a single transaction.
    ///
    /// The transaction commits only when the closure returns `Ok`; any error
    /// rolls every write in it back.
    pub async fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Check the connection answers
    pub async fn ping(&self) -> bool {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|v| v == 1)
            .unwrap_or(false)
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection will be closed when the Arc is dropped
        info!("Database connection closed");
    }
}
