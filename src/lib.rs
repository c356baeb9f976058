//! Meetpay: settlement and reconciliation for paid, time-boxed interactions
//!
//! Requesters pay providers for a chat, video call or booking. Money arrives
//! over one of several rails and is reconciled into durable request and
//! ledger state:
//!
//! - **Wallet**: prepaid gross balance, settled in a single transaction
//! - **Push payment**: mobile-money prompt on the payer's phone, confirmed by webhook
//! - **On-chain deposit**: stablecoin deposit page, confirmed by webhook
//!
//! # Architecture
//!
//! 1. `broker` owns every state transition: settlement flows, webhook
//!    reconciliation, the interaction state machine, referrals and the
//!    identity-verification gate
//! 2. `db` is the store; all coordination between concurrent handlers goes
//!    through its transactions and compare-and-swap updates
//! 3. `gateway` talks to the external rails behind traits
//! 4. `api` exposes the HTTP surface and the webhook receivers

pub mod api;
pub mod broker;
pub mod cache;
pub mod config;
pub mod db;
pub mod gateway;
pub mod notify;
pub mod pricing;
pub mod profiles;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use broker::BrokerService;
use cache::SystemClock;
pub use config::Config;
use db::Database;
use gateway::{DepositClient, DepositGateway, MobileMoneyClient, PushPaymentGateway};
use notify::{LogNotifier, Notifier};
use profiles::{ProfileDirectory, SqliteProfiles};

/// The main application state
#[derive(Clone)]
pub struct MeetpayApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Settlement service
    pub broker: Arc<BrokerService>,
}

impl MeetpayApp {
    /// Create a new application instance wired to the configured rails
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing meetpay application...");

        let config = Arc::new(config);

        let db_url = config.resolve_database_url();
        info!("Connecting to database at: {}", db_url);
        let db = Arc::new(Database::connect(&db_url).await?);
        info!("Database connected successfully");

        let clock = Arc::new(SystemClock);
        let push: Arc<dyn PushPaymentGateway> = Arc::new(MobileMoneyClient::new(
            config.push_payment.clone(),
            clock.clone(),
        )?);
        let deposits: Arc<dyn DepositGateway> =
            Arc::new(DepositClient::new(config.onchain.clone(), clock)?);
        let profiles: Arc<dyn ProfileDirectory> = Arc::new(SqliteProfiles::new(db.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

        let app = Self::from_parts(config, db, push, deposits, profiles, notifier);
        info!("Meetpay application initialized successfully");
        Ok(app)
    }

    /// Assemble an application from already-built collaborators
    pub fn from_parts(
        config: Arc<Config>,
        db: Arc<Database>,
        push: Arc<dyn PushPaymentGateway>,
        deposits: Arc<dyn DepositGateway>,
        profiles: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let broker = Arc::new(BrokerService::new(
            config.clone(),
            db.clone(),
            push,
            deposits,
            profiles,
            notifier,
        ));
        Self { config, db, broker }
    }

    /// Start the application with shutdown signal
    pub async fn run_with_shutdown(&self, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        info!("Starting meetpay application...");

        if let Err(e) = self.broker.init().await {
            error!("Failed to initialize settlement service: {}", e);
            return Err(e.into());
        }

        let sweeper = self.spawn_sweeper();

        info!(
            "Meetpay application running. API available at http://{}",
            self.config.api_bind_address()
        );
        let result = api::serve_with_shutdown(self.clone(), shutdown_rx).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    /// Re-run the stale payment and expired request sweep on the
    /// configured interval
    fn spawn_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.config.settlement.sweep_interval_secs;
        if secs == 0 {
            return None;
        }
        let broker = self.broker.clone();
        info!("Sweeping stale payments every {}s", secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
            // the first tick fires immediately and init already swept
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = broker.sweep().await {
                    error!("Periodic sweep failed: {}", e);
                }
            }
        }))
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down meetpay application...");
        self.db.close().await;
        info!("Meetpay application shutdown complete");
        Ok(())
    }
}

/// Error types for settlement operations
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// Debit exceeds available funds; nothing was changed
    #[error("Insufficient balance")]
    InsufficientBalance,

    /// Operation not allowed in the record's current state
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Payment, interaction or profile missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// External rail call failed
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Webhook payload without a usable correlation id
    #[error("Malformed webhook: {0}")]
    MalformedWebhook(String),

    /// Caller lacks the role or ownership required
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Bad request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<anyhow::Error> for BrokerError {
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Database(format!("{:#}", e))
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::Database(e.to_string())
    }
}

/// Result type alias for settlement operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
