//! Notification sink
//!
//! Delivery (push, email, in-app) belongs to another service. The settlement
//! core only announces events through [`Notifier`]; the default
//! implementation writes them to the log.

use async_trait::async_trait;
use tracing::info;

/// Events the settlement core announces
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A paid request is waiting for the provider's decision
    async fn paid_request(&self, provider_id: &str, interaction_id: &str) -> anyhow::Result<()>;

    /// The provider accepted the requester's request
    async fn request_accepted(&self, requester_id: &str, interaction_id: &str) -> anyhow::Result<()>;

    /// The request was rejected (by the provider or automatically)
    async fn request_rejected(&self, requester_id: &str, interaction_id: &str) -> anyhow::Result<()>;

    /// A payment reached COMPLETED
    async fn payment_confirmed(&self, payer_id: &str, payment_id: &str) -> anyhow::Result<()>;

    /// A request held for verification was refunded instead of released
    async fn verification_refund(
        &self,
        requester_id: &str,
        interaction_id: &str,
        amount: i64,
    ) -> anyhow::Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn paid_request(&self, provider_id: &str, interaction_id: &str) -> anyhow::Result<()> {
        info!(target: "notify", kind = "PAID_REQUEST", user = provider_id, interaction = interaction_id, "notification");
        Ok(())
    }

    async fn request_accepted(&self, requester_id: &str, interaction_id: &str) -> anyhow::Result<()> {
        info!(target: "notify", kind = "REQUEST_ACCEPTED", user = requester_id, interaction = interaction_id, "notification");
        Ok(())
    }

    async fn request_rejected(&self, requester_id: &str, interaction_id: &str) -> anyhow::Result<()> {
        info!(target: "notify", kind = "REQUEST_REJECTED", user = requester_id, interaction = interaction_id, "notification");
        Ok(())
    }

    async fn payment_confirmed(&self, payer_id: &str, payment_id: &str) -> anyhow::Result<()> {
        info!(target: "notify", kind = "PAYMENT_CONFIRMED", user = payer_id, payment = payment_id, "notification");
        Ok(())
    }

    async fn verification_refund(
        &self,
        requester_id: &str,
        interaction_id: &str,
        amount: i64,
    ) -> anyhow::Result<()> {
        info!(target: "notify", kind = "KYC_REFUND", user = requester_id, interaction = interaction_id, amount, "notification");
        Ok(())
    }
}
