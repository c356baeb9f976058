//! Referral commissions and signup bonuses

use super::BrokerService;
use crate::{
    db::{Entry, ReferralModel, ReferralQueries, Role, TxType},
    pricing::apply_bps,
    BrokerError, BrokerResult,
};
use rusqlite::Connection;
use tracing::{debug, info};

impl BrokerService {
    /// Pay the referrer of `referred_user_id` a commission on a settled
    /// payment. At most one commission per payment; the referral's cap is
    /// taken with a compare-and-swap every time.
    ///
    /// Returns the referrer and the amount paid, if anything was paid.
    pub(super) fn pay_commission(
        &self,
        conn: &Connection,
        referred_user_id: &str,
        payment_id: &str,
        settled_amount: i64,
    ) -> anyhow::Result<Option<(String, i64)>> {
        let referrals = ReferralQueries::new(conn);
        let Some(referral) = referrals.get_by_referred_user(referred_user_id)? else {
            return Ok(None);
        };
        if referrals.has_commission(payment_id)? {
            debug!("Referral: payment {} already paid a commission", payment_id);
            return Ok(None);
        }
        let commission = apply_bps(settled_amount, self.config.referral.commission_bps)?;
        if commission <= 0 {
            return Ok(None);
        }
        if !referrals.claim_slot(&referral.id, self.config.referral.max_transactions)? {
            info!(
                "Referral: {} reached {} commissions, nothing paid for {}",
                referral.id, self.config.referral.max_transactions, payment_id
            );
            return Ok(None);
        }
        self.wallets(conn).credit(
            &referral.referrer_id,
            commission,
            Entry::new(TxType::ReferralCommission, payment_id),
        )?;
        if !referrals.record_commission(payment_id, &referral, commission)? {
            anyhow::bail!("Commission for payment {} was recorded concurrently", payment_id);
        }
        Ok(Some((referral.referrer_id, commission)))
    }

    /// Register the caller as referred by `referrer_id`.
    ///
    /// Providers joining through a referral earn both sides a signup bonus.
    pub async fn register_referral(&self, caller: &str, referrer_id: &str) -> BrokerResult<ReferralModel> {
        let referrer_id = referrer_id.trim();
        if referrer_id.is_empty() {
            return Err(BrokerError::Validation("referrer_id is required".to_string()));
        }
        if referrer_id == caller {
            return Err(BrokerError::Validation("Cannot refer yourself".to_string()));
        }
        let role = self
            .profiles
            .role(caller)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Profile {}", caller)))?;
        if self.profiles.role(referrer_id).await?.is_none() {
            return Err(BrokerError::NotFound(format!("Referrer {}", referrer_id)));
        }

        let settings = &self.config.referral;
        let referral = self
            .db
            .with_tx(|tx| -> BrokerResult<ReferralModel> {
                let referral = ReferralQueries::new(tx)
                    .insert(referrer_id, caller)?
                    .ok_or_else(|| BrokerError::Validation("Already referred".to_string()))?;
                if role == Role::Provider {
                    let wallets = self.wallets(tx);
                    wallets.credit_withdrawable(
                        referrer_id,
                        settings.referrer_bonus,
                        Entry::new(TxType::ReferralBonus, &referral.id),
                    )?;
                    wallets.credit_withdrawable(
                        caller,
                        settings.referred_bonus,
                        Entry::new(TxType::ReferralBonus, &referral.id),
                    )?;
                }
                Ok(referral)
            })
            .await?;

        info!(
            "Referral: {} registered as referred by {} (role {})",
            caller, referrer_id, role
        );
        Ok(referral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testkit::Kit;

    #[tokio::test]
    async fn test_provider_signup_bonuses() {
        let kit = Kit::new().await;
        kit.user("ref", Role::Requester, true).await;
        kit.user("p1", Role::Provider, true).await;

        let referral = kit.service.register_referral("p1", "ref").await.unwrap();
        assert_eq!(referral.referrer_id, "ref");
        assert_eq!(kit.wallet("ref").await.withdrawable, 10_000);
        assert_eq!(kit.wallet("p1").await.withdrawable, 20_000);
        assert_eq!(kit.wallet("p1").await.balance, 0);

        let err = kit.service.register_referral("p1", "ref").await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
        assert_eq!(kit.wallet("ref").await.withdrawable, 10_000);
    }

    #[tokio::test]
    async fn test_requester_referral_has_no_bonus() {
        let kit = Kit::new().await;
        kit.pair().await;
        kit.service.register_referral("r1", "p1").await.unwrap();
        assert_eq!(kit.tx_count("p1").await, 0);
        assert_eq!(kit.tx_count("r1").await, 0);
    }

    #[tokio::test]
    async fn test_referral_validation() {
        let kit = Kit::new().await;
        kit.pair().await;
        assert!(matches!(
            kit.service.register_referral("r1", "r1").await,
            Err(BrokerError::Validation(_))
        ));
        assert!(matches!(
            kit.service.register_referral("r1", "ghost").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(matches!(
            kit.service.register_referral("ghost", "r1").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commission_capped_and_once_per_payment() {
        let kit = Kit::new().await;
        kit.pair().await;
        kit.user("ref", Role::Requester, true).await;
        kit.service.register_referral("r1", "ref").await.unwrap();

        let paid = kit
            .db
            .with_tx(|tx| -> anyhow::Result<Vec<Option<(String, i64)>>> {
                Ok(vec![
                    kit.service.pay_commission(tx, "r1", "pay-1", 170_000)?,
                    kit.service.pay_commission(tx, "r1", "pay-1", 170_000)?,
                    kit.service.pay_commission(tx, "r1", "pay-2", 100_000)?,
                    kit.service.pay_commission(tx, "r1", "pay-3", 100_000)?,
                    kit.service.pay_commission(tx, "p1", "pay-4", 100_000)?,
                ])
            })
            .await
            .unwrap();

        assert_eq!(paid[0], Some(("ref".to_string(), 8_500)));
        assert_eq!(paid[1], None);
        assert_eq!(paid[2], Some(("ref".to_string(), 5_000)));
        // cap of two reached
        assert_eq!(paid[3], None);
        // p1 was never referred
        assert_eq!(paid[4], None);
        assert_eq!(kit.wallet("ref").await.balance, 13_500);
    }
}
