//! Wallet read surface

use super::BrokerService;
use crate::{
    db::{WalletModel, WalletTransactionModel},
    BrokerResult,
};
use serde::Serialize;

/// One page of ledger rows, newest first
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub items: Vec<WalletTransactionModel>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl BrokerService {
    /// Wallet of a user, created with zero balances on first read
    pub async fn get_wallet(&self, user_id: &str) -> BrokerResult<WalletModel> {
        Ok(self
            .db
            .with_conn(|c| self.wallets(c).get_or_create(user_id))
            .await?)
    }

    /// Ledger rows of a user; `page` starts at 1
    pub async fn list_transactions(
        &self,
        user_id: &str,
        page: u32,
        per_page: u32,
    ) -> BrokerResult<TransactionPage> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let offset = (page - 1).saturating_mul(per_page);
        let (items, total) = self
            .db
            .with_conn(|c| -> anyhow::Result<_> {
                let wallets = self.wallets(c);
                Ok((
                    wallets.list_transactions(user_id, per_page, offset)?,
                    wallets.count_transactions(user_id)?,
                ))
            })
            .await?;
        Ok(TransactionPage {
            items,
            total,
            page,
            per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::testkit::Kit;
    use crate::db::TxType;

    #[tokio::test]
    async fn test_wallet_created_on_read() {
        let kit = Kit::new().await;
        let wallet = kit.service.get_wallet("new").await.unwrap();
        assert_eq!(wallet.balance, 0);
        assert_eq!(wallet.withdrawable, 0);
        assert_eq!(wallet.currency, "KES");
    }

    #[tokio::test]
    async fn test_transactions_paginate_newest_first() {
        let kit = Kit::new().await;
        for amount in [100, 200, 300] {
            kit.fund("u1", amount).await;
        }

        let first = kit.service.list_transactions("u1", 1, 2).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].amount, 300);
        assert_eq!(first.items[0].tx_type, TxType::Refund);

        let second = kit.service.list_transactions("u1", 2, 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].amount, 100);

        // page 0 is treated as the first page
        let clamped = kit.service.list_transactions("u1", 0, 500).await.unwrap();
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.per_page, 100);
        assert_eq!(clamped.items.len(), 3);
    }
}
