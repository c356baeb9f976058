//! Profile directory
//!
//! Profiles are owned elsewhere; settlement reads a handful of flags from
//! them and flips provider availability on accept.

use crate::db::{Database, ProfileModel, ProfileQueries, Role};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Profile flags the settlement core depends on
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Role of a user, None if unknown
    async fn role(&self, user_id: &str) -> anyhow::Result<Option<Role>>;

    /// Whether identity verification is complete
    async fn is_verified(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Mark verification complete; false if already verified
    async fn mark_verified(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Provider is accepting requests and currently available
    async fn is_eligible(&self, provider_id: &str) -> anyhow::Result<bool>;

    /// Set provider availability
    async fn set_available(&self, provider_id: &str, available: bool) -> anyhow::Result<()>;
}

/// Profile directory backed by the `profiles` table
#[derive(Clone)]
pub struct SqliteProfiles {
    db: Arc<Database>,
}

impl SqliteProfiles {
    /// Create a directory over the shared database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a profile
    pub async fn upsert(&self, profile: &ProfileModel) -> anyhow::Result<()> {
        self.db
            .with_conn(|c| ProfileQueries::new(c).upsert(profile))
            .await
    }

    async fn get(&self, user_id: &str) -> anyhow::Result<Option<ProfileModel>> {
        self.db.with_conn(|c| ProfileQueries::new(c).get(user_id)).await
    }
}

#[async_trait]
impl ProfileDirectory for SqliteProfiles {
    async fn role(&self, user_id: &str) -> anyhow::Result<Option<Role>> {
        Ok(self.get(user_id).await?.map(|p| p.role))
    }

    async fn is_verified(&self, user_id: &str) -> anyhow::Result<bool> {
        Ok(self.get(user_id).await?.map(|p| p.verified).unwrap_or(false))
    }

    async fn mark_verified(&self, user_id: &str) -> anyhow::Result<bool> {
        let changed = self
            .db
            .with_conn(|c| ProfileQueries::new(c).set_verified(user_id))
            .await?;
        if changed {
            info!("Profile {} verified", user_id);
        }
        Ok(changed)
    }

    async fn is_eligible(&self, provider_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .get(provider_id)
            .await?
            .map(|p| p.role == Role::Provider && p.accepting_requests && p.available)
            .unwrap_or(false))
    }

    async fn set_available(&self, provider_id: &str, available: bool) -> anyhow::Result<()> {
        self.db
            .with_conn(|c| ProfileQueries::new(c).set_available(provider_id, available))
            .await?;
        info!("Provider {} available={}", provider_id, available);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(user_id: &str, role: Role) -> ProfileModel {
        ProfileModel {
            user_id: user_id.to_string(),
            role,
            verified: false,
            accepting_requests: true,
            available: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_eligibility_and_verification() {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let profiles = SqliteProfiles::new(db);
        profiles.upsert(&profile("p1", Role::Provider)).await.unwrap();
        profiles.upsert(&profile("r1", Role::Requester)).await.unwrap();

        assert!(profiles.is_eligible("p1").await.unwrap());
        assert!(!profiles.is_eligible("r1").await.unwrap());
        assert!(!profiles.is_eligible("missing").await.unwrap());

        profiles.set_available("p1", false).await.unwrap();
        assert!(!profiles.is_eligible("p1").await.unwrap());

        assert!(!profiles.is_verified("r1").await.unwrap());
        assert!(profiles.mark_verified("r1").await.unwrap());
        assert!(!profiles.mark_verified("r1").await.unwrap());
        assert!(profiles.is_verified("r1").await.unwrap());
        assert_eq!(profiles.role("p1").await.unwrap(), Some(Role::Provider));
    }
}
