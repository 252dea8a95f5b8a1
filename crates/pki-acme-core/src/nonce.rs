//! Anti-replay nonces
//!
//! A nonce is issued by new-nonce (and on every response) and consumed by
//! exactly one signed request. Consumption is a single conditional delete, so
//! two requests racing with the same nonce cannot both succeed.

use async_trait::async_trait;
use chrono::Utc;
use pki_acme_db::entities::nonce;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AcmeResult;
use crate::jose::random_token;

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Issue a fresh nonce
    async fn issue(&self) -> AcmeResult<String>;

    /// Consume a nonce; `false` if it is unknown, expired or already used
    async fn consume(&self, nonce: &str) -> AcmeResult<bool>;

    /// Delete expired nonces, returning how many were removed
    async fn sweep(&self) -> AcmeResult<u64>;
}

/// Nonces stored in the `acme_nonces` table
pub struct DbNonceStore {
    db: DatabaseConnection,
    ttl: chrono::Duration,
}

impl DbNonceStore {
    pub fn new(db: DatabaseConnection, ttl: Duration) -> Self {
        Self {
            db,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }
}

#[async_trait]
impl NonceStore for DbNonceStore {
    async fn issue(&self) -> AcmeResult<String> {
        let now = Utc::now();
        let value = random_token(32);
        nonce::ActiveModel {
            nonce: Set(value.clone()),
            expires_at: Set(now + self.ttl),
            created_at: Set(now),
        }
        .insert(&self.db)
        .await?;
        Ok(value)
    }

    async fn consume(&self, value: &str) -> AcmeResult<bool> {
        let result = nonce::Entity::delete_many()
            .filter(nonce::Column::Nonce.eq(value))
            .filter(nonce::Column::ExpiresAt.gt(Utc::now()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn sweep(&self) -> AcmeResult<u64> {
        let result = nonce::Entity::delete_many()
            .filter(nonce::Column::ExpiresAt.lte(Utc::now()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

/// Periodically delete expired nonces
pub fn spawn_nonce_sweeper(store: Arc<dyn NonceStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.sweep().await {
                Ok(0) => {}
                Ok(removed) => debug!("Swept {} expired nonces", removed),
                Err(e) => warn!("Nonce sweep failed: {}", e),
            }
        }
    })
}
