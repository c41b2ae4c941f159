pub mod etcd;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of a first-writer-wins seed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Created,
    /// The key was already present; the stored value is untouched. Expected
    /// across concurrent supervisor restarts, not an error.
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Etcd(Box::new(e))
    }
}

/// Typed access to the distributed configuration store. The supervisor only
/// needs three verbs; consensus and replication stay behind this seam.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Prefix listing, also used as the availability probe.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Create `key` unless it exists. Never overwrites.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SeedOutcome, StoreError>;

    /// Write `key` bound to a lease of `ttl_secs`. Returns the expiry of the
    /// new lease on success.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<DateTime<Utc>, StoreError>;
}
