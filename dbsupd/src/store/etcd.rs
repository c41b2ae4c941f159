use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use log::info;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::Settings;

use super::{ConfigStore, SeedOutcome, StoreError};

/// etcd-backed [`ConfigStore`].
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<RwLock<Client>>,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[&str]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    /// Block until the store answers a listing call, retrying forever at the
    /// configured interval. Returns `None` when shutdown is requested first.
    ///
    /// After the store first answers, sleeps past the TTL so keys leased by
    /// a crashed predecessor expire before anything reads or writes them.
    pub async fn wait_available(
        settings: &Settings,
        token: &CancellationToken,
    ) -> Option<Self> {
        let endpoint = settings.store_endpoint();
        let retry = settings.loop_interval();
        let store = loop {
            match Self::connect(&[endpoint.as_str()]).await {
                Ok(store) => match store.list(&settings.etcd_path).await {
                    Ok(_) => break store,
                    Err(e) => info!("waiting for config store at {endpoint}: {e}"),
                },
                Err(e) => info!("waiting for config store at {endpoint}: {e}"),
            }
            tokio::select! {
                _ = sleep(retry) => {}
                _ = token.cancelled() => return None,
            }
        };

        info!(
            "config store is up, letting stale keys expire ({}s)",
            settings.settle_delay().as_secs()
        );
        tokio::select! {
            _ = sleep(settings.settle_delay()) => Some(store),
            _ = token.cancelled() => None,
        }
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    String::from_utf8_lossy(kv.value()).to_string(),
                )
            })
            .collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SeedOutcome, StoreError> {
        let cmp = Compare::version(key, CompareOp::Equal, 0);
        let put_op = TxnOp::put(key, value, None);
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let mut client = self.client.write().await;
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            Ok(SeedOutcome::Created)
        } else {
            Ok(SeedOutcome::AlreadyExists)
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_secs: i64,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut client = self.client.write().await;
        let lease_resp = client.lease_client().grant(ttl_secs, None).await?;
        let lease_id = lease_resp.id();

        let res = client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await;
        if let Err(e) = res {
            let _ = client.lease_revoke(lease_id).await;
            return Err(e.into());
        }

        Ok(Utc::now() + chrono::Duration::seconds(lease_resp.ttl()))
    }
}
