// Best-effort result persistence: a write-and-forget upload of each finished
// cutout. Failures are logged and never surface into the item's state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::StorageConfig;
use crate::core::types::ItemId;
use crate::utils::Metrics;

/// One persistence request: the original and the produced cutout.
pub struct StoreRequest {
    pub item_id: ItemId,
    pub file_name: String,
    pub original: Arc<Vec<u8>>,
    pub cutout: Arc<Vec<u8>>,
    pub owner: String,
    pub feature: &'static str,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn store(&self, request: StoreRequest) -> Result<()>;
}

/// HTTP-backed production store.
pub struct HttpResultStore {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpResultStore {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to create storage HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ResultStore for HttpResultStore {
    async fn store(&self, request: StoreRequest) -> Result<()> {
        let url = format!("{}/results", self.base_url);
        let body = serde_json::json!({
            "owner": request.owner,
            "feature": request.feature,
            "file_name": request.file_name,
            "original": general_purpose::STANDARD.encode(request.original.as_slice()),
            "result": general_purpose::STANDARD.encode(request.cutout.as_slice()),
        });

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach result store at {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Result store returned {} for item {}", response.status(), request.item_id);
        }

        debug!("Stored result for item {}", request.item_id);
        Ok(())
    }
}

/// Store used when no storage backend is configured; results stay in memory
/// only.
pub struct NoopResultStore;

#[async_trait]
impl ResultStore for NoopResultStore {
    async fn store(&self, request: StoreRequest) -> Result<()> {
        debug!("STORAGE_URL not set; skipping upload for item {}", request.item_id);
        Ok(())
    }
}

/// Fire-and-forget wrapper: spawn the upload as a detached task whose only
/// observable failure is a log line and a metrics tick.
pub fn store_best_effort(store: Arc<dyn ResultStore>, metrics: Metrics, request: StoreRequest) {
    tokio::spawn(async move {
        let item_id = request.item_id;
        if let Err(e) = store.store(request).await {
            metrics.record_persistence_failure();
            warn!("Best-effort persistence failed for item {}: {:#}", item_id, e);
        }
    });
}

/// Build the store from configuration.
pub fn store_from_config(config: &StorageConfig) -> Result<Arc<dyn ResultStore>> {
    match &config.base_url {
        Some(url) => Ok(Arc::new(HttpResultStore::new(
            url.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?)),
        None => Ok(Arc::new(NoopResultStore)),
    }
}
