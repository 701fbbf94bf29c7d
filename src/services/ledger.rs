// Usage/credit gate: the external ledger consulted before any batch starts.
//
// The reservation is atomic-or-nothing from the coordinator's point of view:
// either the whole batch's cost is reserved, or the batch does not start.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::LedgerConfig;
use crate::core::errors::{LedgerError, LedgerResult};

#[async_trait]
pub trait UsageGate: Send + Sync {
    /// Reserve `cost` credits for `feature`, or refuse the whole amount.
    async fn check_and_reserve(&self, cost: u32, feature: &str) -> LedgerResult<()>;

    /// Current credit balance, for the UI's balance counter.
    async fn balance(&self) -> LedgerResult<u32>;
}

/// HTTP-backed production gate.
pub struct HttpUsageGate {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    credits: u32,
}

impl HttpUsageGate {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to create ledger HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UsageGate for HttpUsageGate {
    async fn check_and_reserve(&self, cost: u32, feature: &str) -> LedgerResult<()> {
        let url = format!("{}/usage/reserve", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "cost": cost, "feature": feature }))
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => {
                debug!("Reserved {} credit(s) for {}", cost, feature);
                Ok(())
            }
            reqwest::StatusCode::PAYMENT_REQUIRED => {
                Err(LedgerError::InsufficientBalance { required: cost })
            }
            status => Err(LedgerError::InvalidResponse(format!(
                "{} from {}",
                status, url
            ))),
        }
    }

    async fn balance(&self) -> LedgerResult<u32> {
        let url = format!("{}/usage/balance", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::InvalidResponse(format!(
                "{} from {}",
                response.status(),
                url
            )));
        }

        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        Ok(body.credits)
    }
}

/// Gate used when no ledger is configured (self-hosted deployments): every
/// reservation is admitted and nothing is deducted.
pub struct UnmeteredGate;

#[async_trait]
impl UsageGate for UnmeteredGate {
    async fn check_and_reserve(&self, cost: u32, feature: &str) -> LedgerResult<()> {
        debug!("Unmetered: admitting {} credit(s) for {}", cost, feature);
        Ok(())
    }

    async fn balance(&self) -> LedgerResult<u32> {
        Ok(u32::MAX)
    }
}

/// Build the gate from configuration.
pub fn gate_from_config(config: &LedgerConfig) -> Result<std::sync::Arc<dyn UsageGate>> {
    match &config.base_url {
        Some(url) => Ok(std::sync::Arc::new(HttpUsageGate::new(
            url.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?)),
        None => {
            warn!("LEDGER_URL not set; usage metering is disabled");
            Ok(std::sync::Arc::new(UnmeteredGate))
        }
    }
}
