//! HTTP client for the orchestrator API.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use vlb_id::ServiceKey;

use super::{EndpointResolver, EventSeverity, StatusSink};

/// Page of the service event feed.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    pub items: Vec<EventItem>,
    pub next_after_event_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventItem {
    pub event_id: i64,
    pub event_type: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EndpointsResponse {
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest {
    assigned_address: Ipv4Addr,
}

#[derive(Debug, Serialize)]
struct FinalizerRequest<'a> {
    finalizer: &'a str,
}

#[derive(Debug, Serialize)]
struct EventRequest<'a> {
    severity: EventSeverity,
    reason: &'a str,
    message: &'a str,
    timestamp: String,
}

/// Orchestrator API client.
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    client: reqwest::Client,
    base_url: String,
}

impl OrchestratorClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vlb-controller/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn service_url(&self, key: &ServiceKey, suffix: &str) -> String {
        format!(
            "{}/v1/namespaces/{}/services/{}/{}",
            self.base_url,
            key.namespace(),
            key.name(),
            suffix
        )
    }

    /// Fetch the next page of service events after `after_event_id`.
    pub async fn fetch_events(&self, after_event_id: i64, limit: i64) -> Result<EventsResponse> {
        let url = format!("{}/v1/services/events", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("after_event_id", after_event_id), ("limit", limit)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("events query failed (status={}): {}", status, body);
        }

        Ok(response.json::<EventsResponse>().await?)
    }

    async fn expect_success(response: reqwest::Response, what: &str, allow_not_found: bool) -> Result<()> {
        let status = response.status();
        if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Failed to {what}");
        anyhow::bail!("Failed to {}: {} - {}", what, status, body);
    }
}

#[async_trait]
impl EndpointResolver for OrchestratorClient {
    async fn resolve(&self, key: &ServiceKey) -> Result<Vec<String>> {
        let url = self.service_url(key, "endpoints");
        debug!(url = %url, "Resolving endpoints");

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to resolve endpoints: {} - {}", status, body);
        }

        let endpoints: EndpointsResponse = response.json().await?;
        Ok(endpoints.addresses)
    }
}

#[async_trait]
impl StatusSink for OrchestratorClient {
    async fn set_assigned_address(&self, key: &ServiceKey, address: Ipv4Addr) -> Result<()> {
        let response = self
            .client
            .put(self.service_url(key, "status"))
            .json(&StatusRequest {
                assigned_address: address,
            })
            .send()
            .await?;
        Self::expect_success(response, "set service status", false).await
    }

    async fn clear_assigned_address(&self, key: &ServiceKey) -> Result<()> {
        let response = self.client.delete(self.service_url(key, "status")).send().await?;
        Self::expect_success(response, "clear service status", true).await
    }

    async fn add_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()> {
        let response = self
            .client
            .post(self.service_url(key, "finalizers"))
            .json(&FinalizerRequest { finalizer })
            .send()
            .await?;
        Self::expect_success(response, "add finalizer", false).await
    }

    async fn remove_finalizer(&self, key: &ServiceKey, finalizer: &str) -> Result<()> {
        let url = self.service_url(key, &format!("finalizers/{finalizer}"));
        let response = self.client.delete(url).send().await?;
        Self::expect_success(response, "remove finalizer", true).await
    }

    async fn record_event(
        &self,
        key: &ServiceKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.service_url(key, "events"))
            .json(&EventRequest {
                severity,
                reason,
                message,
                timestamp: Utc::now().to_rfc3339(),
            })
            .send()
            .await?;
        Self::expect_success(response, "record event", false).await
    }
}
