//! HTTP/JSON implementations of the collaborator clients.

use super::{
    Benchmark, BenchmarkControl, ComplianceClient, Credential, Integration, IntegrationClient,
    InventoryClient, ResourceTypeInfo, ResultSink,
};
use crate::error::ClientError;
use crate::fanout::ComplianceResult;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use vigil_config::ServicesConfig;
use vigil_core::{QueryDefinition, VigilError, VigilResult};
use vigil_resilience::RetryPolicy;

/// Shared plumbing of one remote service: base URL, connection pool and
/// retry policy for idempotent reads.
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
    service: &'static str,
    retry: RetryPolicy,
}

impl ServiceClient {
    pub fn new(service: &'static str, base_url: &str, timeout: Duration) -> VigilResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| VigilError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, service, base_url))
    }

    pub fn with_client(client: Client, service: &'static str, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with retry on transient failures.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> VigilResult<T> {
        let url = self.url(path);
        let url = url.as_str();
        self.retry
            .execute(move || async move {
                debug!(service = self.service, url = %url, "HTTP GET");
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ClientError::request(self.service, e))?;
                self.handle_response(response).await
            })
            .await
    }

    /// POST without retry; the call may not be idempotent.
    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> VigilResult<T> {
        let url = self.url(path);
        debug!(service = self.service, url = %url, "HTTP POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::request(self.service, e))?;
        self.handle_response(response).await
    }

    async fn post_no_content<B: Serialize + Sync>(&self, path: &str, body: &B) -> VigilResult<()> {
        let url = self.url(path);
        debug!(service = self.service, url = %url, "HTTP POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::request(self.service, e))?;
        self.check_status(response).await.map(drop)
    }

    async fn check_status(&self, response: Response) -> VigilResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            service: self.service,
            status: status.as_u16(),
            body,
        }
        .into())
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> VigilResult<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::request(self.service, e).into())
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Integration service
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListIntegrationsResponse {
    integrations: Vec<Integration>,
}

/// Integration service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIntegrationClient {
    inner: ServiceClient,
}

impl HttpIntegrationClient {
    pub fn new(config: &ServicesConfig) -> VigilResult<Self> {
        Ok(Self {
            inner: ServiceClient::new(
                "integration",
                &config.integration_url,
                config.request_timeout(),
            )?,
        })
    }

    #[must_use]
    pub fn from_service(inner: ServiceClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    async fn list_integrations(&self) -> VigilResult<Vec<Integration>> {
        let response: ListIntegrationsResponse = self.inner.get_json("/api/v1/integrations").await?;
        Ok(response.integrations)
    }

    async fn get_integration(&self, integration_id: &str) -> VigilResult<Integration> {
        self.inner
            .get_json(&format!("/api/v1/integrations/{}", integration_id))
            .await
    }

    async fn health_check(&self, integration_id: &str) -> VigilResult<Integration> {
        self.inner
            .post_json(
                &format!("/api/v1/integrations/{}/healthcheck", integration_id),
                &serde_json::json!({}),
            )
            .await
    }

    async fn get_credential(&self, credential_id: &str) -> VigilResult<Credential> {
        self.inner
            .get_json(&format!("/api/v1/credentials/{}", credential_id))
            .await
    }

    async fn resource_types(&self, integration: &Integration) -> VigilResult<Vec<ResourceTypeInfo>> {
        self.inner
            .get_json(&format!(
                "/api/v1/integration-types/{}/resource-types",
                integration.integration_type
            ))
            .await
    }
}

// ============================================================================
// Compliance service
// ============================================================================

/// Compliance service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpComplianceClient {
    inner: ServiceClient,
}

impl HttpComplianceClient {
    pub fn new(config: &ServicesConfig) -> VigilResult<Self> {
        Ok(Self {
            inner: ServiceClient::new("compliance", &config.compliance_url, config.request_timeout())?,
        })
    }

    #[must_use]
    pub fn from_service(inner: ServiceClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ComplianceClient for HttpComplianceClient {
    async fn list_queries(&self) -> VigilResult<Vec<QueryDefinition>> {
        self.inner.get_json("/api/v1/queries").await
    }

    async fn list_benchmarks(&self) -> VigilResult<Vec<Benchmark>> {
        self.inner.get_json("/api/v1/benchmarks").await
    }

    async fn benchmark_controls(&self, benchmark_id: &str) -> VigilResult<Vec<BenchmarkControl>> {
        self.inner
            .get_json(&format!("/api/v1/benchmarks/{}/controls", benchmark_id))
            .await
    }
}

// ============================================================================
// Inventory service
// ============================================================================

#[derive(Debug, Serialize)]
struct RemoveResourcesRequest<'a> {
    integration_id: &'a str,
    resource_type: &'a str,
}

/// Inventory service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpInventoryClient {
    inner: ServiceClient,
}

impl HttpInventoryClient {
    pub fn new(config: &ServicesConfig) -> VigilResult<Self> {
        Ok(Self {
            inner: ServiceClient::new("inventory", &config.inventory_url, config.request_timeout())?,
        })
    }

    #[must_use]
    pub fn from_service(inner: ServiceClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn remove_resources(&self, integration_id: &str, resource_type: &str) -> VigilResult<()> {
        self.inner
            .post_no_content(
                "/api/v1/resources/remove",
                &RemoveResourcesRequest {
                    integration_id,
                    resource_type,
                },
            )
            .await
    }
}

// ============================================================================
// Findings sink
// ============================================================================

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    results: &'a [ComplianceResult],
}

/// Findings sink over HTTP.
#[derive(Debug, Clone)]
pub struct HttpResultSink {
    inner: ServiceClient,
}

impl HttpResultSink {
    pub fn new(config: &ServicesConfig) -> VigilResult<Self> {
        Ok(Self {
            inner: ServiceClient::new("sink", &config.sink_url, config.request_timeout())?,
        })
    }

    #[must_use]
    pub fn from_service(inner: ServiceClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn ingest(&self, results: &[ComplianceResult]) -> VigilResult<()> {
        self.inner
            .post_no_content("/api/v1/ingest/compliance-results", &IngestRequest { results })
            .await
    }
}
