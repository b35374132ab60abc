//! External collaborators of the scheduler.
//!
//! Integrations, credentials, the resource type catalog, the query catalog,
//! benchmarks, resource removal and the findings sink all live in other
//! services. The scheduler only sees the narrow traits below; the HTTP
//! implementations are in [`http`].

mod http;

pub use http::*;

use crate::fanout::ComplianceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use vigil_core::{QueryDefinition, VigilResult};

/// Lifecycle state of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationState {
    Active,
    Inactive,
    Archived,
    Sample,
}

/// A configured connection to an external account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub integration_id: String,
    /// Account identifier on the provider side.
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    pub integration_type: String,
    pub state: IntegrationState,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credential_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Integration {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == IntegrationState::Active
    }

    /// True when the last health check is older than `interval` or never happened.
    #[must_use]
    pub fn needs_health_check(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        let Ok(interval) = chrono::Duration::from_std(interval) else {
            return true;
        };
        self.last_check.map_or(true, |checked| checked < now - interval)
    }
}

/// Encrypted credential handed to the describe worker as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    /// Opaque cipher text; only the worker can decrypt it.
    pub secret: String,
}

/// Catalog entry of a resource type an integration can describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeInfo {
    pub name: String,
    /// Cost (spend) resource type.
    #[serde(default)]
    pub cost: bool,
}

/// Benchmark metadata used to tag fanned-out results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    #[serde(default)]
    pub reference_code: String,
}

/// A control reached from a benchmark, and the query that evaluates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkControl {
    /// Root benchmark the control was reached through.
    pub benchmark_id: String,
    pub control_id: String,
    #[serde(default)]
    pub severity: String,
    pub query_id: String,
}

/// Integration service: integrations, health checks, credentials and the
/// per-integration-type resource type catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn list_integrations(&self) -> VigilResult<Vec<Integration>>;

    async fn get_integration(&self, integration_id: &str) -> VigilResult<Integration>;

    /// Runs a health check and returns the refreshed integration.
    async fn health_check(&self, integration_id: &str) -> VigilResult<Integration>;

    async fn get_credential(&self, credential_id: &str) -> VigilResult<Credential>;

    /// Resource types the integration can describe.
    async fn resource_types(&self, integration: &Integration) -> VigilResult<Vec<ResourceTypeInfo>>;
}

/// Compliance service: query catalog and benchmarks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComplianceClient: Send + Sync {
    async fn list_queries(&self) -> VigilResult<Vec<QueryDefinition>>;

    async fn list_benchmarks(&self) -> VigilResult<Vec<Benchmark>>;

    /// Every control of the benchmark, children included.
    async fn benchmark_controls(&self, benchmark_id: &str) -> VigilResult<Vec<BenchmarkControl>>;
}

/// Inventory service: removal of described resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn remove_resources(&self, integration_id: &str, resource_type: &str) -> VigilResult<()>;
}

/// Downstream findings index.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn ingest(&self, results: &[ComplianceResult]) -> VigilResult<()>;
}
