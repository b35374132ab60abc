//! Fan-out of a runner's findings to its callers.
//!
//! A runner evaluates one query on behalf of every control that needs it.
//! Each recorded finding becomes one [`ComplianceResult`] per caller, tagged
//! with the caller's benchmark reference code.

use crate::clients::{Benchmark, ComplianceClient};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use vigil_core::{ComplianceJobId, RunnerId, VigilResult};
use vigil_queue::{FindingStatus, RunnerFinding, RunnerJobMessage};

/// Severity recorded when the control does not declare one.
pub const DEFAULT_SEVERITY: &str = "none";

/// One evaluated resource under one benchmark control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceResult {
    /// Stable across redeliveries of the same runner attempt; the sink upserts on it.
    pub record_key: String,
    pub compliance_job_id: ComplianceJobId,
    pub runner_id: RunnerId,
    pub runner_retry_count: u32,
    pub benchmark_id: String,
    pub benchmark_reference_code: String,
    pub control_id: String,
    pub severity: String,
    pub query_id: String,
    pub integration_id: Option<String>,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub resource_location: String,
    pub status: FindingStatus,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Builds the downstream records of one runner result.
///
/// `reference_codes` maps benchmark ID to reference code; unknown benchmarks
/// get an empty code.
#[must_use]
pub fn fan_out_results(
    job: &RunnerJobMessage,
    findings: &[RunnerFinding],
    reference_codes: &HashMap<String, String>,
    evaluated_at: DateTime<Utc>,
) -> Vec<ComplianceResult> {
    let plan = &job.execution_plan;
    let mut results = Vec::with_capacity(findings.len() * plan.callers.len());

    for finding in findings.iter().filter(|f| f.status.is_recorded()) {
        let integration_id = finding
            .integration_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| plan.integration_id.clone());

        for caller in &plan.callers {
            let severity = if caller.control_severity.is_empty() {
                DEFAULT_SEVERITY.to_string()
            } else {
                caller.control_severity.clone()
            };

            results.push(ComplianceResult {
                record_key: format!(
                    "{}-{}-{}-{}-{}",
                    job.id, job.retry_count, caller.root_benchmark, caller.control_id, finding.resource_id
                ),
                compliance_job_id: job.parent_job_id,
                runner_id: job.id,
                runner_retry_count: job.retry_count,
                benchmark_id: caller.root_benchmark.clone(),
                benchmark_reference_code: reference_codes
                    .get(&caller.root_benchmark)
                    .cloned()
                    .unwrap_or_default(),
                control_id: caller.control_id.clone(),
                severity,
                query_id: plan.query.id.clone(),
                integration_id: integration_id.clone(),
                resource_id: finding.resource_id.clone(),
                resource_name: finding.resource_name.clone(),
                resource_type: finding.resource_type.clone(),
                resource_location: finding.resource_location.clone(),
                status: finding.status,
                reason: finding.reason.clone(),
                evaluated_at,
            });
        }
    }

    results
}

/// Benchmark ID to reference code, loaded from the compliance service.
///
/// Reloaded whenever a lookup misses so new benchmarks show up without a
/// restart.
pub struct BenchmarkCache {
    client: Arc<dyn ComplianceClient>,
    codes: RwLock<HashMap<String, String>>,
}

impl BenchmarkCache {
    pub fn new(client: Arc<dyn ComplianceClient>) -> Self {
        Self {
            client,
            codes: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the cache with the compliance service's current benchmarks.
    pub async fn refresh(&self) -> VigilResult<()> {
        let benchmarks = self.client.list_benchmarks().await?;
        let codes: HashMap<String, String> = benchmarks
            .into_iter()
            .map(|Benchmark { id, reference_code }| (id, reference_code))
            .collect();
        debug!(benchmarks = codes.len(), "Benchmark cache refreshed");
        *self.codes.write() = codes;
        Ok(())
    }

    /// Reference codes for `benchmark_ids`, refreshing once on a miss.
    pub async fn reference_codes<'a, I>(&self, benchmark_ids: I) -> VigilResult<HashMap<String, String>>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        let missing = {
            let codes = self.codes.read();
            benchmark_ids.clone().into_iter().any(|id| !codes.contains_key(id))
        };
        if missing {
            self.refresh().await?;
        }

        let codes = self.codes.read();
        Ok(benchmark_ids
            .into_iter()
            .filter_map(|id| match codes.get(id) {
                Some(code) => Some((id.to_string(), code.clone())),
                None => {
                    warn!(benchmark_id = id, "Benchmark not found in compliance service");
                    None
                }
            })
            .collect())
    }
}
