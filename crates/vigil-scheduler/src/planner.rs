//! Compliance job planning: benchmark controls to runners.

use crate::clients::ComplianceClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use vigil_core::{
    Caller, ComplianceJob, ComplianceJobStatus, NewComplianceJob, NewComplianceRunner,
    TriggerType, VigilError, VigilResult,
};
use vigil_repository::ComplianceStore;

pub struct CompliancePlanner {
    store: Arc<dyn ComplianceStore>,
    compliance: Arc<dyn ComplianceClient>,
}

impl CompliancePlanner {
    pub fn new(store: Arc<dyn ComplianceStore>, compliance: Arc<dyn ComplianceClient>) -> Self {
        Self { store, compliance }
    }

    /// Creates a compliance job for `framework_id` and one `Created` runner
    /// per (query, integration). Controls sharing a query become callers of
    /// the same runner.
    pub async fn plan_compliance_job(
        &self,
        framework_id: &str,
        integration_ids: &[String],
        trigger: TriggerType,
        created_by: &str,
    ) -> VigilResult<ComplianceJob> {
        if integration_ids.is_empty() {
            return Err(VigilError::validation("compliance job needs at least one integration"));
        }

        let controls = self.compliance.benchmark_controls(framework_id).await?;
        let mut callers_by_query: BTreeMap<String, Vec<Caller>> = BTreeMap::new();
        for control in controls {
            let caller = Caller::new(control.benchmark_id, control.control_id, control.severity);
            let callers = callers_by_query.entry(control.query_id).or_default();
            if !callers.contains(&caller) {
                callers.push(caller);
            }
        }
        if callers_by_query.is_empty() {
            return Err(VigilError::validation(format!(
                "benchmark {framework_id} has no controls with a query"
            )));
        }

        let mut job = self
            .store
            .create_compliance_job(&NewComplianceJob {
                framework_id: framework_id.to_string(),
                integration_ids: integration_ids.to_vec(),
                with_incidents: true,
                include_results: Vec::new(),
                trigger_type: trigger,
                parent_id: None,
                created_by: created_by.to_string(),
            })
            .await?;

        let runners: Vec<NewComplianceRunner> = callers_by_query
            .iter()
            .flat_map(|(query_id, callers)| {
                integration_ids.iter().map(move |integration_id| NewComplianceRunner {
                    parent_job_id: job.id,
                    framework_id: framework_id.to_string(),
                    query_id: query_id.clone(),
                    integration_id: Some(integration_id.clone()),
                    resource_collection_id: None,
                    callers: callers.clone(),
                    trigger_type: trigger,
                })
            })
            .collect();
        let created = self.store.create_runners(&runners).await?;

        if self
            .store
            .update_compliance_job_status(job.id, ComplianceJobStatus::RunnersInProgress, None)
            .await?
        {
            job.status = ComplianceJobStatus::RunnersInProgress;
        }

        info!(
            compliance_job_id = %job.id,
            framework_id,
            queries = callers_by_query.len(),
            runners = created.len(),
            trigger = %trigger,
            "Compliance job planned"
        );
        Ok(job)
    }
}
