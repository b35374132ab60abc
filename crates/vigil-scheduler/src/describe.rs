//! Describe job scheduler.
//!
//! Drives the describe job state machine from two independent timers:
//!
//! - **create**: for every integration, health check when stale, skip when
//!   inactive, then call [`DescribeScheduler::describe`] for each resource
//!   type the integration type supports
//! - **dispatch**: global ceilings, bounded candidate batch per lane, per
//!   resource type ceilings, concurrent publish, then the retry sweep
//!
//! A failure scoped to one integration or one job is logged and skipped;
//! only a store failure that makes the whole phase meaningless aborts it.

use crate::admission::AdmissionController;
use crate::clients::{Integration, IntegrationClient, ResourceTypeInfo};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::metrics::{reasons, SchedulerMetrics};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use vigil_config::SchedulerConfig;
use vigil_core::{
    DescribeJob, DescribeJobStatus, Lane, NewDescribeJob, TriggerType, VigilError, VigilResult,
};
use vigil_repository::{DescribeJobStore, RetrySweep};

/// Options of a describe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeRequest {
    pub trigger: TriggerType,
    /// Create the job directly in `RemovingResources`.
    pub remove_resources: bool,
    pub parent_id: Option<i64>,
    pub created_by: String,
}

impl DescribeRequest {
    /// Periodic discovery by the scheduler itself.
    #[must_use]
    pub fn scheduled() -> Self {
        Self {
            trigger: TriggerType::Scheduled,
            remove_resources: false,
            parent_id: None,
            created_by: "system".to_string(),
        }
    }

    /// On-demand discovery requested by a user.
    #[must_use]
    pub fn manual(created_by: impl Into<String>) -> Self {
        Self {
            trigger: TriggerType::Manual,
            created_by: created_by.into(),
            ..Self::scheduled()
        }
    }

    #[must_use]
    pub fn removing_resources(mut self) -> Self {
        self.remove_resources = true;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Counters of one create phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateReport {
    pub created: usize,
    pub in_progress: usize,
    pub up_to_date: usize,
    pub skipped_integrations: usize,
}

pub struct DescribeScheduler {
    store: Arc<dyn DescribeJobStore>,
    integrations: Arc<dyn IntegrationClient>,
    admission: AdmissionController,
    dispatcher: Dispatcher,
    config: SchedulerConfig,
}

impl DescribeScheduler {
    pub fn new(
        store: Arc<dyn DescribeJobStore>,
        integrations: Arc<dyn IntegrationClient>,
        dispatcher: Dispatcher,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            admission: AdmissionController::new(Arc::clone(&store), config.clone()),
            store,
            integrations,
            dispatcher,
            config,
        }
    }

    /// Creates a describe job for `(integration_id, resource_type)`.
    ///
    /// Returns `Ok(None)` when a scheduled request finds a recent enough job,
    /// and [`VigilError::JobInProgress`] when the pair already has one in flight.
    pub async fn describe(
        &self,
        integration_id: &str,
        resource_type: &str,
        request: DescribeRequest,
    ) -> VigilResult<Option<DescribeJob>> {
        let integration = self.integrations.get_integration(integration_id).await?;
        let catalog = self.integrations.resource_types(&integration).await?;
        let resource_type = catalog
            .into_iter()
            .find(|rt| rt.name.eq_ignore_ascii_case(resource_type))
            .ok_or_else(|| {
                VigilError::validation(format!(
                    "resource type {} is not supported by {}",
                    resource_type, integration.integration_type
                ))
            })?;

        if let Some(last) = self.last_job_gate(&integration, &resource_type, &request).await? {
            debug!(job_id = %last.id, "Recent describe job exists, nothing to do");
            return Ok(None);
        }

        let integration = self.ensure_healthy(integration).await?;
        self.insert(&integration, &resource_type, &request).await.map(Some)
    }

    /// Create phase over every integration.
    #[instrument(skip(self))]
    pub async fn create_phase(&self) -> VigilResult<CreateReport> {
        let integrations = self.integrations.list_integrations().await?;
        let mut report = CreateReport::default();

        for integration in integrations {
            let integration_id = integration.integration_id.clone();
            let integration = match self.ensure_healthy(integration).await {
                Ok(integration) => integration,
                Err(e) => {
                    debug!(integration_id = %integration_id, reason = %e, "Skipping integration");
                    report.skipped_integrations += 1;
                    continue;
                }
            };

            let resource_types = match self.integrations.resource_types(&integration).await {
                Ok(types) => types,
                Err(e) => {
                    warn!(integration_id = %integration_id, error = %e, "Failed to list resource types");
                    report.skipped_integrations += 1;
                    continue;
                }
            };

            let request = DescribeRequest::scheduled();
            for resource_type in resource_types.iter().filter(|rt| self.is_discovery_enabled(rt)) {
                match self.create_if_due(&integration, resource_type, &request).await {
                    Ok(Some(_)) => report.created += 1,
                    Ok(None) => report.up_to_date += 1,
                    Err(VigilError::JobInProgress) => {
                        debug!(
                            integration_id = %integration_id,
                            resource_type = %resource_type.name,
                            "Describe job already in progress"
                        );
                        report.in_progress += 1;
                    }
                    Err(e) => {
                        warn!(
                            integration_id = %integration_id,
                            resource_type = %resource_type.name,
                            error = %e,
                            "Failed to create describe job"
                        );
                    }
                }
            }
        }

        info!(
            created = report.created,
            in_progress = report.in_progress,
            up_to_date = report.up_to_date,
            skipped_integrations = report.skipped_integrations,
            "Describe create phase finished"
        );
        Ok(report)
    }

    /// Dispatch phase: manual lane first, then scheduled, then the retry sweep.
    ///
    /// A failing step is logged and the remaining steps still run. The phase
    /// fails only when every step failed.
    #[instrument(skip(self))]
    pub async fn dispatch_phase(&self) -> VigilResult<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut last_error = None;
        let mut succeeded = false;

        for lane in [Lane::Manual, Lane::Scheduled] {
            match self.dispatch_lane(lane).await {
                Ok(lane_report) => {
                    succeeded = true;
                    report.published += lane_report.published;
                    report.failed += lane_report.failed;
                    report.skipped += lane_report.skipped;
                }
                Err(e) => {
                    warn!(%lane, error = %e, "Describe dispatch lane failed");
                    last_error = Some(e);
                }
            }
        }

        match self.retry_failed().await {
            Ok(sweep) => {
                succeeded = true;
                if sweep.retried > 0 || sweep.exhausted > 0 {
                    info!(retried = sweep.retried, exhausted = sweep.exhausted, "Describe retry sweep");
                }
            }
            Err(e) => {
                warn!(error = %e, "Describe retry sweep failed");
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) if !succeeded => Err(e),
            _ => Ok(report),
        }
    }

    /// One admission and dispatch pass over a lane.
    pub async fn dispatch_lane(&self, lane: Lane) -> VigilResult<DispatchReport> {
        if let Some(blocked) = self.admission.check_ceilings().await? {
            debug!(%lane, limiter = blocked.limiter(), "Describe publishing blocked");
            return Ok(DispatchReport::default());
        }

        let candidates = self
            .store
            .list_created_jobs(self.config.max_concurrent_call, lane)
            .await
            .inspect_err(|e| {
                error!(%lane, error = %e, "Failed to fetch created describe jobs");
                SchedulerMetrics::dispatch_failed(reasons::FETCH_ERROR);
            })?;
        if candidates.is_empty() {
            return Ok(DispatchReport::default());
        }

        let admission = self.admission.select(candidates).await?;
        debug!(
            %lane,
            admitted = admission.admitted.len(),
            deferred = admission.deferred.len(),
            "Describe candidates admitted"
        );
        Ok(self.dispatcher.dispatch(admission.admitted).await)
    }

    /// Resets failed and timed out jobs within the retry ceiling.
    pub async fn retry_failed(&self) -> VigilResult<RetrySweep> {
        self.store.retry_failed_jobs(self.config.max_retries).await
    }

    /// Asset and spend discovery can be switched off independently.
    fn is_discovery_enabled(&self, resource_type: &ResourceTypeInfo) -> bool {
        if resource_type.cost {
            self.config.spend_discovery_enabled
        } else {
            self.config.asset_discovery_enabled
        }
    }

    /// Health checks a stale integration and rejects inactive ones.
    async fn ensure_healthy(&self, integration: Integration) -> VigilResult<Integration> {
        let integration =
            if integration.needs_health_check(Utc::now(), self.config.health_check_interval()) {
                debug!(integration_id = %integration.integration_id, "Running integration health check");
                self.integrations.health_check(&integration.integration_id).await?
            } else {
                integration
            };

        if integration.is_active() {
            Ok(integration)
        } else {
            Err(VigilError::InactiveIntegration(integration.integration_id))
        }
    }

    async fn create_if_due(
        &self,
        integration: &Integration,
        resource_type: &ResourceTypeInfo,
        request: &DescribeRequest,
    ) -> VigilResult<Option<DescribeJob>> {
        if self.last_job_gate(integration, resource_type, request).await?.is_some() {
            return Ok(None);
        }
        self.insert(integration, resource_type, request).await.map(Some)
    }

    /// Returns the last job when it makes a new scheduled one unnecessary,
    /// or `JobInProgress` when it is still in flight.
    async fn last_job_gate(
        &self,
        integration: &Integration,
        resource_type: &ResourceTypeInfo,
        request: &DescribeRequest,
    ) -> VigilResult<Option<DescribeJob>> {
        let Some(last) = self
            .store
            .get_last_describe_job(&integration.integration_id, &resource_type.name)
            .await?
        else {
            return Ok(None);
        };

        if last.status.is_in_flight() {
            return Err(VigilError::JobInProgress);
        }

        if request.trigger == TriggerType::Scheduled {
            let interval = if resource_type.cost {
                self.config.cost_discovery_interval()
            } else {
                self.config.describe_interval()
            };
            let interval = chrono::Duration::from_std(interval)
                .map_err(|e| VigilError::internal(format!("invalid describe interval: {e}")))?;
            if last.since_update(Utc::now()) < interval {
                return Ok(Some(last));
            }
        }

        Ok(None)
    }

    async fn insert(
        &self,
        integration: &Integration,
        resource_type: &ResourceTypeInfo,
        request: &DescribeRequest,
    ) -> VigilResult<DescribeJob> {
        let status = if request.remove_resources {
            DescribeJobStatus::RemovingResources
        } else {
            DescribeJobStatus::Created
        };

        let mut new = NewDescribeJob::scheduled(
            &integration.integration_id,
            &integration.provider_id,
            &integration.integration_type,
            &resource_type.name,
        )
        .with_trigger(request.trigger)
        .with_status(status);
        new.parent_id = request.parent_id;
        new.created_by.clone_from(&request.created_by);

        let job = self.store.create_describe_job(&new).await.map_err(|e| match e {
            VigilError::Conflict(_) => VigilError::JobInProgress,
            other => other,
        })?;

        SchedulerMetrics::job_created(request.trigger.as_str());
        info!(
            job_id = %job.id,
            integration_id = %job.integration_id,
            resource_type = %job.resource_type,
            trigger = %job.trigger_type,
            status = %job.status,
            "Describe job created"
        );
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Credential, IntegrationState, MockIntegrationClient};
    use std::collections::HashMap;
    use vigil_queue::{InMemoryQueue, StreamSpec};
    use vigil_repository::InMemoryJobStore;
    use vigil_resilience::RateLimiter;

    fn integration(id: &str, state: IntegrationState) -> Integration {
        Integration {
            integration_id: id.into(),
            provider_id: "123456789012".into(),
            name: id.into(),
            integration_type: "aws_cloud_account".into(),
            state,
            last_check: Some(Utc::now()),
            credential_id: format!("cred-{id}"),
            labels: HashMap::new(),
        }
    }

    fn catalog() -> Vec<ResourceTypeInfo> {
        vec![
            ResourceTypeInfo { name: "ec2".into(), cost: false },
            ResourceTypeInfo { name: "cost_explorer".into(), cost: true },
        ]
    }

    fn client(integrations: Vec<Integration>) -> MockIntegrationClient {
        let mut mock = MockIntegrationClient::new();
        let listed = integrations.clone();
        mock.expect_list_integrations().returning(move || Ok(listed.clone()));
        mock.expect_get_integration().returning(move |id| {
            integrations
                .iter()
                .find(|i| i.integration_id == id)
                .cloned()
                .ok_or_else(|| VigilError::not_found("integration", id))
        });
        mock.expect_resource_types().returning(|_| Ok(catalog()));
        mock.expect_get_credential().returning(|id| {
            Ok(Credential { id: id.to_string(), secret: "cipher".into() })
        });
        mock
    }

    fn scheduler(store: Arc<InMemoryJobStore>, client: MockIntegrationClient, config: SchedulerConfig) -> DescribeScheduler {
        let client: Arc<dyn IntegrationClient> = Arc::new(client);
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue,
            Arc::clone(&client),
            RateLimiter::per_second(1000),
            "delivery",
        );
        DescribeScheduler::new(store, client, dispatcher, config)
    }

    #[tokio::test]
    async fn test_create_phase_is_mutually_exclusive_per_pair() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(
            store.clone(),
            client(vec![integration("i-1", IntegrationState::Active)]),
            SchedulerConfig::default(),
        );

        let first = s.create_phase().await.unwrap();
        assert_eq!(first.created, 2);

        let second = s.create_phase().await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.in_progress, 2);

        let ec2: Vec<_> = store
            .describe_jobs()
            .into_iter()
            .filter(|j| j.integration_id == "i-1" && j.resource_type == "ec2")
            .collect();
        assert_eq!(ec2.len(), 1);
        assert_eq!(ec2[0].status, DescribeJobStatus::Created);
    }

    #[tokio::test]
    async fn test_inactive_integration_is_skipped() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(
            store.clone(),
            client(vec![integration("i-off", IntegrationState::Inactive)]),
            SchedulerConfig::default(),
        );

        let report = s.create_phase().await.unwrap();
        assert_eq!(report.skipped_integrations, 1);
        assert!(store.describe_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_stale_integration_is_health_checked_first() {
        let mut stale = integration("i-1", IntegrationState::Active);
        stale.last_check = Some(Utc::now() - chrono::Duration::hours(30));

        let mut mock = client(vec![stale]);
        mock.expect_health_check().times(1).returning(|id| {
            let mut checked = integration(id, IntegrationState::Inactive);
            checked.last_check = Some(Utc::now());
            Ok(checked)
        });

        let store = Arc::new(InMemoryJobStore::new());
        let report = scheduler(store.clone(), mock, SchedulerConfig::default())
            .create_phase()
            .await
            .unwrap();

        assert_eq!(report.skipped_integrations, 1);
        assert!(store.describe_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_spend_only_discovery() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = SchedulerConfig {
            asset_discovery_enabled: false,
            ..SchedulerConfig::default()
        };
        scheduler(store.clone(), client(vec![integration("i-1", IntegrationState::Active)]), config)
            .create_phase()
            .await
            .unwrap();

        let jobs = store.describe_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].resource_type, "cost_explorer");
    }

    #[tokio::test]
    async fn test_recent_terminal_job_suppresses_scheduled_but_not_manual() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(
            store.clone(),
            client(vec![integration("i-1", IntegrationState::Active)]),
            SchedulerConfig::default(),
        );

        let mut done = store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "123456789012", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        done.status = DescribeJobStatus::Succeeded;
        done.updated_at = Utc::now();
        store.insert_describe_job(done);

        let scheduled = s.describe("i-1", "ec2", DescribeRequest::scheduled()).await.unwrap();
        assert!(scheduled.is_none());

        let manual = s.describe("i-1", "EC2", DescribeRequest::manual("alice")).await.unwrap().unwrap();
        assert_eq!(manual.trigger_type, TriggerType::Manual);
        assert_eq!(manual.created_by, "alice");

        let again = s.describe("i-1", "ec2", DescribeRequest::manual("alice")).await;
        assert!(matches!(again, Err(VigilError::JobInProgress)));
    }

    #[tokio::test]
    async fn test_unknown_resource_type_is_rejected() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(store, client(vec![integration("i-1", IntegrationState::Active)]), SchedulerConfig::default());

        let result = s.describe("i-1", "not_a_type", DescribeRequest::manual("alice")).await;
        assert!(matches!(result, Err(VigilError::Validation(_))));
    }

    #[tokio::test]
    async fn test_remove_resources_creates_removal_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(store, client(vec![integration("i-1", IntegrationState::Active)]), SchedulerConfig::default());

        let job = s
            .describe("i-1", "ec2", DescribeRequest::manual("alice").removing_resources().with_parent(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, DescribeJobStatus::RemovingResources);
        assert_eq!(job.parent_id, Some(7));
    }

    #[tokio::test]
    async fn test_dispatch_respects_resource_type_ceiling() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = SchedulerConfig {
            resource_type_limits: HashMap::from([("ec2".to_string(), 25)]),
            ..SchedulerConfig::default()
        };

        for i in 0..20 {
            let mut job = store
                .create_describe_job(&NewDescribeJob::scheduled(format!("r-{i}"), "p", "aws_cloud_account", "ec2"))
                .await
                .unwrap();
            job.status = DescribeJobStatus::InProgress;
            store.insert_describe_job(job);
        }
        let integrations: Vec<_> = (0..30)
            .map(|i| integration(&format!("i-{i}"), IntegrationState::Active))
            .collect();
        for i in 0..30 {
            store
                .create_describe_job(&NewDescribeJob::scheduled(format!("i-{i}"), "p", "aws_cloud_account", "ec2"))
                .await
                .unwrap();
        }

        let s = scheduler(store.clone(), client(integrations), config);
        let report = s.dispatch_lane(Lane::Scheduled).await.unwrap();

        assert_eq!(report.published, 5);
        let jobs = store.describe_jobs();
        let queued = jobs.iter().filter(|j| j.status == DescribeJobStatus::Queued).count();
        let created = jobs.iter().filter(|j| j.status == DescribeJobStatus::Created).count();
        assert_eq!(queued, 5);
        assert_eq!(created, 25);
    }

    #[tokio::test]
    async fn test_queue_depth_ceiling_blocks_dispatch() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = SchedulerConfig {
            max_queued: 0,
            ..SchedulerConfig::default()
        };
        let mut job = store
            .create_describe_job(&NewDescribeJob::scheduled("i-0", "p", "aws_cloud_account", "s3"))
            .await
            .unwrap();
        job.status = DescribeJobStatus::Queued;
        job.queued_at = Some(Utc::now());
        store.insert_describe_job(job);
        store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();

        let s = scheduler(store, client(vec![integration("i-1", IntegrationState::Active)]), config);
        let report = s.dispatch_lane(Lane::Scheduled).await.unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_failed_manual_lane_still_dispatches_scheduled_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create_describe_job(
                &NewDescribeJob::scheduled("i-0", "p", "aws_cloud_account", "s3")
                    .with_trigger(TriggerType::Manual),
            )
            .await
            .unwrap();
        store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        store.fail_lane(Some(Lane::Manual));

        let integrations = vec![
            integration("i-0", IntegrationState::Active),
            integration("i-1", IntegrationState::Active),
        ];
        let s = scheduler(store.clone(), client(integrations), SchedulerConfig::default());
        let report = s.dispatch_phase().await.unwrap();

        assert_eq!(report.published, 1);
        let jobs = store.describe_jobs();
        let status_of = |id: &str| {
            jobs.iter()
                .find(|j| j.integration_id == id)
                .map(|j| j.status)
                .unwrap()
        };
        assert_eq!(status_of("i-0"), DescribeJobStatus::Created);
        assert_eq!(status_of("i-1"), DescribeJobStatus::Queued);
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts_dispatch() {
        let store = Arc::new(InMemoryJobStore::new());
        store.set_unavailable(true);
        let s = scheduler(store, client(vec![]), SchedulerConfig::default());
        assert!(s.dispatch_phase().await.is_err());
    }
}
