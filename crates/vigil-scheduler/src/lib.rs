//! # Vigil Scheduler
//!
//! Decides which describe jobs and compliance runners to hand to remote
//! workers, when, and how many, and folds their results back into the job
//! store.
//!
//! ```text
//!                   ┌──────────────┐  create   ┌─────────────┐
//!  integrations ───▶│  Describe    │──────────▶│  Job Store  │◀─── result consumers
//!                   │  Scheduler   │           └──────┬──────┘          ▲
//!                   └──────┬───────┘                  │ Created         │
//!                          │ admission + dispatch     ▼                 │
//!                          └───────────────▶  describe-jobs[-manuals]   │
//!                                                     │                 │
//!                   ┌──────────────┐                  ▼                 │
//!  benchmarks ─────▶│  Runner      │──▶ compliance-runner-jobs ──▶ workers ──▶ *-results
//!                   │  Publisher   │
//!                   └──────────────┘
//! ```
//!
//! Only the elected leader runs the create, dispatch, publish and sweep
//! loops; the result consumers run on every instance.

pub mod admission;
pub mod clients;
pub mod consumers;
pub mod describe;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod leader;
pub mod metrics;
pub mod planner;
pub mod publisher;
pub mod reconcile;
pub mod runtime;
pub mod sweepers;

pub use admission::{admit, Admission, AdmissionController, Blocked};
pub use clients::{
    ComplianceClient, HttpComplianceClient, HttpIntegrationClient, HttpInventoryClient,
    HttpResultSink, IntegrationClient, InventoryClient, ResultSink, ServiceClient,
};
pub use consumers::{DescribeResultHandler, RunnerResultHandler};
pub use describe::{CreateReport, DescribeRequest, DescribeScheduler};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::ClientError;
pub use fanout::{fan_out_results, BenchmarkCache, ComplianceResult};
pub use leader::{LeaderElector, LeaderLock, Leadership, RedisLeaderLock, SingleInstanceLock};
pub use metrics::{register_metrics, SchedulerMetrics};
pub use planner::CompliancePlanner;
pub use publisher::{PublishReport, RunnerPublisher};
pub use reconcile::ComplianceReconciler;
pub use runtime::{RuntimeSettings, SchedulerRuntime, SchedulerServices};
pub use sweepers::{RetentionReport, Sweepers};
