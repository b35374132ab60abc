//! # Vigil Repository
//!
//! The Job Store: the single source of truth for describe jobs, compliance
//! jobs and compliance runners.
//!
//! ```text
//! Scheduler / Publisher / Result consumers
//!   ↓  Arc<dyn DescribeJobStore>, Arc<dyn ComplianceStore>
//! PgDescribeJobStore, PgComplianceStore    (Postgres / SQLx)
//! InMemoryJobStore                          (tests, local runs)
//! ```
//!
//! Every mutation is a narrow, named, conditional update. The allowed
//! source states of an update come from the status transition tables in
//! `vigil-core`, so a row never takes a transition the tables reject and
//! two writers racing on the same row cannot both win.

pub mod memory;
pub mod pool;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryJobStore;
pub use pool::*;
pub use postgres::*;
pub use traits::*;
