//! Domain model for the scheduling core.

pub mod compliance;
pub mod describe_job;
pub mod status;
pub mod trigger;

pub use compliance::*;
pub use describe_job::*;
pub use status::*;
pub use trigger::*;
