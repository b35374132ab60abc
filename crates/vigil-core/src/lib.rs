//! # Vigil Core
//!
//! Core types, domain model, and error definitions shared by the Vigil
//! scheduling crates: describe jobs, compliance jobs and runners, their
//! state machines, and the unified [`VigilError`].

pub mod domain;
pub mod error;
pub mod id;
pub mod result;
pub mod telemetry;
pub mod traits;

pub use domain::*;
pub use error::*;
pub use id::*;
pub use result::*;
pub use traits::*;

// Re-export shaku for dependency injection
pub use shaku::Interface;
