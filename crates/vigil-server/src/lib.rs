//! # Vigil Server Library
//!
//! Dependency injection, runtime assembly, startup health checks and the
//! startup banner of the scheduler process.

pub mod app;
pub mod di;
pub mod health;
pub mod startup;
