//! Reaper library for idle GPU notebook pods
//!
//! This crate provides the core functionality for:
//! - Parsing the GPU allocation report into pod records
//! - Resolving pod age from a persisted ledger or from creation timestamps
//! - Layered termination window policy and the terminate/keep decision
//! - Stopping notebooks by annotation or deletion
//! - The reconciliation loop tying these together
//! - Health checks and observability

pub mod age;
pub mod exec;
pub mod health;
pub mod models;
pub mod observability;
pub mod policy;
pub mod reconcile;
pub mod report;
pub mod store;
pub mod terminator;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ReaperMetrics, StructuredLogger};
pub use reconcile::{CycleSummary, ReconcileConfig, ReconcileLoop, ReconcileLoopBuilder};
pub use store::{ConfigStore, CycleContext, LoadOutcome};
