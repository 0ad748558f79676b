//! Reconciliation of GPU pods against their termination windows
//!
//! One cycle reloads the document, reads the allocation report, resolves each
//! pod's age and window, and stops pods that have run past their window.
//! Cycles repeat on a fixed interval until shutdown.

mod r#loop;

#[cfg(test)]
mod tests;

pub use r#loop::{
    CycleSummary, ReconcileConfig, ReconcileLoop, ReconcileLoopBuilder, UNHEALTHY_AFTER_FAILURES,
};
