//! Pod age resolution
//!
//! Two interchangeable sources measure how long a pod has been running:
//! - a persisted ledger of "last seen running" timestamps that survives restarts
//! - the pod's creation timestamp queried from the API, cached for a short TTL
//!
//! The deployment mode picks one at startup; they are never mixed per pod.

mod creation;
mod ledger;

pub use creation::{CreationTimeAge, CreationTimeCacheEntry, CREATION_TIME_TTL};
pub use ledger::{mark_stopped, prune_stopped, touch, LedgerAge, STOPPED_RETENTION};

use crate::exec::{CommandRunner, Kubectl};
use crate::models::{PodRecord, ReaperMode};
use crate::store::{CycleContext, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;

/// Source of a pod's elapsed running time
#[async_trait]
pub trait AgeSource: Send + Sync {
    /// Record that the pod was seen running in this cycle
    fn observe(
        &self,
        ctx: &mut CycleContext,
        record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Age in fractional hours, or `None` when it cannot be determined
    async fn resolve_age(
        &self,
        ctx: &CycleContext,
        record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Option<f64>;

    /// Drop state that is no longer needed; returns how many entries went
    fn prune(&self, _ctx: &mut CycleContext, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Create the age source for a deployment mode
pub fn create_age_source(
    mode: ReaperMode,
    runner: Arc<dyn CommandRunner>,
    kubectl: Kubectl,
) -> Box<dyn AgeSource> {
    match mode {
        ReaperMode::Ledger => {
            tracing::info!("Using persisted ledger for pod age");
            Box::new(LedgerAge)
        }
        ReaperMode::CreationTime => {
            tracing::info!("Using pod creation timestamps for pod age");
            Box::new(CreationTimeAge::new(runner, kubectl))
        }
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are read as local time.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Hours elapsed since `start`; clock skew never yields a negative age
pub fn hours_since(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now.signed_duration_since(start);
    (elapsed.num_milliseconds() as f64 / 3_600_000.0).max(0.0)
}

/// Timestamp format written to the ledger and to annotations
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
