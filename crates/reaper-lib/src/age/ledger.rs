//! Age from the persisted "last seen running" ledger
//!
//! A pod moves `unknown -> running -> stopped -> running -> ...`. The running
//! timestamp is only refreshed on the edge into running, so age is measured
//! from the start of the current run rather than the first sighting.
//!
//! Entries are keyed by the allocated pod name, so replicas of one notebook
//! (`nb-0`, `nb-1`) keep separate run times.

use super::{format_timestamp, hours_since, parse_timestamp, AgeSource};
use crate::models::{PodRecord, PodTimestamp, ReaperDocument};
use crate::store::{CycleContext, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{error, info};

/// How long a stopped pod's entry is kept after it was stopped
pub const STOPPED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Record a running observation.
///
/// Returns `true` when the ledger changed: the pod had no entry, or its
/// entry carries `last_stopped` and it has now come back.
pub fn touch(document: &mut ReaperDocument, namespace: &str, pod_name: &str, now: DateTime<Utc>) -> bool {
    let pods = document
        .pod_timestamps
        .entry(namespace.to_string())
        .or_default();

    let restarted = match pods.get(pod_name) {
        None => true,
        Some(entry) => entry.last_stopped.is_some(),
    };

    if restarted {
        pods.insert(
            pod_name.to_string(),
            PodTimestamp {
                last_seen_running: Some(format_timestamp(now)),
                last_stopped: None,
            },
        );
    }

    restarted
}

/// Record that a termination action is being issued.
/// Only pods already in the ledger are marked.
pub fn mark_stopped(document: &mut ReaperDocument, namespace: &str, pod_name: &str, now: DateTime<Utc>) -> bool {
    match document
        .pod_timestamps
        .get_mut(namespace)
        .and_then(|pods| pods.get_mut(pod_name))
    {
        Some(entry) => {
            entry.last_stopped = Some(format_timestamp(now));
            true
        }
        None => false,
    }
}

/// Remove entries stopped longer ago than `retention`, and namespaces left empty.
///
/// A stopped pod that returns gets a fresh entry anyway, so dropping the old
/// one loses nothing. Entries with an unparsable `last_stopped` are kept.
pub fn prune_stopped(
    document: &mut ReaperDocument,
    now: DateTime<Utc>,
    retention: Duration,
) -> usize {
    let retention_hours = retention.as_secs_f64() / 3600.0;
    let mut removed = 0;

    for pods in document.pod_timestamps.values_mut() {
        let before = pods.len();
        pods.retain(|_, entry| {
            let stopped = entry.last_stopped.as_deref().and_then(parse_timestamp);
            !matches!(stopped, Some(at) if hours_since(at, now) > retention_hours)
        });
        removed += before - pods.len();
    }
    document.pod_timestamps.retain(|_, pods| !pods.is_empty());

    removed
}

/// Ledger-backed age source
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerAge;

#[async_trait]
impl AgeSource for LedgerAge {
    fn observe(
        &self,
        ctx: &mut CycleContext,
        record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if touch(&mut ctx.document, &record.namespace, &record.full_name, now) {
            info!(
                pod = %record.full_name,
                namespace = %record.namespace,
                "Updated start time for pod"
            );
            ctx.persist()?;
        }
        Ok(())
    }

    async fn resolve_age(
        &self,
        ctx: &CycleContext,
        record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let started = ctx
            .document
            .pod_timestamp(&record.namespace, &record.full_name)?
            .last_seen_running
            .as_deref()?;

        match parse_timestamp(started) {
            Some(start) => Some(hours_since(start, now)),
            None => {
                error!(
                    pod = %record.full_name,
                    namespace = %record.namespace,
                    value = %started,
                    "Error calculating pod age: unparsable last_seen_running"
                );
                None
            }
        }
    }

    fn prune(&self, ctx: &mut CycleContext, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let removed = prune_stopped(&mut ctx.document, now, STOPPED_RETENTION);
        if removed > 0 {
            info!(removed = removed, "Pruned ledger entries of long-stopped pods");
            ctx.persist()?;
        }
        Ok(removed)
    }
}
