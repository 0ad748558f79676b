//! Age from the pod's creation timestamp, with a short-lived cache

use super::{hours_since, parse_timestamp, AgeSource};
use crate::exec::{CommandRunner, Kubectl};
use crate::models::PodRecord;
use crate::store::{CycleContext, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a fetched creation timestamp is reused
pub const CREATION_TIME_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationTimeCacheEntry {
    pub created_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl CreationTimeCacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .map(|age| age < ttl)
            // fetched_at in the future: clock stepped back, refetch
            .unwrap_or(false)
    }
}

/// Creation-timestamp age source keyed by `(namespace, full_name)`
pub struct CreationTimeAge {
    runner: Arc<dyn CommandRunner>,
    kubectl: Kubectl,
    ttl: Duration,
    cache: DashMap<(String, String), CreationTimeCacheEntry>,
}

impl CreationTimeAge {
    pub fn new(runner: Arc<dyn CommandRunner>, kubectl: Kubectl) -> Self {
        Self {
            runner,
            kubectl,
            ttl: CREATION_TIME_TTL,
            cache: DashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Creation time of a pod, from cache when fresh
    pub async fn creation_time(&self, namespace: &str, full_name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let key = (namespace.to_string(), full_name.to_string());

        if let Some(entry) = self.cache.get(&key).map(|e| *e) {
            if entry.is_fresh(now, self.ttl) {
                debug!(pod = %full_name, namespace = %namespace, "Creation time cache hit");
                return Some(entry.created_at);
            }
        }

        let output = self
            .runner
            .execute(&self.kubectl.pod_creation_timestamp(namespace, full_name))
            .await;

        let raw = match output.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => raw.to_string(),
            _ => {
                warn!(pod = %full_name, namespace = %namespace, "No creation timestamp returned, skipping pod");
                return None;
            }
        };

        let Some(created_at) = parse_timestamp(&raw) else {
            warn!(pod = %full_name, namespace = %namespace, value = %raw, "Unparsable creation timestamp, skipping pod");
            return None;
        };

        self.cache.insert(
            key,
            CreationTimeCacheEntry {
                created_at,
                fetched_at: now,
            },
        );
        Some(created_at)
    }

    /// Drop entries that have outlived the TTL
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        self.cache.retain(|_, entry| entry.is_fresh(now, self.ttl));
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl AgeSource for CreationTimeAge {
    fn observe(
        &self,
        _ctx: &mut CycleContext,
        _record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.evict_expired(now);
        Ok(())
    }

    async fn resolve_age(
        &self,
        _ctx: &CycleContext,
        record: &PodRecord,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let created_at = self
            .creation_time(&record.namespace, &record.full_name, now)
            .await?;
        Some(hours_since(created_at, now))
    }
}
