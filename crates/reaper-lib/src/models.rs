//! Core data models for the reaper

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Window applied when nothing in the document names one
pub const FALLBACK_TERMINATION_WINDOW: &str = "2h";

/// Namespaces excluded by a freshly created document
pub const DEFAULT_EXCLUDED_NAMESPACES: &[&str] = &["kube-system", "kubeflow"];

/// Deployment mode: which age source and termination action are paired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaperMode {
    /// Persisted "last seen running" ledger, notebooks stopped by annotation
    #[default]
    Ledger,
    /// Pod creation timestamps from the API, notebooks deleted
    CreationTime,
}

impl std::fmt::Display for ReaperMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaperMode::Ledger => write!(f, "ledger"),
            ReaperMode::CreationTime => write!(f, "creation-time"),
        }
    }
}

/// A pod identity taken from one row of the allocation report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    /// Base name of the owning notebook (numeric suffixes stripped)
    pub name: String,
    /// Allocated pod name as printed in the report
    pub full_name: String,
    pub namespace: String,
    pub node: Option<String>,
}

impl PodRecord {
    pub fn new(full_name: impl Into<String>, namespace: impl Into<String>, node: Option<String>) -> Self {
        let full_name = full_name.into();
        Self {
            name: crate::report::base_name(&full_name).to_string(),
            full_name,
            namespace: namespace.into(),
            node,
        }
    }

    /// The generated suffix stripped from `full_name`, including its leading dash.
    /// Empty when `name` is not a prefix of `full_name`.
    pub fn suffix(&self) -> &str {
        self.full_name.strip_prefix(self.name.as_str()).unwrap_or("")
    }
}

/// Ledger entry for one pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTimestamp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_running: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<String>,
}

/// Per-pod policy override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_window: Option<String>,
}

/// Per-namespace policy override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_window: Option<String>,
    #[serde(default)]
    pub pods: BTreeMap<String, PodPolicy>,
}

/// namespace -> pod -> timestamps
pub type PodLedger = BTreeMap<String, BTreeMap<String, PodTimestamp>>;

/// The policy/ledger document reloaded at the start of every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperDocument {
    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: BTreeSet<String>,

    #[serde(default = "default_termination_window")]
    pub default_termination_window: String,

    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespacePolicy>,

    #[serde(default)]
    pub pod_timestamps: PodLedger,

    /// Keys this version does not know about, kept so saves don't drop them
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_excluded_namespaces() -> BTreeSet<String> {
    DEFAULT_EXCLUDED_NAMESPACES
        .iter()
        .map(|ns| ns.to_string())
        .collect()
}

fn default_termination_window() -> String {
    FALLBACK_TERMINATION_WINDOW.to_string()
}

impl Default for ReaperDocument {
    fn default() -> Self {
        Self {
            excluded_namespaces: default_excluded_namespaces(),
            default_termination_window: default_termination_window(),
            namespaces: BTreeMap::new(),
            pod_timestamps: PodLedger::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl ReaperDocument {
    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.excluded_namespaces.contains(namespace)
    }

    /// Ledger entry for a pod, if any
    pub fn pod_timestamp(&self, namespace: &str, pod_name: &str) -> Option<&PodTimestamp> {
        self.pod_timestamps.get(namespace)?.get(pod_name)
    }
}
