//! Deployment configuration
//!
//! Read once at startup from `REAPER_*` environment variables. Termination
//! policy is not here: it lives in the document and is reloaded every cycle.

use anyhow::{Context, Result};
use reaper_lib::ReaperMode;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between reconciliation cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Policy and ledger document
    #[serde(default = "default_document_path")]
    pub document_path: String,

    /// Log file written alongside stdout
    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub mode: ReaperMode,

    /// Orchestrator CLI binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_interval() -> u64 {
    3
}

fn default_document_path() -> String {
    "pod_config.json".to_string()
}

fn default_log_file() -> String {
    "gpu-reaper.log".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_api_port() -> u16 {
    8080
}

impl ReaperConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("REAPER").try_parsing(true))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Self = config::Config::builder()
            .add_source(source)
            .build()
            .context("Failed to read reaper configuration")?
            .try_deserialize()
            .context("Invalid reaper configuration")?;

        if config.interval_secs == 0 {
            anyhow::bail!("REAPER_INTERVAL_SECS must be greater than zero");
        }
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
