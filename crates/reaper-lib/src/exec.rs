//! Bounded execution of orchestrator CLI commands
//!
//! Every call is capped by a timeout and a failure of any kind (spawn error,
//! non-zero exit, timeout) is reported as "no output" to the caller.

use crate::observability::{error_chain, ReaperMetrics};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Default bound for a single external call
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Annotation Kubeflow watches to stop a notebook
pub const STOPPED_ANNOTATION: &str = "kubeflow-resource-stopped";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

/// Invokes an external process and returns its stdout on success
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, argv: &[String]) -> Option<String>;
}

/// Runs commands as child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command, distinguishing the ways it can fail
    pub async fn run(&self, argv: &[String]) -> Result<String, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))?
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, argv: &[String]) -> Option<String> {
        debug!(command = %argv.join(" "), "Executing command");

        match self.run(argv).await {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                ReaperMetrics::new().inc_command_failures();
                error!(command = %argv.join(" "), error = %error_chain(&e), "Command failed");
                None
            }
        }
    }
}

/// Builds argument lists for the orchestrator CLI
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl Kubectl {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn argv<const N: usize>(&self, args: [&str; N]) -> Vec<String> {
        std::iter::once(self.binary.as_str())
            .chain(args)
            .map(str::to_string)
            .collect()
    }

    /// GPU allocation report
    pub fn inspect_gpushare(&self) -> Vec<String> {
        self.argv(["inspect", "gpushare", "-d"])
    }

    /// Creation timestamp of a single pod
    pub fn pod_creation_timestamp(&self, namespace: &str, pod: &str) -> Vec<String> {
        self.argv([
            "get",
            "pod",
            pod,
            "-n",
            namespace,
            "-o",
            "jsonpath={.metadata.creationTimestamp}",
        ])
    }

    /// Mark a notebook stopped, replacing any earlier annotation
    pub fn annotate_stopped(&self, namespace: &str, notebook: &str, timestamp: &str) -> Vec<String> {
        let annotation = format!("{STOPPED_ANNOTATION}={timestamp}");
        self.argv([
            "annotate",
            "notebook",
            notebook,
            annotation.as_str(),
            "-n",
            namespace,
            "--overwrite",
        ])
    }

    pub fn delete(&self, kind: &str, namespace: &str, name: &str) -> Vec<String> {
        self.argv(["delete", kind, "-n", namespace, name])
    }
}
