//! Stopping notebooks that outlived their window

use crate::age::{format_timestamp, mark_stopped};
use crate::exec::{CommandRunner, Kubectl};
use crate::models::{PodRecord, ReaperMode};
use crate::observability::error_chain;
use crate::report::base_name;
use crate::store::CycleContext;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How a notebook is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Annotate the notebook so its controller scales it to zero
    Annotate,
    /// Delete the notebook, falling back to the bare pod
    Delete,
}

impl From<ReaperMode> for TerminationMode {
    fn from(mode: ReaperMode) -> Self {
        match mode {
            ReaperMode::Ledger => TerminationMode::Annotate,
            ReaperMode::CreationTime => TerminationMode::Delete,
        }
    }
}

/// Issues termination actions against the cluster
pub struct Terminator {
    runner: Arc<dyn CommandRunner>,
    kubectl: Kubectl,
    mode: TerminationMode,
}

impl Terminator {
    pub fn new(runner: Arc<dyn CommandRunner>, kubectl: Kubectl, mode: TerminationMode) -> Self {
        Self {
            runner,
            kubectl,
            mode,
        }
    }

    pub fn mode(&self) -> TerminationMode {
        self.mode
    }

    /// Stop a notebook. Failures are logged and reported as `false`.
    pub async fn terminate(&self, ctx: &mut CycleContext, record: &PodRecord, now: DateTime<Utc>) -> bool {
        let notebook = base_name(&record.name);

        info!(
            original_name = %record.full_name,
            base_name = %notebook,
            namespace = %record.namespace,
            mode = ?self.mode,
            "Terminating notebook"
        );

        match self.mode {
            TerminationMode::Annotate => self.annotate(ctx, record, notebook, now).await,
            TerminationMode::Delete => self.delete(record, notebook).await,
        }
    }

    async fn annotate(
        &self,
        ctx: &mut CycleContext,
        record: &PodRecord,
        notebook: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let timestamp = format_timestamp(now);

        // Ledger first: an ambiguous annotate must not retrigger next cycle
        if mark_stopped(&mut ctx.document, &record.namespace, &record.full_name, now) {
            if let Err(e) = ctx.persist() {
                error!(error = %error_chain(&e), pod = %record.full_name, "Failed to persist stop time");
            }
        }

        let argv = self
            .kubectl
            .annotate_stopped(&record.namespace, notebook, &timestamp);

        if self.runner.execute(&argv).await.is_some() {
            info!(notebook = %notebook, namespace = %record.namespace, "Successfully stopped notebook");
            true
        } else {
            error!(notebook = %notebook, namespace = %record.namespace, "Failed to stop notebook");
            false
        }
    }

    async fn delete(&self, record: &PodRecord, notebook: &str) -> bool {
        let argv = self.kubectl.delete("notebook", &record.namespace, notebook);
        if self.runner.execute(&argv).await.is_some() {
            info!(notebook = %notebook, namespace = %record.namespace, "Deleted notebook");
            return true;
        }

        warn!(
            notebook = %notebook,
            pod = %record.full_name,
            namespace = %record.namespace,
            "Notebook delete failed, deleting pod directly"
        );

        let argv = self.kubectl.delete("pod", &record.namespace, &record.full_name);
        if self.runner.execute(&argv).await.is_some() {
            info!(pod = %record.full_name, namespace = %record.namespace, "Deleted pod");
            true
        } else {
            error!(pod = %record.full_name, namespace = %record.namespace, "Failed to delete pod");
            false
        }
    }
}
