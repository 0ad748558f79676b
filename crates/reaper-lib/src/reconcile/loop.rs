//! Reconciliation loop
//!
//! Runs one cycle at a time on a fixed interval. Shutdown is checked before
//! each cycle and raced against the sleep between cycles; an in-flight
//! external call always completes or times out first.

use crate::age::{create_age_source, AgeSource};
use crate::exec::{CommandRunner, Kubectl};
use crate::health::{components, HealthRegistry};
use crate::models::{PodRecord, ReaperMode};
use crate::observability::{error_chain, ReaperMetrics, StructuredLogger};
use crate::policy::{decide, resolve_window};
use crate::report::fetch_allocations;
use crate::store::{ConfigStore, CycleContext, LoadOutcome};
use crate::terminator::Terminator;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Failed cycles in a row before the loop reports itself unhealthy
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Sleep between cycles (default: 3 seconds)
    pub interval: Duration,
    /// Which age source and termination action to use
    pub mode: ReaperMode,
    pub kubectl: Kubectl,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            mode: ReaperMode::default(),
            kubectl: Kubectl::default(),
        }
    }
}

/// What happened in one cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    /// Pods found in non-excluded namespaces
    pub pods: usize,
    /// Pods skipped because their age was unknown
    pub unknown_age: usize,
    pub terminated: usize,
    pub termination_failures: usize,
    /// Pods whose ledger entry could not be written
    pub ledger_write_failures: usize,
    /// Stale ledger entries dropped this cycle
    pub pruned: usize,
    /// False when the allocation report could not be fetched
    pub report_available: bool,
}

pub struct ReconcileLoop {
    runner: Arc<dyn CommandRunner>,
    store: ConfigStore,
    ages: Box<dyn AgeSource>,
    terminator: Terminator,
    config: ReconcileConfig,
    health: HealthRegistry,
    metrics: ReaperMetrics,
    logger: StructuredLogger,
    consecutive_failures: u32,
}

impl ReconcileLoop {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: ConfigStore,
        config: ReconcileConfig,
        health: HealthRegistry,
    ) -> Self {
        let ages = create_age_source(config.mode, runner.clone(), config.kubectl.clone());
        let terminator = Terminator::new(runner.clone(), config.kubectl.clone(), config.mode.into());

        Self {
            runner,
            store,
            ages,
            terminator,
            logger: StructuredLogger::new(config.mode.to_string()),
            config,
            health,
            metrics: ReaperMetrics::new(),
            consecutive_failures: 0,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run cycles until a shutdown message arrives or the sender is dropped
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            mode = %self.config.mode,
            "Starting reconciliation loop"
        );

        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            info!("Starting new check cycle");
            let start = Instant::now();

            match self.run_cycle().await {
                Ok(summary) => {
                    let elapsed = start.elapsed();
                    self.metrics.observe_cycle(elapsed.as_secs_f64());
                    self.logger.log_cycle(
                        summary.pods,
                        summary.terminated,
                        summary.termination_failures,
                        elapsed.as_millis(),
                    );
                    self.consecutive_failures = 0;
                    self.health.set_healthy(components::RECONCILE_LOOP).await;
                    self.health.record_cycle(Utc::now().timestamp()).await;
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    self.consecutive_failures += 1;
                    self.metrics.inc_cycle_errors();
                    error!(
                        error = %message,
                        consecutive_failures = self.consecutive_failures,
                        "Error in reconciliation cycle"
                    );

                    if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                        self.health
                            .set_unhealthy(components::RECONCILE_LOOP, message)
                            .await;
                    } else {
                        self.health
                            .set_degraded(components::RECONCILE_LOOP, message)
                            .await;
                    }
                }
            }

            info!(interval_secs = self.config.interval.as_secs_f64(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.logger.log_shutdown("shutdown requested");
    }

    /// Run a single cycle against a fresh copy of the document
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        let mut ctx = CycleContext::load(&self.store);
        self.report_document_health(ctx.outcome()).await;

        let mut summary = CycleSummary::default();

        let pods = match fetch_allocations(
            self.runner.as_ref(),
            &self.config.kubectl,
            &ctx.document.excluded_namespaces,
        )
        .await
        {
            Some(pods) => {
                summary.report_available = true;
                self.health.set_healthy(components::ALLOCATION_REPORT).await;
                pods
            }
            None => {
                self.health
                    .set_degraded(components::ALLOCATION_REPORT, "allocation report unavailable")
                    .await;
                Vec::new()
            }
        };

        summary.pods = pods.len();
        self.metrics.set_pods_observed(pods.len() as i64);

        match self.ages.prune(&mut ctx, Utc::now()) {
            Ok(pruned) => summary.pruned = pruned,
            Err(e) => warn!(error = %error_chain(&e), "Failed to persist pruned ledger"),
        }

        if pods.is_empty() {
            info!("No pods found in non-excluded namespaces");
            return Ok(summary);
        }

        // A pod that cannot be recorded must not keep the rest from being checked
        let mut first_error = None;
        info!(count = pods.len(), "Processing pods");
        for record in &pods {
            if let Err(e) = self.process_pod(&mut ctx, record, &mut summary).await {
                let message = format!("{e:#}");
                error!(error = %message, "Ledger write failed, continuing with remaining pods");
                summary.ledger_write_failures += 1;
                first_error.get_or_insert(e);
            }
        }

        if summary.termination_failures > 0 {
            self.health
                .set_degraded(
                    components::TERMINATOR,
                    format!("{} termination(s) failed", summary.termination_failures),
                )
                .await;
        } else {
            self.health.set_healthy(components::TERMINATOR).await;
        }

        if let Some(e) = first_error {
            self.health
                .set_degraded(components::DOCUMENT, "ledger could not be written")
                .await;
            return Err(e.context(format!(
                "{} of {} pods could not be recorded",
                summary.ledger_write_failures, summary.pods
            )));
        }

        Ok(summary)
    }

    /// Observe and evaluate one pod. The pod is evaluated even when
    /// recording it fails; the recording error is returned afterwards.
    async fn process_pod(
        &self,
        ctx: &mut CycleContext,
        record: &PodRecord,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let now = Utc::now();
        let recorded = self.ages.observe(ctx, record, now);

        self.evaluate_pod(ctx, record, summary, now).await;

        recorded.with_context(|| {
            format!(
                "failed to record running pod {}/{}",
                record.namespace, record.full_name
            )
        })
    }

    async fn evaluate_pod(
        &self,
        ctx: &mut CycleContext,
        record: &PodRecord,
        summary: &mut CycleSummary,
        now: DateTime<Utc>,
    ) {
        let window = resolve_window(&ctx.document, &record.namespace, &record.name).to_string();

        let Some(age_hours) = self.ages.resolve_age(ctx, record, now).await else {
            summary.unknown_age += 1;
            self.metrics.inc_unknown_age();
            self.logger.log_unknown_age(&record.name, &record.namespace);
            return;
        };

        let decision = decide(age_hours, &window);
        self.logger.log_pod_status(
            &record.name,
            &record.namespace,
            age_hours,
            &window,
            decision.remaining_hours,
        );

        if !decision.should_terminate {
            return;
        }

        info!(
            pod = %record.full_name,
            namespace = %record.namespace,
            termination_window = %window,
            "Pod exceeded termination window"
        );

        let success = self.terminator.terminate(ctx, record, Utc::now()).await;
        self.metrics.record_termination(success);
        self.logger
            .log_termination(&record.full_name, &record.namespace, &window, success);

        if success {
            summary.terminated += 1;
        } else {
            summary.termination_failures += 1;
        }
    }

    async fn report_document_health(&self, outcome: LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded | LoadOutcome::Created => {
                self.health.set_healthy(components::DOCUMENT).await
            }
            LoadOutcome::Fallback => {
                self.health
                    .set_degraded(components::DOCUMENT, "document unusable, running on defaults")
                    .await
            }
        }
    }
}

/// Builder for the reconciliation loop
pub struct ReconcileLoopBuilder {
    runner: Option<Arc<dyn CommandRunner>>,
    store: Option<ConfigStore>,
    health: Option<HealthRegistry>,
    age_source: Option<Box<dyn AgeSource>>,
    config: ReconcileConfig,
}

impl ReconcileLoopBuilder {
    pub fn new() -> Self {
        Self {
            runner: None,
            store: None,
            health: None,
            age_source: None,
            config: ReconcileConfig::default(),
        }
    }

    /// Replace the age source the mode would otherwise select
    pub fn age_source(mut self, ages: Box<dyn AgeSource>) -> Self {
        self.age_source = Some(ages);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn mode(mut self, mode: ReaperMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn kubectl(mut self, kubectl: Kubectl) -> Self {
        self.config.kubectl = kubectl;
        self
    }

    pub fn build(self) -> Result<ReconcileLoop> {
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("Command runner is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Document store is required"))?;

        if self.config.interval.is_zero() {
            anyhow::bail!("Cycle interval must be greater than zero");
        }

        let mut reconcile =
            ReconcileLoop::new(runner, store, self.config, self.health.unwrap_or_default());
        if let Some(ages) = self.age_source {
            reconcile.ages = ages;
        }
        Ok(reconcile)
    }
}

impl Default for ReconcileLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
