//! Cycle-level tests for the reconciliation loop
//!
//! These drive whole cycles against a scripted command runner and a
//! document in a temporary directory.

#[cfg(test)]
mod cycle_tests {
    use crate::age::{parse_timestamp, touch, AgeSource, LedgerAge};
    use crate::exec::mock::ScriptedRunner;
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{PodRecord, ReaperMode};
    use crate::reconcile::{ReconcileLoop, ReconcileLoopBuilder, UNHEALTHY_AFTER_FAILURES};
    use crate::store::{ConfigStore, CycleContext, StoreError};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    const INSPECT: &[&str] = &["kubectl", "inspect", "gpushare"];
    const ANNOTATE: &[&str] = &["kubectl", "annotate", "notebook"];
    const GET_POD: &[&str] = &["kubectl", "get", "pod"];
    const DELETE_NOTEBOOK: &[&str] = &["kubectl", "delete", "notebook"];

    const REPORT: &str = "\
NAME:       gpu-node-1
IPADDRESS:  10.0.0.12

NAME               NAMESPACE    GPU0(Allocated)  GPU Memory(GiB)
jupyter-alice-0    team-a       8                8
jupyter-bob-0      team-b       4                4
dcgm-exporter-1    kube-system  1                1
Allocated :        13 (81%)
Total :            16
";

    /// Ledger whose writes always fail, as on a read-only document mount
    struct ReadOnlyLedger;

    #[async_trait]
    impl AgeSource for ReadOnlyLedger {
        fn observe(
            &self,
            ctx: &mut CycleContext,
            record: &PodRecord,
            now: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if touch(&mut ctx.document, &record.namespace, &record.full_name, now) {
                return Err(StoreError::Write {
                    path: PathBuf::from("pod_config.json"),
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "read-only file system",
                    ),
                });
            }
            Ok(())
        }

        async fn resolve_age(
            &self,
            ctx: &CycleContext,
            record: &PodRecord,
            now: DateTime<Utc>,
        ) -> Option<f64> {
            LedgerAge.resolve_age(ctx, record, now).await
        }
    }

    fn cycle_errors_total() -> f64 {
        prometheus::gather()
            .iter()
            .find(|family| family.get_name() == "gpu_reaper_cycle_errors_total")
            .map(|family| family.get_metric()[0].get_counter().get_value())
            .unwrap_or(0.0)
    }

    fn hours_ago(hours: i64) -> String {
        (Utc::now() - ChronoDuration::hours(hours)).to_rfc3339()
    }

    fn write_document(dir: &TempDir, document: serde_json::Value) -> PathBuf {
        let path = dir.path().join("pod_config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
        path
    }

    fn build(runner: &Arc<ScriptedRunner>, path: &PathBuf, mode: ReaperMode, health: HealthRegistry) -> ReconcileLoop {
        ReconcileLoopBuilder::new()
            .runner(runner.clone())
            .store(ConfigStore::new(path))
            .mode(mode)
            .health(health)
            .interval(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    fn ledger_entry(path: &PathBuf, namespace: &str, pod: &str) -> Option<crate::models::PodTimestamp> {
        let ctx = CycleContext::load(&ConfigStore::new(path));
        ctx.document.pod_timestamp(namespace, pod).cloned()
    }

    #[tokio::test]
    async fn test_overdue_pod_is_annotated_and_age_resets_after_restart() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "excluded_namespaces": ["kube-system"],
                "default_termination_window": "2h",
                "pod_timestamps": {
                    "team-a": { "jupyter-alice-0": { "last_seen_running": hours_ago(10) } },
                    "team-b": { "jupyter-bob-0": { "last_seen_running": hours_ago(1) } }
                }
            }),
        );

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        runner.respond(ANNOTATE, Some("annotated"));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.pods, 2);
        assert_eq!(summary.terminated, 1);
        assert_eq!(runner.calls_starting_with(ANNOTATE), 1);

        let annotate = runner
            .calls()
            .into_iter()
            .find(|argv| argv[1] == "annotate")
            .unwrap();
        assert_eq!(annotate[3], "jupyter-alice");
        assert_eq!(annotate[6], "team-a");

        let stopped = ledger_entry(&path, "team-a", "jupyter-alice-0").unwrap();
        assert!(stopped.last_stopped.is_some());

        // The notebook comes back: the next sighting starts a fresh run
        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.terminated, 0);
        assert_eq!(runner.calls_starting_with(ANNOTATE), 1);

        let restarted = ledger_entry(&path, "team-a", "jupyter-alice-0").unwrap();
        assert!(restarted.last_stopped.is_none());
        let started = parse_timestamp(restarted.last_seen_running.as_deref().unwrap()).unwrap();
        assert!(Utc::now() - started < ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn test_first_sighting_is_recorded_and_not_terminated() {
        let dir = TempDir::new().unwrap();
        let path = write_document(&dir, json!({ "excluded_namespaces": ["kube-system"] }));

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.terminated, 0);
        assert_eq!(runner.calls_starting_with(ANNOTATE), 0);

        let first = ledger_entry(&path, "team-a", "jupyter-alice-0").unwrap();
        assert!(first.last_seen_running.is_some());

        reconcile.run_cycle().await.unwrap();
        assert_eq!(ledger_entry(&path, "team-a", "jupyter-alice-0").unwrap(), first);
    }

    #[tokio::test]
    async fn test_excluded_namespaces_are_never_tracked() {
        let dir = TempDir::new().unwrap();
        let path = write_document(&dir, json!({ "excluded_namespaces": ["kube-system", "team-b"] }));

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.pods, 1);

        let ctx = CycleContext::load(&ConfigStore::new(&path));
        assert!(!ctx.document.pod_timestamps.contains_key("team-b"));
        assert!(!ctx.document.pod_timestamps.contains_key("kube-system"));
    }

    #[tokio::test]
    async fn test_namespace_policy_overrides_default() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "excluded_namespaces": ["kube-system"],
                "default_termination_window": "1h",
                "namespaces": {
                    "team-a": { "termination_window": "1d", "pods": {} },
                    "team-b": { "pods": { "jupyter-bob": { "termination_window": "5h" } } }
                },
                "pod_timestamps": {
                    "team-a": { "jupyter-alice-0": { "last_seen_running": hours_ago(10) } },
                    "team-b": { "jupyter-bob-0": { "last_seen_running": hours_ago(6) } }
                }
            }),
        );

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        runner.respond(ANNOTATE, Some("annotated"));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();

        // alice: 10h < 1d, kept. bob: 6h > 5h pod override, stopped.
        assert_eq!(summary.terminated, 1);
        let annotate = runner
            .calls()
            .into_iter()
            .find(|argv| argv[1] == "annotate")
            .unwrap();
        assert_eq!(annotate[3], "jupyter-bob");
    }

    #[tokio::test]
    async fn test_invalid_window_never_terminates() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "default_termination_window": "forever",
                "pod_timestamps": {
                    "team-a": { "jupyter-alice-0": { "last_seen_running": hours_ago(1000) } }
                }
            }),
        );

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.terminated, 0);
        assert_eq!(runner.calls_starting_with(ANNOTATE), 0);
    }

    #[tokio::test]
    async fn test_malformed_document_does_not_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pod_config.json");
        std::fs::write(&path, "{\"namespaces\": [oops").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let health = HealthRegistry::with_components().await;
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, health.clone());

        let summary = reconcile.run_cycle().await.unwrap();

        // Defaults exclude kube-system; both notebooks are seen but too young
        assert_eq!(summary.pods, 2);
        assert_eq!(summary.terminated, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"namespaces\": [oops");

        let status = health.health().await.components[components::DOCUMENT].status;
        assert_eq!(status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_report_failure_is_an_empty_cycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pod_config.json");

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, None);
        let health = HealthRegistry::with_components().await;
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, health.clone());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.pods, 0);
        assert!(!summary.report_available);

        let status = health.health().await.components[components::ALLOCATION_REPORT].status;
        assert_eq!(status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_unknown_age_skips_pod() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "default_termination_window": "1h",
                "pod_timestamps": {
                    "team-a": { "jupyter-alice-0": { "last_seen_running": "not a time" } }
                }
            }),
        );

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let mut reconcile = build(&runner, &path, ReaperMode::Ledger, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.unknown_age, 1);
        assert_eq!(summary.terminated, 0);
    }

    #[tokio::test]
    async fn test_creation_time_mode_deletes_and_caches() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "excluded_namespaces": ["kube-system", "team-b"],
                "namespaces": {
                    "team-a": { "pods": { "jupyter-alice": { "termination_window": "1h" } } }
                }
            }),
        );
        let created = (Utc::now() - ChronoDuration::hours(5)).to_rfc3339();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        runner.respond(GET_POD, Some(created.as_str()));
        runner.respond(DELETE_NOTEBOOK, Some("deleted"));
        let mut reconcile = build(&runner, &path, ReaperMode::CreationTime, HealthRegistry::new());

        let summary = reconcile.run_cycle().await.unwrap();
        assert_eq!(summary.terminated, 1);
        assert_eq!(runner.calls_starting_with(DELETE_NOTEBOOK), 1);

        reconcile.run_cycle().await.unwrap();
        assert_eq!(runner.calls_starting_with(GET_POD), 1);

        // No ledger in this mode
        let ctx = CycleContext::load(&ConfigStore::new(&path));
        assert!(ctx.document.pod_timestamps.is_empty());
        assert_eq!(runner.calls_starting_with(ANNOTATE), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pod_config.json");

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let health = HealthRegistry::with_components().await;
        let reconcile = build(&runner, &path, ReaperMode::Ledger, health.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile.run(shutdown_rx));

        // Wait for the first cycle, then interrupt the hour-long sleep
        for _ in 0..100 {
            if health.health().await.last_cycle_timestamp.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(runner.calls_starting_with(INSPECT), 1);
        assert!(health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_unwritable_ledger_does_not_block_later_pods() {
        let dir = TempDir::new().unwrap();
        let path = write_document(
            &dir,
            json!({
                "excluded_namespaces": ["kube-system"],
                "default_termination_window": "2h",
                "pod_timestamps": {
                    "team-b": { "jupyter-bob-0": { "last_seen_running": hours_ago(10) } }
                }
            }),
        );

        // jupyter-alice-0 is new and listed first; recording it fails
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        runner.respond(ANNOTATE, Some("annotated"));
        let health = HealthRegistry::with_components().await;
        let mut reconcile = ReconcileLoopBuilder::new()
            .runner(runner.clone())
            .store(ConfigStore::new(&path))
            .age_source(Box::new(ReadOnlyLedger))
            .health(health.clone())
            .interval(Duration::from_secs(3600))
            .build()
            .unwrap();

        let err = reconcile.run_cycle().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("1 of 2 pods could not be recorded"));
        assert!(message.contains("team-a/jupyter-alice-0"));

        assert_eq!(runner.calls_starting_with(ANNOTATE), 1);
        let annotate = runner
            .calls()
            .into_iter()
            .find(|argv| argv[1] == "annotate")
            .unwrap();
        assert_eq!(annotate[3], "jupyter-bob");

        let status = health.health().await.components[components::DOCUMENT].status;
        assert_eq!(status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_failing_cycles_keep_running_and_turn_unhealthy() {
        let dir = TempDir::new().unwrap();
        let path = write_document(&dir, json!({ "excluded_namespaces": ["kube-system"] }));

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(INSPECT, Some(REPORT));
        let health = HealthRegistry::with_components().await;
        let errors_before = cycle_errors_total();

        let reconcile = ReconcileLoopBuilder::new()
            .runner(runner.clone())
            .store(ConfigStore::new(&path))
            .age_source(Box::new(ReadOnlyLedger))
            .health(health.clone())
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile.run(shutdown_rx));

        let mut loop_status = ComponentStatus::Healthy;
        for _ in 0..500 {
            loop_status = health.health().await.components[components::RECONCILE_LOOP].status;
            if loop_status == ComponentStatus::Unhealthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(loop_status, ComponentStatus::Unhealthy);
        assert!(runner.calls_starting_with(INSPECT) >= UNHEALTHY_AFTER_FAILURES as usize);
        assert!(cycle_errors_total() - errors_before >= f64::from(UNHEALTHY_AFTER_FAILURES));

        // No cycle completed, so the reaper never reported ready
        let readiness = health.readiness().await;
        assert!(!readiness.ready);
    }

    #[tokio::test]
    async fn test_builder_requires_runner_and_store() {
        let runner = Arc::new(ScriptedRunner::new());

        assert!(ReconcileLoopBuilder::new().runner(runner.clone()).build().is_err());
        assert!(ReconcileLoopBuilder::new()
            .store(ConfigStore::new("unused.json"))
            .build()
            .is_err());
        assert!(ReconcileLoopBuilder::new()
            .runner(runner)
            .store(ConfigStore::new("unused.json"))
            .interval(Duration::ZERO)
            .build()
            .is_err());
    }
}
