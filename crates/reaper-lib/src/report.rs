//! GPU allocation report parsing
//!
//! Turns the text printed by `kubectl inspect gpushare -d` into pod records.
//! The report is a sequence of per-node blocks:
//!
//! ```text
//! NAME:       gpu-node-1
//! IPADDRESS:  10.0.0.12
//!
//! NAME              NAMESPACE  GPU0(Allocated)
//! jupyter-alice-0   team-a     8
//! jupyter-bob-0     team-b     4
//! Allocated :       12 (75%)
//! Total :           16
//! ```

use crate::exec::{CommandRunner, Kubectl};
use crate::models::PodRecord;
use std::collections::BTreeSet;
use tracing::{debug, info};

const NAMESPACE_HEADER: &str = "NAMESPACE";
const ALLOCATION_HEADER: &str = "GPU0(Allocated)";
const SECTION_TERMINATORS: &[&str] = &["IPADDRESS:", "Allocated :", "Total :", "Allocated/Total"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    SeekingNode,
    SeekingHeader,
    ReadingRows,
}

/// Strip the trailing run of `-<digits>` segments from an allocated pod name.
///
/// `jupyter-alice-0` and `jupyter-alice-7-3` both map to `jupyter-alice`;
/// a name with nothing but digit segments is returned unchanged.
pub fn base_name(full_name: &str) -> &str {
    let mut end = full_name.len();

    while let Some(dash) = full_name[..end].rfind('-') {
        let segment = &full_name[dash + 1..end];
        if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) || dash == 0 {
            break;
        }
        end = dash;
    }

    &full_name[..end]
}

/// Parse report text, dropping rows from excluded namespaces
pub fn parse_allocation_report(text: &str, excluded: &BTreeSet<String>) -> Vec<PodRecord> {
    let mut state = ParseState::SeekingNode;
    let mut node: Option<String> = None;
    let mut pods = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("---") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("NAME:") {
            node = rest.split_whitespace().next().map(str::to_string);
            state = ParseState::SeekingHeader;
            continue;
        }

        if line.contains(NAMESPACE_HEADER) && line.contains(ALLOCATION_HEADER) {
            state = ParseState::ReadingRows;
            continue;
        }

        if SECTION_TERMINATORS.iter().any(|t| line.starts_with(t)) {
            if state == ParseState::ReadingRows {
                state = ParseState::SeekingHeader;
            }
            continue;
        }

        if state != ParseState::ReadingRows {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(pod_name), Some(namespace)) = (fields.next(), fields.next()) else {
            continue;
        };

        if excluded.contains(namespace) {
            debug!(namespace = %namespace, pod = %pod_name, "Skipping pod in excluded namespace");
            continue;
        }

        let record = PodRecord::new(pod_name, namespace, node.clone());
        info!(
            pod = %record.full_name,
            namespace = %record.namespace,
            node = record.node.as_deref().unwrap_or("unknown"),
            "Found pod"
        );
        pods.push(record);
    }

    pods
}

/// Fetch the allocation report and parse it.
/// A failed fetch is an empty cycle, not an error.
pub async fn fetch_allocations(
    runner: &dyn CommandRunner,
    kubectl: &Kubectl,
    excluded: &BTreeSet<String>,
) -> Option<Vec<PodRecord>> {
    info!("Fetching GPU allocations");

    let output = runner.execute(&kubectl.inspect_gpushare()).await?;
    let pods = parse_allocation_report(&output, excluded);

    info!(count = pods.len(), "Total pods found");
    Some(pods)
}
