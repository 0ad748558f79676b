//! Termination window resolution and the terminate/keep decision

use crate::models::{ReaperDocument, FALLBACK_TERMINATION_WINDOW};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("unrecognised termination window {0:?}, expected <number><h|d>")]
    Format(String),

    #[error("termination window {0:?} is not positive")]
    NotPositive(String),
}

/// Outcome of comparing a pod's age with its window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub should_terminate: bool,
    /// Positive: hours left. Negative: hours overdue.
    pub remaining_hours: f64,
}

impl Decision {
    const KEEP: Decision = Decision {
        should_terminate: false,
        remaining_hours: 0.0,
    };
}

fn window_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d*\.?\d+)([hd])").expect("window pattern is valid"))
}

/// Pick the window for a pod: pod override, namespace override, document default, `2h`.
pub fn resolve_window<'a>(document: &'a ReaperDocument, namespace: &str, pod_name: &str) -> &'a str {
    fn non_empty(window: Option<&String>) -> Option<&str> {
        window.map(|w| w.trim()).filter(|w| !w.is_empty())
    }

    let namespace_policy = document.namespaces.get(namespace);

    namespace_policy
        .and_then(|ns| ns.pods.get(pod_name))
        .and_then(|pod| non_empty(pod.termination_window.as_ref()))
        .or_else(|| namespace_policy.and_then(|ns| non_empty(ns.termination_window.as_ref())))
        .or_else(|| non_empty(Some(&document.default_termination_window)))
        .unwrap_or(FALLBACK_TERMINATION_WINDOW)
}

/// Parse a window such as `2h`, `1.5h` or `5d` into hours
pub fn parse_window(window: &str) -> Result<f64, WindowError> {
    let captures = window_pattern()
        .captures(window.trim())
        .ok_or_else(|| WindowError::Format(window.to_string()))?;

    let value: f64 = captures[1]
        .parse()
        .map_err(|_| WindowError::Format(window.to_string()))?;

    let hours = match &captures[2] {
        "d" => value * 24.0,
        _ => value,
    };

    if hours <= 0.0 {
        return Err(WindowError::NotPositive(window.to_string()));
    }
    Ok(hours)
}

/// Terminate only once age is strictly past the limit.
/// A window that does not parse never terminates.
pub fn decide(age_hours: f64, window: &str) -> Decision {
    match parse_window(window) {
        Ok(limit_hours) => Decision {
            should_terminate: age_hours > limit_hours,
            remaining_hours: limit_hours - age_hours,
        },
        Err(e) => {
            tracing::warn!(window = %window, error = %e, "Ignoring invalid termination window");
            Decision::KEEP
        }
    }
}
