//! The verdict shape every guardrail returns.
//!
//! A guardrail is a pure `(output, context) -> verdict` function, not a
//! content-mutating or human-pausing stage, so the outcome space is kept
//! to three states — `{pass, warn, fail}` — each carrying a
//! machine-readable category, a message, a detail bag, a `retry_allowed`
//! flag, and a three-level severity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Three-level severity: informational, a warning, or critical enough to
/// bypass warning aggregation and fail the task immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// The outcome of evaluating one guardrail against one task output: one
/// of `{pass, warn, fail}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// Machine-readable category, e.g. `"dangerous_pattern"`, `"scope_control"`.
    pub category: String,
    pub message: String,
    pub detail: HashMap<String, serde_json::Value>,
    /// Whether a `fail` verdict may be retried. Meaningless on `pass`/`warn`.
    pub retry_allowed: bool,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    #[must_use]
    pub fn pass(category: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Pass,
            category: category.into(),
            message: String::new(),
            detail: HashMap::new(),
            retry_allowed: false,
            severity: Severity::Info,
        }
    }

    #[must_use]
    pub fn warn(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Warn,
            category: category.into(),
            message: message.into(),
            detail: HashMap::new(),
            retry_allowed: true,
            severity: Severity::Warning,
        }
    }

    #[must_use]
    pub fn fail(
        category: impl Into<String>,
        message: impl Into<String>,
        retry_allowed: bool,
        severity: Severity,
    ) -> Self {
        Self {
            status: VerdictStatus::Fail,
            category: category.into(),
            message: message.into(),
            detail: HashMap::new(),
            retry_allowed,
            severity,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }

    #[must_use]
    pub fn is_warn(&self) -> bool {
        self.status == VerdictStatus::Warn
    }

    #[must_use]
    pub fn is_fail(&self) -> bool {
        self.status == VerdictStatus::Fail
    }

    /// `critical` always bypasses warn aggregation and fails the task
    /// immediately, regardless of `retry_allowed`.
    #[must_use]
    pub fn is_critical_fail(&self) -> bool {
        self.is_fail() && self.severity == Severity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn critical_fail_detection() {
        let v = Verdict::fail("security.dangerous_pattern", "eval() detected", false, Severity::Critical);
        assert!(v.is_critical_fail());
        let soft = Verdict::fail("shape", "bad json", true, Severity::Warning);
        assert!(!soft.is_critical_fail());
    }

    #[test]
    fn pass_round_trips_json() {
        let v = Verdict::pass("behavioral.role_adherence");
        let json = serde_json::to_string(&v).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert!(back.is_pass());
    }
}
