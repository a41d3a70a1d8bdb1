//! `ProjectState`: the single authoritative record for one run.
//!
//! The Flow exclusively owns this type; Workers and Guardrails only ever
//! see read-only snapshots (see [`ProjectStateSnapshot`]) plus whatever
//! typed delta their own contract returns. Every mutator on `ProjectState`
//! enforces one or more of its invariants (legal phase transitions, retry
//! budgets, unique and workspace-rooted file paths, monotonic transition
//! timestamps) and returns [`InvariantError`] rather than panicking, so a
//! caller that attempts an illegal mutation gets a recoverable `Result`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::phase::{Phase, Transition};

/// One recorded error: the phase it occurred in, a kind tag, a message,
/// when it happened, and whether it was recoverable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: Phase,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

/// A single MoSCoW-prioritized user story.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserStory {
    pub summary: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: MoscowPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoscowPriority {
    Must,
    Should,
    Could,
    Wont,
}

/// Set by Planning's requirements task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Requirements {
    pub project_name: String,
    pub description: String,
    pub target_users: Vec<String>,
    /// Invariant: the Behavioral guardrail family fails this task if this
    /// has fewer than 3 entries.
    pub user_stories: Vec<UserStory>,
    pub non_functional_requirements: Vec<String>,
    pub assumptions: Vec<String>,
    pub constraints: Vec<String>,
}

/// A named architectural component.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub responsibility: String,
}

/// A single architecture decision record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub title: String,
    pub context: String,
    pub decision: String,
    pub consequences: String,
}

/// Set by Planning's architecture task (depends on `Requirements`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Architecture {
    pub system_overview: String,
    pub components: Vec<Component>,
    /// key -> (chosen value, justification)
    pub tech_choices: BTreeMap<String, TechChoice>,
    pub interfaces: Vec<String>,
    pub data_entities: Vec<String>,
    pub deployment_topology: String,
    pub decision_records: Vec<DecisionRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TechChoice {
    pub value: String,
    pub justification: String,
}

impl Architecture {
    /// Whether a frontend component is declared. The Development crew
    /// skips frontend tasks without error when this is `false`.
    #[must_use]
    pub fn declares_frontend(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case("frontend"))
    }
}

/// The kind of a generated file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Source,
    Test,
    Config,
    Doc,
}

/// `(path, content, language, kind, deps)` appended by Development.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeFile {
    /// Relative path under the declared workspace root. Uniqueness and
    /// path-security (invariant 3) are checked at append time by
    /// [`ProjectState::append_file`], not here.
    pub path: String,
    pub content: String,
    pub language: String,
    pub kind: FileKind,
    pub deps: Vec<String>,
}

/// A single failing or passing test case observed by the TestRunner tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    pub trace: Option<String>,
}

/// Set by Testing, via its bound `TestRunner` tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRun {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub coverage: f64,
    pub cases: Vec<TestCase>,
}

impl TestRun {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total > 0
    }

    #[must_use]
    pub fn failing_cases(&self) -> Vec<&TestCase> {
        self.cases.iter().filter(|c| !c.passed).collect()
    }
}

/// Set by Deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentBundle {
    pub infrastructure_design: String,
    pub packaging_manifest: String,
    pub documentation: String,
}

/// The single authoritative record for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: Uuid,
    pub description: String,
    pub phase: Phase,
    /// The phase `AwaitingHuman` was entered from, if currently suspended.
    pub suspended_from: Option<Phase>,
    pub requirements: Option<Requirements>,
    pub architecture: Option<Architecture>,
    pub files: Vec<CodeFile>,
    pub test_results: Option<TestRun>,
    pub deployment: Option<DeploymentBundle>,
    pub transitions: Vec<Transition>,
    pub errors: Vec<ErrorEntry>,
    pub retries: FxHashMap<Phase, u32>,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: FxHashMap<String, Value>,
    /// Fields from a future snapshot schema this build doesn't know about.
    /// Preserved and round-tripped rather than dropped, so a snapshot
    /// written by a newer build stays forward-compatible. Never written to
    /// by this build.
    #[serde(flatten, default)]
    pub unknown_fields: serde_json::Map<String, Value>,
}

/// Errors returned by `ProjectState`'s invariant-checked mutators.
/// These are distinct from [`crate::errors::OrchestratorError`] because a
/// caller may want to recover locally (e.g. pick a different path) before
/// the failure ever becomes a phase-level `InvariantViolation`.
#[derive(Debug, thiserror::Error)]
pub enum InvariantError {
    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
    #[error("retries[{phase}] would exceed max_retries ({max})")]
    RetryBudgetExceeded { phase: Phase, max: u32 },
    #[error("duplicate file path: {0}")]
    DuplicateFilePath(String),
    #[error("file path is not relative or escapes the workspace root: {0}")]
    UnsafeFilePath(String),
    #[error("transition timestamp {new} is not >= previous timestamp {previous}")]
    OutOfOrderTransition {
        previous: DateTime<Utc>,
        new: DateTime<Utc>,
    },
}

impl ProjectState {
    /// Construct a fresh `ProjectState` at `Phase::Intake`.
    #[must_use]
    pub fn new(description: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            project_id: Uuid::new_v4(),
            description: description.into(),
            phase: Phase::Intake,
            suspended_from: None,
            requirements: None,
            architecture: None,
            files: Vec::new(),
            test_results: None,
            deployment: None,
            transitions: Vec::new(),
            errors: Vec::new(),
            retries: FxHashMap::default(),
            max_retries,
            started_at: now,
            completed_at: None,
            metadata: FxHashMap::default(),
            unknown_fields: serde_json::Map::new(),
        }
    }

    /// Apply a phase transition, enforcing invariants 1, 4, and 5.
    pub fn transition(&mut self, to: Phase, reason: impl Into<String>) -> Result<(), InvariantError> {
        if !self.phase.allows_transition(to, self.suspended_from) {
            return Err(InvariantError::IllegalTransition {
                from: self.phase,
                to,
            });
        }
        let now = Utc::now();
        if let Some(last) = self.transitions.last() {
            if now < last.timestamp {
                return Err(InvariantError::OutOfOrderTransition {
                    previous: last.timestamp,
                    new: now,
                });
            }
        }
        self.transitions.push(Transition {
            from_phase: self.phase,
            to_phase: to,
            timestamp: now,
            reason: reason.into(),
        });

        if to == Phase::AwaitingHuman {
            self.suspended_from = Some(self.phase);
        } else if self.phase == Phase::AwaitingHuman {
            self.suspended_from = None;
        }

        self.phase = to;
        // Invariant 4: completed_at is set iff phase in {COMPLETE, ERROR}.
        self.completed_at = if to.is_terminal() { Some(now) } else { None };
        Ok(())
    }

    /// Record an error event (invariant-free; always legal to append).
    pub fn record_error(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        recoverable: bool,
    ) {
        self.errors.push(ErrorEntry {
            phase: self.phase,
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
            recoverable,
        });
    }

    /// Increment the retry counter for the current phase, enforcing
    /// invariant 2 (`retries[p] <= max_retries`).
    pub fn bump_retry(&mut self, phase: Phase) -> Result<u32, InvariantError> {
        let next = self.retries.get(&phase).copied().unwrap_or(0) + 1;
        if next > self.max_retries {
            return Err(InvariantError::RetryBudgetExceeded {
                phase,
                max: self.max_retries,
            });
        }
        self.retries.insert(phase, next);
        Ok(next)
    }

    #[must_use]
    pub fn retry_count(&self, phase: Phase) -> u32 {
        self.retries.get(&phase).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn retry_budget_exhausted(&self, phase: Phase) -> bool {
        self.retry_count(phase) >= self.max_retries
    }

    /// Append a generated file, enforcing invariant 3 (unique, relative,
    /// sandboxed paths).
    pub fn append_file(
        &mut self,
        path: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
        kind: FileKind,
        deps: Vec<String>,
    ) -> Result<(), InvariantError> {
        let path = path.into();
        if !is_safe_relative_path(&path) {
            return Err(InvariantError::UnsafeFilePath(path));
        }
        if self.files.iter().any(|f| f.path == path) {
            return Err(InvariantError::DuplicateFilePath(path));
        }
        self.files.push(CodeFile {
            path,
            content: content.into(),
            language: language.into(),
            kind,
            deps,
        });
        Ok(())
    }

    /// Immutable, cloned view for Workers and Guardrails — they read state
    /// through this, never the owning `ProjectState` itself.
    #[must_use]
    pub fn snapshot(&self) -> ProjectStateSnapshot {
        ProjectStateSnapshot {
            project_id: self.project_id,
            description: self.description.clone(),
            phase: self.phase,
            requirements: self.requirements.clone(),
            architecture: self.architecture.clone(),
            files: self.files.clone(),
            test_results: self.test_results.clone(),
            deployment: self.deployment.clone(),
            retries: self.retries.clone(),
            max_retries: self.max_retries,
            metadata: self.metadata.clone(),
        }
    }
}

/// A relative path with no `..` components and no leading `/`.
fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') {
        return false;
    }
    std::path::Path::new(path)
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}

/// Read-only view of [`ProjectState`] handed to Workers and Guardrails.
/// Deliberately omits `transitions`/`errors`/`started_at`/`completed_at` —
/// those are Flow-internal bookkeeping, not task context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectStateSnapshot {
    pub project_id: Uuid,
    pub description: String,
    pub phase: Phase,
    pub requirements: Option<Requirements>,
    pub architecture: Option<Architecture>,
    pub files: Vec<CodeFile>,
    pub test_results: Option<TestRun>,
    pub deployment: Option<DeploymentBundle>,
    pub retries: FxHashMap<Phase, u32>,
    pub max_retries: u32,
    pub metadata: FxHashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_at_intake_with_no_completed_at() {
        let s = ProjectState::new("build me an api", 3);
        assert_eq!(s.phase, Phase::Intake);
        assert!(s.completed_at.is_none());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut s = ProjectState::new("x", 3);
        let err = s.transition(Phase::Development, "skip ahead").unwrap_err();
        assert!(matches!(err, InvariantError::IllegalTransition { .. }));
        assert_eq!(s.phase, Phase::Intake);
    }

    #[test]
    fn terminal_transition_sets_completed_at() {
        let mut s = ProjectState::new("x", 3);
        s.transition(Phase::Planning, "ok").unwrap();
        s.transition(Phase::Development, "ok").unwrap();
        s.transition(Phase::Testing, "ok").unwrap();
        s.transition(Phase::Deployment, "ok").unwrap();
        s.transition(Phase::Complete, "done").unwrap();
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut s = ProjectState::new("x", 1);
        s.bump_retry(Phase::Testing).unwrap();
        let err = s.bump_retry(Phase::Testing).unwrap_err();
        assert!(matches!(err, InvariantError::RetryBudgetExceeded { .. }));
    }

    #[test]
    fn duplicate_and_unsafe_paths_are_rejected() {
        let mut s = ProjectState::new("x", 3);
        s.append_file("src/main.rs", "fn main(){}", "rust", FileKind::Source, vec![])
            .unwrap();
        assert!(matches!(
            s.append_file("src/main.rs", "x", "rust", FileKind::Source, vec![]),
            Err(InvariantError::DuplicateFilePath(_))
        ));
        assert!(matches!(
            s.append_file("../escape.rs", "x", "rust", FileKind::Source, vec![]),
            Err(InvariantError::UnsafeFilePath(_))
        ));
        assert!(matches!(
            s.append_file("/abs/path.rs", "x", "rust", FileKind::Source, vec![]),
            Err(InvariantError::UnsafeFilePath(_))
        ));
    }

    #[test]
    fn snapshot_json_round_trips_through_serde() {
        let mut s = ProjectState::new("build me an api", 3);
        s.transition(Phase::Planning, "validated").unwrap();
        s.append_file("src/main.rs", "fn main(){}", "rust", FileKind::Source, vec![])
            .unwrap();
        let json = serde_json::to_string(&s).unwrap();
        let back: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_id, s.project_id);
        assert_eq!(back.phase, s.phase);
        assert_eq!(back.files.len(), s.files.len());
        assert_eq!(back.transitions.len(), s.transitions.len());
    }

    #[test]
    fn unknown_fields_are_preserved_across_round_trip() {
        let s = ProjectState::new("x", 3);
        let mut json: serde_json::Value = serde_json::to_value(&s).unwrap();
        json.as_object_mut()
            .unwrap()
            .insert("future_field".into(), serde_json::json!("from a newer build"));
        let back: ProjectState = serde_json::from_value(json.clone()).unwrap();
        let round_tripped = serde_json::to_value(&back).unwrap();
        assert_eq!(round_tripped["future_field"], json["future_field"]);
    }

    #[test]
    fn awaiting_human_returns_to_suspension_source() {
        let mut s = ProjectState::new("x", 3);
        s.transition(Phase::AwaitingHuman, "ambiguous").unwrap();
        assert_eq!(s.suspended_from, Some(Phase::Intake));
        s.transition(Phase::Intake, "resumed").unwrap();
        assert_eq!(s.suspended_from, None);
    }
}
