//! The [`Guardrail`] trait: a pure validator over `(typed_output, context)`
//!.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::verdict::Verdict;

/// Cap on a delegation chain's ancestry depth — prevents unbounded memory
/// growth from pathological coordinator delegation.
const MAX_DELEGATION_DEPTH: usize = 64;

/// Context handed to every guardrail alongside the output it is
/// evaluating: `(typed_output, context) -> verdict`.
#[derive(Debug, Clone)]
pub struct GuardrailContext {
    pub task_id: String,
    pub worker_role: String,
    /// `true` if `worker_role` is a designated coordinator role, i.e. may
    /// legally delegate tasks.
    pub is_coordinator_role: bool,
    /// Names/identifiers the current requirements/architecture declare —
    /// used by the scope-control guardrail to check the output only
    /// references items actually present in state.
    pub known_scope_items: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    parent: Option<Arc<GuardrailContext>>,
}

impl GuardrailContext {
    #[must_use]
    pub fn new(task_id: impl Into<String>, worker_role: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worker_role: worker_role.into(),
            is_coordinator_role: false,
            known_scope_items: Vec::new(),
            metadata: HashMap::new(),
            parent: None,
        }
    }

    #[must_use]
    pub fn with_coordinator_role(mut self, is_coordinator: bool) -> Self {
        self.is_coordinator_role = is_coordinator;
        self
    }

    #[must_use]
    pub fn with_known_scope_items(mut self, items: Vec<String>) -> Self {
        self.known_scope_items = items;
        self
    }

    /// Derive a child context for a delegated sub-task.
    #[must_use]
    pub fn delegate(&self, task_id: impl Into<String>, worker_role: impl Into<String>) -> Self {
        let parent = if self.delegation_depth() >= MAX_DELEGATION_DEPTH {
            None
        } else {
            Some(Arc::new(self.clone()))
        };
        Self {
            task_id: task_id.into(),
            worker_role: worker_role.into(),
            is_coordinator_role: false,
            known_scope_items: self.known_scope_items.clone(),
            metadata: HashMap::new(),
            parent,
        }
    }

    #[must_use]
    pub fn delegation_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(p) = current {
            depth += 1;
            current = p.parent.as_ref();
        }
        depth
    }

    /// Whether delegating from `self` to `task_id` would introduce a cycle
    /// — i.e. `task_id` already appears in the ancestry chain.
    #[must_use]
    pub fn would_cycle(&self, task_id: &str) -> bool {
        if self.task_id == task_id {
            return true;
        }
        let mut current = self.parent.as_ref();
        while let Some(p) = current {
            if p.task_id == task_id {
                return true;
            }
            current = p.parent.as_ref();
        }
        false
    }
}

/// Errors a guardrail may return when it cannot complete evaluation at
/// all (distinct from returning a `fail` verdict, which is a successful
/// evaluation that found a problem).
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("backend unavailable for guardrail '{guardrail}': {reason}")]
    BackendUnavailable { guardrail: String, reason: String },
    #[error("output could not be inspected by guardrail '{guardrail}': {reason}")]
    InvalidOutput { guardrail: String, reason: String },
}

/// A pure validator over `(typed_output, context) -> verdict`.
#[async_trait]
pub trait Guardrail: Send + Sync {
    /// Unique identifier, e.g. `"security.dangerous_pattern"`.
    fn id(&self) -> &str;

    async fn evaluate(
        &self,
        output: &serde_json::Value,
        ctx: &GuardrailContext,
    ) -> Result<Verdict, GuardrailError>;

    /// Whether the chain may continue past an internal evaluation error by
    /// treating it as degraded coverage rather than aborting. Defaults to
    /// `true`.
    fn degradable(&self) -> bool {
        true
    }

    /// Execution priority within a chain — lower values run first. Running
    /// in declared order is satisfied by the `Task`'s own declared
    /// ordering; priority only matters when a chain is built from a
    /// catalog rather than hand-ordered.
    fn priority(&self) -> u32 {
        100
    }
}
