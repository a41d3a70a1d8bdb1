//! Orchestrator-wide error taxonomy.
//!
//! Every fallible operation in `crewflow-core` ultimately resolves to an
//! [`OrchestratorError`] variant. The variants mirror the seven error kinds
//! an operator needs to distinguish: some are retryable by the Flow's
//! circuit breaker, some require operator intervention, and some indicate a
//! bug rather than an environmental failure.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error kind for the orchestrator.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    /// Malformed or missing configuration — never retried.
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(crewflow::configuration),
        help("check RunOptions and any loaded policy file for missing or malformed fields")
    )]
    Configuration(String),

    /// A transient failure in an external dependency (LLM call, tool I/O).
    /// Retried by the Worker's backoff policy up to its configured limit.
    #[error("transient failure calling {what}: {source}")]
    #[diagnostic(code(crewflow::transient))]
    Transient {
        /// What was being called (e.g. `"llm.complete"`, `"tool.file_store.write"`).
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A worker's output did not conform to its expected schema after all
    /// coercion attempts were exhausted.
    #[error("worker output for role {role} did not match the expected shape: {detail}")]
    #[diagnostic(code(crewflow::shape))]
    Shape {
        /// The role whose output failed to coerce.
        role: String,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// A guardrail returned `warn` — execution continues, but the verdict
    /// is recorded against the task and may influence retry routing.
    #[error("guardrail '{guardrail}' warned: {message}")]
    #[diagnostic(code(crewflow::guardrail_soft), severity(Warning))]
    GuardrailSoft {
        /// Identifier of the guardrail stage that warned.
        guardrail: String,
        /// The warning message.
        message: String,
    },

    /// A guardrail returned `fail` and the chain's fail mode is not
    /// `log_only` — execution of the offending task is blocked.
    #[error("guardrail '{guardrail}' blocked execution: {message}")]
    #[diagnostic(
        code(crewflow::guardrail_hard),
        help("inspect the guardrail verdict detail for the specific rule that fired")
    )]
    GuardrailHard {
        /// Identifier of the guardrail stage that blocked.
        guardrail: String,
        /// The block message.
        message: String,
    },

    /// A phase, task, or run-level budget (retries, tokens, wall-clock) was
    /// exhausted without reaching a terminal success state.
    #[error("budget exhausted: {0}")]
    #[diagnostic(
        code(crewflow::budget_exhausted),
        help("raise the relevant limit in RunOptions or inspect why retries were needed")
    )]
    BudgetExhausted(String),

    /// A data-model or state-machine invariant was violated — always a bug,
    /// never retried, always fatal to the run.
    #[error("invariant violated: {0}")]
    #[diagnostic(
        code(crewflow::invariant_violation),
        help("this indicates a bug in crewflow itself; please file an issue with the run's audit log")
    )]
    InvariantViolation(String),
}

impl OrchestratorError {
    /// Whether the Flow's circuit breaker should count this failure toward
    /// its consecutive-failure threshold and consider retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::GuardrailSoft { .. } | Self::Shape { .. }
        )
    }

    /// Whether this error should suspend the run for human feedback rather
    /// than simply failing it outright.
    #[must_use]
    pub fn requires_human_feedback(&self) -> bool {
        matches!(self, Self::GuardrailHard { .. } | Self::BudgetExhausted(_))
    }
}
