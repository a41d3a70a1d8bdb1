//! `GuardrailChain`: runs a task's declared guardrails in order and
//! applies a fixed set of chain semantics.
//!
//! - Run in declared order.
//! - On `pass`/`warn`, continue; warnings accumulate.
//! - On `fail` with `retry_allowed=true` and retry budget remaining,
//!   short-circuit and instruct the Worker to retry with the verdict's
//!   message appended to context.
//! - On `fail` with `retry_allowed=false` or budget exhausted, propagate
//!   as a task failure.
//! - `severity=critical` always bypasses warn aggregation and fails the
//!   task immediately, regardless of `retry_allowed`.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::guardrail::{Guardrail, GuardrailContext, GuardrailError};
use crate::verdict::{Severity, Verdict, VerdictStatus};

/// Per-stage execution metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStageMetrics {
    pub guardrail_id: String,
    pub duration: std::time::Duration,
    pub degraded: bool,
    pub status: String,
}

/// What the Crew layer should do after running a task's guardrail chain.
#[derive(Debug, Clone)]
pub enum ChainOutcome {
    /// All guardrails passed or warned; the task's output may be committed.
    Commit { warnings: Vec<Verdict> },
    /// A `fail` verdict with `retry_allowed=true` and budget remaining —
    /// the Worker should be re-invoked with `verdict.message` appended.
    Retry { verdict: Verdict },
    /// A `fail` verdict with `retry_allowed=false`, or the retry budget
    /// was already exhausted — the task fails outright.
    Block { verdict: Verdict },
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("guardrail '{guardrail}' is not degradable and failed to evaluate: {source}")]
    CriticalGuardrailFailure {
        guardrail: String,
        #[source]
        source: GuardrailError,
    },
}

/// An ordered, priority-sorted sequence of guardrails for one task.
pub struct GuardrailChain {
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailChain {
    #[must_use]
    pub fn new(mut guardrails: Vec<Arc<dyn Guardrail>>) -> Self {
        guardrails.sort_by_key(|g| g.priority());
        Self { guardrails }
    }

    /// Evaluate the chain against one task output. `retry_budget_remaining`
    /// is whether the task has at least one more retry available in its
    /// per-task budget (default 3).
    #[tracing::instrument(skip(self, output), fields(guardrail_count = self.guardrails.len()))]
    pub async fn evaluate(
        &self,
        output: &serde_json::Value,
        ctx: &GuardrailContext,
        retry_budget_remaining: bool,
    ) -> Result<(ChainOutcome, Vec<ChainStageMetrics>), ChainError> {
        let mut warnings = Vec::new();
        let mut metrics = Vec::new();

        for guardrail in &self.guardrails {
            let started = Instant::now();
            let verdict = match guardrail.evaluate(output, ctx).await {
                Ok(v) => v,
                Err(source) => {
                    if guardrail.degradable() {
                        metrics.push(ChainStageMetrics {
                            guardrail_id: guardrail.id().to_string(),
                            duration: started.elapsed(),
                            degraded: true,
                            status: "degraded".into(),
                        });
                        tracing::warn!(guardrail = guardrail.id(), "guardrail degraded after error");
                        continue;
                    }
                    return Err(ChainError::CriticalGuardrailFailure {
                        guardrail: guardrail.id().to_string(),
                        source,
                    });
                }
            };

            metrics.push(ChainStageMetrics {
                guardrail_id: guardrail.id().to_string(),
                duration: started.elapsed(),
                degraded: false,
                status: status_label(&verdict),
            });

            match verdict.status {
                VerdictStatus::Pass => continue,
                VerdictStatus::Warn => {
                    warnings.push(verdict);
                    continue;
                }
                VerdictStatus::Fail => {
                    // Critical always fails immediately, bypassing warn
                    // aggregation, regardless of retry_allowed.
                    if verdict.severity == Severity::Critical {
                        return Ok((ChainOutcome::Block { verdict }, metrics));
                    }
                    if verdict.retry_allowed && retry_budget_remaining {
                        return Ok((ChainOutcome::Retry { verdict }, metrics));
                    }
                    return Ok((ChainOutcome::Block { verdict }, metrics));
                }
            }
        }

        Ok((ChainOutcome::Commit { warnings }, metrics))
    }
}

fn status_label(v: &Verdict) -> String {
    match v.status {
        VerdictStatus::Pass => "pass".into(),
        VerdictStatus::Warn => "warn".into(),
        VerdictStatus::Fail => "fail".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedGuardrail {
        id: &'static str,
        verdict: Verdict,
        priority: u32,
    }

    #[async_trait]
    impl Guardrail for FixedGuardrail {
        fn id(&self) -> &str {
            self.id
        }
        async fn evaluate(
            &self,
            _output: &serde_json::Value,
            _ctx: &GuardrailContext,
        ) -> Result<Verdict, GuardrailError> {
            Ok(self.verdict.clone())
        }
        fn priority(&self) -> u32 {
            self.priority
        }
    }

    fn ctx() -> GuardrailContext {
        GuardrailContext::new("task-1", "backend_developer")
    }

    #[tokio::test]
    async fn all_pass_commits() {
        let chain = GuardrailChain::new(vec![Arc::new(FixedGuardrail {
            id: "g1",
            verdict: Verdict::pass("shape"),
            priority: 1,
        })]);
        let (outcome, _) = chain.evaluate(&serde_json::json!({}), &ctx(), true).await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Commit { .. }));
    }

    #[tokio::test]
    async fn soft_fail_with_budget_retries() {
        let chain = GuardrailChain::new(vec![Arc::new(FixedGuardrail {
            id: "g1",
            verdict: Verdict::fail("scope_control", "references unknown component", true, Severity::Warning),
            priority: 1,
        })]);
        let (outcome, _) = chain.evaluate(&serde_json::json!({}), &ctx(), true).await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Retry { .. }));
    }

    #[tokio::test]
    async fn soft_fail_without_budget_blocks() {
        let chain = GuardrailChain::new(vec![Arc::new(FixedGuardrail {
            id: "g1",
            verdict: Verdict::fail("scope_control", "references unknown component", true, Severity::Warning),
            priority: 1,
        })]);
        let (outcome, _) = chain.evaluate(&serde_json::json!({}), &ctx(), false).await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Block { .. }));
    }

    #[tokio::test]
    async fn critical_fail_blocks_even_with_retry_allowed_and_budget() {
        let chain = GuardrailChain::new(vec![Arc::new(FixedGuardrail {
            id: "security.dangerous_pattern",
            verdict: Verdict::fail("dangerous_pattern", "shell injection", true, Severity::Critical),
            priority: 1,
        })]);
        let (outcome, _) = chain.evaluate(&serde_json::json!({}), &ctx(), true).await.unwrap();
        assert!(matches!(outcome, ChainOutcome::Block { .. }));
    }

    #[tokio::test]
    async fn warnings_accumulate_across_stages() {
        let chain = GuardrailChain::new(vec![
            Arc::new(FixedGuardrail {
                id: "g1",
                verdict: Verdict::warn("quality.docstrings", "missing docstring"),
                priority: 1,
            }),
            Arc::new(FixedGuardrail {
                id: "g2",
                verdict: Verdict::warn("quality.file_length", "file is long"),
                priority: 2,
            }),
        ]);
        let (outcome, metrics) = chain.evaluate(&serde_json::json!({}), &ctx(), true).await.unwrap();
        match outcome {
            ChainOutcome::Commit { warnings } => assert_eq!(warnings.len(), 2),
            _ => panic!("expected commit"),
        }
        assert_eq!(metrics.len(), 2);
    }
}
