//! The Behavioral guardrail family: role adherence, scope
//! control, delegation legality, output shape, and iteration-limit
//! tracking.
//!
//! Each check is a named validator over a typed `GuardrailContext`,
//! including the delegation-cycle ancestry check the context itself tracks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::guardrail::{Guardrail, GuardrailContext, GuardrailError};
use crate::verdict::{Severity, Verdict};

/// Role adherence: the output's declared content domain must match the
/// worker's declared role. Operates on an output shaped like
/// `{"role_domain": "backend"}`; a missing field passes rather than
/// penalizing roles whose output carries no explicit domain tag.
pub struct RoleAdherenceGuardrail {
    /// role -> accepted content domains
    allowed_domains: std::collections::HashMap<String, HashSet<String>>,
}

impl RoleAdherenceGuardrail {
    #[must_use]
    pub fn new(allowed_domains: std::collections::HashMap<String, HashSet<String>>) -> Self {
        Self { allowed_domains }
    }
}

#[async_trait]
impl Guardrail for RoleAdherenceGuardrail {
    fn id(&self) -> &str {
        "behavioral.role_adherence"
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn evaluate(&self, output: &serde_json::Value, ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(domain) = output.get("role_domain").and_then(serde_json::Value::as_str) else {
            return Ok(Verdict::pass("role_adherence"));
        };
        let Some(allowed) = self.allowed_domains.get(&ctx.worker_role) else {
            return Ok(Verdict::pass("role_adherence"));
        };
        if allowed.contains(domain) {
            Ok(Verdict::pass("role_adherence"))
        } else {
            Ok(Verdict::fail(
                "role_adherence",
                format!("role '{}' produced out-of-domain content '{domain}'", ctx.worker_role),
                true,
                Severity::Warning,
            ))
        }
    }
}

/// Scope control: the output must reference only items present in the
/// current requirements/architecture. Operates on an output
/// carrying `{"references": [...]}`.
pub struct ScopeControlGuardrail;

#[async_trait]
impl Guardrail for ScopeControlGuardrail {
    fn id(&self) -> &str {
        "behavioral.scope_control"
    }

    fn priority(&self) -> u32 {
        21
    }

    async fn evaluate(&self, output: &serde_json::Value, ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(references) = output.get("references").and_then(serde_json::Value::as_array) else {
            return Ok(Verdict::pass("scope_control"));
        };
        if ctx.known_scope_items.is_empty() {
            return Ok(Verdict::pass("scope_control"));
        }
        let out_of_scope: Vec<String> = references
            .iter()
            .filter_map(serde_json::Value::as_str)
            .filter(|r| !ctx.known_scope_items.iter().any(|known| known == r))
            .map(str::to_string)
            .collect();
        if out_of_scope.is_empty() {
            Ok(Verdict::pass("scope_control"))
        } else {
            Ok(Verdict::fail(
                "scope_control",
                format!("references out-of-scope item(s): {}", out_of_scope.join(", ")),
                true,
                Severity::Warning,
            ))
        }
    }
}

/// Delegation legality: only designated coordinator roles may delegate;
/// delegation cycles are refused. Operates on an output
/// carrying `{"delegates_to_task": "..."}`.
pub struct DelegationLegalityGuardrail;

#[async_trait]
impl Guardrail for DelegationLegalityGuardrail {
    fn id(&self) -> &str {
        "behavioral.delegation_legality"
    }

    fn priority(&self) -> u32 {
        2
    }

    fn degradable(&self) -> bool {
        false
    }

    async fn evaluate(&self, output: &serde_json::Value, ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(delegate_target) = output.get("delegates_to_task").and_then(serde_json::Value::as_str) else {
            return Ok(Verdict::pass("delegation_legality"));
        };
        if !ctx.is_coordinator_role {
            return Ok(Verdict::fail(
                "delegation_legality",
                format!("role '{}' attempted delegation without coordinator designation", ctx.worker_role),
                false,
                Severity::Critical,
            ));
        }
        if ctx.would_cycle(delegate_target) {
            return Ok(Verdict::fail(
                "delegation_legality",
                format!("delegation to '{delegate_target}' would introduce a cycle"),
                false,
                Severity::Critical,
            ));
        }
        Ok(Verdict::pass("delegation_legality"))
    }
}

/// Output shape: the output parses as the declared typed artifact.
/// Guardrails run after Worker-side schema coercion already succeeded, so
/// this re-validates structurally against the same schema at the chain
/// layer rather than duplicating coercion.
pub struct OutputShapeGuardrail {
    schema: serde_json::Value,
}

impl OutputShapeGuardrail {
    #[must_use]
    pub fn new(schema: serde_json::Value) -> Self {
        Self { schema }
    }

    fn matches_shape(&self, output: &serde_json::Value) -> bool {
        match (&self.schema, output) {
            (serde_json::Value::Object(schema_obj), serde_json::Value::Object(output_obj)) => {
                let Some(required) = schema_obj.get("required").and_then(serde_json::Value::as_array) else {
                    return true;
                };
                required
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .all(|key| output_obj.contains_key(key))
            }
            _ => true,
        }
    }
}

#[async_trait]
impl Guardrail for OutputShapeGuardrail {
    fn id(&self) -> &str {
        "behavioral.output_shape"
    }

    fn priority(&self) -> u32 {
        3
    }

    fn degradable(&self) -> bool {
        false
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        if self.matches_shape(output) {
            Ok(Verdict::pass("output_shape"))
        } else {
            Ok(Verdict::fail(
                "output_shape",
                "output is missing one or more fields required by the declared schema",
                true,
                Severity::Warning,
            ))
        }
    }
}

/// Iteration limit: warns at 80% and fails at 100% of the worker's inner
/// iteration cap. Operates on an output carrying
/// `{"iteration": n}`; `iteration_cap` is the Worker's configured cap.
pub struct IterationLimitGuardrail {
    iteration_cap: u32,
}

impl IterationLimitGuardrail {
    #[must_use]
    pub fn new(iteration_cap: u32) -> Self {
        Self { iteration_cap }
    }
}

#[async_trait]
impl Guardrail for IterationLimitGuardrail {
    fn id(&self) -> &str {
        "behavioral.iteration_limit"
    }

    fn priority(&self) -> u32 {
        90
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(iteration) = output.get("iteration").and_then(serde_json::Value::as_u64) else {
            return Ok(Verdict::pass("iteration_limit"));
        };
        let iteration = iteration as u32;
        if iteration >= self.iteration_cap {
            return Ok(Verdict::fail(
                "iteration_limit",
                format!("iteration {iteration} reached the cap of {}", self.iteration_cap),
                false,
                Severity::Warning,
            ));
        }
        let warn_threshold = (f64::from(self.iteration_cap) * 0.8).floor() as u32;
        if iteration >= warn_threshold {
            return Ok(Verdict::warn(
                "iteration_limit",
                format!("iteration {iteration} is at 80% of the cap ({})", self.iteration_cap),
            ));
        }
        Ok(Verdict::pass("iteration_limit"))
    }
}

/// Build the full Behavioral chain.
#[must_use]
pub fn behavioral_chain(
    allowed_domains: std::collections::HashMap<String, HashSet<String>>,
    expected_output_schema: serde_json::Value,
    iteration_cap: u32,
) -> Vec<Arc<dyn Guardrail>> {
    vec![
        Arc::new(DelegationLegalityGuardrail),
        Arc::new(OutputShapeGuardrail::new(expected_output_schema)),
        Arc::new(RoleAdherenceGuardrail::new(allowed_domains)),
        Arc::new(ScopeControlGuardrail),
        Arc::new(IterationLimitGuardrail::new(iteration_cap)),
    ]
}
