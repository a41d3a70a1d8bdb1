//! The Quality guardrail family: file/function length,
//! docstring and type-signature presence, coverage threshold, dependency
//! policy, and architecture compliance.
//!
//! Each check is a static-analysis pass over generated source rather than
//! prompt content, returning a `Verdict` with no side effects.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::guardrail::{Guardrail, GuardrailContext, GuardrailError};
use crate::verdict::{Severity, Verdict};

fn file_fields(output: &serde_json::Value) -> Option<(&str, &str)> {
    let path = output.get("path")?.as_str()?;
    let content = output.get("content")?.as_str()?;
    Some((path, content))
}

/// File-length and function-length thresholds.
pub struct LengthThresholdGuardrail {
    max_file_lines: usize,
    max_function_lines: usize,
    function_start: Regex,
}

impl LengthThresholdGuardrail {
    #[must_use]
    pub fn new(max_file_lines: usize, max_function_lines: usize) -> Self {
        Self {
            max_file_lines,
            max_function_lines,
            function_start: Regex::new(r"(?m)^\s*(pub\s+)?(async\s+)?fn\s+\w+").unwrap(),
        }
    }
}

impl Default for LengthThresholdGuardrail {
    fn default() -> Self {
        Self::new(800, 80)
    }
}

#[async_trait]
impl Guardrail for LengthThresholdGuardrail {
    fn id(&self) -> &str {
        "quality.length_threshold"
    }

    fn priority(&self) -> u32 {
        110
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some((path, content)) = file_fields(output) else {
            return Ok(Verdict::pass("length_threshold"));
        };
        let total_lines = content.lines().count();
        if total_lines > self.max_file_lines {
            return Ok(Verdict::warn(
                "length_threshold",
                format!("{path} has {total_lines} lines, exceeding the file-length threshold of {}", self.max_file_lines),
            ));
        }

        let starts: Vec<usize> = self.function_start.find_iter(content).map(|m| line_of(content, m.start())).collect();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(total_lines);
            let len = end.saturating_sub(start);
            if len > self.max_function_lines {
                return Ok(Verdict::warn(
                    "length_threshold",
                    format!("{path} has a function spanning {len} lines, exceeding the threshold of {}", self.max_function_lines),
                ));
            }
        }
        Ok(Verdict::pass("length_threshold"))
    }
}

fn line_of(content: &str, byte_offset: usize) -> usize {
    content[..byte_offset].lines().count()
}

/// Presence of docstrings and type signatures on public functions.
/// Heuristic, language-agnostic: a public function is expected to be
/// preceded by a doc comment and to name at least one typed parameter or
/// return type.
pub struct DocstringPresenceGuardrail {
    pub_fn: Regex,
    doc_comment: Regex,
}

impl Default for DocstringPresenceGuardrail {
    fn default() -> Self {
        Self {
            pub_fn: Regex::new(r"(?m)^\s*pub\s+(async\s+)?fn\s+(\w+)").unwrap(),
            doc_comment: Regex::new(r"(?m)^\s*///").unwrap(),
        }
    }
}

#[async_trait]
impl Guardrail for DocstringPresenceGuardrail {
    fn id(&self) -> &str {
        "quality.docstring_presence"
    }

    fn priority(&self) -> u32 {
        111
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some((path, content)) = file_fields(output) else {
            return Ok(Verdict::pass("docstring_presence"));
        };
        let lines: Vec<&str> = content.lines().collect();
        let mut undocumented = Vec::new();
        for m in self.pub_fn.find_iter(content) {
            let line_idx = line_of(content, m.start());
            let preceding = if line_idx == 0 { "" } else { lines[line_idx - 1] };
            if !self.doc_comment.is_match(preceding) {
                undocumented.push(m.as_str().trim().to_string());
            }
        }
        if undocumented.is_empty() {
            Ok(Verdict::pass("docstring_presence"))
        } else {
            Ok(Verdict::warn(
                "docstring_presence",
                format!("{path}: undocumented public function(s): {}", undocumented.join(", ")),
            ))
        }
    }
}

/// Coverage threshold check on test outputs: coverage exactly at threshold
/// passes, strictly below fails.
pub struct CoverageThresholdGuardrail {
    threshold: f64,
}

impl CoverageThresholdGuardrail {
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Guardrail for CoverageThresholdGuardrail {
    fn id(&self) -> &str {
        "quality.coverage_threshold"
    }

    fn priority(&self) -> u32 {
        112
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(coverage) = output.get("coverage").and_then(serde_json::Value::as_f64) else {
            return Ok(Verdict::pass("coverage_threshold"));
        };
        if coverage >= self.threshold {
            Ok(Verdict::pass("coverage_threshold"))
        } else {
            Ok(Verdict::fail(
                "coverage_threshold",
                format!("coverage {coverage:.2} is strictly below the threshold of {:.2}", self.threshold),
                true,
                Severity::Warning,
            ))
        }
    }
}

/// Documentation presence: a generated file of kind `doc` or a
/// non-trivial module is expected to carry a top-level summary.
pub struct DocumentationPresenceGuardrail;

#[async_trait]
impl Guardrail for DocumentationPresenceGuardrail {
    fn id(&self) -> &str {
        "quality.documentation_presence"
    }

    fn priority(&self) -> u32 {
        113
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(kind) = output.get("kind").and_then(serde_json::Value::as_str) else {
            return Ok(Verdict::pass("documentation_presence"));
        };
        if kind != "doc" {
            return Ok(Verdict::pass("documentation_presence"));
        }
        let Some(content) = output.get("content").and_then(serde_json::Value::as_str) else {
            return Ok(Verdict::pass("documentation_presence"));
        };
        if content.trim().is_empty() {
            Ok(Verdict::warn("documentation_presence", "documentation file has no content"))
        } else {
            Ok(Verdict::pass("documentation_presence"))
        }
    }
}

/// Dependency policy: no pinned-to-latest, no packages flagged in a
/// configurable blocklist. Operates on an output carrying
/// `{"dependencies": [{"name": "...", "version": "..."}]}`.
pub struct DependencyPolicyGuardrail {
    blocklist: Vec<String>,
}

impl DependencyPolicyGuardrail {
    #[must_use]
    pub fn new(blocklist: Vec<String>) -> Self {
        Self { blocklist }
    }
}

#[async_trait]
impl Guardrail for DependencyPolicyGuardrail {
    fn id(&self) -> &str {
        "quality.dependency_policy"
    }

    fn priority(&self) -> u32 {
        114
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(deps) = output.get("dependencies").and_then(serde_json::Value::as_array) else {
            return Ok(Verdict::pass("dependency_policy"));
        };
        let mut violations = Vec::new();
        for dep in deps {
            let name = dep.get("name").and_then(serde_json::Value::as_str).unwrap_or_default();
            let version = dep.get("version").and_then(serde_json::Value::as_str).unwrap_or_default();
            if version == "latest" || version == "*" {
                violations.push(format!("{name} is pinned to '{version}'"));
            }
            if self.blocklist.iter().any(|b| b == name) {
                violations.push(format!("{name} is on the dependency blocklist"));
            }
        }
        if violations.is_empty() {
            Ok(Verdict::pass("dependency_policy"))
        } else {
            Ok(Verdict::fail("dependency_policy", violations.join("; "), true, Severity::Warning))
        }
    }
}

/// Architecture compliance: each generated file's declared module lives
/// under a component named in the architecture. Operates on
/// an output carrying `{"path": "...", "component": "..."}`.
pub struct ArchitectureComplianceGuardrail {
    known_components: Vec<String>,
}

impl ArchitectureComplianceGuardrail {
    #[must_use]
    pub fn new(known_components: Vec<String>) -> Self {
        Self { known_components }
    }
}

#[async_trait]
impl Guardrail for ArchitectureComplianceGuardrail {
    fn id(&self) -> &str {
        "quality.architecture_compliance"
    }

    fn priority(&self) -> u32 {
        30
    }

    async fn evaluate(&self, output: &serde_json::Value, _ctx: &GuardrailContext) -> Result<Verdict, GuardrailError> {
        let Some(component) = output.get("component").and_then(serde_json::Value::as_str) else {
            return Ok(Verdict::pass("architecture_compliance"));
        };
        if self.known_components.is_empty() || self.known_components.iter().any(|c| c.eq_ignore_ascii_case(component)) {
            Ok(Verdict::pass("architecture_compliance"))
        } else {
            Ok(Verdict::fail(
                "architecture_compliance",
                format!("declared component '{component}' is not named in the architecture"),
                true,
                Severity::Warning,
            ))
        }
    }
}

/// Build the full Quality chain.
#[must_use]
pub fn quality_chain(
    coverage_threshold: f64,
    dependency_blocklist: Vec<String>,
    known_components: Vec<String>,
) -> Vec<Arc<dyn Guardrail>> {
    vec![
        Arc::new(ArchitectureComplianceGuardrail::new(known_components)),
        Arc::new(LengthThresholdGuardrail::default()),
        Arc::new(DocstringPresenceGuardrail::default()),
        Arc::new(DocumentationPresenceGuardrail),
        Arc::new(CoverageThresholdGuardrail::new(coverage_threshold)),
        Arc::new(DependencyPolicyGuardrail::new(dependency_blocklist)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> GuardrailContext {
        GuardrailContext::new("t1", "dev")
    }

    #[tokio::test]
    async fn coverage_exactly_at_threshold_passes() {
        let g = CoverageThresholdGuardrail::new(0.8);
        let v = g.evaluate(&serde_json::json!({"coverage": 0.8}), &ctx()).await.unwrap();
        assert!(v.is_pass());
    }

    #[tokio::test]
    async fn coverage_strictly_below_threshold_fails() {
        let g = CoverageThresholdGuardrail::new(0.8);
        let v = g.evaluate(&serde_json::json!({"coverage": 0.79}), &ctx()).await.unwrap();
        assert!(v.is_fail());
    }

    #[tokio::test]
    async fn pinned_to_latest_dependency_is_blocked() {
        let g = DependencyPolicyGuardrail::new(vec![]);
        let output = serde_json::json!({"dependencies": [{"name": "leftpad", "version": "latest"}]});
        let v = g.evaluate(&output, &ctx()).await.unwrap();
        assert!(v.is_fail());
    }

    #[tokio::test]
    async fn unknown_component_fails_architecture_compliance() {
        let g = ArchitectureComplianceGuardrail::new(vec!["backend".into()]);
        let output = serde_json::json!({"component": "frontend"});
        let v = g.evaluate(&output, &ctx()).await.unwrap();
        assert!(v.is_fail());
    }

    #[tokio::test]
    async fn undocumented_public_function_warns() {
        let g = DocstringPresenceGuardrail::default();
        let output = serde_json::json!({"path": "lib.rs", "content": "pub fn undocumented() {}"});
        let v = g.evaluate(&output, &ctx()).await.unwrap();
        assert!(v.is_warn());
    }

    #[tokio::test]
    async fn documented_public_function_passes() {
        let g = DocstringPresenceGuardrail::default();
        let output = serde_json::json!({"path": "lib.rs", "content": "/// does the thing\npub fn documented() {}"});
        let v = g.evaluate(&output, &ctx()).await.unwrap();
        assert!(v.is_pass());
    }

    #[tokio::test]
    async fn oversized_file_warns_on_length_threshold() {
        let g = LengthThresholdGuardrail::new(5, 80);
        let content = (0..10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let output = serde_json::json!({"path": "big.rs", "content": content});
        let v = g.evaluate(&output, &ctx()).await.unwrap();
        assert!(v.is_warn());
    }
}
