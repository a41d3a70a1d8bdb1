//! A role-bound LLM invoker with retry/backoff and output schema coercion.
//! Workers do not know about guardrails — those run above them in the
//! Crew layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::events::EventBus;
use crate::state::ProjectStateSnapshot;
use crate::tools::{
    ChatMessage, Embedder, FileStore, FinishReason, LlmClient, LlmError, LlmRequest, LlmResponse, Sandbox, TestRunner,
    Vcs,
};

/// A role's persona: system prompt framing plus declared goal, mirroring
/// CrewAI-style `{role, goal, backstory}` templates.
#[derive(Clone, Debug)]
pub struct RoleTemplate {
    pub role: String,
    pub goal: String,
    pub persona: String,
}

/// The capability subset a Worker is bound to. All fields are optional
/// because a given role may not need every capability.
#[derive(Clone, Default)]
pub struct ToolSet {
    pub file_store: Option<Arc<dyn FileStore>>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    pub test_runner: Option<Arc<dyn TestRunner>>,
    pub vcs: Option<Arc<dyn Vcs>>,
}

/// A single task attempt's input.
#[derive(Clone, Debug)]
pub struct TaskInvocation {
    pub task_id: String,
    pub description: String,
    pub expected_output_schema: Value,
    /// Prior task outputs declared as dependencies, inlined verbatim.
    pub dependency_context: Vec<(String, Value)>,
    /// Recalled associative-memory entries, if memory is enabled.
    pub memory_recall: Vec<String>,
    /// Guardrail feedback accumulated from prior failed attempts of the
    /// same task.
    pub feedback: Vec<String>,
}

/// The coerced, typed artifact a Worker produces for one task attempt.
#[derive(Clone, Debug)]
pub struct WorkerOutput {
    pub task_id: String,
    pub artifact: Value,
    pub token_counts_in: u32,
    pub token_counts_out: u32,
}

/// A single tool invocation, as parsed from a `FinishReason::Tool`
/// response body. `tool` is a dotted `<capability>.<operation>` pair,
/// e.g. `"file_store.read"` or `"vcs.commit"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Masks values under keys that look like secrets before they reach an
/// audit-log event. Mirrors the key-name heuristics of the credential
/// scanners in the guardrails crate without pulling that crate in as a
/// dependency of the worker.
fn redact_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let redacted = if looks_sensitive_key(&k) {
                        Value::String("[REDACTED]".into())
                    } else {
                        redact_value(v)
                    };
                    (k, redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        other => other,
    }
}

fn looks_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["secret", "token", "password", "api_key", "apikey", "credential"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("transient failure invoking LLM for role {role}: {source}")]
    #[diagnostic(code(crewflow::worker::transient))]
    Transient {
        role: String,
        #[source]
        source: LlmError,
    },
    #[error("LLM output for task {task_id} did not parse as the declared schema: {detail}")]
    #[diagnostic(code(crewflow::worker::shape))]
    Shape { task_id: String, detail: String },
    #[error("permanent LLM failure for role {role}: {0}", role = .role)]
    #[diagnostic(code(crewflow::worker::permanent))]
    Permanent { role: String, source: LlmError },
    #[error("worker iteration cap ({cap}) reached for task {task_id} without completion")]
    #[diagnostic(code(crewflow::worker::iteration_cap))]
    IterationCapReached { task_id: String, cap: u32 },
}

/// Exponential backoff schedule for transient LLM failures: 1s, 2s, 4s,
/// 8s, then holds at `cap`.
#[must_use]
pub fn backoff_schedule(cap: Duration) -> Vec<Duration> {
    let mut delay = Duration::from_secs(1);
    let mut schedule = Vec::new();
    while delay < cap {
        schedule.push(delay);
        delay *= 2;
    }
    schedule.push(cap);
    schedule
}

/// A role-bound LLM invoker.
pub struct Worker {
    pub role: RoleTemplate,
    pub model_id: String,
    pub tools: ToolSet,
    pub memory: Option<Arc<dyn Embedder>>,
    pub llm: Arc<dyn LlmClient>,
    pub max_call_retries: u32,
    pub iteration_cap: u32,
    coercer: Option<Arc<dyn OutputCoercer>>,
    events: EventBus,
}

impl Worker {
    pub fn new(
        role: RoleTemplate,
        model_id: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        events: EventBus,
    ) -> Self {
        Self {
            role,
            model_id: model_id.into(),
            tools: ToolSet::default(),
            memory: None,
            llm,
            max_call_retries: 4,
            iteration_cap: 8,
            coercer: None,
            events,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory: Arc<dyn Embedder>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Overrides the default JSON-shape coercion with a role-specific
    /// strategy (e.g. a YAML-tolerant parser for infra-as-code artifacts).
    #[must_use]
    pub fn with_coercer(mut self, coercer: Arc<dyn OutputCoercer>) -> Self {
        self.coercer = Some(coercer);
        self
    }

    fn coerce(&self, text: &str, schema: &Value) -> Result<Value, String> {
        match &self.coercer {
            Some(c) => c.coerce(text, schema),
            None => coerce_to_schema(text, schema),
        }
    }

    /// Assemble the message list for one LLM call.
    fn assemble_messages(&self, invocation: &TaskInvocation, _snapshot: &ProjectStateSnapshot) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".into(),
            content: format!(
                "Role: {}\nGoal: {}\nPersona: {}",
                self.role.role, self.role.goal, self.role.persona
            ),
        }];

        let mut user_content = format!(
            "Task: {}\nExpected output schema: {}",
            invocation.description, invocation.expected_output_schema
        );
        for (dep_id, dep_output) in &invocation.dependency_context {
            user_content.push_str(&format!("\n\nDependency `{dep_id}` output:\n{dep_output}"));
        }
        for recalled in &invocation.memory_recall {
            user_content.push_str(&format!("\n\nRecalled context:\n{recalled}"));
        }
        for feedback in &invocation.feedback {
            user_content.push_str(&format!("\n\nPrevious attempt feedback:\n{feedback}"));
        }
        messages.push(ChatMessage {
            role: "user".into(),
            content: user_content,
        });
        messages
    }

    /// Invoke the worker on a single task attempt. Assembles the message
    /// list, then loops: call the LLM, and if it signals `Tool` completion
    /// dispatch the requested tool and feed the result back in as context
    /// for the next call, up to `iteration_cap` rounds.
    pub async fn invoke(
        &self,
        invocation: TaskInvocation,
        snapshot: &ProjectStateSnapshot,
    ) -> Result<WorkerOutput, WorkerError> {
        let mut messages = self.assemble_messages(&invocation, snapshot);
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;

        for iteration in 0..self.iteration_cap {
            let response = self.call_with_backoff(&messages, &invocation.expected_output_schema).await?;
            tokens_in += response.token_counts.input;
            tokens_out += response.token_counts.output;

            if response.finish_reason != FinishReason::Tool {
                let artifact =
                    self.coerce(&response.text, &invocation.expected_output_schema)
                        .map_err(|detail| WorkerError::Shape {
                            task_id: invocation.task_id.clone(),
                            detail,
                        })?;
                self.events.diagnostic(
                    "worker.invoke",
                    format!(
                        "role={} task={} iteration={iteration} finish={:?}",
                        self.role.role, invocation.task_id, response.finish_reason
                    ),
                );
                return Ok(WorkerOutput {
                    task_id: invocation.task_id,
                    artifact,
                    token_counts_in: tokens_in,
                    token_counts_out: tokens_out,
                });
            }

            let call: ToolCall = serde_json::from_str(&response.text).map_err(|e| WorkerError::Shape {
                task_id: invocation.task_id.clone(),
                detail: format!("tool call did not parse: {e}"),
            })?;
            messages.push(ChatMessage {
                role: "assistant".into(),
                content: response.text.clone(),
            });
            let result = self.dispatch_tool_call(&call).await;
            self.events.emit(crate::events::Event::ToolInvocation {
                tool: call.tool.clone(),
                operation: call.tool.clone(),
                arguments: redact_value(call.arguments.clone()),
                result: redact_value(result.clone().unwrap_or_else(|e| json!({ "error": e }))),
                ok: result.is_ok(),
            });
            let result_text = match result {
                Ok(v) => v.to_string(),
                Err(e) => format!("error: {e}"),
            };
            messages.push(ChatMessage {
                role: "tool".into(),
                content: result_text,
            });
        }

        Err(WorkerError::IterationCapReached {
            task_id: invocation.task_id,
            cap: self.iteration_cap,
        })
    }

    /// One LLM call with the role's retry/backoff schedule applied to
    /// `Transient` failures. `Permanent` failures are not retried.
    async fn call_with_backoff(&self, messages: &[ChatMessage], schema: &Value) -> Result<LlmResponse, WorkerError> {
        let backoff = backoff_schedule(Duration::from_secs(8));
        let mut last_err = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt as u32 > self.max_call_retries {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let request = LlmRequest {
                role: self.role.role.clone(),
                messages: messages.to_vec(),
                model_id: self.model_id.clone(),
                temperature: 0.2,
                max_output_tokens: 4096,
                response_schema: Some(schema.clone()),
                stop: None,
            };

            match self.llm.complete(request).await {
                Ok(response) => return Ok(response),
                Err(LlmError::Permanent(msg)) => {
                    return Err(WorkerError::Permanent {
                        role: self.role.role.clone(),
                        source: LlmError::Permanent(msg),
                    });
                }
                Err(source @ LlmError::Transient(_)) => {
                    last_err = Some(source);
                }
            }
        }

        Err(WorkerError::Transient {
            role: self.role.role.clone(),
            source: last_err.unwrap_or_else(|| LlmError::Transient("retries exhausted".into())),
        })
    }

    /// Dispatches one tool call to the bound [`ToolSet`] handle. Returns a
    /// plain JSON result so it can be appended back into the message list
    /// as tool-role content.
    async fn dispatch_tool_call(&self, call: &ToolCall) -> Result<Value, String> {
        fn arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
            args.get(key)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("missing '{key}' argument"))
        }

        match call.tool.as_str() {
            "file_store.read" => {
                let store = self.tools.file_store.as_ref().ok_or("no file_store bound to this role")?;
                let path = arg(&call.arguments, "path")?;
                let bytes = store.read(path).await.map_err(|e| e.to_string())?;
                Ok(json!({ "content": String::from_utf8_lossy(&bytes) }))
            }
            "file_store.write" => {
                let store = self.tools.file_store.as_ref().ok_or("no file_store bound to this role")?;
                let path = arg(&call.arguments, "path")?;
                let content = arg(&call.arguments, "content")?;
                store.write(path, content.as_bytes()).await.map_err(|e| e.to_string())?;
                Ok(json!({ "ok": true }))
            }
            "file_store.list" => {
                let store = self.tools.file_store.as_ref().ok_or("no file_store bound to this role")?;
                let dir = arg(&call.arguments, "dir")?;
                let paths = store.list(dir).await.map_err(|e| e.to_string())?;
                Ok(json!({ "paths": paths }))
            }
            "sandbox.execute" => {
                let sandbox = self.tools.sandbox.as_ref().ok_or("no sandbox bound to this role")?;
                let language = arg(&call.arguments, "language")?;
                let source = arg(&call.arguments, "source")?;
                let timeout_secs = call.arguments.get("timeout_secs").and_then(Value::as_u64).unwrap_or(10);
                let allowlist: Vec<String> = call
                    .arguments
                    .get("import_allowlist")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let result = sandbox
                    .execute(language, source, Duration::from_secs(timeout_secs), &allowlist)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(result).unwrap_or(Value::Null))
            }
            "test_runner.run" => {
                let runner = self.tools.test_runner.as_ref().ok_or("no test_runner bound to this role")?;
                let tests_path = arg(&call.arguments, "tests_path")?;
                let source_path = arg(&call.arguments, "source_path")?;
                let run = runner.run(tests_path, source_path).await.map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(run).unwrap_or(Value::Null))
            }
            "vcs.init" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                vcs.init().await.map_err(|e| e.to_string())?;
                Ok(json!({ "ok": true }))
            }
            "vcs.add" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                let path = arg(&call.arguments, "path")?;
                vcs.add(path).await.map_err(|e| e.to_string())?;
                Ok(json!({ "ok": true }))
            }
            "vcs.commit" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                let message = arg(&call.arguments, "message")?;
                let sha = vcs.commit(message).await.map_err(|e| e.to_string())?;
                Ok(json!({ "sha": sha }))
            }
            "vcs.branch" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                let name = arg(&call.arguments, "name")?;
                vcs.branch(name).await.map_err(|e| e.to_string())?;
                Ok(json!({ "ok": true }))
            }
            "vcs.status" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                let entries = vcs.status().await.map_err(|e| e.to_string())?;
                Ok(json!({ "entries": entries }))
            }
            "vcs.diff" => {
                let vcs = self.tools.vcs.as_ref().ok_or("no vcs bound to this role")?;
                let diff = vcs.diff().await.map_err(|e| e.to_string())?;
                Ok(json!({ "diff": diff }))
            }
            other => Err(format!("unknown tool '{other}'")),
        }
    }
}

/// Coerce raw LLM text into the declared typed artifact.
/// A real worker would use a structured-output parser matched to
/// `schema`; here the coercion is JSON-shape validation, which is the
/// schema-agnostic core of that contract.
fn coerce_to_schema(text: &str, _schema: &Value) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|e| format!("not valid JSON: {e}"))
}

/// A trait for swapping in a different output-coercion strategy per role
/// (e.g. a YAML-tolerant parser for infra-as-code artifacts). Set via
/// [`Worker::with_coercer`]; a worker built without one falls back to
/// plain JSON-shape coercion.
#[async_trait]
pub trait OutputCoercer: Send + Sync {
    fn coerce(&self, text: &str, schema: &Value) -> Result<Value, String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProjectState;
    use crate::tools::{FileStoreError, TokenCounts};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::Permanent("script exhausted".into()));
            }
            Ok(responses.remove(0))
        }
    }

    struct AlwaysToolLlm;

    #[async_trait]
    impl LlmClient for AlwaysToolLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: serde_json::json!({"tool": "file_store.read", "arguments": {"path": "a.txt"}}).to_string(),
                finish_reason: FinishReason::Tool,
                token_counts: TokenCounts { input: 1, output: 1 },
            })
        }
    }

    struct StubFileStore {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl FileStore for StubFileStore {
        async fn read(&self, _path: &str) -> Result<Vec<u8>, FileStoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(b"file contents".to_vec())
        }
        async fn write(&self, _path: &str, _bytes: &[u8]) -> Result<(), FileStoreError> {
            Ok(())
        }
        async fn list(&self, _dir: &str) -> Result<Vec<String>, FileStoreError> {
            Ok(vec![])
        }
    }

    fn role() -> RoleTemplate {
        RoleTemplate {
            role: "developer".into(),
            goal: "write code".into(),
            persona: "terse".into(),
        }
    }

    fn invocation() -> TaskInvocation {
        TaskInvocation {
            task_id: "t1".into(),
            description: "do the thing".into(),
            expected_output_schema: serde_json::json!({}),
            dependency_context: vec![],
            memory_recall: vec![],
            feedback: vec![],
        }
    }

    #[tokio::test]
    async fn tool_call_round_trips_before_final_answer() {
        let file_store = Arc::new(StubFileStore {
            reads: AtomicUsize::new(0),
        });
        let tool_call =
            serde_json::json!({"tool": "file_store.read", "arguments": {"path": "a.txt"}}).to_string();
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmResponse {
                text: tool_call,
                finish_reason: FinishReason::Tool,
                token_counts: TokenCounts { input: 5, output: 5 },
            },
            LlmResponse {
                text: serde_json::json!({"path": "a.txt", "content": "done"}).to_string(),
                finish_reason: FinishReason::Stop,
                token_counts: TokenCounts { input: 5, output: 5 },
            },
        ]));
        let worker = Worker::new(role(), "test-model", llm, EventBus::new(16)).with_tools(ToolSet {
            file_store: Some(file_store.clone()),
            ..ToolSet::default()
        });
        let snapshot = ProjectState::new("demo", 3).snapshot();

        let output = worker.invoke(invocation(), &snapshot).await.unwrap();
        assert_eq!(output.artifact["content"], "done");
        assert_eq!(file_store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(output.token_counts_in, 10);
    }

    #[tokio::test]
    async fn exceeding_iteration_cap_without_completion_errors() {
        let mut worker = Worker::new(role(), "test-model", Arc::new(AlwaysToolLlm), EventBus::new(16)).with_tools(
            ToolSet {
                file_store: Some(Arc::new(StubFileStore {
                    reads: AtomicUsize::new(0),
                })),
                ..ToolSet::default()
            },
        );
        worker.iteration_cap = 2;
        let snapshot = ProjectState::new("demo", 3).snapshot();

        let err = worker.invoke(invocation(), &snapshot).await.unwrap_err();
        assert!(matches!(err, WorkerError::IterationCapReached { cap: 2, .. }));
    }

    #[tokio::test]
    async fn tool_call_against_unbound_capability_is_reported_as_tool_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmResponse {
                text: serde_json::json!({"tool": "vcs.commit", "arguments": {"message": "wip"}}).to_string(),
                finish_reason: FinishReason::Tool,
                token_counts: TokenCounts { input: 1, output: 1 },
            },
            LlmResponse {
                text: serde_json::json!({"ok": true}).to_string(),
                finish_reason: FinishReason::Stop,
                token_counts: TokenCounts { input: 1, output: 1 },
            },
        ]));
        let worker = Worker::new(role(), "test-model", llm, EventBus::new(16));
        let snapshot = ProjectState::new("demo", 3).snapshot();

        let output = worker.invoke(invocation(), &snapshot).await.unwrap();
        assert_eq!(output.artifact["ok"], true);
    }

    #[test]
    fn backoff_schedule_doubles_up_to_cap() {
        let schedule = backoff_schedule(Duration::from_secs(8));
        assert_eq!(
            schedule,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn coerce_valid_json() {
        let schema = serde_json::json!({});
        let out = coerce_to_schema(r#"{"a": 1}"#, &schema).unwrap();
        assert_eq!(out["a"], 1);
    }

    #[test]
    fn coerce_rejects_non_json() {
        let schema = serde_json::json!({});
        assert!(coerce_to_schema("not json at all", &schema).is_err());
    }
}
