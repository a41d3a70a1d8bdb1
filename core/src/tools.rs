//! Capability interfaces usable by Workers.
//!
//! The core depends only on these traits; concrete implementations (a real
//! filesystem sandbox, a subprocess-based code runner, an HTTP LLM client,
//! …) are external collaborators and out of scope for this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TestRun;

/// Errors a [`FileStore`] may return.
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    Denied(String),
    #[error("too large: {0}")]
    TooLarge(String),
}

/// Sandboxed, whitelist-rooted filesystem access — the only writable path
/// into a project's workspace.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FileStoreError>;
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError>;
    async fn list(&self, dir: &str) -> Result<Vec<String>, FileStoreError>;
}

/// The result of a single sandboxed code execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("execution timed out")]
    Timeout,
    #[error("import not allowed: {0}")]
    ImportDenied(String),
    #[error("sandbox failure: {0}")]
    Failure(String),
}

/// Network-isolated, resource-capped code execution.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        language: &str,
        source: &str,
        timeout: std::time::Duration,
        import_allowlist: &[String],
    ) -> Result<ExecutionResult, SandboxError>;
}

#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error("test discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("runner failure: {0}")]
    Failure(String),
}

/// Deterministic test execution and result parsing.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, tests_path: &str, source_path: &str) -> Result<TestRun, TestRunnerError>;
}

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("refused: commits to protected branch {0} are not allowed")]
    ProtectedBranch(String),
    #[error("vcs failure: {0}")]
    Failure(String),
}

/// Version control operations.
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn init(&self) -> Result<(), VcsError>;
    async fn add(&self, path: &str) -> Result<(), VcsError>;
    async fn commit(&self, message: &str) -> Result<String, VcsError>;
    async fn branch(&self, name: &str) -> Result<(), VcsError>;
    async fn status(&self) -> Result<Vec<String>, VcsError>;
    async fn diff(&self) -> Result<String, VcsError>;
}

/// A single chat message in an [`LlmRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// LLM client request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRequest {
    pub role: String,
    pub messages: Vec<ChatMessage>,
    pub model_id: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub response_schema: Option<serde_json::Value>,
    pub stop: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Tool,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    pub token_counts: TokenCounts,
}

/// Errors returned by an [`LlmClient`], distinguishing retryable failures
/// from configuration/auth failures the Worker must not retry.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transient LLM failure: {0}")]
    Transient(String),
    #[error("permanent LLM failure: {0}")]
    Permanent(String),
}

/// The sole point of contact with a chat/completion endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Text embedding for the associative memory store. Errors are treated as
/// memory-disabled for that call, not propagated as a run failure.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}
