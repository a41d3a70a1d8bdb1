//! The top-level phase state machine: a single orchestrating loop drives
//! a closed set of phases, persists after every transition, and can
//! suspend for an out-of-band human response before resuming the fixed
//! Intake/Planning/Development/Testing/Deployment pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::config::RunOptions;
use crate::crew::{Crew, CrewError, CrewOutput};
use crate::events::{Event, EventBus};
use crate::runtime::{Checkpointer, PersistenceError};
use crate::state::{Phase, ProjectState};
use crate::worker::WorkerError;

/// A paused run's request for an out-of-band human response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<String>,
    /// A redacted summary of state handed to the human, not the raw
    /// snapshot.
    pub context_digest: String,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    /// Taken automatically if `deadline` elapses with no response.
    pub default_action: String,
}

/// A human's (or timeout's) answer to a [`FeedbackRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub request_id: Uuid,
    pub selected_option: String,
    pub free_text: Option<String>,
}

struct PendingFeedback {
    request: FeedbackRequest,
    response: Option<FeedbackResponse>,
}

/// Brokers suspension/resumption of a single in-flight [`FeedbackRequest`]
/// between the Flow loop and an external caller of
/// [`Flow::submit_response`]. One hub per `Flow`; at most one outstanding
/// request at a time, matching `AWAITING_HUMAN` being a single phase.
///
/// Unlike a blocking rendezvous, parking never waits inline for a reply:
/// `run()` returns `RunOutcome::AwaitingHuman` as soon as a request is
/// parked, and a later call to `run()` observes whatever `submit_response`
/// (or an elapsed deadline, resolved to `default_action`) left behind.
#[derive(Default)]
struct FeedbackHub {
    pending: Mutex<Option<PendingFeedback>>,
}

impl FeedbackHub {
    async fn park(&self, request: FeedbackRequest) {
        *self.pending.lock().await = Some(PendingFeedback { request, response: None });
    }

    async fn current(&self) -> Option<FeedbackRequest> {
        self.pending.lock().await.as_ref().map(|p| p.request.clone())
    }

    async fn submit(&self, response: FeedbackResponse) -> Result<(), FlowError> {
        let mut slot = self.pending.lock().await;
        let Some(pending) = slot.as_mut() else {
            return Err(FlowError::NoPendingFeedback);
        };
        if pending.request.id != response.request_id {
            return Err(FlowError::FeedbackIdMismatch {
                expected: pending.request.id,
                got: response.request_id,
            });
        }
        pending.response = Some(response);
        Ok(())
    }

    /// Returns the resolved `(request, response)` pair, if any, and clears
    /// the pending slot. A response is resolved either because
    /// `submit_response` was called, or because the request's deadline has
    /// elapsed, in which case `default_action` is applied automatically.
    async fn resolve(&self) -> Option<(FeedbackRequest, FeedbackResponse)> {
        let mut slot = self.pending.lock().await;
        let pending = slot.as_ref()?;
        if let Some(response) = &pending.response {
            let out = (pending.request.clone(), response.clone());
            *slot = None;
            return Some(out);
        }
        if let Some(deadline) = pending.request.deadline {
            if chrono::Utc::now() >= deadline {
                let response = FeedbackResponse {
                    request_id: pending.request.id,
                    selected_option: pending.request.default_action.clone(),
                    free_text: None,
                };
                let out = (pending.request.clone(), response);
                *slot = None;
                return Some(out);
            }
        }
        None
    }
}

/// Tracks consecutive failures within a single phase, tripping once a
/// fixed threshold of consecutive failures is reached.
#[derive(Default)]
struct CircuitBreaker {
    phase: Mutex<Option<Phase>>,
    consecutive_failures: AtomicU32,
}

const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

impl CircuitBreaker {
    /// Record a failure in `phase`, resetting the counter if the phase
    /// changed since the last failure. Returns `true` once the threshold is
    /// reached.
    async fn record_failure(&self, phase: Phase) -> bool {
        let mut current = self.phase.lock().await;
        if *current != Some(phase) {
            *current = Some(phase);
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        count >= CIRCUIT_BREAKER_THRESHOLD
    }

    async fn record_success(&self, phase: Phase) {
        let mut current = self.phase.lock().await;
        *current = Some(phase);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }
}

/// How a run concluded.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Complete { project_id: Uuid },
    AwaitingHuman { project_id: Uuid, request: FeedbackRequest },
    Error { project_id: Uuid, reason: String },
    /// A fatal failure the run cannot retry its way out of: a missing
    /// model, an unresolvable role, a missing crew registration. Distinct
    /// from [`Self::Error`] only at the CLI boundary — the `Phase` both
    /// land in is `ERROR` either way.
    ConfigurationError { project_id: Uuid, reason: String },
    Cancelled { project_id: Uuid },
}

impl RunOutcome {
    /// Stable CLI exit codes.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete { .. } => 0,
            Self::AwaitingHuman { .. } => 2,
            Self::Error { .. } => 3,
            Self::Cancelled { .. } => 4,
            Self::ConfigurationError { .. } => 5,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum FlowError {
    #[error("persistence failure: {0}")]
    #[diagnostic(code(crewflow::flow::persistence))]
    Persistence(#[from] PersistenceError),

    #[error("no project found for id {0}")]
    #[diagnostic(code(crewflow::flow::not_found))]
    ProjectNotFound(Uuid),

    #[error("no feedback request is currently pending")]
    #[diagnostic(code(crewflow::flow::no_pending_feedback))]
    NoPendingFeedback,

    #[error("feedback response id {got} does not match the pending request id {expected}")]
    #[diagnostic(code(crewflow::flow::feedback_id_mismatch))]
    FeedbackIdMismatch { expected: Uuid, got: Uuid },

    #[error("the run was cancelled")]
    #[diagnostic(code(crewflow::flow::cancelled))]
    Cancelled,

    #[error("illegal phase transition: {0}")]
    #[diagnostic(code(crewflow::flow::invariant_violation))]
    InvariantViolation(String),
}

/// A function that builds the [`Crew`] for a phase, given the current
/// snapshot and run options. Crews are rebuilt per attempt so task
/// descriptions can incorporate the latest feedback/context.
pub type CrewFactory = Arc<dyn Fn(&ProjectState, &RunOptions) -> Result<Crew, CrewError> + Send + Sync>;

/// The top-level phase state machine.
pub struct Flow {
    state: Mutex<ProjectState>,
    options: RunOptions,
    checkpointer: Arc<dyn Checkpointer>,
    events: EventBus,
    crew_factories: HashMap<Phase, CrewFactory>,
    circuit_breaker: CircuitBreaker,
    feedback: FeedbackHub,
    cancelled: AtomicBool,
}

impl Flow {
    #[must_use]
    pub fn new(
        state: ProjectState,
        options: RunOptions,
        checkpointer: Arc<dyn Checkpointer>,
        events: EventBus,
        crew_factories: HashMap<Phase, CrewFactory>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            options,
            checkpointer,
            events,
            crew_factories,
            circuit_breaker: CircuitBreaker::default(),
            feedback: FeedbackHub::default(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Rebuild a `Flow` from the last persisted snapshot, resuming from
    /// the last successful phase boundary.
    pub async fn resume_from_checkpoint(
        project_id: Uuid,
        options: RunOptions,
        checkpointer: Arc<dyn Checkpointer>,
        events: EventBus,
        crew_factories: HashMap<Phase, CrewFactory>,
    ) -> Result<Self, FlowError> {
        let state = checkpointer
            .load(project_id)
            .await?
            .ok_or(FlowError::ProjectNotFound(project_id))?;
        Ok(Self::new(state, options, checkpointer, events, crew_factories))
    }

    /// Signal run-wide cancellation, moving the Flow to `Error` with
    /// reason `"cancelled"`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub async fn current_phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Expose the pending request, if any, for an external caller polling
    /// for work to hand to a human.
    pub async fn await_request(&self) -> Option<FeedbackRequest> {
        self.feedback.current().await
    }

    /// Deliver a human's (or automation's) answer to the pending
    /// [`FeedbackRequest`], unblocking the parked phase.
    pub async fn submit_response(&self, response: FeedbackResponse) -> Result<(), FlowError> {
        self.feedback.submit(response).await
    }

    async fn persist(&self) -> Result<(), FlowError> {
        let state = self.state.lock().await;
        self.checkpointer.save(&state).await?;
        Ok(())
    }

    async fn transition(&self, to: Phase, reason: impl Into<String> + Clone) -> Result<(), FlowError> {
        let from = {
            let mut state = self.state.lock().await;
            let from = state.phase;
            if let Err(err) = state.transition(to, reason.clone()) {
                state.record_error("invariant_violation", err.to_string(), false);
                drop(state);
                self.persist().await?;
                return Err(FlowError::InvariantViolation(err.to_string()));
            }
            from
        };
        self.events.emit(Event::RouterDecision {
            phase: from,
            next_phase: to,
            reasoning: reason.into(),
        });
        self.persist().await
    }

    async fn record_error(&self, kind: &str, message: &str, recoverable: bool) -> Result<(), FlowError> {
        self.state.lock().await.record_error(kind, message, recoverable);
        self.persist().await
    }

    fn make_digest(state: &ProjectState) -> String {
        format!(
            "phase={} files={} retries={:?}",
            state.phase,
            state.files.len(),
            state.retries
        )
    }

    /// Park the Flow in `AWAITING_HUMAN` and emit the request. Does not
    /// wait for a response inline — the run loop surfaces
    /// `RunOutcome::AwaitingHuman` to the caller immediately, and resumption
    /// happens on a later call to `run()` once `submit_response` has been
    /// called (or the request's deadline has elapsed).
    async fn suspend_for_human(
        &self,
        question: impl Into<String>,
        options: Vec<String>,
        default_action: impl Into<String>,
    ) -> StepOutcome {
        let suspended_from = self.state.lock().await.phase;
        if let Err(e) = self.transition(Phase::AwaitingHuman, "awaiting human input").await {
            return StepOutcome::Errored(e.to_string());
        }

        let digest = Self::make_digest(&*self.state.lock().await);
        let request = FeedbackRequest {
            id: Uuid::new_v4(),
            question: question.into(),
            options,
            context_digest: digest,
            deadline: Some(chrono::Utc::now() + chrono::Duration::from_std(self.options.feedback_timeout).unwrap()),
            default_action: default_action.into(),
        };
        self.events.diagnostic(
            "flow.awaiting_human",
            format!("suspended from {suspended_from}: {}", request.question),
        );
        self.feedback.park(request.clone()).await;
        StepOutcome::AwaitingHuman(request)
    }

    /// AWAITING_HUMAN: resolve a parked request against whatever response
    /// is available, or hand control back to the caller if nothing has
    /// arrived yet. `selected_option == "abort"` (the universal default
    /// action) ends the run; any other answer resumes the phase it
    /// suspended from.
    async fn step_awaiting_human(&self) -> StepOutcome {
        match self.feedback.resolve().await {
            Some((request, response)) => {
                let suspended_from = self.state.lock().await.suspended_from;
                self.state.lock().await.metadata.insert(
                    "last_feedback_response".into(),
                    serde_json::to_value(&response).unwrap_or(Value::Null),
                );
                if response.selected_option == "abort" {
                    return StepOutcome::Errored(format!("human feedback aborted the run: {}", request.question));
                }
                let Some(from) = suspended_from else {
                    return StepOutcome::Errored("awaiting_human has no suspension source".into());
                };
                match self.transition(from, "resumed from awaiting human").await {
                    Ok(()) => StepOutcome::Continue,
                    Err(e) => StepOutcome::Errored(e.to_string()),
                }
            }
            None => match self.feedback.current().await {
                Some(request) => StepOutcome::AwaitingHuman(request),
                None => StepOutcome::Errored("awaiting_human entered with no pending request".into()),
            },
        }
    }

    fn crew_for(&self, phase: Phase) -> Option<CrewFactory> {
        self.crew_factories.get(&phase).cloned()
    }

    /// Drive the Flow from its current phase to a terminal outcome.
    #[instrument(skip(self), fields(project_id = tracing::field::Empty))]
    pub async fn run(&self) -> RunOutcome {
        let project_id = self.state.lock().await.project_id;
        tracing::Span::current().record("project_id", tracing::field::display(project_id));

        loop {
            if self.is_cancelled() {
                let _ = self.record_error("cancelled", "run-wide cancellation requested", false).await;
                let _ = self.transition_to_error("cancelled").await;
                return RunOutcome::Cancelled { project_id };
            }

            let phase = self.state.lock().await.phase;
            let outcome = match phase {
                Phase::Intake => self.step_intake().await,
                Phase::Planning | Phase::Development | Phase::Testing | Phase::Deployment => {
                    self.step_crew_phase(phase).await
                }
                Phase::AwaitingHuman => self.step_awaiting_human().await,
                Phase::Complete => return RunOutcome::Complete { project_id },
                Phase::Error => {
                    let reason = self
                        .state
                        .lock()
                        .await
                        .errors
                        .last()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "unknown".into());
                    return RunOutcome::Error { project_id, reason };
                }
            };

            match outcome {
                StepOutcome::Continue => continue,
                StepOutcome::AwaitingHuman(request) => {
                    return RunOutcome::AwaitingHuman { project_id, request };
                }
                StepOutcome::ConfigurationError(reason) => {
                    let _ = self.transition_to_error(&reason).await;
                    return RunOutcome::ConfigurationError { project_id, reason };
                }
                StepOutcome::Errored(reason) => {
                    let _ = self.transition_to_error(&reason).await;
                    return RunOutcome::Error { project_id, reason };
                }
            }
        }
    }

    async fn transition_to_error(&self, reason: &str) -> Result<(), FlowError> {
        let phase = self.state.lock().await.phase;
        if phase.is_terminal() {
            return Ok(());
        }
        if phase == Phase::AwaitingHuman {
            // ERROR is not a legal edge from AWAITING_HUMAN; return to the
            // suspension source first so the transition table is satisfied.
            let suspended_from = self.state.lock().await.suspended_from;
            if let Some(from) = suspended_from {
                self.transition(from, "forced out of awaiting-human for error").await?;
            }
        }
        self.transition(Phase::Error, reason).await
    }

    /// INTAKE: validate the description, then advance.
    async fn step_intake(&self) -> StepOutcome {
        let (description, max_len) = {
            let state = self.state.lock().await;
            (state.description.clone(), self.options.max_description_length)
        };

        if description.trim().is_empty() {
            let _ = self.record_error("configuration", "empty project description", false).await;
            return StepOutcome::ConfigurationError("empty project description".into());
        }
        if description.len() > max_len {
            let _ = self
                .record_error("configuration", format!("description exceeds cap of {max_len}"), false)
                .await;
            return StepOutcome::ConfigurationError("description exceeds configured length cap".into());
        }
        if looks_ambiguous(&description) {
            return self
                .suspend_for_human(
                    "The project description is too vague to plan from. Can you clarify scope and constraints?",
                    vec!["clarify".into(), "abort".into()],
                    "abort",
                )
                .await;
        }

        match self.transition(Phase::Planning, "description validated").await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Errored(e.to_string()),
        }
    }

    /// The shared driver for PLANNING/DEVELOPMENT/TESTING/DEPLOYMENT: build
    /// the phase's crew, run it, route on the result, and feed the circuit
    /// breaker.
    async fn step_crew_phase(&self, phase: Phase) -> StepOutcome {
        let Some(factory) = self.crew_for(phase) else {
            let msg = format!("no crew registered for phase {phase}");
            let _ = self.record_error("configuration", &msg, false).await;
            return StepOutcome::ConfigurationError(msg);
        };

        let (state_snapshot_owner, options) = {
            let state = self.state.lock().await;
            (state.clone(), self.options.clone())
        };

        let crew = match factory(&state_snapshot_owner, &options) {
            Ok(crew) => crew,
            Err(e) => {
                let msg = format!("failed to build crew for {phase}: {e}");
                let _ = self.record_error("configuration", &msg, false).await;
                return StepOutcome::ConfigurationError(msg);
            }
        };

        let snapshot = state_snapshot_owner.snapshot();
        let result = crew.kickoff(&snapshot).await;

        match result {
            Ok(output) => {
                self.circuit_breaker.record_success(phase).await;
                self.route_success(phase, output).await
            }
            Err(err) => self.handle_crew_error(phase, err).await,
        }
    }

    async fn handle_crew_error(&self, phase: Phase, err: CrewError) -> StepOutcome {
        if let CrewError::UnknownRole(role) = &err {
            let msg = format!("no worker registered for role '{role}'");
            let _ = self.record_error("configuration", &msg, false).await;
            return StepOutcome::ConfigurationError(msg);
        }
        if let CrewError::Worker {
            source: WorkerError::Permanent { .. },
            ..
        } = &err
        {
            let msg = err.to_string();
            let _ = self.record_error("configuration", &msg, false).await;
            return StepOutcome::ConfigurationError(msg);
        }

        let _ = self.record_error("crew_failure", err.to_string(), true).await;
        let tripped = self.circuit_breaker.record_failure(phase).await;

        let is_critical_guardrail = matches!(
            err,
            CrewError::GuardrailBlocked {
                severity: crewflow_guardrails::verdict::Severity::Critical,
                ..
            }
        );

        if tripped || is_critical_guardrail {
            if phase.supports_awaiting_human_on_exhaustion() && !is_critical_guardrail {
                return self.route_budget_exhausted(phase).await;
            }
            return StepOutcome::Errored(format!("circuit breaker tripped in {phase}: {err}"));
        }

        match err {
            CrewError::RetryExhausted { .. } => self.route_budget_exhausted(phase).await,
            other => StepOutcome::Errored(other.to_string()),
        }
    }

    async fn route_budget_exhausted(&self, phase: Phase) -> StepOutcome {
        if phase.supports_awaiting_human_on_exhaustion() {
            self.suspend_for_human(
                format!("{phase} exhausted its retry budget. How should the run proceed?"),
                vec!["retry".into(), "abort".into()],
                "abort",
            )
            .await
        } else {
            StepOutcome::Errored(format!("{phase} exhausted its retry budget"))
        }
    }

    /// Dispatch to the per-phase router.
    async fn route_success(&self, phase: Phase, output: CrewOutput) -> StepOutcome {
        match phase {
            Phase::Planning => self.router_planning(output).await,
            Phase::Development => self.router_development(output).await,
            Phase::Testing => self.router_testing(output).await,
            Phase::Deployment => self.router_deployment(output).await,
            Phase::Intake | Phase::AwaitingHuman | Phase::Complete | Phase::Error => {
                unreachable!("step_crew_phase only dispatches for PLANNING/DEVELOPMENT/TESTING/DEPLOYMENT")
            }
        }
    }

    async fn router_planning(&self, output: CrewOutput) -> StepOutcome {
        let requirements = output.outputs.get("requirements").cloned();
        let architecture = output.outputs.get("architecture").cloned();
        let confidence = output
            .outputs
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);

        if requirements.is_none() || architecture.is_none() || confidence < f64::from(self.options.planning_confidence_threshold) {
            return self
                .suspend_for_human(
                    "Planning output is incomplete or low-confidence. Please clarify requirements.",
                    vec!["clarify".into(), "abort".into()],
                    "abort",
                )
                .await;
        }

        if let Some(req) = requirements.and_then(|v| serde_json::from_value(v).ok()) {
            self.state.lock().await.requirements = Some(req);
        }
        if let Some(arch) = architecture.and_then(|v| serde_json::from_value(v).ok()) {
            self.state.lock().await.architecture = Some(arch);
        }

        match self.transition(Phase::Development, "planning complete").await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Errored(e.to_string()),
        }
    }

    async fn router_development(&self, output: CrewOutput) -> StepOutcome {
        {
            let mut state = self.state.lock().await;
            for (task_id, value) in &output.outputs {
                if let Some(file) = value.as_object() {
                    let path = file.get("path").and_then(Value::as_str).unwrap_or(task_id).to_string();
                    let content = file.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
                    let language = file.get("language").and_then(Value::as_str).unwrap_or("text").to_string();
                    let _ = state.append_file(path, content, language, crate::state::FileKind::Source, vec![]);
                }
            }
        }
        match self.transition(Phase::Testing, "development complete").await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Errored(e.to_string()),
        }
    }

    async fn router_testing(&self, output: CrewOutput) -> StepOutcome {
        let test_run: Option<crate::state::TestRun> = output
            .outputs
            .get("test_results")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let passed = test_run.as_ref().map(crate::state::TestRun::all_passed).unwrap_or(false);
        let coverage_ok = test_run
            .as_ref()
            .map(|t| t.coverage >= self.options.coverage_threshold)
            .unwrap_or(false);

        if let Some(run) = test_run.clone() {
            self.state.lock().await.test_results = Some(run);
        }

        if passed && coverage_ok {
            return match self.transition(Phase::Deployment, "tests passed").await {
                Ok(()) => StepOutcome::Continue,
                Err(e) => StepOutcome::Errored(e.to_string()),
            };
        }

        let phase = Phase::Testing;
        let bumped = self.state.lock().await.bump_retry(phase);
        match bumped {
            Ok(_) => {
                let feedback = test_run
                    .map(|t| {
                        t.failing_cases()
                            .iter()
                            .map(|c| format!("{}: {}", c.name, c.trace.clone().unwrap_or_default()))
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                    .unwrap_or_default();
                self.state
                    .lock()
                    .await
                    .metadata
                    .insert("last_test_feedback".into(), Value::String(feedback));
                match self.transition(Phase::Development, "tests failed, retrying").await {
                    Ok(()) => StepOutcome::Continue,
                    Err(e) => StepOutcome::Errored(e.to_string()),
                }
            }
            Err(_) => self.route_budget_exhausted(phase).await,
        }
    }

    async fn router_deployment(&self, output: CrewOutput) -> StepOutcome {
        if let Some(bundle) = output
            .outputs
            .get("deployment_bundle")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
        {
            self.state.lock().await.deployment = Some(bundle);
        }
        match self.transition(Phase::Complete, "deployment complete").await {
            Ok(()) => StepOutcome::Continue,
            Err(e) => StepOutcome::Errored(e.to_string()),
        }
    }
}

enum StepOutcome {
    Continue,
    AwaitingHuman(FeedbackRequest),
    Errored(String),
    ConfigurationError(String),
}

/// Heuristic ambiguity signal for Intake validation. A description this
/// short, with no concrete nouns a planner could act on, is treated as
/// ambiguous and routed to human feedback rather than rejected outright.
fn looks_ambiguous(description: &str) -> bool {
    let word_count = description.split_whitespace().count();
    word_count < 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InMemoryCheckpointer;
    use crewflow_guardrails::chain::GuardrailChain;
    use crate::crew::{ProcessPolicy, Task};
    use crate::worker::{RoleTemplate, Worker};
    use crate::tools::{ChatMessage, FinishReason, LlmClient, LlmError, LlmRequest, LlmResponse, TokenCounts};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct EchoLlm(String);

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: self.0.clone(),
                finish_reason: FinishReason::Stop,
                token_counts: TokenCounts { input: 1, output: 1 },
            })
        }
    }

    fn test_options() -> RunOptions {
        let mut opts = RunOptions::default();
        opts.feedback_timeout = Duration::from_millis(50);
        opts.max_retries = 2;
        opts
    }

    fn empty_crew_factories() -> HashMap<Phase, CrewFactory> {
        HashMap::new()
    }

    #[tokio::test]
    async fn intake_rejects_empty_description() {
        let state = ProjectState::new("", 3);
        let flow = Flow::new(
            state,
            test_options(),
            Arc::new(InMemoryCheckpointer::new()),
            EventBus::new(16),
            empty_crew_factories(),
        );
        let outcome = flow.run().await;
        assert!(matches!(outcome, RunOutcome::ConfigurationError { .. }));
        assert_eq!(outcome.exit_code(), 5);
        assert_eq!(flow.current_phase().await, Phase::Error);
    }

    #[tokio::test]
    async fn intake_rejects_oversized_description() {
        let mut opts = test_options();
        opts.max_description_length = 10;
        let state = ProjectState::new("a".repeat(100), 3);
        let flow = Flow::new(state, opts, Arc::new(InMemoryCheckpointer::new()), EventBus::new(16), empty_crew_factories());
        let outcome = flow.run().await;
        assert!(matches!(outcome, RunOutcome::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn ambiguous_intake_suspends_for_human() {
        let state = ProjectState::new("make it fast", 3);
        let flow = Flow::new(
            state,
            test_options(),
            Arc::new(InMemoryCheckpointer::new()),
            EventBus::new(16),
            empty_crew_factories(),
        );
        let outcome = flow.run().await;
        assert!(matches!(outcome, RunOutcome::AwaitingHuman { .. }));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(flow.current_phase().await, Phase::AwaitingHuman);
    }

    #[tokio::test]
    async fn submitting_a_non_abort_response_resumes_the_suspended_phase() {
        let state = ProjectState::new("make it fast", 3);
        let flow = Flow::new(
            state,
            test_options(),
            Arc::new(InMemoryCheckpointer::new()),
            EventBus::new(16),
            empty_crew_factories(),
        );

        let first = flow.run().await;
        let request = match first {
            RunOutcome::AwaitingHuman { request, .. } => request,
            other => panic!("expected AwaitingHuman, got {other:?}"),
        };

        flow.submit_response(FeedbackResponse {
            request_id: request.id,
            selected_option: "clarify".into(),
            free_text: Some("it's an inventory service".into()),
        })
        .await
        .unwrap();

        // No crew is registered for PLANNING in this test, so resuming
        // past the clarified intake surfaces as a configuration error
        // rather than looping back to AwaitingHuman.
        let second = flow.run().await;
        assert!(matches!(second, RunOutcome::ConfigurationError { .. }));
        assert_eq!(flow.current_phase().await, Phase::Error);
    }

    #[tokio::test]
    async fn missing_crew_factory_errors_out() {
        let mut state = ProjectState::new("build a thing with enough words", 3);
        state.transition(Phase::Planning, "skip intake for this test").unwrap();
        let flow = Flow::new(
            state,
            test_options(),
            Arc::new(InMemoryCheckpointer::new()),
            EventBus::new(16),
            empty_crew_factories(),
        );
        let outcome = flow.run().await;
        assert!(matches!(outcome, RunOutcome::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn planning_incomplete_output_suspends_for_human() {
        let mut state = ProjectState::new("build a thing with enough words", 3);
        state.transition(Phase::Planning, "skip intake for this test").unwrap();

        let events = EventBus::new(16);
        let llm: Arc<dyn LlmClient> = Arc::new(EchoLlm(
            serde_json::json!({
                "project_name": "demo", "description": "x", "target_users": [],
                "user_stories": [], "non_functional_requirements": [], "assumptions": [], "constraints": []
            })
            .to_string(),
        ));
        let worker = Arc::new(Worker::new(
            RoleTemplate {
                role: "planner".into(),
                goal: "plan".into(),
                persona: "terse".into(),
            },
            "test-model",
            llm,
            events.clone(),
        ));

        let mut factories: HashMap<Phase, CrewFactory> = HashMap::new();
        factories.insert(
            Phase::Planning,
            Arc::new(move |_state, _opts| {
                let mut workers = Map::new();
                workers.insert("planner".to_string(), worker.clone());
                let tasks = vec![Task::new(
                    "requirements",
                    "produce requirements",
                    "planner",
                    serde_json::json!({}),
                    GuardrailChain::new(vec![]),
                )];
                Crew::new(tasks, ProcessPolicy::Sequential, workers, EventBus::new(16))
            }),
        );

        let flow = Flow::new(state, test_options(), Arc::new(InMemoryCheckpointer::new()), events, factories);
        let outcome = flow.run().await;
        // Requirements task id is "requirements", not "architecture"/"confidence",
        // so this should suspend for human clarification rather than advance.
        assert!(matches!(outcome, RunOutcome::AwaitingHuman { .. }));
    }

    #[tokio::test]
    async fn feedback_response_with_mismatched_id_is_rejected() {
        let state = ProjectState::new("make it fast", 3);
        let flow = Flow::new(
            state,
            test_options(),
            Arc::new(InMemoryCheckpointer::new()),
            EventBus::new(16),
            empty_crew_factories(),
        );
        let outcome = flow.run().await;
        assert!(matches!(outcome, RunOutcome::AwaitingHuman { .. }));

        let result = flow
            .submit_response(FeedbackResponse {
                request_id: Uuid::new_v4(),
                selected_option: "clarify".into(),
                free_text: None,
            })
            .await;
        assert!(matches!(result, Err(FlowError::FeedbackIdMismatch { .. })));
    }
}
