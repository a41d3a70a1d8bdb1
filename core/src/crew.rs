//! A bounded group of Workers executing an ordered task DAG under one of
//! two process policies: DAG construction with cycle detection and
//! topological ordering, plus bounded concurrent dispatch for the
//! Coordinated policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::instrument;

use crewflow_guardrails::chain::{ChainOutcome, GuardrailChain};
use crewflow_guardrails::guardrail::GuardrailContext;
use crewflow_guardrails::verdict::Verdict;

use crate::events::{Event, EventBus};
use crate::state::ProjectStateSnapshot;
use crate::worker::{TaskInvocation, Worker, WorkerError};

/// One unit of work in a Crew's task DAG.
pub struct Task {
    pub id: String,
    pub description: String,
    pub worker_role: String,
    pub expected_output_schema: Value,
    /// Task ids whose outputs are inlined into this task's context.
    pub dependencies: Vec<String>,
    pub guardrails: GuardrailChain,
    pub timeout: Duration,
    /// Per-task retry budget.
    pub max_retries: u32,
}

impl Task {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        worker_role: impl Into<String>,
        expected_output_schema: Value,
        guardrails: GuardrailChain,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker_role: worker_role.into(),
            expected_output_schema,
            dependencies: Vec::new(),
            guardrails,
            timeout: Duration::from_secs(120),
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, task_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = task_ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// How a Crew schedules its tasks.
pub enum ProcessPolicy {
    /// Execute tasks in topological order, one at a time.
    Sequential,
    /// A coordinator worker assigns roles per task; independent tasks may
    /// run concurrently, bounded by `max_concurrent` and
    /// `active_task_cap_per_worker`.
    Coordinated {
        max_concurrent: usize,
        active_task_cap_per_worker: usize,
    },
}

/// The merged set of task outputs and accumulated warnings from a
/// `kickoff`.
#[derive(Debug, Clone, Default)]
pub struct CrewOutput {
    pub outputs: HashMap<String, Value>,
    pub warnings: Vec<Verdict>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CrewError {
    #[error("dependency cycle detected (task '{0}' is its own transitive dependency)")]
    #[diagnostic(code(crewflow::crew::cycle))]
    Cycle(String),

    #[error("task '{task}' declares unresolved dependency '{dependency}'")]
    #[diagnostic(code(crewflow::crew::missing_dependency))]
    MissingDependency { task: String, dependency: String },

    #[error("no worker registered for role '{0}'")]
    #[diagnostic(code(crewflow::crew::unknown_role))]
    UnknownRole(String),

    #[error("task '{task_id}' failed guardrail '{guardrail}' ({severity}): {message}")]
    #[diagnostic(code(crewflow::crew::guardrail_blocked))]
    GuardrailBlocked {
        task_id: String,
        guardrail: String,
        message: String,
        severity: crewflow_guardrails::verdict::Severity,
    },

    #[error("task '{task_id}' exhausted its retry budget ({budget})")]
    #[diagnostic(code(crewflow::crew::retry_exhausted))]
    RetryExhausted { task_id: String, budget: u32 },

    #[error("worker failure on task '{task_id}': {source}")]
    #[diagnostic(code(crewflow::crew::worker_error))]
    Worker {
        task_id: String,
        #[source]
        source: WorkerError,
    },

    #[error("task '{task_id}' timed out after {timeout_secs}s")]
    #[diagnostic(code(crewflow::crew::timeout))]
    Timeout { task_id: String, timeout_secs: u64 },

    #[error("guardrail chain failed to evaluate for task '{task_id}': {source}")]
    #[diagnostic(code(crewflow::crew::chain_error))]
    Chain {
        task_id: String,
        #[source]
        source: crewflow_guardrails::chain::ChainError,
    },

    #[error("coordinator delegated task '{task_id}' to role '{role}', which is not registered")]
    #[diagnostic(code(crewflow::crew::illegal_delegation))]
    IllegalDelegation { task_id: String, role: String },
}

impl CrewError {
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::MissingDependency { task, .. } => Some(task),
            Self::GuardrailBlocked { task_id, .. }
            | Self::RetryExhausted { task_id, .. }
            | Self::Worker { task_id, .. }
            | Self::Timeout { task_id, .. }
            | Self::Chain { task_id, .. }
            | Self::IllegalDelegation { task_id, .. } => Some(task_id),
            Self::Cycle(_) | Self::UnknownRole(_) => None,
        }
    }
}

/// A bounded group of workers executing a task DAG.
pub struct Crew {
    tasks: Vec<Task>,
    policy: ProcessPolicy,
    workers: HashMap<String, Arc<Worker>>,
    coordinator: Option<Arc<Worker>>,
    events: EventBus,
}

impl Crew {
    /// Construct a Crew, eagerly validating that its task DAG has no cycles.
    /// Checked once here for the static task graph, and again per
    /// coordinator delegation at dispatch time, since the Coordinated
    /// policy's cycle detector must also refuse delegation cycles.
    pub fn new(
        tasks: Vec<Task>,
        policy: ProcessPolicy,
        workers: HashMap<String, Arc<Worker>>,
        events: EventBus,
    ) -> Result<Self, CrewError> {
        let crew = Self {
            tasks,
            policy,
            workers,
            coordinator: None,
            events,
        };
        crew.topological_order()?;
        Ok(crew)
    }

    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<Worker>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn task_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Kahn's algorithm: returns task indices in a valid execution order, or
    /// `Err` if a cycle exists or a dependency id is unresolved.
    fn topological_order(&self) -> Result<Vec<usize>, CrewError> {
        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];

        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let dep_idx = self.task_index(dep).ok_or_else(|| CrewError::MissingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                dependents[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: std::collections::VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut in_degree = in_degree;

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck = (0..self.tasks.len())
                .find(|i| !order.contains(i))
                .map(|i| self.tasks[i].id.clone())
                .unwrap_or_default();
            return Err(CrewError::Cycle(stuck));
        }
        Ok(order)
    }

    fn worker_for(&self, role: &str) -> Result<Arc<Worker>, CrewError> {
        self.workers
            .get(role)
            .cloned()
            .ok_or_else(|| CrewError::UnknownRole(role.to_string()))
    }

    /// Execute the task's guardrail-gated retry loop against an already
    /// dependency-satisfied task, returning its committed output and any
    /// accumulated warnings.
    async fn run_task(
        &self,
        task: &Task,
        snapshot: &ProjectStateSnapshot,
        dependency_context: Vec<(String, Value)>,
    ) -> Result<(Value, Vec<Verdict>), CrewError> {
        let worker = self.worker_for(&task.worker_role)?;
        let ctx = GuardrailContext::new(task.id.clone(), task.worker_role.clone());
        let mut feedback = Vec::new();

        for attempt in 0..=task.max_retries {
            let invocation = TaskInvocation {
                task_id: task.id.clone(),
                description: task.description.clone(),
                expected_output_schema: task.expected_output_schema.clone(),
                dependency_context: dependency_context.clone(),
                memory_recall: Vec::new(),
                feedback: feedback.clone(),
            };

            let output = tokio::time::timeout(task.timeout, worker.invoke(invocation, snapshot))
                .await
                .map_err(|_| CrewError::Timeout {
                    task_id: task.id.clone(),
                    timeout_secs: task.timeout.as_secs(),
                })?
                .map_err(|source| CrewError::Worker {
                    task_id: task.id.clone(),
                    source,
                })?;

            let retry_budget_remaining = attempt < task.max_retries;
            let (outcome, _metrics) = task
                .guardrails
                .evaluate(&output.artifact, &ctx, retry_budget_remaining)
                .await
                .map_err(|source| CrewError::Chain {
                    task_id: task.id.clone(),
                    source,
                })?;

            match outcome {
                ChainOutcome::Commit { warnings } => {
                    for w in &warnings {
                        self.events.emit(Event::GuardrailVerdict {
                            guardrail: w.category.clone(),
                            task_id: task.id.clone(),
                            verdict: "warn".into(),
                            message: w.message.clone(),
                        });
                    }
                    return Ok((output.artifact, warnings));
                }
                ChainOutcome::Retry { verdict } => {
                    self.events.emit(Event::GuardrailVerdict {
                        guardrail: verdict.category.clone(),
                        task_id: task.id.clone(),
                        verdict: "retry".into(),
                        message: verdict.message.clone(),
                    });
                    feedback.push(verdict.message);
                    continue;
                }
                ChainOutcome::Block { verdict } => {
                    self.events.emit(Event::GuardrailVerdict {
                        guardrail: verdict.category.clone(),
                        task_id: task.id.clone(),
                        verdict: "fail".into(),
                        message: verdict.message.clone(),
                    });
                    return Err(CrewError::GuardrailBlocked {
                        task_id: task.id.clone(),
                        guardrail: verdict.category,
                        message: verdict.message,
                        severity: verdict.severity,
                    });
                }
            }
        }

        Err(CrewError::RetryExhausted {
            task_id: task.id.clone(),
            budget: task.max_retries,
        })
    }

    /// Run the crew's tasks under its configured policy.
    #[instrument(skip(self, snapshot), fields(crew_tasks = self.tasks.len()), err)]
    pub async fn kickoff(&self, snapshot: &ProjectStateSnapshot) -> Result<CrewOutput, CrewError> {
        match self.policy {
            ProcessPolicy::Sequential => self.kickoff_sequential(snapshot).await,
            ProcessPolicy::Coordinated { .. } => self.kickoff_coordinated(snapshot).await,
        }
    }

    async fn kickoff_sequential(&self, snapshot: &ProjectStateSnapshot) -> Result<CrewOutput, CrewError> {
        let order = self.topological_order()?;
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut warnings = Vec::new();

        for idx in order {
            let task = &self.tasks[idx];
            let dependency_context = task
                .dependencies
                .iter()
                .map(|dep| (dep.clone(), outputs.get(dep).cloned().unwrap_or(Value::Null)))
                .collect();
            let (artifact, task_warnings) = self.run_task(task, snapshot, dependency_context).await?;
            outputs.insert(task.id.clone(), artifact);
            warnings.extend(task_warnings);
        }

        Ok(CrewOutput { outputs, warnings })
    }

    /// Ask the coordinator which registered role should handle each task,
    /// falling back to the task's own declared role when there is no
    /// coordinator or its response doesn't name a registered role.
    async fn coordinator_assignments(&self, snapshot: &ProjectStateSnapshot) -> HashMap<String, String> {
        let default: HashMap<String, String> = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.worker_role.clone()))
            .collect();

        let Some(coordinator) = &self.coordinator else {
            return default;
        };

        let batch_description: Vec<_> = self
            .tasks
            .iter()
            .map(|t| serde_json::json!({"task_id": t.id, "declared_role": t.worker_role}))
            .collect();
        let invocation = TaskInvocation {
            task_id: "__coordinator_assignment".into(),
            description: "Assign a registered worker role to each task in the batch.".into(),
            expected_output_schema: serde_json::json!({"type": "object"}),
            dependency_context: vec![("batch".into(), Value::Array(batch_description))],
            memory_recall: Vec::new(),
            feedback: Vec::new(),
        };

        match coordinator.invoke(invocation, snapshot).await {
            Ok(output) => {
                let Some(map) = output.artifact.as_object() else {
                    return default;
                };
                let mut assignments = default;
                for (task_id, role) in map {
                    if let Some(role) = role.as_str() {
                        if self.workers.contains_key(role) {
                            assignments.insert(task_id.clone(), role.to_string());
                        }
                    }
                }
                self.events.diagnostic(
                    "crew.coordinator",
                    format!("assigned {} task(s)", assignments.len()),
                );
                assignments
            }
            Err(_) => default,
        }
    }

    /// Dependency-wave scheduling: repeatedly run every not-yet-done task
    /// whose dependencies are all committed, bounded by `max_concurrent` and
    /// a per-worker active-task cap.
    async fn kickoff_coordinated(&self, snapshot: &ProjectStateSnapshot) -> Result<CrewOutput, CrewError> {
        let (max_concurrent, per_worker_cap) = match self.policy {
            ProcessPolicy::Coordinated {
                max_concurrent,
                active_task_cap_per_worker,
            } => (max_concurrent, active_task_cap_per_worker),
            ProcessPolicy::Sequential => unreachable!("kickoff_coordinated only called for Coordinated policy"),
        };
        self.topological_order()?; // cycle check up front

        let assignments = self.coordinator_assignments(snapshot).await;
        for task in &self.tasks {
            let role = &assignments[&task.id];
            if !self.workers.contains_key(role) {
                return Err(CrewError::IllegalDelegation {
                    task_id: task.id.clone(),
                    role: role.clone(),
                });
            }
        }

        let outputs: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
        let warnings: Arc<Mutex<Vec<Verdict>>> = Arc::new(Mutex::new(Vec::new()));
        let active_per_worker: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut done: HashSet<String> = HashSet::new();

        while done.len() < self.tasks.len() {
            let ready: Vec<&Task> = {
                let committed = outputs.lock().await;
                self.tasks
                    .iter()
                    .filter(|t| !done.contains(&t.id))
                    .filter(|t| t.dependencies.iter().all(|d| committed.contains_key(d)))
                    .collect()
            };
            if ready.is_empty() {
                let stuck = self.tasks.iter().find(|t| !done.contains(&t.id)).unwrap();
                return Err(CrewError::Cycle(stuck.id.clone()));
            }

            let mut handles = Vec::new();
            for task in ready {
                let role = assignments[&task.id].clone();
                {
                    let mut active = active_per_worker.lock().await;
                    let count = active.entry(role.clone()).or_insert(0);
                    if *count >= per_worker_cap {
                        // Worker is at capacity this wave; it will be
                        // retried on the next wave once a slot frees up.
                        continue;
                    }
                    *count += 1;
                }
                done.insert(task.id.clone());

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let dependency_context = {
                    let committed = outputs.lock().await;
                    task.dependencies
                        .iter()
                        .map(|dep| (dep.clone(), committed.get(dep).cloned().unwrap_or(Value::Null)))
                        .collect::<Vec<_>>()
                };
                let outputs = outputs.clone();
                let warnings = warnings.clone();
                let active_per_worker = active_per_worker.clone();
                let snapshot = snapshot.clone();
                let task_id = task.id.clone();

                handles.push(async move {
                    let _permit = permit;
                    let result = self.run_task(task, &snapshot, dependency_context).await;
                    active_per_worker
                        .lock()
                        .await
                        .entry(role)
                        .and_modify(|c| *c = c.saturating_sub(1));
                    match result {
                        Ok((artifact, task_warnings)) => {
                            outputs.lock().await.insert(task_id, artifact);
                            warnings.lock().await.extend(task_warnings);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                });
            }

            let results = futures_util::future::join_all(handles).await;
            for result in results {
                result?;
            }
        }

        Ok(CrewOutput {
            outputs: Arc::try_unwrap(outputs).expect("no outstanding refs").into_inner(),
            warnings: Arc::try_unwrap(warnings).expect("no outstanding refs").into_inner(),
        })
    }

    /// Diagnostic-only DOT export of the task dependency graph (spec_full
    /// SUPPLEMENTED FEATURES #5). Not on the execution path.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph crew {\n");
        for task in &self.tasks {
            dot.push_str(&format!("  \"{}\" [role=\"{}\"];\n", task.id, task.worker_role));
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                dot.push_str(&format!("  \"{dep}\" -> \"{}\";\n", task.id));
            }
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProjectState;
    use crate::tools::{ChatMessage, LlmClient, LlmError, LlmRequest, LlmResponse, FinishReason, TokenCounts};
    use crewflow_guardrails::verdict::Severity;
    use async_trait::async_trait;

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: r#"{"ok": true}"#.into(),
                finish_reason: FinishReason::Stop,
                token_counts: TokenCounts { input: 1, output: 1 },
            })
        }
    }

    fn worker(role: &str, events: EventBus) -> Arc<Worker> {
        Arc::new(Worker::new(
            crate::worker::RoleTemplate {
                role: role.into(),
                goal: "do the thing".into(),
                persona: "terse".into(),
            },
            "test-model",
            Arc::new(EchoLlm),
            events,
        ))
    }

    fn passing_chain() -> GuardrailChain {
        GuardrailChain::new(vec![])
    }

    #[tokio::test]
    async fn sequential_crew_runs_tasks_in_dependency_order() {
        let events = EventBus::new(16);
        let mut workers = HashMap::new();
        workers.insert("dev".to_string(), worker("dev", events.clone()));

        let t1 = Task::new("a", "first", "dev", serde_json::json!({}), passing_chain());
        let t2 = Task::new("b", "second", "dev", serde_json::json!({}), passing_chain()).depends_on(["a"]);

        let crew = Crew::new(vec![t1, t2], ProcessPolicy::Sequential, workers, events).unwrap();
        let snapshot = ProjectState::new("x", 3).snapshot();
        let output = crew.kickoff(&snapshot).await.unwrap();
        assert_eq!(output.outputs.len(), 2);
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected_at_construction() {
        let events = EventBus::new(16);
        let workers = HashMap::new();
        let t = Task::new("a", "first", "dev", serde_json::json!({}), passing_chain()).depends_on(["ghost"]);
        let err = Crew::new(vec![t], ProcessPolicy::Sequential, workers, events).unwrap_err();
        assert!(matches!(err, CrewError::MissingDependency { .. }));
    }

    #[tokio::test]
    async fn cycle_is_rejected_at_construction() {
        let events = EventBus::new(16);
        let workers = HashMap::new();
        let t1 = Task::new("a", "first", "dev", serde_json::json!({}), passing_chain()).depends_on(["b"]);
        let t2 = Task::new("b", "second", "dev", serde_json::json!({}), passing_chain()).depends_on(["a"]);
        let err = Crew::new(vec![t1, t2], ProcessPolicy::Sequential, workers, events).unwrap_err();
        assert!(matches!(err, CrewError::Cycle(_)));
    }

    #[tokio::test]
    async fn unknown_role_fails_kickoff() {
        let events = EventBus::new(16);
        let workers = HashMap::new();
        let t = Task::new("a", "first", "nobody", serde_json::json!({}), passing_chain());
        let crew = Crew::new(vec![t], ProcessPolicy::Sequential, workers, events).unwrap();
        let snapshot = ProjectState::new("x", 3).snapshot();
        let err = crew.kickoff(&snapshot).await.unwrap_err();
        assert!(matches!(err, CrewError::UnknownRole(_)));
    }

    #[tokio::test]
    async fn critical_guardrail_blocks_task_without_committing() {
        let events = EventBus::new(16);
        let mut workers = HashMap::new();
        workers.insert("dev".to_string(), worker("dev", events.clone()));

        struct AlwaysBlock;
        #[async_trait]
        impl crewflow_guardrails::guardrail::Guardrail for AlwaysBlock {
            fn id(&self) -> &str {
                "security.dangerous_pattern"
            }
            async fn evaluate(
                &self,
                _output: &serde_json::Value,
                _ctx: &GuardrailContext,
            ) -> Result<Verdict, crewflow_guardrails::guardrail::GuardrailError> {
                Ok(Verdict::fail("dangerous_pattern", "shell injection", false, Severity::Critical))
            }
        }
        let chain = GuardrailChain::new(vec![Arc::new(AlwaysBlock)]);
        let t = Task::new("a", "first", "dev", serde_json::json!({}), chain);
        let crew = Crew::new(vec![t], ProcessPolicy::Sequential, workers, events).unwrap();
        let snapshot = ProjectState::new("x", 3).snapshot();
        let err = crew.kickoff(&snapshot).await.unwrap_err();
        assert!(matches!(err, CrewError::GuardrailBlocked { .. }));
    }

    #[tokio::test]
    async fn coordinated_crew_runs_independent_tasks() {
        let events = EventBus::new(16);
        let mut workers = HashMap::new();
        workers.insert("dev".to_string(), worker("dev", events.clone()));

        let t1 = Task::new("a", "first", "dev", serde_json::json!({}), passing_chain());
        let t2 = Task::new("b", "second", "dev", serde_json::json!({}), passing_chain());
        let crew = Crew::new(
            vec![t1, t2],
            ProcessPolicy::Coordinated {
                max_concurrent: 4,
                active_task_cap_per_worker: 4,
            },
            workers,
            events,
        )
        .unwrap();
        let snapshot = ProjectState::new("x", 3).snapshot();
        let output = crew.kickoff(&snapshot).await.unwrap();
        assert_eq!(output.outputs.len(), 2);
    }

    #[test]
    fn dot_export_includes_declared_edges() {
        let events = EventBus::new(16);
        let workers = HashMap::new();
        let t1 = Task::new("a", "first", "dev", serde_json::json!({}), passing_chain());
        let t2 = Task::new("b", "second", "dev", serde_json::json!({}), passing_chain()).depends_on(["a"]);
        let crew = Crew::new(vec![t1, t2], ProcessPolicy::Sequential, workers, events).unwrap();
        let dot = crew.to_dot();
        assert!(dot.contains("\"a\" -> \"b\""));
    }
}
