//! # crewflow-core
//!
//! The orchestration core of `crewflow`, an autonomous software-delivery
//! orchestrator. Given a natural-language project description, a [`flow`]
//! drives a project through five phases — Intake, Planning, Development,
//! Testing, Deployment — dispatching [`crew`]-scheduled [`worker`] task
//! attempts gated by `crewflow-guardrails` chains, against a single
//! invariant-checked [`state::ProjectState`].
//!
//! ## Module guide
//!
//! - [`state`] — `ProjectState`, `Phase`, the transition table, and the
//!   invariant-checked mutators that are the only legal way to change them.
//! - [`tools`] — capability interfaces (`FileStore`, `Sandbox`, `TestRunner`,
//!   `Vcs`, `LlmClient`, `Embedder`) a Worker may be bound to; specified by
//!   contract only, no bundled implementation.
//! - [`worker`] — a role-bound LLM invoker with retry/backoff and output
//!   schema coercion.
//! - [`crew`] — a bounded group of Workers executing an ordered task DAG
//!   under a Sequential or Coordinated process policy.
//! - [`flow`] — the top-level phase state machine: routers, error
//!   classification, the circuit breaker, and human-feedback suspension.
//! - [`runtime`] — the `Checkpointer` abstraction for crash-resumable
//!   persistence of `ProjectState`.
//! - [`events`] — the audit-trail event bus every tool call, guardrail
//!   verdict, and router decision is emitted to.
//! - [`config`] — `RunOptions`, the one explicit options record threaded
//!   through `run(description, options)`.
//! - [`errors`] — the orchestrator-wide error taxonomy.
//! - [`telemetry`] — process-wide `tracing` subscriber setup.

pub mod config;
pub mod crew;
pub mod errors;
pub mod events;
pub mod flow;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod tools;
pub mod worker;
