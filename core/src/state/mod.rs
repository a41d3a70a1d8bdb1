//! Typed value objects for project state, phase, transitions, and errors,
//! plus the invariant-checked mutators that are the only legal way to
//! change them.

pub mod phase;
pub mod project;

pub use phase::{Phase, Transition};
pub use project::{
    Architecture, CodeFile, Component, DecisionRecord, DeploymentBundle, ErrorEntry, FileKind,
    InvariantError, MoscowPriority, ProjectState, ProjectStateSnapshot, Requirements, TechChoice,
    TestCase, TestRun, UserStory,
};
