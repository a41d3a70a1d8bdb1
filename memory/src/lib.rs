//! # crewflow-memory
//!
//! Two independent memory stores for the crewflow orchestrator:
//! [`associative`] (session-scoped embedding recall, partitioned by
//! project and purged on run completion) and [`relational`] (append-only
//! cross-session run/phase/role metrics, never read by the flow control
//! path). Both expose a "null" implementation for `memory_enabled = false`
//! runs so callers never need to branch on that flag themselves.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod associative;
pub mod errors;
pub mod relational;

pub mod prelude {
    pub use crate::associative::{AssociativeStore, Embedder, InMemoryAssociativeStore, NullAssociativeStore, RecallWeights};
    pub use crate::errors::MemoryError;
    pub use crate::relational::{NullRelationalStore, PhaseMetric, RelationalStore, RoleMetric, RunRecord, SqliteRelationalStore};
}
