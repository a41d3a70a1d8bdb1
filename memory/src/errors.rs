//! Error taxonomy for the associative and relational memory stores.

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    #[error("relational store error: {0}")]
    #[diagnostic(
        code(crewflow::memory::sqlx),
        help("check that persist_dir is writable and the sqlite file is not locked by another process")
    )]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error in memory store: {0}")]
    #[diagnostic(code(crewflow::memory::serde))]
    Serde(#[from] serde_json::Error),

    #[error("unknown scope: {0}")]
    #[diagnostic(code(crewflow::memory::unknown_scope))]
    UnknownScope(String),
}
