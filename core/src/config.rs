//! Run configuration.
//!
//! `RunOptions` is the one explicit options record threaded through
//! `run(description, options)` and every constructor that needs it — there
//! is no process-wide singleton config.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Errors raised while loading or validating a [`RunOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("invalid environment variable {key}: {value}")]
    InvalidEnv { key: String, value: String },
    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// `options` record recognized by `run(description, options)`.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RunOptions {
    #[validate(range(min = 0, max = 20))]
    pub max_retries: u32,
    pub memory_enabled: bool,
    pub persist_dir: PathBuf,
    /// Intake's length cap on the raw project description.
    #[validate(range(min = 1))]
    pub max_description_length: usize,
    #[validate(range(min = 0.0, max = 1.0))]
    pub coverage_threshold: f64,
    #[validate(range(min = 0.0, max = 10.0))]
    pub quality_score_threshold: f64,
    pub workspace_roots: Vec<PathBuf>,
    pub role_models: BTreeMap<String, String>,
    pub dangerous_patterns: Vec<String>,
    #[serde(with = "humantime_secs")]
    pub feedback_timeout: Duration,
    /// Confidence threshold below which Planning's self-reported
    /// confidence routes to `AWAITING_HUMAN` instead of advancing.
    #[validate(range(min = 0.0, max = 1.0))]
    pub planning_confidence_threshold: f32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            memory_enabled: true,
            persist_dir: PathBuf::from("./crewflow-runs"),
            max_description_length: 10_000,
            coverage_threshold: 0.8,
            quality_score_threshold: 7.0,
            workspace_roots: vec![PathBuf::from("./workspace")],
            role_models: BTreeMap::new(),
            dangerous_patterns: Vec::new(),
            feedback_timeout: Duration::from_secs(3600),
            planning_confidence_threshold: 0.7,
        }
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Fluent builder for [`RunOptions`], supporting file (YAML/TOML/JSON) load
/// plus environment-variable overrides.
#[derive(Default)]
pub struct RunOptionsBuilder {
    options: RunOptions,
}

impl RunOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: RunOptions::default(),
        }
    }

    /// Load a config file, inferring format from its extension
    /// (`.yaml`/`.yml`, `.toml`, `.json`).
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed: RunOptions = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source: Box::new(source),
            })?,
            "toml" => toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source: Box::new(source),
            })?,
            _ => serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source: Box::new(source),
            })?,
        };
        self.options = parsed;
        Ok(self)
    }

    /// Apply environment-variable overrides on top of whatever has been
    /// loaded so far. Recognized variables: `CREWFLOW_MAX_RETRIES`,
    /// `CREWFLOW_MEMORY_ENABLED`, `CREWFLOW_PERSIST_DIR`,
    /// `CREWFLOW_COVERAGE_THRESHOLD`, `CREWFLOW_FEEDBACK_TIMEOUT_SECS`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        // dotenvy is deliberately best-effort: a missing .env is not an error.
        let _ = dotenvy::dotenv();

        if let Ok(v) = std::env::var("CREWFLOW_MAX_RETRIES") {
            self.options.max_retries = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CREWFLOW_MAX_RETRIES".into(),
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("CREWFLOW_MEMORY_ENABLED") {
            self.options.memory_enabled = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CREWFLOW_MEMORY_ENABLED".into(),
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("CREWFLOW_PERSIST_DIR") {
            self.options.persist_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CREWFLOW_COVERAGE_THRESHOLD") {
            self.options.coverage_threshold = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CREWFLOW_COVERAGE_THRESHOLD".into(),
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("CREWFLOW_FEEDBACK_TIMEOUT_SECS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CREWFLOW_FEEDBACK_TIMEOUT_SECS".into(),
                value: v,
            })?;
            self.options.feedback_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Result<RunOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let opts = RunOptionsBuilder::new().build().unwrap();
        assert_eq!(opts.max_retries, 3);
        assert!((opts.coverage_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let mut opts = RunOptions::default();
        opts.coverage_threshold = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        std::fs::write(&path, r#"{"max_retries": 5, "coverage_threshold": 0.9}"#).unwrap();
        let opts = RunOptionsBuilder::new().with_file(&path).unwrap().build().unwrap();
        assert_eq!(opts.max_retries, 5);
    }
}
