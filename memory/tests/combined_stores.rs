//! Drives the associative and relational stores together the way an
//! external driver would for one simulated run, using only the public
//! API of `crewflow-memory`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crewflow_memory::associative::{AssociativeStore, Embedder, InMemoryAssociativeStore};
use crewflow_memory::relational::{PhaseMetric, RelationalStore, SqliteRelationalStore};

struct WordCountEmbedder;

#[async_trait]
impl Embedder for WordCountEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        Ok(vec![text.split_whitespace().count() as f32])
    }
}

#[tokio::test]
async fn a_run_records_metrics_and_leaves_recallable_memory() {
    let associative = InMemoryAssociativeStore::new(Arc::new(WordCountEmbedder));
    let relational = SqliteRelationalStore::connect("sqlite::memory:").await.unwrap();

    let run_id = "run-combined-1";
    let project_scope = "project-combined-1";
    let started = Utc::now();

    relational.record_run_started(run_id, started).await.unwrap();

    associative
        .remember(
            project_scope,
            "architecture decision: use a single-node deployment topology",
            serde_json::json!({"importance": 0.8}),
        )
        .await;

    relational
        .record_phase_metric(PhaseMetric {
            run_id: run_id.to_string(),
            phase: "PLANNING".to_string(),
            duration_ms: 800,
            retries: 0,
            tokens_in: 400,
            tokens_out: 150,
            outcome: "success".to_string(),
        })
        .await
        .unwrap();
    relational
        .record_role_invocation("planner", "test-model", 400, 150, false)
        .await
        .unwrap();

    relational.record_run_ended(run_id, Utc::now(), "COMPLETE").await.unwrap();

    let runs = relational.list_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].final_phase.as_deref(), Some("COMPLETE"));

    let phase_metrics = relational.phase_metrics_for_run(run_id).await.unwrap();
    assert_eq!(phase_metrics.len(), 1);

    let role_metrics = relational.role_metrics().await.unwrap();
    assert_eq!(role_metrics[0].invocations, 1);

    let recalled = associative.recall(project_scope, "deployment topology", 1).await;
    assert_eq!(recalled.len(), 1);
    assert!(recalled[0].0.contains("single-node"));

    associative.purge(project_scope).await;
    assert!(associative.recall(project_scope, "deployment topology", 1).await.is_empty());
}
