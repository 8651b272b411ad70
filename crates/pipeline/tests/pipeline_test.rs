//! End-to-end pipeline tests against the dummy destination: extract through
//! normalize through load, plus create/restore semantics.

use pipeline::{Credentials, DummyConfig, Pipeline, PipelineError};
use schema::{DataType, Schema};
use serde_json::json;
use std::path::Path;

fn dummy_credentials() -> Credentials {
    Credentials::Dummy(DummyConfig {
        completed_prob: 1.0,
        ..Default::default()
    })
}

fn create(name: &str, dir: &Path) -> Pipeline {
    Pipeline::create(name, dummy_credentials(), Some(dir), None).unwrap()
}

#[tokio::test]
async fn single_record_flows_to_the_destination() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = create("events", dir.path());

    p.extract(
        [json!({"id": 1, "ev": "click", "ts": 1_690_000_000})],
        Some("events"),
    )
    .unwrap();
    assert_eq!(1, p.list_extracted_loads().unwrap().len());

    p.flush().await.unwrap();

    assert!(p.list_extracted_loads().unwrap().is_empty());
    assert!(p.list_normalized_loads().unwrap().is_empty());
    let completed = p.list_completed_loads().unwrap();
    assert_eq!(1, completed.len());
    assert!(p.list_failed_jobs(&completed[0]).unwrap().is_empty());

    let schema = p.default_schema().unwrap();
    assert_eq!(1, schema.version());
    let table = schema.table("events").unwrap();
    assert_eq!(DataType::Bigint, table.columns["id"].data_type);
    assert_eq!(DataType::Text, table.columns["ev"].data_type);
    assert_eq!(DataType::Timestamp, table.columns["ts"].data_type);
    assert_eq!(DataType::Text, table.columns["_dlt_id"].data_type);
}

#[tokio::test]
async fn scalar_items_are_wrapped_and_routed() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = create("scalars", dir.path());

    p.extract([json!("a"), json!("b"), json!("c")], Some("letters"))
        .unwrap();
    p.flush().await.unwrap();

    let schema = p.default_schema().unwrap();
    let table = schema.table("letters").unwrap();
    assert_eq!(DataType::Text, table.columns["v"].data_type);
}

#[tokio::test]
async fn nested_sequences_are_flattened_into_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = create("batches", dir.path());

    // One item that is itself a sequence extracts as two records.
    p.extract([json!([{"id": 1}, {"id": 2}])], Some("rows")).unwrap();
    p.flush().await.unwrap();

    let schema = p.default_schema().unwrap();
    assert!(schema.table("rows").is_some());
}

#[tokio::test]
async fn type_conflicts_surface_and_leave_the_batch_queued() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = create("conflict", dir.path());

    p.extract([json!({"id": 1})], Some("events")).unwrap();
    p.flush().await.unwrap();

    p.extract([json!({"id": "not-a-number"})], Some("events"))
        .unwrap();
    let err = p.flush().await.unwrap_err();
    match err {
        PipelineError::Step(step) => {
            assert_eq!("normalize", step.step);
            assert!(step.last_metrics.has_failed);
            assert_eq!(1, step.last_metrics.pending_items);
            assert!(step.source.to_string().contains("cannot coerce column"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The poisoned batch stays in the extracted queue; no new package.
    assert_eq!(1, p.list_extracted_loads().unwrap().len());
    assert!(p.list_normalized_loads().unwrap().is_empty());
}

#[tokio::test]
async fn restore_reattaches_to_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut p = create("orders", dir.path());
        p.extract([json!({"id": 1})], Some("orders")).unwrap();
        let n = pipeline::NormalizeConfig::default();
        p.normalize(n.workers, n.max_chunk).await.unwrap();
        // The pipeline goes away with one package normalized, not loaded.
    }

    let mut restored =
        Pipeline::restore("orders", dummy_credentials(), dir.path()).unwrap();
    assert_eq!(1, restored.list_normalized_loads().unwrap().len());

    restored.load(20).await.unwrap();
    assert_eq!(1, restored.list_completed_loads().unwrap().len());
}

#[test]
fn restore_requires_a_valid_pipeline() {
    let dir = tempfile::tempdir().unwrap();

    // No directory at all.
    let missing = dir.path().join("absent");
    assert!(matches!(
        Pipeline::restore("any", dummy_credentials(), &missing),
        Err(PipelineError::CannotRestorePipeline(_))
    ));

    // A directory without state.
    assert!(matches!(
        Pipeline::restore("any", dummy_credentials(), dir.path()),
        Err(PipelineError::CannotRestorePipeline(_))
    ));

    // A pipeline with another name.
    create("mine", dir.path());
    let err = Pipeline::restore("other", dummy_credentials(), dir.path()).unwrap_err();
    match err {
        PipelineError::CannotRestorePipeline(reason) => {
            assert!(reason.contains("mine"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn create_wipes_a_previous_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = create("first", dir.path());
    first.extract([json!({"id": 1})], Some("events")).unwrap();
    assert_eq!(1, first.list_extracted_loads().unwrap().len());

    // Creating a new pipeline at the same directory wipes the old one and
    // invalidates its handle.
    let second = create("second", dir.path());
    assert!(second.list_extracted_loads().unwrap().is_empty());
    assert!(matches!(
        first.list_extracted_loads(),
        Err(PipelineError::InvalidPipelineContext)
    ));

    let restored = Pipeline::restore("second", dummy_credentials(), dir.path()).unwrap();
    assert!(matches!(
        second.list_extracted_loads(),
        Err(PipelineError::InvalidPipelineContext)
    ));
    assert!(restored.list_extracted_loads().unwrap().is_empty());
}

#[test]
fn explicit_schema_survives_create_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema::new("custom").unwrap();
    let p = Pipeline::create("named", dummy_credentials(), Some(dir.path()), Some(schema))
        .unwrap();
    assert_eq!("custom", p.default_schema().unwrap().name());
    drop(p);

    let restored = Pipeline::restore("named", dummy_credentials(), dir.path()).unwrap();
    assert_eq!("custom", restored.default_schema().unwrap().name());
}

#[test]
fn empty_schema_name_is_a_valid_default() {
    let dir = tempfile::tempdir().unwrap();
    let p = Pipeline::create(
        "empty",
        dummy_credentials(),
        Some(dir.path()),
        Some(Schema::new("").unwrap()),
    )
    .unwrap();
    assert_eq!("", p.default_schema().unwrap().name());
    drop(p);

    let restored = Pipeline::restore("empty", dummy_credentials(), dir.path()).unwrap();
    assert_eq!("", restored.default_schema().unwrap().name());
}

#[tokio::test]
async fn state_file_reflects_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = create("stateful", dir.path());
    p.extract([json!({"id": 1})], None).unwrap();

    let raw = std::fs::read_to_string(dir.path().join(pipeline::STATE_FILE)).unwrap();
    let state: pipeline::PipelineState = serde_json::from_str(&raw).unwrap();
    assert_eq!("stateful", state.pipeline_name);
    assert_eq!("stateful", state.default_schema_name);
    assert_eq!("dummy", state.client_type);
}
