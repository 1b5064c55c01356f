//! End-to-end pipeline tests: ingestion through dispatch, completion, and
//! chaining of the next process step.

use std::sync::Arc;

use serde_json::{json, Value};

use stratus_core::{ExecutionRef, MemoryBlobStore, PayloadId};
use stratus_flow::batch::BatchOrchestrator;
use stratus_flow::chain::{ChainFilter, CompareOp};
use stratus_flow::completion::CompletionHandler;
use stratus_flow::config::Config;
use stratus_flow::dispatch::Dispatcher;
use stratus_flow::engine::{CompletionReport, CompletionStatus, InMemoryEngine};
use stratus_flow::error::Result;
use stratus_flow::eventmgr::EventManager;
use stratus_flow::ingest::Ingestor;
use stratus_flow::notify::InMemoryNotificationSink;
use stratus_flow::payload::Payload;
use stratus_flow::queue::InMemoryWorkQueue;
use stratus_flow::state::memory::InMemoryStateStore;
use stratus_flow::state::{Count, PayloadState, StateQuery, StateStore};
use stratus_flow::timeseries::InMemoryTimeseriesSink;

struct Pipeline {
    ingestor: Ingestor,
    orchestrator: BatchOrchestrator,
    completion: CompletionHandler,
    store: Arc<InMemoryStateStore>,
    engine: Arc<InMemoryEngine>,
    queue: Arc<InMemoryWorkQueue>,
    sink: Arc<InMemoryNotificationSink>,
    timeseries: Arc<InMemoryTimeseriesSink>,
}

fn pipeline(targets: &[&str]) -> Pipeline {
    let config = Config {
        timeseries_enabled: true,
        ..Config::default()
    };
    let store = Arc::new(InMemoryStateStore::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let timeseries = Arc::new(InMemoryTimeseriesSink::new());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let engine = Arc::new(InMemoryEngine::with_targets(targets.iter().copied()));
    let events = Arc::new(
        EventManager::new(store.clone(), sink.clone(), &config)
            .with_timeseries(timeseries.clone()),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        events.clone(),
        engine.clone(),
        blob.clone(),
        config.clone(),
    ));
    Pipeline {
        ingestor: Ingestor::new(blob.clone(), events.clone(), &config),
        orchestrator: BatchOrchestrator::new(dispatcher, events.clone()),
        completion: CompletionHandler::new(events, queue.clone(), blob, config),
        store,
        engine,
        queue,
        sink,
        timeseries,
    }
}

fn two_step_message() -> Value {
    json!({
        "process": [
            {"workflow": "cog"},
            {"workflow": "publish"},
        ],
        "records": [{
            "id": "scene-1",
            "collection": "s2-l2a",
            "links": [{"rel": "canonical", "href": "s3://bucket/scene-1.json"}],
            "properties": {"cloud_cover": 12.5},
        }],
    })
}

#[tokio::test]
async fn full_lifecycle_with_chaining() -> Result<()> {
    let p = pipeline(&["cog", "publish"]);

    // Ingest and dispatch the first step.
    let payload = p.ingestor.ingest(&two_step_message()).await?.unwrap();
    let outcome = p.orchestrator.process(vec![payload]).await?;
    assert_eq!(outcome.started.len(), 1);
    let id: PayloadId = "s2-l2a/workflow-cog/scene-1".parse().unwrap();
    assert_eq!(outcome.started[0], id);

    // The engine reports success; the completion payload is the engine
    // input with results filled in.
    let started = p.engine.started()?;
    let report = CompletionReport {
        execution: started[0].execution.clone(),
        payload: started[0].input.clone(),
        status: CompletionStatus::Succeeded,
        error: None,
        cause: None,
    };
    p.completion.handle(&report).await?;

    let record = p.store.get(&id).await?.unwrap();
    assert_eq!(record.state, PayloadState::Completed);
    assert_eq!(record.outputs, vec!["s3://bucket/scene-1.json".to_string()]);

    // The chained payload re-enters through the queue and dispatches the
    // second step under a fresh identity.
    let message = p.queue.pop()?.unwrap();
    let chained = p.ingestor.ingest(&message.body).await?.unwrap();
    let outcome = p.orchestrator.process(vec![chained]).await?;
    let chained_id: PayloadId = "s2-l2a/workflow-publish/scene-1".parse().unwrap();
    assert_eq!(outcome.started, vec![chained_id.clone()]);
    assert_eq!(p.engine.started()?.len(), 2);

    // Both identities are visible in their own partitions.
    assert_eq!(
        p.store.get(&chained_id).await?.unwrap().state,
        PayloadState::Processing
    );

    let kinds = p.sink.published_kinds()?;
    assert_eq!(
        kinds,
        vec!["claimed", "started", "succeeded", "claimed", "started"]
    );
    // One timeseries row per store transition.
    assert_eq!(p.timeseries.records()?.len(), 5);
    Ok(())
}

#[tokio::test]
async fn chain_filter_restricts_carried_records() -> Result<()> {
    let filter =
        ChainFilter::id_pattern("scene-*").with_property("cloud_cover", CompareOp::Lt, 20.0);
    let message = json!({
        "process": [
            {"workflow": "cog"},
            {"workflow": "publish", "chainFilter": serde_json::to_value(&filter).unwrap()},
        ],
        "records": [
            {"id": "scene-1", "collection": "s2-l2a", "links": [],
             "properties": {"cloud_cover": 12.5}},
            {"id": "scene-2", "collection": "s2-l2a", "links": [],
             "properties": {"cloud_cover": 80.0}},
            {"id": "aux-1", "collection": "s2-l2a", "links": [],
             "properties": {"cloud_cover": 1.0}},
        ],
    });

    let payload = Payload::from_json(message)?;
    let next: Vec<Payload> = payload.next_payloads().collect();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].records.len(), 1);
    assert_eq!(next[0].records[0].id, "scene-1");
    assert!(next[0].id.is_none());
    Ok(())
}

#[tokio::test]
async fn invalid_input_failure_is_not_redispatched() -> Result<()> {
    let p = pipeline(&["cog"]);
    let message = json!({
        "process": [{"workflow": "cog"}],
        "records": [{"id": "scene-1", "collection": "s2-l2a", "links": []}],
    });

    let payload = p.ingestor.ingest(&message).await?.unwrap();
    p.orchestrator.process(vec![payload.clone()]).await?;

    let started = p.engine.started()?;
    let report = CompletionReport {
        execution: started[0].execution.clone(),
        payload: started[0].input.clone(),
        status: CompletionStatus::Failed,
        error: Some("States.TaskFailed".to_string()),
        cause: Some(json!([
            {"error": "InvalidInput", "errorMessage": "unsupported projection"},
        ])),
    };
    p.completion.handle(&report).await?;

    let id: PayloadId = "s2-l2a/workflow-cog/scene-1".parse().unwrap();
    assert_eq!(p.store.get(&id).await?.unwrap().state, PayloadState::Invalid);

    // INVALID is terminal: redelivery skips instead of dispatching.
    let outcome = p.orchestrator.process(vec![payload]).await?;
    assert!(outcome.started.is_empty());
    assert_eq!(outcome.skipped, vec![id]);
    assert_eq!(p.engine.started()?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn query_surfaces_failed_records_for_operators() -> Result<()> {
    let p = pipeline(&[]);
    // No known targets: every dispatch fails terminally.
    let batch = vec![
        p.ingestor
            .ingest(&json!({
                "process": [{"workflow": "cog"}],
                "records": [{"id": "scene-1", "collection": "s2-l2a", "links": []}],
            }))
            .await?
            .unwrap(),
        p.ingestor
            .ingest(&json!({
                "process": [{"workflow": "cog"}],
                "records": [{"id": "scene-2", "collection": "s2-l2a", "links": []}],
            }))
            .await?
            .unwrap(),
    ];
    let outcome = p.orchestrator.process(batch).await?;
    assert_eq!(outcome.failed.len(), 2);
    assert!(outcome.failed.iter().all(|f| f.terminal));

    let query = StateQuery::new("s2-l2a/workflow-cog").with_state(PayloadState::Failed);
    let page = p.store.query(&query).await?;
    assert_eq!(page.records.len(), 2);
    assert_eq!(p.store.count(&query, 100).await?, Count::Exact(2));

    let narrowed = query.with_error_prefix("workflow not found");
    assert_eq!(p.store.count(&narrowed, 100).await?, Count::Exact(2));
    Ok(())
}

#[tokio::test]
async fn redelivered_completion_report_is_idempotent() -> Result<()> {
    let p = pipeline(&["cog"]);
    let message = json!({
        "process": [{"workflow": "cog"}, {"workflow": "publish"}],
        "records": [{"id": "scene-1", "collection": "s2-l2a", "links": []}],
    });
    let payload = p.ingestor.ingest(&message).await?.unwrap();
    p.orchestrator.process(vec![payload]).await?;

    let started = p.engine.started()?;
    let report = CompletionReport {
        execution: started[0].execution.clone(),
        payload: started[0].input.clone(),
        status: CompletionStatus::Succeeded,
        error: None,
        cause: None,
    };
    p.completion.handle(&report).await?;
    p.completion.handle(&report).await?;

    let id: PayloadId = "s2-l2a/workflow-cog/scene-1".parse().unwrap();
    let record = p.store.get(&id).await?.unwrap();
    assert_eq!(record.state, PayloadState::Completed);
    // The chained payload is enqueued per report; the batch decision
    // policy deduplicates when both are delivered together.
    assert_eq!(p.queue.messages()?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn execution_reference_is_stable_across_redelivery() -> Result<()> {
    let id: PayloadId = "s2-l2a/workflow-cog/scene-1".parse().unwrap();
    assert_eq!(ExecutionRef::derive(&id, 1), ExecutionRef::derive(&id, 1));
    assert_ne!(ExecutionRef::derive(&id, 1), ExecutionRef::derive(&id, 2));
    Ok(())
}
