//! Correctness regression tests for the orchestration invariants.

use std::sync::Arc;

use chrono::Utc;

use stratus_core::{MemoryBlobStore, PayloadId};
use stratus_flow::batch::BatchOrchestrator;
use stratus_flow::config::Config;
use stratus_flow::dispatch::Dispatcher;
use stratus_flow::engine::InMemoryEngine;
use stratus_flow::error::Result;
use stratus_flow::eventmgr::EventManager;
use stratus_flow::notify::InMemoryNotificationSink;
use stratus_flow::payload::{Payload, ProcessStep, Record, StepEntry};
use stratus_flow::state::memory::InMemoryStateStore;
use stratus_flow::state::{PayloadState, StateStore};

struct Harness {
    dispatcher: Arc<Dispatcher>,
    orchestrator: BatchOrchestrator,
    store: Arc<InMemoryStateStore>,
    engine: Arc<InMemoryEngine>,
    sink: Arc<InMemoryNotificationSink>,
    events: Arc<EventManager>,
}

fn harness() -> Harness {
    let config = Config::default();
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    let engine = Arc::new(InMemoryEngine::with_targets(["wf"]));
    let events = Arc::new(EventManager::new(store.clone(), sink.clone(), &config));
    let dispatcher = Arc::new(Dispatcher::new(
        events.clone(),
        engine.clone(),
        Arc::new(MemoryBlobStore::new()),
        config,
    ));
    Harness {
        orchestrator: BatchOrchestrator::new(dispatcher.clone(), events.clone()),
        dispatcher,
        store,
        engine,
        sink,
        events,
    }
}

fn payload(items: &[&str]) -> Payload {
    Payload::new(
        vec![StepEntry::Single(ProcessStep::new("wf"))],
        items.iter().map(|i| Record::new(*i, "X")).collect(),
    )
}

fn payload_replace(items: &[&str]) -> Payload {
    Payload::new(
        vec![StepEntry::Single(ProcessStep::new("wf").with_replace())],
        items.iter().map(|i| Record::new(*i, "X")).collect(),
    )
}

#[tokio::test]
async fn identity_derivation_round_trip() -> Result<()> {
    let mut p = payload(&["a", "b"]);
    let id = p.ensure_id()?;
    assert_eq!(id.to_string(), "X/workflow-wf/a/b");
    Ok(())
}

#[tokio::test]
async fn at_most_one_active_execution_under_concurrency() -> Result<()> {
    let h = harness();
    let p = payload(&["a"]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dispatcher = h.dispatcher.clone();
        let p = p.clone();
        handles.push(tokio::spawn(async move { dispatcher.dispatch(&p).await }));
    }
    let mut successes = 0;
    for handle in handles {
        if let Ok(Some(_)) = handle.await.expect("dispatch task panicked") {
            successes += 1;
        }
    }
    assert!(successes >= 1);

    // However the interleaving resolved, exactly one execution exists.
    assert_eq!(h.engine.started()?.len(), 1);
    let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
    let record = h.store.get(&id).await?.unwrap();
    assert_eq!(record.state, PayloadState::Processing);
    assert_eq!(record.executions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn idempotent_redelivery_from_completed() -> Result<()> {
    let h = harness();
    let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
    h.store.complete(&id, vec![], Utc::now()).await?;

    // Back-to-back redelivery without replace: zero new executions.
    for _ in 0..2 {
        let outcome = h.orchestrator.process(vec![payload(&["a"])]).await?;
        assert!(outcome.started.is_empty());
        assert_eq!(outcome.skipped, vec![id.clone()]);
    }
    assert!(h.engine.started()?.is_empty());
    let kinds = h.sink.published_kinds()?;
    assert_eq!(
        kinds
            .iter()
            .filter(|k| *k == "already_completed")
            .count(),
        2
    );

    // With replace: exactly one new execution.
    let outcome = h.orchestrator.process(vec![payload_replace(&["a"])]).await?;
    assert_eq!(outcome.started, vec![id.clone()]);
    assert_eq!(h.engine.started()?.len(), 1);
    assert_eq!(h.store.get(&id).await?.unwrap().executions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn batch_duplicate_law_in_input_order() -> Result<()> {
    let h = harness();
    let batch = vec![
        payload(&["a"]),
        payload(&["b"]),
        payload(&["a"]),
        payload(&["a"]),
    ];

    let outcome = h.orchestrator.process(batch).await?;
    let a: PayloadId = "X/workflow-wf/a".parse().unwrap();
    let b: PayloadId = "X/workflow-wf/b".parse().unwrap();
    assert_eq!(outcome.started, vec![a.clone(), b]);
    assert_eq!(outcome.dropped, vec![a.clone(), a]);
    assert_eq!(h.engine.started()?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn unknown_target_then_reentry() -> Result<()> {
    let config = Config::default();
    let store = Arc::new(InMemoryStateStore::new());
    let sink = Arc::new(InMemoryNotificationSink::new());
    // The engine knows no targets at all, so every start is rejected.
    let engine = Arc::new(InMemoryEngine::with_targets(Vec::<String>::new()));
    let events = Arc::new(EventManager::new(store.clone(), sink, &config));
    let dispatcher = Dispatcher::new(
        events,
        engine,
        Arc::new(MemoryBlobStore::new()),
        config,
    );

    let p = payload(&["a"]);
    let err = dispatcher.dispatch(&p).await.unwrap_err();
    assert!(err.is_terminal());

    let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
    assert_eq!(store.get(&id).await?.unwrap().state, PayloadState::Failed);

    // FAILED is re-enterable: the next attempt claims again.
    let err = dispatcher.dispatch(&p).await.unwrap_err();
    assert!(err.is_terminal());
    let record = store.get(&id).await?.unwrap();
    assert_eq!(record.state, PayloadState::Failed);
    assert_eq!(record.executions.len(), 2);
    Ok(())
}

#[tokio::test]
async fn transient_engine_failure_is_retryable_then_succeeds() -> Result<()> {
    let h = harness();
    h.engine.fail_next_start();
    let p = payload(&["a"]);

    let err = h.dispatcher.dispatch(&p).await.unwrap_err();
    assert!(!err.is_terminal());

    let id = h.dispatcher.dispatch(&p).await?.unwrap();
    let record = h.store.get(&id).await?.unwrap();
    assert_eq!(record.state, PayloadState::Processing);
    assert_eq!(record.executions.len(), 2);

    h.events.flush().await?;
    let kinds = h.sink.published_kinds()?;
    assert_eq!(kinds, vec!["claimed", "failed", "claimed", "started"]);
    Ok(())
}

#[tokio::test]
async fn every_transition_produces_an_event() -> Result<()> {
    let h = harness();
    let batch = vec![payload(&["a"]), payload(&["a"])];
    h.orchestrator.process(batch).await?;

    let kinds = h.sink.published_kinds()?;
    assert!(kinds.contains(&"claimed".to_string()));
    assert!(kinds.contains(&"started".to_string()));
    assert!(kinds.contains(&"duplicate".to_string()));
    Ok(())
}
