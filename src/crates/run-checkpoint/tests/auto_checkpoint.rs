mod common;

use common::GatedSnapshotStore;
use run_checkpoint::{
    AutoCheckpointScheduler, CheckpointError, CheckpointLedger, CheckpointRequest,
    CheckpointType, InMemoryLedgerStore, InMemoryRunExecutor, RunId, TickOutcome,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    ledger: CheckpointLedger,
    snapshots: GatedSnapshotStore,
    executor: InMemoryRunExecutor,
    scheduler: AutoCheckpointScheduler,
    run: RunId,
}

async fn setup() -> Setup {
    let snapshots = GatedSnapshotStore::default();
    let ledger = CheckpointLedger::new(
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(snapshots.clone()),
    );
    let executor = InMemoryRunExecutor::new();
    let run: RunId = "run-auto".into();
    executor.upsert_run(run.clone(), 3, json!({"draft": "v0"})).await;
    let scheduler = AutoCheckpointScheduler::new(ledger.clone(), Arc::new(executor.clone()));

    Setup {
        ledger,
        snapshots,
        executor,
        scheduler,
        run,
    }
}

async fn kinds(ledger: &CheckpointLedger, run: &RunId) -> Vec<(u64, CheckpointType)> {
    let mut out: Vec<_> = ledger
        .list_checkpoints(run)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.version, c.checkpoint_type))
        .collect();
    out.sort_by_key(|(v, _)| *v);
    out
}

#[tokio::test(start_paused = true)]
async fn test_tick_colliding_with_manual_create_is_skipped() {
    let s = setup().await;
    s.scheduler.configure(&s.run, true, 60).unwrap();

    // a manual create parks inside the snapshot write, holding the run lock
    s.snapshots.hold.store(true, Ordering::SeqCst);
    let manual = {
        let ledger = s.ledger.clone();
        let run = s.run.clone();
        tokio::spawn(async move {
            ledger
                .create_checkpoint(
                    CheckpointRequest::new(run, 3, CheckpointType::Manual, json!({"draft": "v0"}))
                        .with_description("user save"),
                )
                .await
        })
    };
    s.snapshots.entered.notified().await;

    // the 60s tick finds the run busy and produces nothing
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(kinds(&s.ledger, &s.run).await.is_empty());

    s.snapshots.hold.store(false, Ordering::SeqCst);
    s.snapshots.release.notify_one();
    let created = manual.await.unwrap().unwrap();
    assert_eq!(created.version, 1);

    // the next regular tick goes through
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        kinds(&s.ledger, &s.run).await,
        vec![(1, CheckpointType::Manual), (2, CheckpointType::Auto)]
    );

    s.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_checkpoints_follow_the_live_run() {
    let s = setup().await;
    s.scheduler.configure(&s.run, true, 120).unwrap();

    tokio::time::sleep(Duration::from_secs(121)).await;
    s.executor
        .advance(&s.run, 8, json!({"draft": "v1"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let checkpoints = s.ledger.list_checkpoints(&s.run).await.unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].step_number, 8);
    assert_eq!(checkpoints[1].step_number, 3);
    assert_eq!(
        s.ledger.load_snapshot(&checkpoints[0]).await.unwrap(),
        json!({"draft": "v1"})
    );

    s.scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disable_during_in_flight_tick_lets_it_finish() {
    let s = setup().await;
    s.scheduler.configure(&s.run, true, 60).unwrap();

    s.snapshots.hold.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;
    s.snapshots.entered.notified().await;

    s.scheduler.configure(&s.run, false, 60).unwrap();
    s.snapshots.hold.store(false, Ordering::SeqCst);
    s.snapshots.release.notify_one();

    // the in-flight tick commits, nothing after it does
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(
        kinds(&s.ledger, &s.run).await,
        vec![(1, CheckpointType::Auto)]
    );
}

#[tokio::test]
async fn test_manual_tick_reports_outcome() {
    let s = setup().await;
    match s.scheduler.tick(&s.run).await {
        TickOutcome::Created(checkpoint) => assert_eq!(checkpoint.version, 1),
        other => panic!("unexpected tick outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_interval_validation() {
    let s = setup().await;
    for interval in [0, 59, 3601, u64::MAX] {
        assert!(matches!(
            s.scheduler.configure(&s.run, true, interval),
            Err(CheckpointError::Validation(_))
        ));
    }
    assert!(s.scheduler.active_runs().is_empty());
}
