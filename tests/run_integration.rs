//! Full publish-run integration tests
//!
//! These tests drive the controller through its public surface the way
//! the server handlers do:
//! - a complete multi-partition run with pages and removals
//! - two-pass republish handling with dependency fan-out
//! - cancellation, fatal failures, and out-of-band skips

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestStack;
use pressline::cluster::RunDelegate;
use pressline::config::Config;
use pressline::error::PublishError;
use pressline::progress::{HistoryStore, MockHistoryStore};
use pressline::publish::{
    AllowAllGate, Publisher, RenderOutcome, StaticDirectory, WriteResult,
};
use pressline::queue::{DirtyQueue, SqliteQueueStore};
use pressline::{
    AttributeSet, DirtAction, ObjectKind, ObjectRef, PageTask, PublishDriver, PublishTarget,
    RemovalTask, RunController, RunState, RunStatus,
};

// ============================================================================
// Successful Runs
// ============================================================================

#[tokio::test]
async fn test_multi_partition_run_drains_the_queue() {
    let stack = TestStack::new(vec![1, 2]);
    stack.dirty_pages(1, 1..6);
    stack.dirty_pages(2, 10..13);
    stack
        .queue
        .mark_dirty(
            ObjectRef::page(20),
            DirtAction::Delete,
            1,
            AttributeSet::WholeObject,
            false,
        )
        .unwrap();

    let report = stack.run_to_completion().await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.published.get(&ObjectKind::Page), Some(&9));
    assert_eq!(report.total_remaining(), 0);
    assert_eq!(report.republish_pending, 0);
    assert!(report.error.is_none());

    assert_eq!(stack.publisher.rendered_count(), 8);
    assert_eq!(stack.publisher.retracted_count(), 1);
    assert_eq!(stack.queue.count().unwrap(), 0);
    assert_eq!(stack.controller.status().state, RunState::Stopped);
}

#[tokio::test]
async fn test_channel_zero_mark_is_published_everywhere() {
    let stack = TestStack::new(vec![1, 2]);
    stack.dirty_pages(0, [7]);

    let report = stack.run_to_completion().await;

    assert_eq!(report.status, RunStatus::Succeeded);
    // Selected once per partition, swept at finalize.
    assert_eq!(stack.publisher.rendered_count(), 2);
    assert_eq!(stack.queue.count().unwrap(), 0);
}

#[tokio::test]
async fn test_second_pass_picks_up_dependency_dirt_and_republish() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, [1, 3]);

    // Rendering page 1 re-dirties page 2; page 3 keeps asking for a
    // republish, so one request is left over after the final pass.
    stack
        .publisher
        .add_side_effect(1, ObjectRef::page(2), &[]);
    stack.publisher.republish_always(3);

    let report = stack.run_to_completion().await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.published.get(&ObjectKind::Page), Some(&3));
    assert_eq!(report.republish_pending, 1);
    assert_eq!(report.total_remaining(), 0);

    // Pass one renders pages 1 and 3, pass two renders pages 2 and 3.
    assert_eq!(stack.publisher.rendered_count(), 4);
    assert_eq!(stack.queue.count().unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_band_object_counts_without_rendering() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, 1..4);
    stack.controller.record_out_of_band(ObjectRef::page(2));

    let report = stack.run_to_completion().await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.published.get(&ObjectKind::Page), Some(&3));
    assert_eq!(stack.publisher.rendered_count(), 2);
    assert_eq!(stack.queue.count().unwrap(), 0);
}

#[tokio::test]
async fn test_run_history_feeds_the_next_eta() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, 1..4);
    stack.run_to_completion().await;

    let saved = stack.history.load("channel-1/pages").unwrap();
    let saved = saved.expect("page phase history saved");
    assert_eq!(saved.units, 3);
}

// ============================================================================
// Failure Paths
// ============================================================================

#[tokio::test]
async fn test_fatal_write_fails_the_run_and_releases_the_snapshot() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, 1..4);
    stack
        .publisher
        .set_write_result(2, WriteResult::Fatal("render store down".into()));

    let report = stack.run_to_completion().await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error.is_some());

    let status = stack.controller.status();
    assert_eq!(status.state, RunState::Stopped);
    assert!(status.error.is_some());

    // Unhandled entries went back to pending for the next run.
    let remaining = stack.queue.count().unwrap();
    assert!(remaining >= 1);
    let claimed = stack.queue.claim_pending(&[1]).unwrap();
    let reclaimed: u64 = claimed.iter().map(|c| c.entries).sum();
    assert_eq!(reclaimed, remaining);
}

#[tokio::test]
async fn test_recoverable_render_failure_defers_the_object() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, [1, 2]);
    stack
        .publisher
        .fail_render(1, PublishError::Recoverable("asset store timeout".into()));

    let report = stack.run_to_completion().await;

    // The run succeeds; the deferred object stays dirty for the next one.
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(stack.queue.count().unwrap(), 1);
    let claimed = stack.queue.claim_pending(&[1]).unwrap();
    assert_eq!(claimed.len(), 1);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Publisher whose writes block long enough for a stop to land.
struct StallingPublisher;

#[async_trait]
impl Publisher for StallingPublisher {
    async fn render(&self, _task: &PageTask) -> Result<RenderOutcome, PublishError> {
        Ok(RenderOutcome::into_targets(vec![PublishTarget::RenderStore]))
    }

    async fn write(&self, _target: PublishTarget, _task: &PageTask) -> WriteResult {
        tokio::time::sleep(Duration::from_secs(30)).await;
        WriteResult::Ok
    }

    async fn retract(&self, _removal: &RemovalTask) -> WriteResult {
        WriteResult::Ok
    }
}

#[tokio::test]
async fn test_stop_cancels_a_running_publish() {
    let mut config = Config::default();
    config.pool.workers = 2;
    config.pool.shutdown_grace_secs = 0;

    let store = Arc::new(SqliteQueueStore::in_memory().unwrap());
    let queue = Arc::new(DirtyQueue::new(
        store,
        Arc::new(AllowAllGate),
        &config.queue,
    ));
    for id in 1..5 {
        queue
            .mark_dirty(
                ObjectRef::page(id),
                DirtAction::Modify,
                1,
                AttributeSet::WholeObject,
                false,
            )
            .unwrap();
    }
    let driver = Arc::new(PublishDriver::new(
        queue.clone(),
        Arc::new(StallingPublisher),
        Arc::new(StaticDirectory::new(vec![1])),
        Arc::new(MockHistoryStore::new()),
        &config,
    ));
    let controller = Arc::new(RunController::new(driver));

    controller.start(false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.is_running());

    controller.stop(true).await.unwrap();

    let status = controller.status();
    assert_eq!(status.state, RunState::Stopped);
    let report = status.last_report.expect("cancelled run reports");
    assert_eq!(report.status, RunStatus::Cancelled);

    // The snapshot was released; nothing was lost.
    assert_eq!(queue.count().unwrap(), 4);
}

// ============================================================================
// Delegation
// ============================================================================

#[tokio::test]
async fn test_local_delegate_runs_through_the_controller() {
    let stack = TestStack::new(vec![1]);
    stack.dirty_pages(1, [1]);
    let delegate = stack.delegate();

    assert!(!delegate.is_running().await.unwrap());
    delegate.start(false).await.unwrap();
    stack.controller.join().await;

    let status = delegate.status().await.unwrap();
    assert_eq!(status.state, RunState::Stopped);
    let report = status.last_report.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.total_published(), 1);
}

// A second start while a run is active is rejected.
#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let mut config = Config::default();
    config.pool.workers = 1;
    config.pool.shutdown_grace_secs = 0;

    let store = Arc::new(SqliteQueueStore::in_memory().unwrap());
    let queue = Arc::new(DirtyQueue::new(
        store,
        Arc::new(AllowAllGate),
        &config.queue,
    ));
    queue
        .mark_dirty(
            ObjectRef::page(1),
            DirtAction::Modify,
            1,
            AttributeSet::WholeObject,
            false,
        )
        .unwrap();
    let driver = Arc::new(PublishDriver::new(
        queue.clone(),
        Arc::new(StallingPublisher),
        Arc::new(StaticDirectory::new(vec![1])),
        Arc::new(MockHistoryStore::new()),
        &config,
    ));
    let controller = Arc::new(RunController::new(driver));

    controller.start(false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.start(false).is_err());

    controller.stop(true).await.unwrap();
}
