//! Bounded worker pool for page publishing
//!
//! A pass takes a fixed task list, fans it out to `workers` concurrent
//! workers over a shared distributor, and waits for all of them. After
//! cancellation the pass gets a grace period to wind down before the
//! worker tasks are aborted.

pub mod distributor;
pub mod worker;

pub use distributor::{PageDistributor, StopCause};
pub use worker::PassContext;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::models::{ObjectRef, PageTask};
use crate::pool::worker::run_worker;

/// What one pass produced besides published pages.
pub struct PassOutcome {
    /// Pages that asked to be published again.
    pub republish: Vec<ObjectRef>,
    /// Objects fully handled during the pass.
    pub handled: Vec<ObjectRef>,
    /// Why the pass stopped early, if it did.
    pub stop_cause: Option<StopCause>,
    /// First fatal error seen by any worker.
    pub error: Option<Error>,
}

impl PassOutcome {
    pub fn completed(&self) -> bool {
        self.stop_cause.is_none()
    }
}

/// Spawns and joins the workers of a pass.
pub struct WorkerPool {
    workers: usize,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }

    /// Run one pass over the given tasks.
    pub async fn run_pass(&self, ctx: Arc<PassContext>, tasks: Vec<PageTask>) -> PassOutcome {
        let distributor = Arc::new(PageDistributor::new(tasks));
        let workers = self.workers.min(distributor.remaining().max(1));

        tracing::debug!(
            workers,
            tasks = distributor.remaining(),
            partition = ctx.partition,
            "starting publish pass"
        );

        let handles: Vec<_> = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, ctx.clone(), distributor.clone())))
            .collect();

        let cancel = ctx.cancel.clone();
        let grace = self.shutdown_grace;
        let mut republish = Vec::new();
        let mut handled = Vec::new();
        tokio::select! {
            results = join_all(handles) => {
                for result in results {
                    match result {
                        Ok(output) => {
                            republish.extend(output.republish);
                            handled.extend(output.handled);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "worker task panicked");
                            distributor.record_error(Error::Run(
                                crate::error::RunError::DriverFailed(format!("worker panicked: {e}")),
                            ));
                        }
                    }
                }
            }
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                // the pass is abandoned, what the stragglers produced
                // no longer matters
                tracing::warn!("workers exceeded shutdown grace after cancellation");
                distributor.stop(StopCause::Cancelled);
            }
        }

        PassOutcome {
            republish,
            handled,
            stop_cause: distributor.stop_cause(),
            error: distributor.take_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::models::{AttributeSet, DirtAction, ObjectKind};
    use crate::progress::WorkPhase;
    use crate::publish::{AllowAllGate, MockPublisher, WriteResult};
    use crate::queue::{DirtyQueue, MockQueueStore, QueueStore};
    use crate::run::{CancelFlag, OutOfBandSet};

    async fn seeded_queue(store: Arc<MockQueueStore>, pages: u64) -> Arc<DirtyQueue> {
        let queue = Arc::new(DirtyQueue::new(
            store,
            Arc::new(AllowAllGate),
            &QueueConfig::default(),
        ));
        for id in 1..=pages {
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
        queue.claim_pending(&[1]).unwrap();
        queue
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(&PoolConfig {
            workers: 4,
            shutdown_grace_secs: 5,
            representative_min_pages: 100,
        })
    }

    fn context(
        queue: Arc<DirtyQueue>,
        publisher: Arc<MockPublisher>,
        phase_target: u64,
    ) -> Arc<PassContext> {
        let root = WorkPhase::root("run");
        let phase = root.add_child("pages", phase_target, None);
        Arc::new(PassContext {
            queue,
            publisher,
            phase,
            partition: 1,
            dependencies_enabled: true,
            cancel: CancelFlag::new(),
            out_of_band: OutOfBandSet::new(),
        })
    }

    #[tokio::test]
    async fn test_pass_publishes_everything() {
        let store = Arc::new(MockQueueStore::new());
        let queue = seeded_queue(store.clone(), 20).await;
        let publisher = Arc::new(MockPublisher::new());
        let ctx = context(queue.clone(), publisher.clone(), 20);

        let tasks = queue.publish_tasks(ObjectKind::Page, 1).unwrap();
        let outcome = pool().run_pass(ctx.clone(), tasks).await;

        assert!(outcome.completed());
        assert!(outcome.error.is_none());
        assert_eq!(publisher.rendered_count(), 20);
        assert_eq!(ctx.phase.done(), 20);

        queue.finalize_run().await.unwrap();
        assert_eq!(store.count_entries().unwrap(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_error_stops_pass_early() {
        let store = Arc::new(MockQueueStore::new());
        let queue = seeded_queue(store, 50).await;
        let publisher = Arc::new(MockPublisher::new());
        publisher.set_write_result(10, WriteResult::Fatal("disk full".into()));
        let ctx = context(queue.clone(), publisher, 50);

        let tasks = queue.publish_tasks(ObjectKind::Page, 1).unwrap();
        let outcome = pool().run_pass(ctx, tasks).await;

        assert_eq!(outcome.stop_cause, Some(StopCause::Fatal));
        assert!(outcome.error.unwrap().to_string().contains("disk full"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_distribution() {
        let store = Arc::new(MockQueueStore::new());
        let queue = seeded_queue(store, 30).await;
        let publisher = Arc::new(MockPublisher::new());
        let ctx = context(queue.clone(), publisher, 30);
        ctx.cancel.cancel();

        let tasks = queue.publish_tasks(ObjectKind::Page, 1).unwrap();
        let outcome = pool().run_pass(ctx, tasks).await;
        assert_eq!(outcome.stop_cause, Some(StopCause::Cancelled));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_republish_requests_surface_in_outcome() {
        let store = Arc::new(MockQueueStore::new());
        let queue = seeded_queue(store, 5).await;
        let publisher = Arc::new(MockPublisher::new());
        publisher.republish_once(3);
        let ctx = context(queue.clone(), publisher, 5);

        let tasks = queue.publish_tasks(ObjectKind::Page, 1).unwrap();
        let outcome = pool().run_pass(ctx, tasks).await;
        assert_eq!(outcome.republish, vec![ObjectRef::page(3)]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_results_merge_across_the_pool() {
        let store = Arc::new(MockQueueStore::new());
        let queue = seeded_queue(store, 12).await;
        let publisher = Arc::new(MockPublisher::new());
        publisher.republish_once(2);
        publisher.republish_once(9);
        let ctx = context(queue.clone(), publisher, 12);

        let tasks = queue.publish_tasks(ObjectKind::Page, 1).unwrap();
        let outcome = pool().run_pass(ctx, tasks).await;

        assert!(outcome.completed());
        let mut republish = outcome.republish;
        republish.sort();
        assert_eq!(republish, vec![ObjectRef::page(2), ObjectRef::page(9)]);
        let mut handled = outcome.handled;
        handled.sort();
        let expected: Vec<_> = (1..=12).map(ObjectRef::page).collect();
        assert_eq!(handled, expected);
        queue.shutdown().await;
    }
}
