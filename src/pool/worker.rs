//! Page publish worker
//!
//! One worker loops over the distributor: render the task, announce the
//! declared targets, write them, confirm each write. Recoverable
//! failures defer the object to the next run and the loop continues;
//! fatal failures and bookkeeping violations stop the whole pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, PublishError, Result};
use crate::models::{AttributeSet, ChannelId, HandledKey, ObjectRef, PageTask, PublishTarget};
use crate::pool::distributor::{PageDistributor, StopCause};
use crate::progress::WorkPhase;
use crate::publish::{Publisher, WriteResult};
use crate::queue::DirtyQueue;
use crate::run::{CancelFlag, OutOfBandSet};

/// Everything one pass shares between its workers.
pub struct PassContext {
    pub queue: Arc<DirtyQueue>,
    pub publisher: Arc<dyn Publisher>,
    pub phase: Arc<WorkPhase>,
    pub partition: ChannelId,
    /// Whether side effects re-dirty their objects. Disabled on the
    /// final pass so a run terminates.
    pub dependencies_enabled: bool,
    pub cancel: CancelFlag,
    pub out_of_band: OutOfBandSet,
}

/// What one worker accumulated over its loop. Merged into the
/// [`PassOutcome`](crate::pool::PassOutcome) once every worker joined.
#[derive(Default)]
pub(crate) struct WorkerOutput {
    /// Pages that asked to be published again next pass.
    pub republish: Vec<ObjectRef>,
    /// Objects fully handled, all targets confirmed.
    pub handled: Vec<ObjectRef>,
}

/// Worker loop body. Spawned once per pool slot.
pub(crate) async fn run_worker(
    worker_id: usize,
    ctx: Arc<PassContext>,
    distributor: Arc<PageDistributor>,
) -> WorkerOutput {
    let mut output = WorkerOutput::default();
    loop {
        if ctx.cancel.is_cancelled() {
            distributor.stop(StopCause::Cancelled);
            break;
        }
        let Some(task) = distributor.next() else {
            break;
        };

        match handle_task(&ctx, &task, &mut output).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(worker_id, object = %task.object, error = %e, "task failed, stopping pass");
                distributor.record_error(e);
                break;
            }
        }
    }
    tracing::debug!(worker_id, "worker finished");
    output
}

async fn handle_task(ctx: &PassContext, task: &PageTask, output: &mut WorkerOutput) -> Result<()> {
    let key = HandledKey::new(task.object, task.channel);

    // published directly by an editor while the run was queued: the
    // output is already current, only the queue row needs clearing
    if ctx.out_of_band.take(&task.object) {
        tracing::debug!(object = %task.object, "skipping out-of-band published object");
        ctx.queue.report_initiated(key, PublishTarget::RenderStore)?;
        ctx.queue
            .report_action_done(key, PublishTarget::RenderStore)
            .await?;
        output.handled.push(task.object);
        ctx.phase.done_work(1);
        return Ok(());
    }

    let outcome = match ctx.publisher.render(task).await {
        Ok(outcome) => outcome,
        Err(PublishError::Recoverable(msg)) => {
            tracing::warn!(object = %task.object, error = %msg, "render failed, deferring object");
            ctx.queue.defer_object(&key)?;
            ctx.phase.done_work(1);
            return Ok(());
        }
        Err(e @ PublishError::Fatal(_)) => return Err(Error::Publish(e)),
    };

    for target in &outcome.targets {
        ctx.queue.report_initiated(key, *target)?;
    }

    for target in &outcome.targets {
        match ctx.publisher.write(*target, task).await {
            WriteResult::Ok => {
                ctx.queue.report_action_done(key, *target).await?;
            }
            WriteResult::Recoverable(msg) => {
                tracing::warn!(object = %task.object, %target, error = %msg, "write failed, deferring object");
                ctx.queue.defer_object(&key)?;
                ctx.phase.done_work(1);
                return Ok(());
            }
            WriteResult::Fatal(msg) => {
                return Err(Error::Publish(PublishError::Fatal(msg)));
            }
        }
    }

    if ctx.dependencies_enabled {
        for (object, attributes) in &outcome.side_effects {
            mark_side_effect(ctx, *object, attributes.clone())?;
        }
    }

    if outcome.needs_republish {
        output.republish.push(task.object);
    }

    output.handled.push(task.object);
    ctx.phase.done_work(1);
    Ok(())
}

fn mark_side_effect(
    ctx: &PassContext,
    object: ObjectRef,
    attributes: BTreeSet<String>,
) -> Result<()> {
    let attributes = if attributes.is_empty() {
        AttributeSet::WholeObject
    } else {
        AttributeSet::Named(attributes)
    };
    ctx.queue.mark_dirty(
        object,
        crate::models::DirtAction::Dependency,
        ctx.partition,
        attributes,
        false,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::models::DirtAction;
    use crate::publish::{AllowAllGate, MockPublisher};
    use crate::queue::{MockQueueStore, QueueStore};

    fn pass_context(
        store: Arc<MockQueueStore>,
        publisher: Arc<MockPublisher>,
        dependencies_enabled: bool,
    ) -> (Arc<DirtyQueue>, Arc<PassContext>) {
        let queue = Arc::new(DirtyQueue::new(
            store,
            Arc::new(AllowAllGate),
            &QueueConfig::default(),
        ));
        let root = WorkPhase::root("run");
        let phase = root.add_child("pages", 0, None);
        let ctx = Arc::new(PassContext {
            queue: queue.clone(),
            publisher,
            phase,
            partition: 1,
            dependencies_enabled,
            cancel: CancelFlag::new(),
            out_of_band: OutOfBandSet::new(),
        });
        (queue, ctx)
    }

    fn task(id: u64) -> PageTask {
        PageTask {
            object: ObjectRef::page(id),
            channel: 1,
            attributes: AttributeSet::WholeObject,
        }
    }

    async fn seed_claimed(queue: &DirtyQueue, id: u64) {
        queue
            .mark_dirty(
                ObjectRef::page(id),
                DirtAction::Modify,
                1,
                AttributeSet::WholeObject,
                false,
            )
            .unwrap();
        queue.claim_pending(&[1]).unwrap();
    }

    #[tokio::test]
    async fn test_successful_task_clears_entry() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        let (queue, ctx) = pass_context(store.clone(), publisher.clone(), true);
        seed_claimed(&queue, 1).await;

        let mut output = WorkerOutput::default();
        handle_task(&ctx, &task(1), &mut output).await.unwrap();
        queue.finalize_run().await.unwrap();

        assert_eq!(output.handled, vec![ObjectRef::page(1)]);
        assert_eq!(publisher.written_count(), 2, "both default targets written");
        assert_eq!(store.count_entries().unwrap(), 0);
        assert_eq!(ctx.phase.done(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_recoverable_render_defers_object() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        publisher.fail_render(1, PublishError::Recoverable("timeout".into()));
        let (queue, ctx) = pass_context(store.clone(), publisher, true);
        seed_claimed(&queue, 1).await;

        let mut output = WorkerOutput::default();
        handle_task(&ctx, &task(1), &mut output).await.unwrap();
        queue.finalize_run().await.unwrap();

        assert!(output.handled.is_empty());
        // the entry survived the successful-run sweep
        let survivors = store.all_entries();
        assert_eq!(survivors.len(), 1);
        assert!(!survivors[0].claimed);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_write_stops_pass() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        publisher.set_write_result(1, WriteResult::Fatal("disk full".into()));
        let (queue, ctx) = pass_context(store, publisher, true);
        seed_claimed(&queue, 1).await;

        let mut output = WorkerOutput::default();
        let err = handle_task(&ctx, &task(1), &mut output).await.unwrap_err();
        assert!(matches!(err, Error::Publish(PublishError::Fatal(_))));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_side_effects_re_dirty_when_enabled() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        let (queue, ctx) = pass_context(store.clone(), publisher, true);
        seed_claimed(&queue, 1).await;

        let mut output = WorkerOutput::default();
        // a render outcome with side effects comes from the publisher;
        // mark one manually through the same path the worker uses
        mark_side_effect(&ctx, ObjectRef::page(7), BTreeSet::new()).unwrap();
        handle_task(&ctx, &task(1), &mut output).await.unwrap();

        let entry = store
            .find_entry(&ObjectRef::page(7), DirtAction::Dependency, 1)
            .unwrap();
        assert!(entry.is_some());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_band_object_skipped_but_cleared() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        let (queue, ctx) = pass_context(store.clone(), publisher.clone(), true);
        seed_claimed(&queue, 1).await;
        ctx.out_of_band.record(ObjectRef::page(1));

        let mut output = WorkerOutput::default();
        handle_task(&ctx, &task(1), &mut output).await.unwrap();
        queue.finalize_run().await.unwrap();

        assert_eq!(output.handled, vec![ObjectRef::page(1)]);
        assert_eq!(publisher.rendered_count(), 0);
        assert_eq!(store.count_entries().unwrap(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_republish_request_collected() {
        let store = Arc::new(MockQueueStore::new());
        let publisher = Arc::new(MockPublisher::new());
        publisher.republish_once(1);
        let (queue, ctx) = pass_context(store, publisher, true);
        seed_claimed(&queue, 1).await;

        let mut output = WorkerOutput::default();
        handle_task(&ctx, &task(1), &mut output).await.unwrap();
        assert_eq!(output.republish, vec![ObjectRef::page(1)]);
        queue.shutdown().await;
    }
}
