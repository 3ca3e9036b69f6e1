//! Dirty-object queue
//!
//! Central service for marking objects dirty and feeding publish runs.
//! Every mark goes through the same pipeline: publishability gate,
//! dependency-batch routing, cancellation of superseded entries, then
//! merge-or-insert against the unique `(object, action, channel)` key.
//!
//! Architecture:
//!
//! ```text
//!   mark_dirty ──> gate ──> batch? ──> cancellations ──> merge/insert
//!                                                            │
//!   start_run ── claim snapshot ──> publish_tasks/removal_tasks
//!                                                            │
//!   workers ── initiate/report_done ──> HandledMap ──> QueueRemover
//!                                                            │
//!   finalize_run / handle_failed_run <── await_drained ──────┘
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::models::{
    AttributeSet, ChannelId, DirtAction, HandledKey, ObjectKind, ObjectRef, PageTask,
    PublishTarget, QueueEntry, RemovalTask,
};
use crate::publish::PublishGate;
use crate::queue::batch::DependencyBatch;
use crate::queue::handled::HandledMap;
use crate::queue::remover::QueueRemover;
use crate::queue::store::{ClaimCount, NewEntry, QueueStore};

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to a single dirty mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtDisposition {
    /// A new entry was written.
    Inserted,
    /// An existing entry for the same key absorbed the mark.
    Merged,
    /// The mark went into the open dependency batch.
    Buffered,
    /// The gate rejected the object; nothing was written.
    Skipped,
}

/// Result of [`DirtyQueue::mark_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtOutcome {
    pub disposition: DirtDisposition,
    /// Pending entries cancelled by this mark.
    pub cancelled: u64,
}

impl DirtOutcome {
    fn new(disposition: DirtDisposition, cancelled: u64) -> Self {
        Self {
            disposition,
            cancelled,
        }
    }
}

// ============================================================================
// Dirty Queue
// ============================================================================

/// The durable dirty-object queue.
///
/// Thread-safe; share it behind an `Arc`. Mutating calls that only touch
/// the store are synchronous, the run-lifecycle calls are async because
/// they wait on the background remover.
pub struct DirtyQueue {
    store: Arc<dyn QueueStore>,
    gate: Arc<dyn PublishGate>,
    handled: HandledMap,
    remover: QueueRemover,
    batch: Mutex<Option<DependencyBatch>>,
    handled_count: AtomicU64,
}

impl DirtyQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        gate: Arc<dyn PublishGate>,
        config: &QueueConfig,
    ) -> Self {
        let remover = QueueRemover::spawn(
            store.clone(),
            config.remover_buffer,
            config.remover_batch,
        );
        Self {
            store,
            gate,
            handled: HandledMap::new(),
            remover,
            batch: Mutex::new(None),
            handled_count: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Marking
    // ------------------------------------------------------------------

    /// Mark an object dirty.
    ///
    /// Removing actions always enqueue; publish-affecting actions are
    /// checked against the gate first. While a dependency batch is open,
    /// `Dependency` marks are buffered instead of written.
    pub fn mark_dirty(
        &self,
        object: ObjectRef,
        action: DirtAction,
        channel: ChannelId,
        attributes: AttributeSet,
        delayed: bool,
    ) -> Result<DirtOutcome, QueueError> {
        if action.affects_content() && !self.gate.is_publishable(&object, channel) {
            tracing::debug!(%object, %action, "gate rejected dirty mark");
            return Ok(DirtOutcome::new(DirtDisposition::Skipped, 0));
        }

        if action == DirtAction::Dependency {
            let mut batch = self.batch.lock().unwrap();
            if let Some(batch) = batch.as_mut() {
                batch.add(object, channel, attributes);
                return Ok(DirtOutcome::new(DirtDisposition::Buffered, 0));
            }
        }

        let cancelled = self.apply_cancellations(&object, action, channel)?;

        let outcome = match self.store.find_entry(&object, action, channel)? {
            Some(existing) => {
                self.merge_into(&existing, &attributes, delayed)?;
                DirtOutcome::new(DirtDisposition::Merged, cancelled)
            }
            None => {
                self.store.insert_entry(&NewEntry {
                    object,
                    action,
                    channel,
                    delayed,
                    attributes,
                })?;
                DirtOutcome::new(DirtDisposition::Inserted, cancelled)
            }
        };

        tracing::trace!(%object, %action, channel, ?outcome, "object marked dirty");
        Ok(outcome)
    }

    /// Cancellations declared by the incoming action, applied to the
    /// object's unclaimed pending entries.
    fn apply_cancellations(
        &self,
        object: &ObjectRef,
        action: DirtAction,
        channel: ChannelId,
    ) -> Result<u64, QueueError> {
        let rules = action.cancellations();
        if rules.is_empty() {
            return Ok(0);
        }

        let victims: Vec<i64> = self
            .store
            .entries_for_object(object)?
            .into_iter()
            .filter(|pending| !pending.claimed)
            .filter(|pending| {
                rules
                    .iter()
                    .any(|rule| rule.cancels(pending.action, pending.channel, channel))
            })
            .map(|pending| pending.id)
            .collect();

        if victims.is_empty() {
            return Ok(0);
        }
        let cancelled = self.store.delete_entries(&victims)?;
        tracing::debug!(%object, %action, cancelled, "cancelled superseded entries");
        Ok(cancelled)
    }

    fn merge_into(
        &self,
        existing: &QueueEntry,
        attributes: &AttributeSet,
        delayed: bool,
    ) -> Result<(), QueueError> {
        let mut merged = existing.attributes.clone();
        merged.merge(attributes);
        if merged != existing.attributes {
            self.store.set_attributes(existing.id, &merged)?;
        }
        // a live mark wakes a delayed entry; the reverse never re-delays
        if existing.delayed && !delayed {
            self.store.clear_delayed(existing.id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependency batches
    // ------------------------------------------------------------------

    /// Start buffering `Dependency` marks.
    pub fn open_dependency_batch(&self) -> Result<(), QueueError> {
        let mut batch = self.batch.lock().unwrap();
        if batch.is_some() {
            return Err(QueueError::BatchAlreadyActive);
        }
        *batch = Some(DependencyBatch::new());
        Ok(())
    }

    /// Write the open batch to the store. Returns rows inserted.
    pub fn commit_dependency_batch(&self) -> Result<u64, QueueError> {
        let batch = self
            .batch
            .lock()
            .unwrap()
            .take()
            .ok_or(QueueError::NoActiveBatch)?;
        Ok(batch.commit(&*self.store)?)
    }

    /// Drop the open batch. Returns the number of buffered marks lost.
    pub fn discard_dependency_batch(&self) -> Result<u64, QueueError> {
        let batch = self
            .batch
            .lock()
            .unwrap()
            .take()
            .ok_or(QueueError::NoActiveBatch)?;
        Ok(batch.len() as u64)
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    /// Claim the current non-delayed entries of the given partitions
    /// (channel-0 entries included) as the run's snapshot.
    ///
    /// Also called again before a republish pass to sweep in entries
    /// dirtied while the run was underway.
    pub fn claim_pending(&self, partitions: &[ChannelId]) -> Result<Vec<ClaimCount>, QueueError> {
        Ok(self.store.claim_for_run(partitions)?)
    }

    /// Reset per-run handshake state. Call once at run start.
    pub fn begin_run(&self) {
        self.handled.clear();
        self.handled_count.store(0, Ordering::Relaxed);
    }

    /// Claimed publish work for one kind and partition, merged per object.
    ///
    /// An object with several claimed entries yields a single task; an
    /// entry without attribute restriction widens the merged set to the
    /// whole object.
    pub fn publish_tasks(
        &self,
        kind: ObjectKind,
        partition: ChannelId,
    ) -> Result<Vec<PageTask>, QueueError> {
        let entries = self.store.select_publish(kind, true, partition, &[])?;

        let mut merged: BTreeMap<ObjectRef, AttributeSet> = BTreeMap::new();
        for entry in entries {
            merged
                .entry(entry.object)
                .and_modify(|attrs| attrs.merge(&entry.attributes))
                .or_insert(entry.attributes);
        }

        Ok(merged
            .into_iter()
            .map(|(object, attributes)| PageTask {
                object,
                channel: partition,
                attributes,
            })
            .collect())
    }

    /// Claimed removal work for one kind and partition.
    pub fn removal_tasks(
        &self,
        kind: ObjectKind,
        partition: ChannelId,
    ) -> Result<Vec<RemovalTask>, QueueError> {
        let entries = self.store.select_removals(kind, true, partition)?;
        Ok(entries
            .into_iter()
            .map(|entry| RemovalTask {
                object: entry.object,
                channel: entry.channel,
                action: entry.action,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Announce an upcoming target write for an object.
    pub fn report_initiated(
        &self,
        key: HandledKey,
        target: PublishTarget,
    ) -> Result<(), QueueError> {
        self.handled.initiate(key, target)
    }

    /// Confirm a target write. When the object becomes fully handled its
    /// claimed rows are queued for background removal. Returns whether
    /// the object is now fully handled.
    pub async fn report_action_done(
        &self,
        key: HandledKey,
        target: PublishTarget,
    ) -> Result<bool, QueueError> {
        let fully_handled = self.handled.report_done(key, target)?;
        if fully_handled {
            self.remover.remove(key).await?;
            self.handled_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(fully_handled)
    }

    /// Abandon an object's handshake so its entry survives the run.
    /// Used after a recoverable write failure.
    pub fn abandon_handling(&self, key: &HandledKey) {
        self.handled.abandon(key);
    }

    /// Give an object's claimed rows back to the pending queue and drop
    /// its handshake state. The object stays dirty for the next run even
    /// when this run finishes cleanly.
    pub fn defer_object(&self, key: &HandledKey) -> Result<u64, QueueError> {
        self.handled.abandon(key);
        Ok(self.store.release_object(key)?)
    }

    /// Objects fully handled since [`Self::begin_run`].
    pub fn handled_count(&self) -> u64 {
        self.handled_count.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Run finalization
    // ------------------------------------------------------------------

    /// Remaining claimed entries per kind. During or after a run this is
    /// the unhandled residue of the snapshot.
    pub fn remaining_counts(&self) -> Result<BTreeMap<ObjectKind, u64>, QueueError> {
        Ok(self.store.claimed_counts()?)
    }

    /// Wait for the background remover to catch up with everything
    /// reported handled so far.
    pub async fn await_removals(&self) -> Result<(), QueueError> {
        self.remover.await_drained().await
    }

    /// Successful run: drain the remover, then sweep every remaining
    /// claimed row. Returns the per-kind counts that were still claimed
    /// at sweep time.
    pub async fn finalize_run(&self) -> Result<BTreeMap<ObjectKind, u64>, QueueError> {
        self.remover.await_drained().await?;
        let remaining = self.store.claimed_counts()?;
        let swept = self.store.delete_claimed()?;
        self.handled.clear();
        tracing::info!(swept, "run finalized, claimed entries removed");
        Ok(remaining)
    }

    /// Failed or cancelled run: drain the remover (whatever was fully
    /// handled stays deleted), then release the rest back to pending.
    /// Returns rows released.
    pub async fn handle_failed_run(&self) -> Result<u64, QueueError> {
        self.remover.await_drained().await?;
        let released = self.store.release_claimed()?;
        self.handled.clear();
        tracing::warn!(released, "run failed, claimed entries released");
        Ok(released)
    }

    /// Total live entries.
    pub fn count(&self) -> Result<u64, QueueError> {
        Ok(self.store.count_entries()?)
    }

    /// Stop the background remover. The queue is unusable for runs
    /// afterwards.
    pub async fn shutdown(&self) {
        self.remover.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
