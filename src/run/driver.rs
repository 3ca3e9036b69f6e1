//! Publish run driver
//!
//! [`PublishDriver`] is the production [`RunPipeline`]: it claims the
//! queue snapshot, builds the phase tree, walks the partitions (removals
//! first, then up to two page passes), and settles the queue according
//! to how the run ended.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::Config;
use crate::error::{Error, PublishError, Result, RunError};
use crate::models::{
    AttributeSet, ChannelId, HandledKey, ObjectKind, PageTask, PublishTarget, RunReport,
    RunStatus,
};
use crate::pool::{PassContext, StopCause, WorkerPool};
use crate::progress::{HistoryStore, PhaseStats, WorkPhase};
use crate::publish::{ChannelDirectory, Publisher, WriteResult};
use crate::queue::DirtyQueue;
use crate::run::{RunContext, RunPipeline};

/// Maximum page passes per partition. The second pass publishes what
/// the first one re-dirtied, with dependency fan-out disabled so the
/// run always terminates.
const MAX_PASSES: usize = 2;

pub struct PublishDriver {
    queue: Arc<DirtyQueue>,
    publisher: Arc<dyn Publisher>,
    directory: Arc<dyn ChannelDirectory>,
    history: Arc<dyn HistoryStore>,
    pool: WorkerPool,
    representative_min_pages: u64,
}

struct PartitionPhases {
    partition: ChannelId,
    removals: Arc<WorkPhase>,
    pages: Arc<WorkPhase>,
}

impl PublishDriver {
    pub fn new(
        queue: Arc<DirtyQueue>,
        publisher: Arc<dyn Publisher>,
        directory: Arc<dyn ChannelDirectory>,
        history: Arc<dyn HistoryStore>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            publisher,
            directory,
            history,
            pool: WorkerPool::new(&config.pool),
            representative_min_pages: config.pool.representative_min_pages,
        }
    }

    fn load_history(&self, phase_name: &str) -> Option<crate::progress::PhaseHistory> {
        match self.history.load(phase_name) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(phase = phase_name, error = %e, "failed to load phase history");
                None
            }
        }
    }

    fn build_phases(&self, root: &Arc<WorkPhase>, partitions: &[ChannelId]) -> Vec<PartitionPhases> {
        partitions
            .iter()
            .map(|&partition| {
                let container = root.add_child(format!("channel-{partition}"), 0, None);
                let removals_name = format!("channel-{partition}/removals");
                let pages_name = format!("channel-{partition}/pages");
                PartitionPhases {
                    partition,
                    removals: container.add_child(
                        removals_name.clone(),
                        0,
                        self.load_history(&removals_name),
                    ),
                    pages: container.add_child(
                        pages_name.clone(),
                        0,
                        self.load_history(&pages_name),
                    ),
                }
            })
            .collect()
    }

    async fn process_removals(&self, ctx: &RunContext, phases: &PartitionPhases) -> Result<()> {
        let mut removals = Vec::new();
        for kind in ObjectKind::ALL {
            removals.extend(self.queue.removal_tasks(kind, phases.partition)?);
        }
        phases.removals.set_target(removals.len() as u64);
        if removals.is_empty() {
            phases.removals.finish();
            return Ok(());
        }
        phases.removals.start();
        tracing::info!(
            partition = phases.partition,
            removals = removals.len(),
            "processing removals"
        );

        for removal in removals {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let key = HandledKey::new(removal.object, removal.channel);
            self.queue.report_initiated(key, PublishTarget::RenderStore)?;
            match self.publisher.retract(&removal).await {
                WriteResult::Ok => {
                    self.queue
                        .report_action_done(key, PublishTarget::RenderStore)
                        .await?;
                }
                WriteResult::Recoverable(msg) => {
                    tracing::warn!(object = %removal.object, error = %msg, "retract failed, deferring");
                    self.queue.defer_object(&key)?;
                }
                WriteResult::Fatal(msg) => {
                    return Err(Error::Publish(PublishError::Fatal(msg)));
                }
            }
            phases.removals.done_work(1);
        }
        phases.removals.finish();
        Ok(())
    }

    fn select_page_tasks(&self, partition: ChannelId) -> Result<Vec<PageTask>> {
        let mut tasks = Vec::new();
        for kind in ObjectKind::ALL {
            tasks.extend(self.queue.publish_tasks(kind, partition)?);
        }
        Ok(tasks)
    }

    /// Run the page passes of one partition. Returns the number of
    /// republish requests left unserved after the final pass.
    async fn process_pages(
        &self,
        ctx: &RunContext,
        phases: &PartitionPhases,
        claimed: &mut BTreeMap<ObjectKind, u64>,
    ) -> Result<u64> {
        let mut tasks = self.select_page_tasks(phases.partition)?;
        phases.pages.set_target(tasks.len() as u64);
        if tasks.is_empty() {
            phases.pages.finish();
            return Ok(0);
        }
        phases.pages.start();

        let mut republish_pending = 0u64;
        // channel-0 rows stay claimed until the finalize sweep, so the
        // re-selection below must skip objects already handled
        let mut handled = BTreeSet::new();
        for pass in 0..MAX_PASSES {
            let final_pass = pass + 1 == MAX_PASSES;
            tracing::info!(
                partition = phases.partition,
                pass,
                tasks = tasks.len(),
                "starting page pass"
            );

            let pass_ctx = Arc::new(PassContext {
                queue: self.queue.clone(),
                publisher: self.publisher.clone(),
                phase: phases.pages.clone(),
                partition: phases.partition,
                dependencies_enabled: !final_pass,
                cancel: ctx.cancel.clone(),
                out_of_band: ctx.out_of_band.clone(),
            });
            let outcome = self.pool.run_pass(pass_ctx, tasks).await;

            if let Some(e) = outcome.error {
                return Err(e);
            }
            if outcome.stop_cause == Some(StopCause::Cancelled) || ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            handled.extend(outcome.handled);

            let mut next: BTreeMap<_, _> = outcome
                .republish
                .into_iter()
                .map(|object| {
                    (
                        object,
                        PageTask {
                            object,
                            channel: phases.partition,
                            attributes: AttributeSet::WholeObject,
                        },
                    )
                })
                .collect();

            if final_pass {
                republish_pending = next.len() as u64;
                if republish_pending > 0 {
                    tracing::warn!(
                        partition = phases.partition,
                        republish_pending,
                        "republish requests left for the next run"
                    );
                }
                break;
            }

            // sweep in whatever the pass re-dirtied; drain the remover
            // first so already-handled rows are gone from the selection
            self.queue.await_removals().await?;
            for claim in self.queue.claim_pending(&[phases.partition])? {
                *claimed.entry(claim.kind).or_insert(0) += claim.entries;
            }
            for task in self.select_page_tasks(phases.partition)? {
                if handled.contains(&task.object) {
                    continue;
                }
                next.entry(task.object).or_insert(task);
            }

            if next.is_empty() {
                break;
            }
            tasks = next.into_values().collect();
            phases
                .pages
                .set_target(phases.pages.target() + tasks.len() as u64);
        }

        phases.pages.finish();
        Ok(republish_pending)
    }

    fn save_history(&self, phases: &[PartitionPhases], representative: bool) {
        for entry in phases {
            for phase in [&entry.removals, &entry.pages] {
                let stats = PhaseStats {
                    elapsed: phase.elapsed(),
                    units: phase.done(),
                };
                if stats.units == 0 {
                    continue;
                }
                let has_prior = matches!(self.history.load(phase.name()), Ok(Some(_)));
                if representative || !has_prior {
                    if let Err(e) = self.history.save(phase.name(), stats.to_history()) {
                        tracing::warn!(phase = phase.name(), error = %e, "failed to save phase history");
                    }
                }
            }
        }
    }

    fn build_report(
        ctx: &RunContext,
        status: RunStatus,
        claimed: &BTreeMap<ObjectKind, u64>,
        remaining: BTreeMap<ObjectKind, u64>,
        republish_pending: u64,
        started_at: chrono::DateTime<Utc>,
        error: Option<String>,
    ) -> RunReport {
        let published = claimed
            .iter()
            .map(|(kind, total)| {
                let left = remaining.get(kind).copied().unwrap_or(0);
                (*kind, total.saturating_sub(left))
            })
            .collect();
        RunReport {
            run_id: ctx.run_id,
            status,
            published,
            remaining,
            republish_pending,
            error,
            started_at,
            ended_at: Utc::now(),
        }
    }

    async fn run_inner(
        &self,
        ctx: &RunContext,
        claimed: &mut BTreeMap<ObjectKind, u64>,
        phases_out: &mut Vec<PartitionPhases>,
    ) -> Result<u64> {
        let partitions = self
            .directory
            .partitions()
            .await
            .map_err(|e| Error::Run(RunError::DriverFailed(format!("partition directory: {e:#}"))))?;

        self.queue.begin_run();
        for claim in self.queue.claim_pending(&partitions)? {
            *claimed.entry(claim.kind).or_insert(0) += claim.entries;
        }
        tracing::info!(
            partitions = partitions.len(),
            claimed = claimed.values().sum::<u64>(),
            "claimed run snapshot"
        );

        let root = WorkPhase::root("publish-run");
        *phases_out = self.build_phases(&root, &partitions);
        ctx.attach_progress(root.clone());
        ctx.set_running()?;
        root.start();

        let mut republish_pending = 0u64;
        for phases in phases_out.iter() {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.process_removals(ctx, phases).await?;
            republish_pending += self.process_pages(ctx, phases, claimed).await?;
        }
        root.finish();
        Ok(republish_pending)
    }
}

#[async_trait]
impl RunPipeline for PublishDriver {
    async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
        let started_at = Utc::now();
        let mut claimed = BTreeMap::new();
        let mut phases = Vec::new();

        match self.run_inner(&ctx, &mut claimed, &mut phases).await {
            Ok(republish_pending) => {
                let remaining = self.queue.finalize_run().await?;
                let total_pages: u64 = claimed.values().sum();
                self.save_history(&phases, total_pages >= self.representative_min_pages);
                Ok(Self::build_report(
                    &ctx,
                    RunStatus::Succeeded,
                    &claimed,
                    remaining,
                    republish_pending,
                    started_at,
                    None,
                ))
            }
            Err(e) => {
                let cancelled = e.is_cancelled() || ctx.cancel.is_cancelled();
                let remaining = self.queue.remaining_counts().unwrap_or_default();
                if let Err(re) = self.queue.handle_failed_run().await {
                    tracing::error!(error = %re, "failed to release run snapshot");
                }
                let (status, error) = if cancelled {
                    (RunStatus::Cancelled, Some("cancelled".to_string()))
                } else {
                    (RunStatus::Failed, Some(e.to_string()))
                };
                Ok(Self::build_report(
                    &ctx, status, &claimed, remaining, 0, started_at, error,
                ))
            }
        }
    }
}
