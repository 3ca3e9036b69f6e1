//! Publish-run lifecycle
//!
//! A run is owned by the [`RunController`]: it validates state
//! transitions, spawns the pipeline onto the runtime, carries the
//! cancellation flag, and serves status snapshots. The actual publishing
//! work lives behind the [`RunPipeline`] trait, implemented by
//! [`driver::PublishDriver`].
//!
//! State machine:
//!
//! ```text
//!   Stopped ──> Initializing ──> Running ──┬──> Stopped   (success)
//!                    │              │      ├──> Cancelled ──> Stopped
//!                    └──────────────┴──────┴──> Error ──────> Stopped
//! ```

pub mod driver;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result, RunError};
use crate::models::{ObjectRef, RunReport};
use crate::progress::{PhaseSnapshot, WorkPhase};

// ============================================================================
// Run State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Initializing,
    Running,
    Cancelled,
    Error,
}

impl RunState {
    /// Legal transitions of the run state machine.
    pub fn can_transition(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Stopped, Initializing)
                | (Initializing, Running)
                | (Initializing, Cancelled)
                | (Initializing, Error)
                | (Running, Stopped)
                | (Running, Cancelled)
                | (Running, Error)
                | (Cancelled, Stopped)
                | (Error, Stopped)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunState::Initializing | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Stopped => "stopped",
            RunState::Initializing => "initializing",
            RunState::Running => "running",
            RunState::Cancelled => "cancelled",
            RunState::Error => "error",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation token shared between the controller and
/// every worker of a run.
#[derive(Clone)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Out-of-band publishes
// ============================================================================

/// Objects already published directly by an editor while a run was
/// queued. The run skips republishing them but still clears their rows.
#[derive(Clone, Default)]
pub struct OutOfBandSet {
    inner: Arc<Mutex<HashSet<ObjectRef>>>,
}

impl OutOfBandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, object: ObjectRef) {
        self.inner.lock().unwrap().insert(object);
    }

    /// Consume the mark for one object. Returns whether it was present.
    pub fn take(&self, object: &ObjectRef) -> bool {
        self.inner.lock().unwrap().remove(object)
    }

    /// Drop every mark. Marks coordinate with the run they were recorded
    /// during; a new run starts with a clean slate.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

// ============================================================================
// Pipeline Trait
// ============================================================================

/// Everything the pipeline needs from the controller.
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancelFlag,
    pub out_of_band: OutOfBandSet,
    handle: RunHandle,
}

impl RunContext {
    /// Report that initialization finished and the run is executing.
    pub fn set_running(&self) -> Result<()> {
        self.handle.set_running()
    }

    /// Publish the run's phase tree for status reporting.
    pub fn attach_progress(&self, root: Arc<WorkPhase>) {
        self.handle.attach_progress(root);
    }
}

/// The work a run performs. Implemented by [`driver::PublishDriver`];
/// tests substitute their own.
#[async_trait]
pub trait RunPipeline: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> Result<RunReport>;
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerState {
    state: RunState,
    run_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    error: Option<String>,
    last_report: Option<RunReport>,
}

struct ControllerInner {
    state: Mutex<ControllerState>,
    progress: Mutex<Option<Arc<WorkPhase>>>,
}

impl ControllerState {
    /// Apply a transition if the state machine allows it.
    fn step(&mut self, to: RunState) -> bool {
        if !self.state.can_transition(to) {
            return false;
        }
        tracing::debug!(from = %self.state, to = %to, "run state transition");
        self.state = to;
        true
    }
}

impl ControllerInner {
    fn transition(&self, to: RunState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.step(to) {
            Ok(())
        } else {
            Err(Error::Run(RunError::InvalidTransition {
                from: state.state.to_string(),
                to: to.to_string(),
            }))
        }
    }
}

/// Handle given to the pipeline for reporting back.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<ControllerInner>,
}

impl RunHandle {
    fn set_running(&self) -> Result<()> {
        self.inner.transition(RunState::Running)
    }

    fn attach_progress(&self, root: Arc<WorkPhase>) {
        *self.inner.progress.lock().unwrap() = Some(root);
    }
}

/// Serializable run status, served locally and over the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusView {
    pub state: RunState,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: Option<PhaseSnapshot>,
    pub last_report: Option<RunReport>,
}

/// Owns the run lifecycle on this node.
pub struct RunController {
    inner: Arc<ControllerInner>,
    pipeline: Arc<dyn RunPipeline>,
    out_of_band: OutOfBandSet,
    cancel: Mutex<Option<CancelFlag>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunController {
    pub fn new(pipeline: Arc<dyn RunPipeline>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(ControllerState {
                    state: RunState::Stopped,
                    run_id: None,
                    started_at: None,
                    error: None,
                    last_report: None,
                }),
                progress: Mutex::new(None),
            }),
            pipeline,
            out_of_band: OutOfBandSet::new(),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.state.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Record a direct editor publish so the next run skips the object.
    pub fn record_out_of_band(&self, object: ObjectRef) {
        self.out_of_band.record(object);
    }

    /// Start a run. With `force`, a currently active run is cancelled
    /// and the start fails; the caller retries after it winds down.
    pub fn start(self: &Arc<Self>, force: bool) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.state.is_active() {
                if force {
                    if let Some(cancel) = self.cancel.lock().unwrap().as_ref() {
                        cancel.cancel();
                    }
                    state.step(RunState::Cancelled);
                }
                return Err(Error::Run(RunError::AlreadyRunning));
            }
            let from = state.state;
            if !state.step(RunState::Initializing) {
                return Err(Error::Run(RunError::InvalidTransition {
                    from: from.to_string(),
                    to: RunState::Initializing.to_string(),
                }));
            }
            state.run_id = Some(run_id);
            state.started_at = Some(Utc::now());
            state.error = None;
        }
        *self.inner.progress.lock().unwrap() = None;

        let cancel = CancelFlag::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let ctx = RunContext {
            run_id,
            cancel: cancel.clone(),
            out_of_band: self.out_of_band.clone(),
            handle: RunHandle {
                inner: self.inner.clone(),
            },
        };

        let controller = self.clone();
        let task = tokio::spawn(async move {
            tracing::info!(%run_id, "publish run starting");
            let result = controller.pipeline.execute(ctx).await;
            controller.settle(run_id, result, cancel);
        });
        *self.task.lock().unwrap() = Some(task);

        Ok(run_id)
    }

    fn settle(&self, run_id: Uuid, result: Result<RunReport>, cancel: CancelFlag) {
        let metrics = crate::metrics::global();
        match result {
            Ok(report) => {
                let outcome = match report.status {
                    crate::models::RunStatus::Succeeded => "succeeded",
                    crate::models::RunStatus::Cancelled => "cancelled",
                    crate::models::RunStatus::Failed => "failed",
                };
                metrics.runs_total.with_label_values(&[outcome]).inc();
                let duration = (report.ended_at - report.started_at)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0;
                metrics.run_duration_seconds.observe(duration);
                for (kind, count) in &report.published {
                    metrics
                        .objects_published_total
                        .with_label_values(&[kind.as_str()])
                        .inc_by(*count);
                }
                match report.status {
                    crate::models::RunStatus::Succeeded => {
                        tracing::info!(%run_id, published = report.total_published(), "publish run finished");
                    }
                    crate::models::RunStatus::Cancelled => {
                        tracing::warn!(%run_id, "publish run cancelled");
                    }
                    crate::models::RunStatus::Failed => {
                        tracing::error!(%run_id, error = ?report.error, "publish run failed");
                    }
                }
                let through = match report.status {
                    crate::models::RunStatus::Succeeded => None,
                    crate::models::RunStatus::Cancelled => Some(RunState::Cancelled),
                    crate::models::RunStatus::Failed => Some(RunState::Error),
                };
                let mut state = self.inner.state.lock().unwrap();
                state.error = report.error.clone();
                state.last_report = Some(report);
                Self::wind_down(&mut state, through);
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                metrics.runs_total.with_label_values(&["cancelled"]).inc();
                tracing::warn!(%run_id, "publish run cancelled");
                let mut state = self.inner.state.lock().unwrap();
                state.error = Some("cancelled".to_string());
                Self::wind_down(&mut state, Some(RunState::Cancelled));
            }
            Err(e) => {
                metrics.runs_total.with_label_values(&["failed"]).inc();
                tracing::error!(%run_id, error = %e, "publish run failed");
                let mut state = self.inner.state.lock().unwrap();
                // first error wins
                if state.error.is_none() {
                    state.error = Some(e.to_string());
                }
                Self::wind_down(&mut state, Some(RunState::Error));
            }
        }
        // unconsumed marks were for this run only
        self.out_of_band.clear();
        *self.cancel.lock().unwrap() = None;
    }

    /// Move the state machine to `Stopped` once the run task has exited,
    /// passing through the cancelled or error state when it is not
    /// already there.
    fn wind_down(state: &mut ControllerState, through: Option<RunState>) {
        if let Some(intermediate) = through {
            if state.state != intermediate {
                state.step(intermediate);
            }
        }
        if !state.step(RunState::Stopped) && state.state != RunState::Stopped {
            tracing::warn!(from = %state.state, "forcing run state to stopped after wind-down");
            state.state = RunState::Stopped;
        }
        state.run_id = None;
    }

    /// Request cancellation of the active run. With `block`, wait until
    /// the run task has fully wound down.
    pub async fn stop(&self, block: bool) -> Result<()> {
        let cancel = self.cancel.lock().unwrap().clone();
        match cancel {
            Some(cancel) => {
                cancel.cancel();
                // surface the wind-down to status() right away
                self.inner.state.lock().unwrap().step(RunState::Cancelled);
            }
            None => return Ok(()),
        }
        if block {
            let task = self.task.lock().unwrap().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "run task join failed");
                }
            }
        }
        Ok(())
    }

    /// Wait for the active run task to finish, if any.
    pub async fn join(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn status(&self) -> RunStatusView {
        let state = self.inner.state.lock().unwrap();
        let progress = self
            .inner
            .progress
            .lock()
            .unwrap()
            .as_ref()
            .map(|root| root.snapshot());
        RunStatusView {
            state: state.state,
            run_id: state.run_id,
            started_at: state.started_at,
            error: state.error.clone(),
            progress,
            last_report: state.last_report.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use std::time::Duration;

    struct InstantPipeline;

    #[async_trait]
    impl RunPipeline for InstantPipeline {
        async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
            ctx.set_running()?;
            Ok(RunReport::new(ctx.run_id, RunStatus::Succeeded))
        }
    }

    struct BlockingPipeline;

    #[async_trait]
    impl RunPipeline for BlockingPipeline {
        async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
            ctx.set_running()?;
            ctx.cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }

    struct FailingPipeline;

    #[async_trait]
    impl RunPipeline for FailingPipeline {
        async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
            ctx.set_running()?;
            Err(Error::Run(RunError::DriverFailed("boom".into())))
        }
    }

    #[test]
    fn test_transition_table() {
        use RunState::*;
        assert!(Stopped.can_transition(Initializing));
        assert!(Initializing.can_transition(Running));
        assert!(Running.can_transition(Cancelled));
        assert!(Cancelled.can_transition(Stopped));
        assert!(Error.can_transition(Stopped));

        assert!(!Stopped.can_transition(Running));
        assert!(!Running.can_transition(Initializing));
        assert!(!Cancelled.can_transition(Running));
    }

    #[tokio::test]
    async fn test_successful_run_settles_to_stopped() {
        let controller = Arc::new(RunController::new(Arc::new(InstantPipeline)));
        let run_id = controller.start(false).unwrap();
        controller.join().await;

        let status = controller.status();
        assert_eq!(status.state, RunState::Stopped);
        assert!(status.error.is_none());
        assert_eq!(status.last_report.unwrap().run_id, run_id);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_active() {
        let controller = Arc::new(RunController::new(Arc::new(BlockingPipeline)));
        controller.start(false).unwrap();
        // give the task a chance to reach Running
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = controller.start(false).unwrap_err();
        assert!(matches!(err, Error::Run(RunError::AlreadyRunning)));

        controller.stop(true).await.unwrap();
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_force_start_cancels_active_run() {
        let controller = Arc::new(RunController::new(Arc::new(BlockingPipeline)));
        controller.start(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // still an error, but the active run is now winding down
        assert!(controller.start(true).is_err());
        controller.join().await;
        assert_eq!(controller.state(), RunState::Stopped);

        // a plain start succeeds again
        controller.start(false).unwrap();
        controller.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let controller = Arc::new(RunController::new(Arc::new(FailingPipeline)));
        controller.start(false).unwrap();
        controller.join().await;

        let status = controller.status();
        assert_eq!(status.state, RunState::Stopped);
        assert!(status.error.unwrap().contains("boom"));
    }

    struct SlowWindDownPipeline;

    #[async_trait]
    impl RunPipeline for SlowWindDownPipeline {
        async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
            ctx.set_running()?;
            ctx.cancel.cancelled().await;
            // keep draining for a while after the cancel request
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err(Error::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_stop_reports_cancelled_during_wind_down() {
        let controller = Arc::new(RunController::new(Arc::new(SlowWindDownPipeline)));
        controller.start(false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        controller.stop(false).await.unwrap();
        assert_eq!(controller.state(), RunState::Cancelled);

        controller.join().await;
        assert_eq!(controller.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_out_of_band_marks_do_not_leak_into_the_next_run() {
        struct CapturePipeline {
            seen: Arc<Mutex<Vec<usize>>>,
        }

        #[async_trait]
        impl RunPipeline for CapturePipeline {
            async fn execute(&self, ctx: RunContext) -> Result<RunReport> {
                ctx.set_running()?;
                self.seen.lock().unwrap().push(ctx.out_of_band.len());
                Ok(RunReport::new(ctx.run_id, RunStatus::Succeeded))
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let controller = Arc::new(RunController::new(Arc::new(CapturePipeline {
            seen: seen.clone(),
        })));
        controller.record_out_of_band(ObjectRef::page(7));

        // the first run sees the mark; an unconsumed mark must not
        // suppress work in the run after it
        controller.start(false).unwrap();
        controller.join().await;
        controller.start(false).unwrap();
        controller.join().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[tokio::test]
    async fn test_out_of_band_take_is_one_shot() {
        let set = OutOfBandSet::new();
        set.record(ObjectRef::page(1));
        assert!(set.take(&ObjectRef::page(1)));
        assert!(!set.take(&ObjectRef::page(1)));
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move {
                flag.cancelled().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
