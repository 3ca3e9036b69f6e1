//! Collaborator contracts for rendering and target writing
//!
//! The scheduler core never renders a page or talks to a content repository
//! itself; it drives narrow trait objects supplied by the embedding system:
//!
//! - [`Publisher`] - render one task and write it into its targets
//! - [`ChannelDirectory`] - the set of partitions a run covers
//! - [`PublishGate`] - filters content dirts on objects excluded from
//!   publishing
//!
//! Mock implementations live alongside the traits so unit and integration
//! tests can run without any real rendering stack.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::PublishError;
use crate::models::{ChannelId, ObjectRef, PageTask, PublishTarget, RemovalTask};

// ============================================================================
// Render Outcome
// ============================================================================

/// Result of rendering one task, before any target writes happen.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    /// Targets that must be written for this task.
    pub targets: Vec<PublishTarget>,

    /// Attributes of *other* objects dirtied as a side effect of rendering
    /// (unresolved references, recomputed navigation, ...). Fed back into
    /// the queue as dependency dirt while dependency handling is enabled.
    pub side_effects: Vec<(ObjectRef, BTreeSet<String>)>,

    /// The render result is incomplete (e.g. forward references were still
    /// unresolved) and the task wants a second pass.
    pub needs_republish: bool,
}

impl RenderOutcome {
    /// A plain successful render into the given targets.
    pub fn into_targets(targets: Vec<PublishTarget>) -> Self {
        Self {
            targets,
            side_effects: Vec::new(),
            needs_republish: false,
        }
    }
}

/// Result of writing one target (or retracting one removal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Output landed in the target.
    Ok,
    /// This write failed but the run may continue; the handshake stays
    /// open so the row is retried by the next run.
    Recoverable(String),
    /// The run cannot continue.
    Fatal(String),
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Render+write collaborator, one call pair per task.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Render the task. Declares which targets must be written.
    async fn render(&self, task: &PageTask) -> Result<RenderOutcome, PublishError>;

    /// Write the rendered output into one target.
    async fn write(&self, target: PublishTarget, task: &PageTask) -> WriteResult;

    /// Remove an object from its targets.
    async fn retract(&self, removal: &RemovalTask) -> WriteResult;
}

/// Directory of output partitions ("channels").
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Partitions a publish run covers, in processing order.
    async fn partitions(&self) -> anyhow::Result<Vec<ChannelId>>;
}

/// Filters content-affecting dirt on objects excluded from publishing.
pub trait PublishGate: Send + Sync {
    /// Whether the object may be published into the channel at all.
    fn is_publishable(&self, object: &ObjectRef, channel: ChannelId) -> bool;
}

// ============================================================================
// Trivial Implementations
// ============================================================================

/// Gate that lets everything through.
pub struct AllowAllGate;

impl PublishGate for AllowAllGate {
    fn is_publishable(&self, _object: &ObjectRef, _channel: ChannelId) -> bool {
        true
    }
}

/// Gate backed by an explicit exclusion list.
#[derive(Default)]
pub struct StaticGate {
    excluded: RwLock<BTreeSet<(ObjectRef, ChannelId)>>,
}

impl StaticGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude one object/channel pair from publishing.
    pub fn exclude(&self, object: ObjectRef, channel: ChannelId) {
        self.excluded.write().unwrap().insert((object, channel));
    }
}

impl PublishGate for StaticGate {
    fn is_publishable(&self, object: &ObjectRef, channel: ChannelId) -> bool {
        !self.excluded.read().unwrap().contains(&(*object, channel))
    }
}

/// Directory over a fixed partition list.
pub struct StaticDirectory {
    partitions: Vec<ChannelId>,
}

impl StaticDirectory {
    pub fn new(partitions: Vec<ChannelId>) -> Self {
        Self { partitions }
    }
}

#[async_trait]
impl ChannelDirectory for StaticDirectory {
    async fn partitions(&self) -> anyhow::Result<Vec<ChannelId>> {
        Ok(self.partitions.clone())
    }
}

// ============================================================================
// Mock Publisher (for testing)
// ============================================================================

/// Scriptable in-memory publisher.
///
/// Tasks render into [`PublishTarget::RenderStore`] and
/// [`PublishTarget::Filesystem`] by default; specific object ids can be
/// scripted to fail, to fail fatally, or to request a republish.
pub struct MockPublisher {
    targets: Vec<PublishTarget>,
    render_failures: Mutex<HashMap<u64, PublishError>>,
    write_results: Mutex<HashMap<u64, WriteResult>>,
    /// Objects that report `needs_republish` on every render.
    republish_always: Mutex<BTreeSet<u64>>,
    /// Objects that report `needs_republish` exactly once.
    republish_once: Mutex<BTreeSet<u64>>,
    /// Side effects emitted on an object's first render only.
    side_effects: Mutex<HashMap<u64, Vec<(ObjectRef, BTreeSet<String>)>>>,
    rendered: AtomicU64,
    written: AtomicU64,
    retracted: AtomicU64,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self {
            targets: vec![PublishTarget::RenderStore, PublishTarget::Filesystem],
            render_failures: Mutex::new(HashMap::new()),
            write_results: Mutex::new(HashMap::new()),
            republish_always: Mutex::new(BTreeSet::new()),
            republish_once: Mutex::new(BTreeSet::new()),
            side_effects: Mutex::new(HashMap::new()),
            rendered: AtomicU64::new(0),
            written: AtomicU64::new(0),
            retracted: AtomicU64::new(0),
        }
    }

    /// Override the declared targets for all tasks.
    pub fn with_targets(mut self, targets: Vec<PublishTarget>) -> Self {
        self.targets = targets;
        self
    }

    /// Script a render failure for one object id.
    pub fn fail_render(&self, object_id: u64, error: PublishError) {
        self.render_failures.lock().unwrap().insert(object_id, error);
    }

    /// Script a write result for one object id (applies to every target).
    pub fn set_write_result(&self, object_id: u64, result: WriteResult) {
        self.write_results.lock().unwrap().insert(object_id, result);
    }

    /// Make one object request a republish on every render.
    pub fn republish_always(&self, object_id: u64) {
        self.republish_always.lock().unwrap().insert(object_id);
    }

    /// Make one object request a republish on its next render only.
    pub fn republish_once(&self, object_id: u64) {
        self.republish_once.lock().unwrap().insert(object_id);
    }

    /// Make one object's next render report a side effect on another
    /// object (whole object when `attributes` is empty).
    pub fn add_side_effect(&self, object_id: u64, affected: ObjectRef, attributes: &[&str]) {
        self.side_effects
            .lock()
            .unwrap()
            .entry(object_id)
            .or_default()
            .push((
                affected,
                attributes.iter().map(|s| s.to_string()).collect(),
            ));
    }

    pub fn rendered_count(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn retracted_count(&self) -> u64 {
        self.retracted.load(Ordering::Relaxed)
    }
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn render(&self, task: &PageTask) -> Result<RenderOutcome, PublishError> {
        if let Some(err) = self.render_failures.lock().unwrap().get(&task.object.id) {
            return Err(match err {
                PublishError::Recoverable(msg) => PublishError::Recoverable(msg.clone()),
                PublishError::Fatal(msg) => PublishError::Fatal(msg.clone()),
            });
        }

        self.rendered.fetch_add(1, Ordering::Relaxed);

        let always = self
            .republish_always
            .lock()
            .unwrap()
            .contains(&task.object.id);
        let once = self.republish_once.lock().unwrap().remove(&task.object.id);
        let side_effects = self
            .side_effects
            .lock()
            .unwrap()
            .remove(&task.object.id)
            .unwrap_or_default();

        Ok(RenderOutcome {
            targets: self.targets.clone(),
            side_effects,
            needs_republish: always || once,
        })
    }

    async fn write(&self, _target: PublishTarget, task: &PageTask) -> WriteResult {
        let result = self
            .write_results
            .lock()
            .unwrap()
            .get(&task.object.id)
            .cloned()
            .unwrap_or(WriteResult::Ok);
        if result == WriteResult::Ok {
            self.written.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn retract(&self, _removal: &RemovalTask) -> WriteResult {
        self.retracted.fetch_add(1, Ordering::Relaxed);
        WriteResult::Ok
    }
}

// ============================================================================
// Tests
// ============================================================================
