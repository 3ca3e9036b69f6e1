//! Core data structures for the publish scheduler
//!
//! This module defines the vocabulary shared by the dirty queue, the work
//! phase tree, the run state machine and the worker pool:
//!
//! - [`ObjectKind`] / [`ObjectRef`] - the publishable object universe
//! - [`DirtAction`] - why an object was dirtied, with its cancellation rules
//! - [`AttributeSet`] - attribute-level dirt tracking
//! - [`QueueEntry`] - a durable "something must be (re-)published" row
//! - [`PageTask`] / [`RemovalTask`] - units of work handed to workers
//! - [`RunReport`] - the machine-readable outcome of one publish run

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Channels
// ============================================================================

/// Logical output partition (a site/node an object is published into).
pub type ChannelId = u32;

/// Channel value meaning "applies to all partitions".
pub const ALL_CHANNELS: ChannelId = 0;

// ============================================================================
// Object Identity
// ============================================================================

/// Closed set of publishable object kinds.
///
/// Replaces an integer type discriminator so that per-kind behavior
/// (attribute tracking, phase naming) lives on the enum instead of in
/// scattered integer switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Page,
    Folder,
    File,
    Form,
}

impl ObjectKind {
    /// All kinds, in processing order.
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Page,
        ObjectKind::Folder,
        ObjectKind::File,
        ObjectKind::Form,
    ];

    /// String representation used as the persistence discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Page => "page",
            ObjectKind::Folder => "folder",
            ObjectKind::File => "file",
            ObjectKind::Form => "form",
        }
    }

    /// Whether attribute-level dirt tracking applies to this kind.
    ///
    /// Folders and binary files are always re-published whole; pages and
    /// forms can be re-rendered for a subset of changed attributes.
    pub fn tracks_attributes(&self) -> bool {
        matches!(self, ObjectKind::Page | ObjectKind::Form)
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(ObjectKind::Page),
            "folder" => Ok(ObjectKind::Folder),
            "file" => Ok(ObjectKind::File),
            "form" => Ok(ObjectKind::Form),
            other => Err(format!("unknown object kind '{other}'")),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a publishable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: u64,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: u64) -> Self {
        Self { kind, id }
    }

    /// Shorthand for page references, the most common case.
    pub fn page(id: u64) -> Self {
        Self::new(ObjectKind::Page, id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ============================================================================
// Dirt Actions
// ============================================================================

/// Why an object was dirtied, and what must happen to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtAction {
    /// Object was created and must be published for the first time.
    Create,
    /// Object content or metadata changed.
    Modify,
    /// A dependency of the object changed (link target, template, ...).
    Dependency,
    /// Object moved; targets must be updated in place.
    Move,
    /// Object was deleted entirely.
    Delete,
    /// Object must be removed from one channel.
    Remove,
    /// Object was taken offline everywhere.
    Offline,
    /// Object is hidden in one channel.
    Hide,
    /// Object becomes visible again in one channel.
    Unhide,
}

/// Which channels a cancellation rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Only entries in the channel being dirtied.
    SameChannel,
    /// Entries in every channel.
    AllChannels,
}

/// Which pending actions a cancellation rule removes.
#[derive(Debug, Clone, Copy)]
pub enum CancelVictims {
    /// Every pending action except the listed ones.
    AllExcept(&'static [DirtAction]),
    /// Only the listed actions.
    Only(&'static [DirtAction]),
}

/// One "inserting this action removes those entries" rule.
#[derive(Debug, Clone, Copy)]
pub struct CancelRule {
    pub scope: CancelScope,
    pub victims: CancelVictims,
}

impl CancelRule {
    /// Whether a pending `(action, channel)` entry falls to this rule when
    /// the rule's owner is inserted for `inserted_channel`.
    pub fn cancels(
        &self,
        pending: DirtAction,
        pending_channel: ChannelId,
        inserted_channel: ChannelId,
    ) -> bool {
        let in_scope = match self.scope {
            CancelScope::AllChannels => true,
            CancelScope::SameChannel => pending_channel == inserted_channel,
        };
        if !in_scope {
            return false;
        }
        match self.victims {
            CancelVictims::AllExcept(keep) => !keep.contains(&pending),
            CancelVictims::Only(only) => only.contains(&pending),
        }
    }
}

impl DirtAction {
    /// The four actions that take an object *out* of a target.
    pub const REMOVING: [DirtAction; 4] = [
        DirtAction::Delete,
        DirtAction::Remove,
        DirtAction::Offline,
        DirtAction::Hide,
    ];

    /// String representation used as the persistence discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtAction::Create => "create",
            DirtAction::Modify => "modify",
            DirtAction::Dependency => "dependency",
            DirtAction::Move => "move",
            DirtAction::Delete => "delete",
            DirtAction::Remove => "remove",
            DirtAction::Offline => "offline",
            DirtAction::Hide => "hide",
            DirtAction::Unhide => "unhide",
        }
    }

    /// Whether this action removes the object from a target rather than
    /// (re-)publishing it.
    pub fn is_removing(&self) -> bool {
        Self::REMOVING.contains(self)
    }

    /// Whether this action publishes content and is therefore subject to
    /// the publishability gate (offline/excluded objects are skipped).
    pub fn affects_content(&self) -> bool {
        !self.is_removing()
    }

    /// Cancellation rules applied when this action is inserted.
    ///
    /// No rule ever targets its own action, so the entry a mark merges
    /// into is never a victim.
    pub fn cancellations(&self) -> &'static [CancelRule] {
        match self {
            // A re-created object no longer needs a pending delete.
            DirtAction::Create => &[CancelRule {
                scope: CancelScope::SameChannel,
                victims: CancelVictims::Only(&[DirtAction::Delete]),
            }],
            // A deleted object needs no further publishing anywhere.
            DirtAction::Delete => &[CancelRule {
                scope: CancelScope::AllChannels,
                victims: CancelVictims::AllExcept(&[
                    DirtAction::Delete,
                    DirtAction::Offline,
                    DirtAction::Remove,
                ]),
            }],
            DirtAction::Offline => &[
                CancelRule {
                    scope: CancelScope::AllChannels,
                    victims: CancelVictims::AllExcept(&[
                        DirtAction::Delete,
                        DirtAction::Offline,
                        DirtAction::Remove,
                    ]),
                },
                CancelRule {
                    scope: CancelScope::SameChannel,
                    victims: CancelVictims::AllExcept(&[DirtAction::Offline]),
                },
            ],
            DirtAction::Remove => &[CancelRule {
                scope: CancelScope::SameChannel,
                victims: CancelVictims::AllExcept(&[DirtAction::Remove]),
            }],
            DirtAction::Hide => &[CancelRule {
                scope: CancelScope::SameChannel,
                victims: CancelVictims::AllExcept(&[DirtAction::Hide]),
            }],
            // Moving within a channel supersedes a pending removal there.
            DirtAction::Move => &[CancelRule {
                scope: CancelScope::SameChannel,
                victims: CancelVictims::Only(&[DirtAction::Remove]),
            }],
            DirtAction::Unhide => &[CancelRule {
                scope: CancelScope::SameChannel,
                victims: CancelVictims::Only(&[DirtAction::Hide]),
            }],
            DirtAction::Modify | DirtAction::Dependency => &[],
        }
    }
}

impl std::str::FromStr for DirtAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(DirtAction::Create),
            "modify" => Ok(DirtAction::Modify),
            "dependency" => Ok(DirtAction::Dependency),
            "move" => Ok(DirtAction::Move),
            "delete" => Ok(DirtAction::Delete),
            "remove" => Ok(DirtAction::Remove),
            "offline" => Ok(DirtAction::Offline),
            "hide" => Ok(DirtAction::Hide),
            "unhide" => Ok(DirtAction::Unhide),
            other => Err(format!("unknown dirt action '{other}'")),
        }
    }
}

impl fmt::Display for DirtAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Attribute Sets
// ============================================================================

/// Which attributes of an object were dirtied.
///
/// `WholeObject` dominates merging: once any dirt applies to the whole
/// object, attribute restrictions are lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeSet {
    /// The whole object must be re-published.
    WholeObject,
    /// Only the named attributes changed.
    Named(BTreeSet<String>),
}

impl AttributeSet {
    /// Build a named set from string-likes.
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeSet::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn is_whole_object(&self) -> bool {
        matches!(self, AttributeSet::WholeObject)
    }

    /// Merge another set into this one. `WholeObject` on either side wins.
    pub fn merge(&mut self, other: &AttributeSet) {
        match (&mut *self, other) {
            (AttributeSet::WholeObject, _) => {}
            (_, AttributeSet::WholeObject) => *self = AttributeSet::WholeObject,
            (AttributeSet::Named(mine), AttributeSet::Named(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        AttributeSet::WholeObject
    }
}

// ============================================================================
// Queue Entries
// ============================================================================

/// A durable dirty-queue row.
///
/// At most one live entry exists per `(kind, object id, action, channel)`;
/// re-dirtying merges attribute sets and clears the delayed flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Persistence row id.
    pub id: i64,
    pub object: ObjectRef,
    pub action: DirtAction,
    pub channel: ChannelId,
    /// Delayed entries are skipped when a run claims its snapshot.
    pub delayed: bool,
    /// Set when the entry belongs to the currently active run.
    pub claimed: bool,
    pub created_at: DateTime<Utc>,
    pub attributes: AttributeSet,
}

/// Key of the per-run publish handshake: one object in one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandledKey {
    pub object: ObjectRef,
    pub channel: ChannelId,
}

impl HandledKey {
    pub fn new(object: ObjectRef, channel: ChannelId) -> Self {
        Self { object, channel }
    }
}

impl fmt::Display for HandledKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object, self.channel)
    }
}

// ============================================================================
// Publish Targets
// ============================================================================

/// Write-side-effect identity for the publish handshake.
///
/// Each target may be initiated at most once per object and run; the queue
/// row is removed only when every initiated target reported done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    /// The rendered-output table inside the CMS database.
    RenderStore,
    /// An external content repository.
    ContentRepository,
    /// The static filesystem export.
    Filesystem,
    /// The search index.
    SearchIndex,
}

impl PublishTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishTarget::RenderStore => "render_store",
            PublishTarget::ContentRepository => "content_repository",
            PublishTarget::Filesystem => "filesystem",
            PublishTarget::SearchIndex => "search_index",
        }
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Work Units
// ============================================================================

/// One unit of publish work handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    pub object: ObjectRef,
    pub channel: ChannelId,
    pub attributes: AttributeSet,
}

impl PageTask {
    pub fn new(object: ObjectRef, channel: ChannelId, attributes: AttributeSet) -> Self {
        Self {
            object,
            channel,
            attributes,
        }
    }
}

/// One unit of removal work (object must disappear from targets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalTask {
    pub object: ObjectRef,
    pub channel: ChannelId,
    pub action: DirtAction,
}

// ============================================================================
// Run Reporting
// ============================================================================

/// Final state of a publish run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Machine-readable outcome of one publish run.
///
/// This is the driver's return value: status plus per-kind counts of what
/// was and was not published. A run with any fatal error reports `Failed`
/// even if some objects were written successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Objects fully handled (all initiated targets done) per kind.
    pub published: BTreeMap<ObjectKind, u64>,
    /// Claimed objects left unhandled per kind.
    pub remaining: BTreeMap<ObjectKind, u64>,
    /// Pages still requesting a republish after the final pass.
    pub republish_pending: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(run_id: Uuid, status: RunStatus) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status,
            published: BTreeMap::new(),
            remaining: BTreeMap::new(),
            republish_pending: 0,
            error: None,
            started_at: now,
            ended_at: now,
        }
    }

    /// Total objects published across kinds.
    pub fn total_published(&self) -> u64 {
        self.published.values().sum()
    }

    /// Total claimed objects left unhandled across kinds.
    pub fn total_remaining(&self) -> u64 {
        self.remaining.values().sum()
    }
}

// ============================================================================
// Tests
// ============================================================================
