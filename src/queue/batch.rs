//! Batched dependency dirt
//!
//! Dependency fan-out can touch tens of thousands of objects at once, so
//! those marks bypass the per-entry merge and cancellation machinery:
//! they are collected in an in-memory buffer, deduplicated there, and
//! written with one bulk existence check plus one batched insert on
//! commit. Only `Dependency` entries ever flow through a batch.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::models::{AttributeSet, ChannelId, DirtAction, ObjectKind, ObjectRef};
use crate::queue::store::{NewEntry, QueueStore};

/// An open batch of dependency marks. Created and committed through
/// [`crate::queue::DirtyQueue`].
pub struct DependencyBatch {
    records: HashMap<(ObjectRef, ChannelId), AttributeSet>,
}

impl DependencyBatch {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Buffer one dependency mark, merging attribute sets on repeat keys.
    pub fn add(&mut self, object: ObjectRef, channel: ChannelId, attributes: AttributeSet) {
        self.records
            .entry((object, channel))
            .and_modify(|existing| existing.merge(&attributes))
            .or_insert(attributes);
    }

    /// Number of distinct buffered marks.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the buffer to the store. Marks whose object already carries
    /// a live `Dependency` entry on the same channel are skipped; the
    /// existing row keeps its attribute set untouched. Returns the number
    /// of rows inserted.
    pub fn commit(self, store: &dyn QueueStore) -> Result<u64> {
        if self.records.is_empty() {
            return Ok(0);
        }

        // One existence probe per (kind, channel) group.
        let mut groups: HashMap<(ObjectKind, ChannelId), Vec<u64>> = HashMap::new();
        for (object, channel) in self.records.keys() {
            groups
                .entry((object.kind, *channel))
                .or_default()
                .push(object.id);
        }

        let mut existing: HashMap<(ObjectKind, ChannelId), HashSet<u64>> = HashMap::new();
        for ((kind, channel), ids) in &groups {
            let found = store.existing_ids(*kind, DirtAction::Dependency, *channel, ids)?;
            existing.insert((*kind, *channel), found);
        }

        let inserts: Vec<NewEntry> = self
            .records
            .into_iter()
            .filter(|((object, channel), _)| {
                !existing
                    .get(&(object.kind, *channel))
                    .is_some_and(|ids| ids.contains(&object.id))
            })
            .map(|((object, channel), attributes)| NewEntry {
                object,
                action: DirtAction::Dependency,
                channel,
                delayed: false,
                attributes,
            })
            .collect();

        let inserted = store.batch_insert(&inserts)?;
        tracing::debug!(inserted, "dependency batch committed");
        Ok(inserted)
    }
}

impl Default for DependencyBatch {
    fn default() -> Self {
        Self::new()
    }
}
