//! Per-run handled-object handshake
//!
//! Workers announce each publish target they are about to write with
//! [`HandledMap::initiate`] and confirm it with [`HandledMap::report_done`].
//! Once every initiated target of an object has reported done, the object
//! counts as fully handled and its queue rows may be removed. The map is
//! cleared between runs.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::QueueError;
use crate::models::{HandledKey, PublishTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetState {
    Initiated,
    Done,
}

/// Tracks the initiate/done handshake for every object touched by the
/// current run.
pub struct HandledMap {
    inner: Mutex<HashMap<HandledKey, HashMap<PublishTarget, TargetState>>>,
}

impl HandledMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Announce that a worker is about to write `target` for this object.
    ///
    /// Fails if the same target was already initiated and has not been
    /// reported done, which would indicate two workers on one object.
    pub fn initiate(&self, key: HandledKey, target: PublishTarget) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let targets = inner.entry(key).or_default();
        match targets.get(&target) {
            Some(TargetState::Initiated) => Err(QueueError::AlreadyInitiated { key, target }),
            _ => {
                targets.insert(target, TargetState::Initiated);
                Ok(())
            }
        }
    }

    /// Confirm that a target write completed. Returns `true` when the
    /// object is now fully handled (all initiated targets are done).
    pub fn report_done(&self, key: HandledKey, target: PublishTarget) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let targets = inner.get_mut(&key).ok_or(QueueError::NotInitiated { key, target })?;
        match targets.get(&target) {
            Some(TargetState::Initiated) => {
                targets.insert(target, TargetState::Done);
            }
            _ => {
                return Err(QueueError::NotInitiated { key, target });
            }
        }

        let fully_handled = targets.values().all(|s| *s == TargetState::Done);
        if fully_handled {
            inner.remove(&key);
        }
        Ok(fully_handled)
    }

    /// Drop the handshake state of one object without completing it.
    ///
    /// Used when a recoverable write failure leaves the entry in the
    /// queue for the next run.
    pub fn abandon(&self, key: &HandledKey) {
        self.inner.lock().unwrap().remove(key);
    }

    /// Number of objects with an open handshake.
    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Forget all handshake state. Called between runs.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Default for HandledMap {
    fn default() -> Self {
        Self::new()
    }
}
