//! Durable dirty-object queue
//!
//! Objects touched by editors are marked dirty here; a publish run later
//! claims a snapshot of the queue and works it off. See [`dirty`] for the
//! service itself, [`store`] for persistence.

pub mod batch;
pub mod dirty;
pub mod handled;
pub mod remover;
pub mod store;

pub use batch::DependencyBatch;
pub use dirty::{DirtDisposition, DirtOutcome, DirtyQueue};
pub use handled::HandledMap;
pub use remover::QueueRemover;
pub use store::{ClaimCount, MockQueueStore, NewEntry, QueueStore, SqliteQueueStore};
