//! # pressline
//!
//! Publish-scheduling core for content-management pipelines: a durable
//! dirty-object queue, a hierarchical progress/ETA tracker, a run state
//! machine with cluster delegation, and a bounded worker pool that
//! publishes pages in at most two passes.
//!
//! ## Architecture
//!
//! ```text
//!   editors ──> DirtyQueue (SQLite) ──> RunController ──> PublishDriver
//!                    │                       │                 │
//!                    │                   WorkPhase          WorkerPool
//!                    │                  (ETA, history)     (render/write)
//!                    │                       │                 │
//!                    └──── handled handshake / QueueRemover ───┘
//!
//!   peers ──> cluster API (axum) ──> RunDelegate ──> owning instance
//! ```
//!
//! Rendering, target writes, and partition discovery are collaborator
//! traits in [`publish`]; this crate owns scheduling, bookkeeping, and
//! run control, not content.

pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod progress;
pub mod publish;
pub mod queue;
pub mod run;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{
    AttributeSet, ChannelId, DirtAction, HandledKey, ObjectKind, ObjectRef, PageTask,
    PublishTarget, QueueEntry, RemovalTask, RunReport, RunStatus, ALL_CHANNELS,
};
pub use queue::DirtyQueue;
pub use run::{driver::PublishDriver, RunController, RunState, RunStatusView};
