//! Run progress tracking: phase trees, ETA estimation, and the
//! historical timings that feed both.

pub mod history;
pub mod phase;

pub use history::{HistoryStore, MockHistoryStore, PhaseHistory, SqliteHistoryStore};
pub use phase::{PhaseSnapshot, PhaseStats, WorkPhase};
