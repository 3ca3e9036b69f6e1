//! Historical phase timings
//!
//! After a representative run, each phase's elapsed time and unit count
//! are stored so the next run can estimate before any work has happened.
//! One row per phase name; a new measurement overwrites the old one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Stored timing of one phase from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseHistory {
    pub elapsed_ms: u64,
    pub units: u64,
}

impl PhaseHistory {
    /// Average time per work unit.
    pub fn rate(&self) -> Duration {
        if self.units == 0 {
            return Duration::from_millis(self.elapsed_ms);
        }
        Duration::from_millis(self.elapsed_ms / self.units)
    }
}

/// Persistence for phase timings.
pub trait HistoryStore: Send + Sync {
    fn load(&self, phase: &str) -> Result<Option<PhaseHistory>>;
    fn save(&self, phase: &str, history: PhaseHistory) -> Result<()>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).context("Failed to open history database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS phase_history (
                phase TEXT PRIMARY KEY,
                elapsed_ms INTEGER NOT NULL,
                units INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create history schema")?;
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn load(&self, phase: &str) -> Result<Option<PhaseHistory>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT elapsed_ms, units FROM phase_history WHERE phase = ?1",
                params![phase],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("Failed to load phase history")?;
        Ok(row.map(|(elapsed_ms, units)| PhaseHistory {
            elapsed_ms: elapsed_ms as u64,
            units: units as u64,
        }))
    }

    fn save(&self, phase: &str, history: PhaseHistory) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO phase_history (phase, elapsed_ms, units, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(phase) DO UPDATE SET
                elapsed_ms = excluded.elapsed_ms,
                units = excluded.units,
                updated_at = excluded.updated_at
            "#,
            params![
                phase,
                history.elapsed_ms as i64,
                history.units as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to save phase history")?;
        Ok(())
    }
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

pub struct MockHistoryStore {
    entries: RwLock<HashMap<String, PhaseHistory>>,
}

impl MockHistoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MockHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for MockHistoryStore {
    fn load(&self, phase: &str) -> Result<Option<PhaseHistory>> {
        Ok(self.entries.read().unwrap().get(phase).copied())
    }

    fn save(&self, phase: &str, history: PhaseHistory) -> Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(phase.to_string(), history);
        Ok(())
    }
}
