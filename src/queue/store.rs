//! Persistence layer for the dirty-object queue
//!
//! The queue logic in [`crate::queue::dirty`] is decoupled from storage
//! through the [`QueueStore`] trait, with a SQLite implementation for
//! production and an in-memory mock for tests. The store only issues
//! statements; merge and cancellation decisions are made above it.
//!
//! Schema: one row per `(kind, object id, action, channel)` in
//! `publish_queue`, plus an attribute side table `publish_queue_attribute`
//! for entries restricted to named attributes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{
    AttributeSet, ChannelId, DirtAction, HandledKey, ObjectKind, ObjectRef, QueueEntry,
    ALL_CHANNELS,
};

// ============================================================================
// Row Types
// ============================================================================

/// A queue row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub object: ObjectRef,
    pub action: DirtAction,
    pub channel: ChannelId,
    pub delayed: bool,
    pub attributes: AttributeSet,
}

/// Per-partition, per-kind count of entries claimed by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCount {
    pub channel: ChannelId,
    pub kind: ObjectKind,
    pub entries: u64,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Storage operations for the dirty queue.
///
/// All methods are transactional at the call boundary; the queue never
/// manages connections itself.
pub trait QueueStore: Send + Sync {
    /// Find the live entry for an exact `(object, action, channel)` key.
    fn find_entry(
        &self,
        object: &ObjectRef,
        action: DirtAction,
        channel: ChannelId,
    ) -> Result<Option<QueueEntry>>;

    /// All live entries for one object, across actions and channels.
    fn entries_for_object(&self, object: &ObjectRef) -> Result<Vec<QueueEntry>>;

    /// Insert a new entry and return it with its row id.
    fn insert_entry(&self, entry: &NewEntry) -> Result<QueueEntry>;

    /// Insert many entries in one statement batch. Returns rows inserted.
    fn batch_insert(&self, entries: &[NewEntry]) -> Result<u64>;

    /// Replace the stored attribute set of an entry.
    fn set_attributes(&self, id: i64, attributes: &AttributeSet) -> Result<()>;

    /// Clear the delayed flag of an entry.
    fn clear_delayed(&self, id: i64) -> Result<()>;

    /// Delete entries by row id. Returns rows deleted.
    fn delete_entries(&self, ids: &[i64]) -> Result<u64>;

    /// Atomically flag all non-delayed entries of the given partitions
    /// (plus channel 0) as claimed by the current run, and return per
    /// partition/kind counts of the newly claimed rows.
    fn claim_for_run(&self, partitions: &[ChannelId]) -> Result<Vec<ClaimCount>>;

    /// Clear the claimed flag on all rows (failed run). Returns rows touched.
    fn release_claimed(&self) -> Result<u64>;

    /// Physically delete all claimed rows (successful run).
    fn delete_claimed(&self) -> Result<u64>;

    /// Delete claimed rows belonging to fully-handled objects. Exact
    /// channel match; channel-0 rows are swept by [`Self::delete_claimed`].
    fn delete_handled(&self, keys: &[HandledKey]) -> Result<u64>;

    /// Release one object's claimed rows back to pending so the final
    /// sweep of a successful run leaves them for the next run.
    fn release_object(&self, key: &HandledKey) -> Result<u64>;

    /// Remaining claimed entries per kind.
    fn claimed_counts(&self) -> Result<BTreeMap<ObjectKind, u64>>;

    /// Entries to publish: non-removing actions for one kind and partition
    /// (channel-0 rows included), minus any caller-specified exclusions.
    fn select_publish(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
        excluded: &[DirtAction],
    ) -> Result<Vec<QueueEntry>>;

    /// Entries to remove: only the four removing actions.
    fn select_removals(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
    ) -> Result<Vec<QueueEntry>>;

    /// Which of the given object ids already have a live entry for the
    /// exact `(kind, action, channel)` key. One bulk read, used by the
    /// dependency-dirt batch.
    fn existing_ids(
        &self,
        kind: ObjectKind,
        action: DirtAction,
        channel: ChannelId,
        ids: &[u64],
    ) -> Result<HashSet<u64>>;

    /// Total live rows, for diagnostics and tests.
    fn count_entries(&self) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite-backed queue store.
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open (or create) the store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite queue store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
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
            CREATE TABLE IF NOT EXISTS publish_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_kind TEXT NOT NULL,
                object_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                channel INTEGER NOT NULL,
                delayed INTEGER NOT NULL DEFAULT 0,
                claimed INTEGER NOT NULL DEFAULT 0,
                whole_object INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                UNIQUE(object_kind, object_id, action, channel)
            );

            CREATE INDEX IF NOT EXISTS idx_publish_queue_object
                ON publish_queue(object_kind, object_id);

            CREATE INDEX IF NOT EXISTS idx_publish_queue_claimed
                ON publish_queue(claimed);

            CREATE TABLE IF NOT EXISTS publish_queue_attribute (
                queue_entry_id INTEGER NOT NULL,
                attribute TEXT NOT NULL,
                PRIMARY KEY (queue_entry_id, attribute)
            );
            "#,
        )
        .context("Failed to create queue schema")?;

        Ok(())
    }

    fn load_attributes(conn: &Connection, id: i64, whole_object: bool) -> Result<AttributeSet> {
        if whole_object {
            return Ok(AttributeSet::WholeObject);
        }
        let mut stmt = conn
            .prepare("SELECT attribute FROM publish_queue_attribute WHERE queue_entry_id = ?1")?;
        let attrs: BTreeSet<String> = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(AttributeSet::Named(attrs))
    }

    fn insert_one(conn: &Connection, entry: &NewEntry) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO publish_queue
                (object_kind, object_id, action, channel, delayed, claimed, whole_object, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)
            "#,
            params![
                entry.object.kind.as_str(),
                entry.object.id as i64,
                entry.action.as_str(),
                entry.channel as i64,
                entry.delayed,
                entry.attributes.is_whole_object(),
                now,
            ],
        )
        .context("Failed to insert queue entry")?;
        let id = conn.last_insert_rowid();

        if let AttributeSet::Named(attrs) = &entry.attributes {
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO publish_queue_attribute (queue_entry_id, attribute) VALUES (?1, ?2)",
            )?;
            for attr in attrs {
                stmt.execute(params![id, attr])?;
            }
        }

        Ok(id)
    }

    const SELECT_COLUMNS: &'static str =
        "id, object_kind, object_id, action, channel, delayed, claimed, whole_object, created_at";
}

impl QueueStore for SqliteQueueStore {
    fn find_entry(
        &self,
        object: &ObjectRef,
        action: DirtAction,
        channel: ChannelId,
    ) -> Result<Option<QueueEntry>> {
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "SELECT {} FROM publish_queue
             WHERE object_kind = ?1 AND object_id = ?2 AND action = ?3 AND channel = ?4",
            Self::SELECT_COLUMNS
        );
        let entry = conn
            .query_row(
                &query,
                params![
                    object.kind.as_str(),
                    object.id as i64,
                    action.as_str(),
                    channel as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to find queue entry")?;

        match entry {
            None => Ok(None),
            Some((id, kind, object_id, action, channel, delayed, claimed, whole, created)) => {
                Ok(Some(QueueEntry {
                    id,
                    object: ObjectRef {
                        kind: kind.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                        id: object_id as u64,
                    },
                    action: action.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    channel: channel as ChannelId,
                    delayed,
                    claimed,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    attributes: Self::load_attributes(&conn, id, whole)?,
                }))
            }
        }
    }

    fn entries_for_object(&self, object: &ObjectRef) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap();
        let query = format!(
            "SELECT {} FROM publish_queue WHERE object_kind = ?1 AND object_id = ?2",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&query)?;
        let rows: Vec<_> = stmt
            .query_map(params![object.kind.as_str(), object.id as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, action, channel, delayed, claimed, whole, created) in rows {
            entries.push(QueueEntry {
                id,
                object: *object,
                action: action.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                channel: channel as ChannelId,
                delayed,
                claimed,
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                attributes: Self::load_attributes(&conn, id, whole)?,
            });
        }
        Ok(entries)
    }

    fn insert_entry(&self, entry: &NewEntry) -> Result<QueueEntry> {
        let conn = self.conn.lock().unwrap();
        let id = Self::insert_one(&conn, entry)?;
        Ok(QueueEntry {
            id,
            object: entry.object,
            action: entry.action,
            channel: entry.channel,
            delayed: entry.delayed,
            claimed: false,
            created_at: Utc::now(),
            attributes: entry.attributes.clone(),
        })
    }

    fn batch_insert(&self, entries: &[NewEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for entry in entries {
            Self::insert_one(&tx, entry)?;
        }
        tx.commit()?;
        Ok(entries.len() as u64)
    }

    fn set_attributes(&self, id: i64, attributes: &AttributeSet) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE publish_queue SET whole_object = ?1 WHERE id = ?2",
            params![attributes.is_whole_object(), id],
        )?;
        conn.execute(
            "DELETE FROM publish_queue_attribute WHERE queue_entry_id = ?1",
            params![id],
        )?;
        if let AttributeSet::Named(attrs) = attributes {
            let mut stmt = conn.prepare(
                "INSERT OR IGNORE INTO publish_queue_attribute (queue_entry_id, attribute) VALUES (?1, ?2)",
            )?;
            for attr in attrs {
                stmt.execute(params![id, attr])?;
            }
        }
        Ok(())
    }

    fn clear_delayed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE publish_queue SET delayed = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn delete_entries(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0u64;
        const CHUNK_SIZE: usize = 500;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders: String = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql_attrs = format!(
                "DELETE FROM publish_queue_attribute WHERE queue_entry_id IN ({placeholders})"
            );
            let sql_rows = format!("DELETE FROM publish_queue WHERE id IN ({placeholders})");
            let params_vec: Vec<&dyn rusqlite::ToSql> =
                chunk.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql_attrs, params_vec.as_slice())?;
            deleted += conn.execute(&sql_rows, params_vec.as_slice())? as u64;
        }
        Ok(deleted)
    }

    fn claim_for_run(&self, partitions: &[ChannelId]) -> Result<Vec<ClaimCount>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut channels: Vec<i64> = partitions.iter().map(|c| *c as i64).collect();
        channels.push(ALL_CHANNELS as i64);
        let placeholders: String = channels.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let params_vec: Vec<&dyn rusqlite::ToSql> =
            channels.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

        // count first so rows claimed by an earlier call are not recounted
        let mut counts = Vec::new();
        {
            let count_sql = format!(
                "SELECT channel, object_kind, COUNT(*) FROM publish_queue
                 WHERE delayed = 0 AND claimed = 0 AND channel IN ({placeholders})
                 GROUP BY channel, object_kind"
            );
            let mut stmt = tx.prepare(&count_sql)?;
            let rows = stmt.query_map(params_vec.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (channel, kind, entries) = row?;
                counts.push(ClaimCount {
                    channel: channel as ChannelId,
                    kind: kind.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    entries: entries as u64,
                });
            }
        }

        let claim_sql = format!(
            "UPDATE publish_queue SET claimed = 1
             WHERE delayed = 0 AND claimed = 0 AND channel IN ({placeholders})"
        );
        tx.execute(&claim_sql, params_vec.as_slice())?;

        tx.commit()?;
        Ok(counts)
    }

    fn release_claimed(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let touched = conn.execute("UPDATE publish_queue SET claimed = 0 WHERE claimed = 1", [])?;
        Ok(touched as u64)
    }

    fn delete_claimed(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM publish_queue_attribute WHERE queue_entry_id IN
                 (SELECT id FROM publish_queue WHERE claimed = 1)",
            [],
        )?;
        let deleted = conn.execute("DELETE FROM publish_queue WHERE claimed = 1", [])?;
        Ok(deleted as u64)
    }

    fn delete_handled(&self, keys: &[HandledKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut deleted = 0u64;
        for key in keys {
            tx.execute(
                "DELETE FROM publish_queue_attribute WHERE queue_entry_id IN
                     (SELECT id FROM publish_queue
                      WHERE claimed = 1 AND object_kind = ?1 AND object_id = ?2 AND channel = ?3)",
                params![
                    key.object.kind.as_str(),
                    key.object.id as i64,
                    key.channel as i64
                ],
            )?;
            deleted += tx.execute(
                "DELETE FROM publish_queue
                 WHERE claimed = 1 AND object_kind = ?1 AND object_id = ?2 AND channel = ?3",
                params![
                    key.object.kind.as_str(),
                    key.object.id as i64,
                    key.channel as i64
                ],
            )? as u64;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn release_object(&self, key: &HandledKey) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let released = conn.execute(
            "UPDATE publish_queue SET claimed = 0
             WHERE claimed = 1 AND object_kind = ?1 AND object_id = ?2 AND channel = ?3",
            params![
                key.object.kind.as_str(),
                key.object.id as i64,
                key.channel as i64
            ],
        )?;
        Ok(released as u64)
    }

    fn claimed_counts(&self) -> Result<BTreeMap<ObjectKind, u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT object_kind, COUNT(*) FROM publish_queue WHERE claimed = 1 GROUP BY object_kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (kind, count) = row?;
            let kind: ObjectKind = kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            counts.insert(kind, count as u64);
        }
        Ok(counts)
    }

    fn select_publish(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
        excluded: &[DirtAction],
    ) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap();

        let mut blocked: Vec<&'static str> =
            DirtAction::REMOVING.iter().map(|a| a.as_str()).collect();
        blocked.extend(excluded.iter().map(|a| a.as_str()));
        let action_placeholders: String =
            blocked.iter().map(|_| "?").collect::<Vec<_>>().join(",");

        let flag_clause = if for_run { "claimed = 1" } else { "delayed = 0" };
        let query = format!(
            "SELECT {} FROM publish_queue
             WHERE object_kind = ? AND channel IN (?, 0) AND {flag_clause}
               AND action NOT IN ({action_placeholders})
             ORDER BY object_id",
            Self::SELECT_COLUMNS
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(kind.as_str().to_string()),
            Box::new(partition as i64),
        ];
        for action in &blocked {
            params_vec.push(Box::new(action.to_string()));
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&query)?;
        let rows: Vec<_> = stmt
            .query_map(params_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, object_id, action, channel, delayed, claimed, whole, created) in rows {
            entries.push(QueueEntry {
                id,
                object: ObjectRef {
                    kind,
                    id: object_id as u64,
                },
                action: action.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                channel: channel as ChannelId,
                delayed,
                claimed,
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                attributes: Self::load_attributes(&conn, id, whole)?,
            });
        }
        Ok(entries)
    }

    fn select_removals(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
    ) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap();
        let removing: Vec<&'static str> =
            DirtAction::REMOVING.iter().map(|a| a.as_str()).collect();
        let placeholders: String = removing.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let flag_clause = if for_run { "claimed = 1" } else { "delayed = 0" };
        let query = format!(
            "SELECT {} FROM publish_queue
             WHERE object_kind = ? AND channel IN (?, 0) AND {flag_clause}
               AND action IN ({placeholders})
             ORDER BY object_id",
            Self::SELECT_COLUMNS
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(kind.as_str().to_string()),
            Box::new(partition as i64),
        ];
        for action in &removing {
            params_vec.push(Box::new(action.to_string()));
        }
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&query)?;
        let rows: Vec<_> = stmt
            .query_map(params_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, object_id, action, channel, delayed, claimed, created) in rows {
            entries.push(QueueEntry {
                id,
                object: ObjectRef {
                    kind,
                    id: object_id as u64,
                },
                action: action.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                channel: channel as ChannelId,
                delayed,
                claimed,
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                attributes: AttributeSet::WholeObject,
            });
        }
        Ok(entries)
    }

    fn existing_ids(
        &self,
        kind: ObjectKind,
        action: DirtAction,
        channel: ChannelId,
        ids: &[u64],
    ) -> Result<HashSet<u64>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.conn.lock().unwrap();
        const CHUNK_SIZE: usize = 500;
        let mut existing = HashSet::new();

        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders: String = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let query = format!(
                "SELECT object_id FROM publish_queue
                 WHERE object_kind = ? AND action = ? AND channel = ?
                   AND object_id IN ({placeholders})"
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(kind.as_str().to_string()),
                Box::new(action.as_str().to_string()),
                Box::new(channel as i64),
            ];
            for id in chunk {
                params_vec.push(Box::new(*id as i64));
            }
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();

            let mut stmt = conn.prepare(&query)?;
            let found = stmt
                .query_map(params_refs.as_slice(), |row| row.get::<_, i64>(0))?
                .filter_map(|r| r.ok())
                .map(|v| v as u64);
            existing.extend(found);
        }
        Ok(existing)
    }

    fn count_entries(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM publish_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// ============================================================================
// Mock Implementation (for testing)
// ============================================================================

/// In-memory mock queue store.
pub struct MockQueueStore {
    entries: RwLock<Vec<QueueEntry>>,
    next_id: AtomicI64,
}

impl MockQueueStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Snapshot of all live entries.
    pub fn all_entries(&self) -> Vec<QueueEntry> {
        self.entries.read().unwrap().clone()
    }
}

impl Default for MockQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStore for MockQueueStore {
    fn find_entry(
        &self,
        object: &ObjectRef,
        action: DirtAction,
        channel: ChannelId,
    ) -> Result<Option<QueueEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .find(|e| e.object == *object && e.action == action && e.channel == channel)
            .cloned())
    }

    fn entries_for_object(&self, object: &ObjectRef) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.object == *object)
            .cloned()
            .collect())
    }

    fn insert_entry(&self, entry: &NewEntry) -> Result<QueueEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stored = QueueEntry {
            id,
            object: entry.object,
            action: entry.action,
            channel: entry.channel,
            delayed: entry.delayed,
            claimed: false,
            created_at: Utc::now(),
            attributes: entry.attributes.clone(),
        };
        self.entries.write().unwrap().push(stored.clone());
        Ok(stored)
    }

    fn batch_insert(&self, entries: &[NewEntry]) -> Result<u64> {
        for entry in entries {
            self.insert_entry(entry)?;
        }
        Ok(entries.len() as u64)
    }

    fn set_attributes(&self, id: i64, attributes: &AttributeSet) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.attributes = attributes.clone();
        }
        Ok(())
    }

    fn clear_delayed(&self, id: i64) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.delayed = false;
        }
        Ok(())
    }

    fn delete_entries(&self, ids: &[i64]) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id));
        Ok((before - entries.len()) as u64)
    }

    fn claim_for_run(&self, partitions: &[ChannelId]) -> Result<Vec<ClaimCount>> {
        let mut entries = self.entries.write().unwrap();
        let mut grouped: BTreeMap<(ChannelId, ObjectKind), u64> = BTreeMap::new();
        for entry in entries.iter_mut() {
            let in_scope =
                entry.channel == ALL_CHANNELS || partitions.contains(&entry.channel);
            if in_scope && !entry.delayed && !entry.claimed {
                entry.claimed = true;
                *grouped.entry((entry.channel, entry.object.kind)).or_insert(0) += 1;
            }
        }
        Ok(grouped
            .into_iter()
            .map(|((channel, kind), entries)| ClaimCount {
                channel,
                kind,
                entries,
            })
            .collect())
    }

    fn release_claimed(&self) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let mut touched = 0;
        for entry in entries.iter_mut() {
            if entry.claimed {
                entry.claimed = false;
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn delete_claimed(&self) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| !e.claimed);
        Ok((before - entries.len()) as u64)
    }

    fn delete_handled(&self, keys: &[HandledKey]) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| {
            !(e.claimed
                && keys
                    .iter()
                    .any(|k| k.object == e.object && k.channel == e.channel))
        });
        Ok((before - entries.len()) as u64)
    }

    fn release_object(&self, key: &HandledKey) -> Result<u64> {
        let mut entries = self.entries.write().unwrap();
        let mut released = 0;
        for entry in entries.iter_mut() {
            if entry.claimed && entry.object == key.object && entry.channel == key.channel {
                entry.claimed = false;
                released += 1;
            }
        }
        Ok(released)
    }

    fn claimed_counts(&self) -> Result<BTreeMap<ObjectKind, u64>> {
        let entries = self.entries.read().unwrap();
        let mut counts = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.claimed) {
            *counts.entry(entry.object.kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn select_publish(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
        excluded: &[DirtAction],
    ) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|e| {
                e.object.kind == kind
                    && (e.channel == partition || e.channel == ALL_CHANNELS)
                    && !e.action.is_removing()
                    && !excluded.contains(&e.action)
                    && if for_run { e.claimed } else { !e.delayed }
            })
            .cloned()
            .collect())
    }

    fn select_removals(
        &self,
        kind: ObjectKind,
        for_run: bool,
        partition: ChannelId,
    ) -> Result<Vec<QueueEntry>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|e| {
                e.object.kind == kind
                    && (e.channel == partition || e.channel == ALL_CHANNELS)
                    && e.action.is_removing()
                    && if for_run { e.claimed } else { !e.delayed }
            })
            .cloned()
            .collect())
    }

    fn existing_ids(
        &self,
        kind: ObjectKind,
        action: DirtAction,
        channel: ChannelId,
        ids: &[u64],
    ) -> Result<HashSet<u64>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|e| {
                e.object.kind == kind
                    && e.action == action
                    && e.channel == channel
                    && ids.contains(&e.object.id)
            })
            .map(|e| e.object.id)
            .collect())
    }

    fn count_entries(&self) -> Result<u64> {
        Ok(self.entries.read().unwrap().len() as u64)
    }
}

// ============================================================================
// Tests
// ============================================================================
