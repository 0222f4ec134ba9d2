//! Aggregate Store - SQLite-backed transactional storage
//!
//! Holds the six logical tables of the aggregation pipeline:
//!
//! ```text
//! Reports          (report key)                      → last_sent_day_index
//! SystemProfiles   (system_profile_hash)             → serialized profile
//! AggregateStore   (report, day, event vector, hash) → aggregate value
//! StringHashes     (report, day, list_index)         → string hash
//! ObservationStore (auto-increment id)               → observation batch
//! GlobalValues     (key)                             → value
//! ```
//!
//! Every operation runs inside [`Store::transaction`], which takes the
//! connection lock and opens an IMMEDIATE transaction, so read-modify-write
//! sequences cannot interleave. Foreign keys are enforced by SQLite: an
//! aggregate row must reference an existing report and system profile.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{
    AggregateRow, AggregateValue, DayIndex, EventRecord, EventVector, GlobalKey, ObservationBatch,
    QueuedObservation, ReportKey, StringHash, SystemProfile, SystemProfileHash,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS Reports (
        customer_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        metric_id INTEGER NOT NULL,
        report_id INTEGER NOT NULL,
        last_sent_day_index INTEGER NOT NULL,
        PRIMARY KEY (customer_id, project_id, metric_id, report_id)
    );

    CREATE TABLE IF NOT EXISTS SystemProfiles (
        system_profile_hash INTEGER NOT NULL PRIMARY KEY,
        system_profile BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS AggregateStore (
        customer_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        metric_id INTEGER NOT NULL,
        report_id INTEGER NOT NULL,
        day_index INTEGER NOT NULL,
        event_vector TEXT NOT NULL,
        system_profile_hash INTEGER NOT NULL,
        aggregate_value BLOB NOT NULL,
        PRIMARY KEY (customer_id, project_id, metric_id, report_id, day_index,
                     event_vector, system_profile_hash),
        FOREIGN KEY (customer_id, project_id, metric_id, report_id)
            REFERENCES Reports (customer_id, project_id, metric_id, report_id)
            ON DELETE CASCADE,
        FOREIGN KEY (system_profile_hash)
            REFERENCES SystemProfiles (system_profile_hash)
    );

    CREATE INDEX IF NOT EXISTS idx_aggregate_profile
        ON AggregateStore (system_profile_hash);

    CREATE TABLE IF NOT EXISTS StringHashes (
        customer_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        metric_id INTEGER NOT NULL,
        report_id INTEGER NOT NULL,
        day_index INTEGER NOT NULL,
        list_index INTEGER NOT NULL,
        string_hash BLOB NOT NULL,
        PRIMARY KEY (customer_id, project_id, metric_id, report_id, day_index, list_index),
        FOREIGN KEY (customer_id, project_id, metric_id, report_id)
            REFERENCES Reports (customer_id, project_id, metric_id, report_id)
            ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_string_hash
        ON StringHashes (customer_id, project_id, metric_id, report_id, day_index, string_hash);

    CREATE TABLE IF NOT EXISTS ObservationStore (
        observation_store_id INTEGER PRIMARY KEY AUTOINCREMENT,
        observation_batch BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS GlobalValues (
        key TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reports: u64,
    pub system_profiles: u64,
    pub aggregates: u64,
    pub string_hashes: u64,
    pub observation_batches: u64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reports: {}, Profiles: {}, Aggregates: {}, Strings: {}, Queued batches: {}",
            self.reports,
            self.system_profiles,
            self.aggregates,
            self.string_hashes,
            self.observation_batches
        )
    }
}

/// SQLite-backed store (std::sync::Mutex because a Connection is !Sync)
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Create or open a store at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Create a throwaway in-memory store
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Run `f` as one atomic unit.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&StoreTx<'_>) -> StorageResult<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire store lock: {}", e)))?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&StoreTx { conn: &tx })?;
        tx.commit()?;

        Ok(result)
    }

    /// Get the database file path (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Composite-key operations available inside a transaction
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    // ==================== Global Values ====================

    /// All stored global values
    pub fn global_values(&self) -> StorageResult<BTreeMap<GlobalKey, String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM GlobalValues")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut values = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            match GlobalKey::parse(&key) {
                Some(key) => {
                    values.insert(key, value);
                }
                None => tracing::warn!("Ignoring unknown global value key {}", key),
            }
        }

        Ok(values)
    }

    pub fn upsert_global_value(&self, key: GlobalKey, value: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO GlobalValues (key, value) VALUES (?, ?)",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    pub fn delete_global_value(&self, key: GlobalKey) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM GlobalValues WHERE key = ?",
            params![key.as_str()],
        )?;
        Ok(())
    }

    // ==================== Reports ====================

    /// Insert bookkeeping for a report unless it already exists
    pub fn insert_report_if_absent(
        &self,
        report: &ReportKey,
        last_sent_day_index: DayIndex,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO Reports
                 (customer_id, project_id, metric_id, report_id, last_sent_day_index)
             VALUES (?, ?, ?, ?, ?)",
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                last_sent_day_index
            ],
        )?;
        Ok(())
    }

    pub fn last_sent_day_index(&self, report: &ReportKey) -> StorageResult<Option<DayIndex>> {
        let day = self
            .conn
            .query_row(
                "SELECT last_sent_day_index FROM Reports
                 WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?",
                params![
                    report.customer_id,
                    report.project_id,
                    report.metric_id,
                    report.report_id
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(day)
    }

    /// Update bookkeeping for an existing report; missing reports are left absent
    pub fn update_last_sent_day_index(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE Reports SET last_sent_day_index = ?
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?",
            params![
                day_index,
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id
            ],
        )?;
        Ok(())
    }

    /// Move a report from `expected` to `day_index` only if it is still at `expected`.
    ///
    /// Returns false when another writer advanced the report first.
    pub fn advance_last_sent_day_index(
        &self,
        report: &ReportKey,
        expected: DayIndex,
        day_index: DayIndex,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE Reports SET last_sent_day_index = ?
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
               AND last_sent_day_index = ?",
            params![
                day_index,
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                expected
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn report_keys(&self) -> StorageResult<Vec<ReportKey>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT customer_id, project_id, metric_id, report_id FROM Reports
             ORDER BY customer_id, project_id, metric_id, report_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReportKey::new(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete reports; their aggregates and string hashes cascade
    pub fn delete_reports(&self, reports: &[ReportKey]) -> StorageResult<usize> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM Reports
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?",
        )?;

        let mut deleted = 0;
        for report in reports {
            deleted += stmt.execute(params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id
            ])?;
        }
        Ok(deleted)
    }

    // ==================== System Profiles ====================

    /// Store a profile under its hash; an existing row is kept
    pub fn insert_system_profile(
        &self,
        hash: SystemProfileHash,
        profile: &SystemProfile,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO SystemProfiles (system_profile_hash, system_profile)
             VALUES (?, ?)",
            params![hash, profile.to_bytes()?],
        )?;
        Ok(())
    }

    pub fn system_profile(&self, hash: SystemProfileHash) -> StorageResult<Option<SystemProfile>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT system_profile FROM SystemProfiles WHERE system_profile_hash = ?",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;

        bytes.map(|b| SystemProfile::from_bytes(&b)).transpose()
    }

    /// Delete profiles no aggregate row references any more
    pub fn delete_unused_system_profiles(&self) -> StorageResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM SystemProfiles WHERE system_profile_hash NOT IN
                 (SELECT DISTINCT system_profile_hash FROM AggregateStore)",
            [],
        )?)
    }

    // ==================== Aggregates ====================

    /// Raw stored bytes of one aggregate, if the row exists
    pub fn aggregate_value_bytes(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        event_vector: &EventVector,
        hash: SystemProfileHash,
    ) -> StorageResult<Option<Vec<u8>>> {
        let bytes = self
            .conn
            .query_row(
                "SELECT aggregate_value FROM AggregateStore
                 WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
                   AND day_index = ? AND event_vector = ? AND system_profile_hash = ?",
                params![
                    report.customer_id,
                    report.project_id,
                    report.metric_id,
                    report.report_id,
                    day_index,
                    event_vector.to_db_string(),
                    hash
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    pub fn insert_aggregate(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        event_vector: &EventVector,
        hash: SystemProfileHash,
        value: &AggregateValue,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO AggregateStore
                 (customer_id, project_id, metric_id, report_id, day_index,
                  event_vector, system_profile_hash, aggregate_value)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index,
                event_vector.to_db_string(),
                hash,
                value.to_bytes()?
            ],
        )?;
        Ok(())
    }

    /// Overwrite the value of an existing aggregate row
    pub fn update_aggregate(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        event_vector: &EventVector,
        hash: SystemProfileHash,
        value: &AggregateValue,
    ) -> StorageResult<usize> {
        Ok(self.conn.execute(
            "UPDATE AggregateStore SET aggregate_value = ?
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
               AND day_index = ? AND event_vector = ? AND system_profile_hash = ?",
            params![
                value.to_bytes()?,
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index,
                event_vector.to_db_string(),
                hash
            ],
        )?)
    }

    /// Number of distinct event vectors stored for (report, day, profile)
    pub fn count_event_vectors(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        hash: SystemProfileHash,
    ) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM AggregateStore
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
               AND day_index = ? AND system_profile_hash = ?",
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index,
                hash
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All aggregates of a report for one day, joined with their profiles
    pub fn event_records_for_day(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
    ) -> StorageResult<Vec<(SystemProfile, EventRecord)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT p.system_profile, a.event_vector, a.aggregate_value
             FROM AggregateStore a
             JOIN SystemProfiles p ON a.system_profile_hash = p.system_profile_hash
             WHERE a.customer_id = ? AND a.project_id = ? AND a.metric_id = ? AND a.report_id = ?
               AND a.day_index = ?
             ORDER BY a.system_profile_hash, a.event_vector",
        )?;
        let rows = stmt.query_map(
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index
            ],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (profile, event_vector, value) = row?;
            let value = match AggregateValue::from_bytes(&value) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        "Skipping undecodable aggregate for report {} day {}: {}",
                        report,
                        day_index,
                        e
                    );
                    continue;
                }
            };
            records.push((
                SystemProfile::from_bytes(&profile)?,
                EventRecord {
                    event_vector: EventVector::from_db_string(&event_vector)?,
                    aggregate_value: value,
                },
            ));
        }

        Ok(records)
    }

    /// Every aggregate row with its profile resolved
    pub fn aggregate_rows(&self) -> StorageResult<Vec<AggregateRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.customer_id, a.project_id, a.metric_id, a.report_id, a.day_index,
                    a.event_vector, p.system_profile, a.aggregate_value
             FROM AggregateStore a
             JOIN SystemProfiles p ON a.system_profile_hash = p.system_profile_hash
             ORDER BY a.customer_id, a.project_id, a.metric_id, a.report_id, a.day_index,
                      a.system_profile_hash, a.event_vector",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                ReportKey::new(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?),
                row.get::<_, DayIndex>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Vec<u8>>(6)?,
                row.get::<_, Vec<u8>>(7)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (report, day_index, event_vector, profile, value) = row?;
            result.push(AggregateRow {
                report,
                day_index,
                event_vector: EventVector::from_db_string(&event_vector)?,
                system_profile: SystemProfile::from_bytes(&profile)?,
                aggregate_value: AggregateValue::from_bytes(&value)?,
            });
        }
        Ok(result)
    }

    pub fn delete_aggregates_before(&self, day_index: DayIndex) -> StorageResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM AggregateStore WHERE day_index < ?",
            params![day_index],
        )?)
    }

    // ==================== String Hashes ====================

    /// List index already assigned to `hash` for (report, day)
    pub fn string_list_index(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        hash: &StringHash,
    ) -> StorageResult<Option<u32>> {
        let index = self
            .conn
            .query_row(
                "SELECT list_index FROM StringHashes
                 WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
                   AND day_index = ? AND string_hash = ?",
                params![
                    report.customer_id,
                    report.project_id,
                    report.metric_id,
                    report.report_id,
                    day_index,
                    hash.as_bytes()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index)
    }

    /// Highest list index assigned for (report, day)
    pub fn max_string_list_index(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
    ) -> StorageResult<Option<u32>> {
        let index = self.conn.query_row(
            "SELECT MAX(list_index) FROM StringHashes
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
               AND day_index = ?",
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index
            ],
            |row| row.get(0),
        )?;
        Ok(index)
    }

    pub fn insert_string_hash(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
        list_index: u32,
        hash: &StringHash,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO StringHashes
                 (customer_id, project_id, metric_id, report_id, day_index, list_index, string_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index,
                list_index,
                hash.as_bytes()
            ],
        )?;
        Ok(())
    }

    /// String hashes of (report, day) ordered by list index
    pub fn string_hashes_for_day(
        &self,
        report: &ReportKey,
        day_index: DayIndex,
    ) -> StorageResult<Vec<StringHash>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT string_hash FROM StringHashes
             WHERE customer_id = ? AND project_id = ? AND metric_id = ? AND report_id = ?
               AND day_index = ?
             ORDER BY list_index",
        )?;
        let rows = stmt.query_map(
            params![
                report.customer_id,
                report.project_id,
                report.metric_id,
                report.report_id,
                day_index
            ],
            |row| row.get::<_, Vec<u8>>(0),
        )?;

        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(StringHash::from_slice(&row?)?);
        }
        Ok(hashes)
    }

    pub fn delete_string_hashes_before(&self, day_index: DayIndex) -> StorageResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM StringHashes WHERE day_index < ?",
            params![day_index],
        )?)
    }

    // ==================== Observations ====================

    /// Append batches to the queue, returning their ids in order
    pub fn insert_observation_batches(
        &self,
        batches: &[ObservationBatch],
    ) -> StorageResult<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO ObservationStore (observation_batch) VALUES (?)")?;

        let mut ids = Vec::with_capacity(batches.len());
        for batch in batches {
            stmt.execute(params![batch.to_bytes()?])?;
            ids.push(self.conn.last_insert_rowid());
        }
        Ok(ids)
    }

    /// Queued batches, oldest first
    pub fn oldest_observations(&self, limit: usize) -> StorageResult<Vec<QueuedObservation>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT observation_store_id, observation_batch FROM ObservationStore
             ORDER BY observation_store_id ASC
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut queued = Vec::new();
        for row in rows {
            let (id, bytes) = row?;
            queued.push(QueuedObservation {
                id,
                batch: ObservationBatch::from_bytes(&bytes)?,
            });
        }
        Ok(queued)
    }

    pub fn delete_observations(&self, ids: &[i64]) -> StorageResult<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM ObservationStore WHERE observation_store_id = ?")?;

        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![id])?;
        }
        Ok(deleted)
    }

    // ==================== Stats ====================

    pub fn stats(&self) -> StorageResult<StoreStats> {
        let count = |table: &str| -> StorageResult<u64> {
            let n: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table),
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };

        Ok(StoreStats {
            reports: count("Reports")?,
            system_profiles: count("SystemProfiles")?,
            aggregates: count("AggregateStore")?,
            string_hashes: count("StringHashes")?,
            observation_batches: count("ObservationStore")?,
        })
    }
}
