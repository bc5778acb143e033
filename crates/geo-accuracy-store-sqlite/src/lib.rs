use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use geo_accuracy_core::{
    AccuracyStat, Clock, ContextKey, ContextType, StatStore, StoreError, SystemClock,
};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS accuracy_stats (
  context_key TEXT PRIMARY KEY,
  context_type TEXT NOT NULL CHECK (context_type IN ('company','office','mission','user')),
  context_id TEXT,
  user_id TEXT,
  success_streak INTEGER NOT NULL CHECK (success_streak >= 0),
  failure_streak INTEGER NOT NULL CHECK (failure_streak >= 0),
  total_samples INTEGER NOT NULL CHECK (total_samples >= 0),
  average_accuracy REAL NOT NULL,
  baseline_accuracy REAL,
  temporary_accuracy REAL,
  temporary_expiration TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (success_streak = 0 OR failure_streak = 0)
);

CREATE INDEX IF NOT EXISTS idx_accuracy_stats_scope ON accuracy_stats(context_type, context_id);
CREATE INDEX IF NOT EXISTS idx_accuracy_stats_user ON accuracy_stats(user_id);
";

const SELECT_STAT_COLUMNS: &str = "SELECT
    context_type, context_id, user_id, success_streak, failure_streak, total_samples,
    average_accuracy, baseline_accuracy, temporary_accuracy, temporary_expiration,
    created_at, updated_at
 FROM accuracy_stats";

/// `SQLite`-backed stat store. `update` runs inside `BEGIN IMMEDIATE`, so writers on other
/// connections to the same file serialize with it as well.
pub struct SqliteStatStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub stat_rows: i64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug)]
struct CorruptRow(String);

impl Display for CorruptRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CorruptRow {}

impl SqliteStatStore {
    /// Open a `SQLite` stat store using the system clock for lifecycle timestamps.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open a `SQLite` stat store with an injected clock.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn), clock })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails, or the
    /// database was written by a newer schema.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (version, inferred_from_legacy) = detect_effective_schema_version(&conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if inferred_from_legacy {
            // Table exists from an unversioned deployment; adopt it as v1.
            record_schema_version(&conn, 1)?;
            info!("recorded schema version 1 for existing accuracy_stats table");
            return Ok(());
        }

        if version < 1 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied accuracy_stats schema migration");
        }

        Ok(())
    }

    /// Run quick-check and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let (quick_check_message, stat_rows) = {
            let conn = self.lock();
            let message: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                .context("failed to run PRAGMA quick_check")?;
            let rows = if table_exists(&conn, "accuracy_stats")? {
                conn.query_row("SELECT COUNT(*) FROM accuracy_stats", [], |row| row.get(0))
                    .context("failed to count accuracy_stats rows")?
            } else {
                0
            };
            (message, rows)
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            stat_rows,
            schema_status,
        })
    }

    /// Load every persisted stat ordered by scope.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_stats(&self) -> Result<Vec<AccuracyStat>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_STAT_COLUMNS} ORDER BY context_type ASC, context_id ASC, user_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut stats = Vec::new();
        while let Some(row) = rows.next()? {
            stats.push(stat_from_row(row)?);
        }
        Ok(stats)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // The connection stays consistent across a panicked holder: every write is transactional.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatStore for SqliteStatStore {
    fn get(&self, key: &ContextKey) -> Result<Option<AccuracyStat>, StoreError> {
        let conn = self.lock();
        load_stat(&conn, key).map_err(to_store_error)
    }

    fn get_or_create(&self, key: &ContextKey) -> Result<AccuracyStat, StoreError> {
        let mut conn = self.lock();
        load_or_insert(&mut conn, key, self.clock.now()).map_err(to_store_error)
    }

    fn save(&self, stat: &AccuracyStat) -> Result<(), StoreError> {
        let mut stored = stat.clone();
        stored.updated_at = self.clock.now();

        let mut conn = self.lock();
        upsert_in_transaction(&mut conn, &stored).map_err(to_store_error)
    }

    fn update<T, E, F>(&self, key: &ContextKey, apply: F) -> Result<T, E>
    where
        F: FnOnce(&AccuracyStat) -> Result<(T, AccuracyStat), E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update transaction")
            .map_err(to_store_error)?;
        let current = load_stat(&tx, key)
            .map_err(to_store_error)?
            .unwrap_or_else(|| AccuracyStat::new(key.clone(), self.clock.now()));

        // Dropping `tx` on an early return rolls the transaction back.
        let (output, mut next) = apply(&current)?;
        if next.context != *key {
            return Err(StoreError::Backend(format!(
                "update for {key} returned a stat keyed {}",
                next.context
            ))
            .into());
        }
        next.updated_at = self.clock.now();

        upsert_stat(&tx, &next).map_err(to_store_error)?;
        tx.commit().context("failed to commit update transaction").map_err(to_store_error)?;
        debug!(
            context = %key,
            total_samples = next.total_samples,
            success_streak = next.success_streak,
            failure_streak = next.failure_streak,
            "persisted accuracy stat"
        );
        Ok(output)
    }
}

fn load_or_insert(
    conn: &mut Connection,
    key: &ContextKey,
    now: OffsetDateTime,
) -> Result<AccuracyStat> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start get_or_create transaction")?;
    if let Some(existing) = load_stat(&tx, key)? {
        return Ok(existing);
    }
    let fresh = AccuracyStat::new(key.clone(), now);
    upsert_stat(&tx, &fresh)?;
    tx.commit().context("failed to commit get_or_create transaction")?;
    debug!(context = %key, "created accuracy stat");
    Ok(fresh)
}

fn upsert_in_transaction(conn: &mut Connection, stat: &AccuracyStat) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start save transaction")?;
    upsert_stat(&tx, stat)?;
    tx.commit().context("failed to commit save transaction")?;
    Ok(())
}

fn load_stat(conn: &Connection, key: &ContextKey) -> Result<Option<AccuracyStat>> {
    let mut stmt = conn.prepare(&format!("{SELECT_STAT_COLUMNS} WHERE context_key = ?1"))?;
    let mut rows = stmt.query(params![key.canonical()])?;
    match rows.next()? {
        Some(row) => Ok(Some(stat_from_row(row)?)),
        None => Ok(None),
    }
}

fn upsert_stat(conn: &Connection, stat: &AccuracyStat) -> Result<()> {
    let total_samples = i64::try_from(stat.total_samples)
        .with_context(|| format!("total_samples overflows sqlite INTEGER for {}", stat.context))?;

    conn.execute(
        "INSERT INTO accuracy_stats(
            context_key, context_type, context_id, user_id,
            success_streak, failure_streak, total_samples, average_accuracy,
            baseline_accuracy, temporary_accuracy, temporary_expiration,
            created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4,
            ?5, ?6, ?7, ?8,
            ?9, ?10, ?11,
            ?12, ?13
        )
        ON CONFLICT(context_key) DO UPDATE SET
            success_streak = excluded.success_streak,
            failure_streak = excluded.failure_streak,
            total_samples = excluded.total_samples,
            average_accuracy = excluded.average_accuracy,
            baseline_accuracy = excluded.baseline_accuracy,
            temporary_accuracy = excluded.temporary_accuracy,
            temporary_expiration = excluded.temporary_expiration,
            updated_at = excluded.updated_at",
        params![
            stat.context.canonical(),
            stat.context.context_type.as_str(),
            stat.context.context_id,
            stat.context.user_id,
            i64::from(stat.success_streak),
            i64::from(stat.failure_streak),
            total_samples,
            stat.average_accuracy,
            stat.baseline_accuracy,
            stat.temporary_accuracy,
            stat.temporary_expiration.map(rfc3339).transpose()?,
            rfc3339(stat.created_at)?,
            rfc3339(stat.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to upsert accuracy stat for {}", stat.context))?;
    Ok(())
}

fn stat_from_row(row: &Row<'_>) -> Result<AccuracyStat> {
    let context_type_raw: String = row.get(0)?;
    let context_type = ContextType::parse(&context_type_raw)
        .ok_or_else(|| corrupt(format!("unknown context_type: {context_type_raw}")))?;
    let context = ContextKey { context_type, context_id: row.get(1)?, user_id: row.get(2)? };

    let temporary_expiration =
        row.get::<_, Option<String>>(9)?.as_deref().map(parse_rfc3339).transpose()?;

    Ok(AccuracyStat {
        success_streak: counter(row.get(3)?, "success_streak", &context)?,
        failure_streak: counter(row.get(4)?, "failure_streak", &context)?,
        total_samples: u64::try_from(row.get::<_, i64>(5)?)
            .map_err(|_| corrupt(format!("negative total_samples for {context}")))?,
        average_accuracy: row.get(6)?,
        baseline_accuracy: row.get(7)?,
        temporary_accuracy: row.get(8)?,
        temporary_expiration,
        created_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        context,
    })
}

fn counter(raw: i64, column: &str, context: &ContextKey) -> Result<u32> {
    u32::try_from(raw).map_err(|_| corrupt(format!("{column}={raw} out of range for {context}")))
}

fn corrupt(message: String) -> anyhow::Error {
    anyhow::Error::new(CorruptRow(message))
}

fn to_store_error(err: anyhow::Error) -> StoreError {
    if let Some(row) = err.chain().find_map(|cause| cause.downcast_ref::<CorruptRow>()) {
        return StoreError::Corrupt(row.0.clone());
    }
    StoreError::Backend(format!("{err:#}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_exists(conn, "accuracy_stats")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| corrupt(format!("invalid RFC3339 timestamp {value}: {err}")))
}
