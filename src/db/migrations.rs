//! Schema versioning for the local record store
//!
//! The schema version lives in SQLite's `user_version` pragma. Each migration
//! moves the schema to exactly one version and runs in its own transaction,
//! so a crash mid-upgrade leaves the store at the last completed version.
//! Applied migrations are also recorded in `schema_migrations`.
//!
//! A store that cannot be migrated (written by a newer build, or older than
//! the oldest migratable version) is wiped and rebuilt; its records are then
//! re-ingested from the network. Running against a mismatched schema is never
//! allowed.
//!
//! # Adding a new migration
//!
//! 1. Create a new struct implementing the `Migration` trait
//! 2. Append it to `ALL_MIGRATIONS` and bump `SCHEMA_VERSION`

use super::{StoreError, StoreResult};
use rusqlite::{Connection, Transaction};

/// Schema version this build reads and writes
pub const SCHEMA_VERSION: u32 = 2;

/// Stores below this version (other than a fresh, empty one) are wiped
pub const MIN_MIGRATABLE_VERSION: u32 = 1;

/// A schema migration that can be applied
pub trait Migration: Send + Sync {
    /// Schema version after this migration has run
    fn version(&self) -> u32;

    /// Human-readable description of what this migration does
    fn description(&self) -> &'static str;

    /// Apply the migration inside the runner's transaction
    fn up(&self, tx: &Transaction<'_>) -> StoreResult<()>;
}

/// Registry of all migrations in order
pub static ALL_MIGRATIONS: &[&dyn Migration] = &[&CreateRecordsTable, &AddStoreMetaAndFilterIndex];

/// Migration runner that tracks and applies migrations
pub struct MigrationRunner<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Current schema version as recorded in the database file
    pub fn current_version(&self) -> StoreResult<u32> {
        let version: u32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(version)
    }

    fn ensure_migrations_table(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(())
    }

    /// Drop every table and reset the version to zero
    fn wipe(&mut self) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DROP TABLE IF EXISTS records;
             DROP TABLE IF EXISTS store_meta;
             DROP TABLE IF EXISTS schema_migrations;",
        )?;
        tx.pragma_update(None, "user_version", 0u32)?;
        tx.commit()?;
        Ok(())
    }

    /// Bring the schema to `SCHEMA_VERSION`, wiping the store if it cannot be migrated
    pub fn run_pending(&mut self) -> StoreResult<MigrationReport> {
        let from_version = self.current_version()?;
        let mut report = MigrationReport {
            from_version,
            to_version: from_version,
            ..Default::default()
        };

        let too_new = from_version > SCHEMA_VERSION;
        let too_old = from_version != 0 && from_version < MIN_MIGRATABLE_VERSION;
        if too_new || too_old {
            log::warn!(
                "[MIGRATIONS] Store schema v{} is not migratable to v{}, wiping local records",
                from_version,
                SCHEMA_VERSION
            );
            self.wipe()?;
            report.wiped = true;
        }

        self.ensure_migrations_table()?;
        let mut current = self.current_version()?;

        for migration in ALL_MIGRATIONS {
            if migration.version() <= current {
                report.skipped += 1;
                continue;
            }

            log::info!(
                "[MIGRATIONS] Running migration v{}: {}",
                migration.version(),
                migration.description()
            );

            let tx = self.conn.transaction()?;
            migration.up(&tx).map_err(|e| StoreError::Migration {
                version: migration.version(),
                message: e.to_string(),
            })?;
            tx.execute(
                "INSERT OR REPLACE INTO schema_migrations (version, description) VALUES (?1, ?2)",
                rusqlite::params![migration.version(), migration.description()],
            )?;
            tx.pragma_update(None, "user_version", migration.version())?;
            tx.commit()?;

            current = migration.version();
            report.applied += 1;
        }

        report.to_version = current;
        Ok(report)
    }

    /// Get list of applied migrations
    pub fn get_applied(&self) -> StoreResult<Vec<AppliedMigration>> {
        self.ensure_migrations_table()?;

        let mut stmt = self.conn.prepare(
            "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
        )?;

        let migrations = stmt
            .query_map([], |row| {
                Ok(AppliedMigration {
                    version: row.get(0)?,
                    description: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(migrations)
    }
}

/// Report of migration run results
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: usize,
    pub skipped: usize,
    pub wiped: bool,
}

/// Information about an applied migration
#[derive(Debug)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: String,
}

// ============================================================================
// MIGRATIONS
// ============================================================================

/// v1: the record table keyed by composite id, plus one index per filterable column
pub struct CreateRecordsTable;

impl Migration for CreateRecordsTable {
    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Create records table with station, status and test date indices"
    }

    fn up(&self, tx: &Transaction<'_>) -> StoreResult<()> {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY NOT NULL,
                isn TEXT NOT NULL,
                test_start_time TEXT NOT NULL,
                station TEXT NOT NULL,
                test_status TEXT NOT NULL,
                test_date TEXT NOT NULL,
                payload TEXT NOT NULL,
                ingested_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_station
                ON records(station, id);
            CREATE INDEX IF NOT EXISTS idx_records_status
                ON records(test_status, id);
            CREATE INDEX IF NOT EXISTS idx_records_test_date
                ON records(test_date, id);",
        )?;
        Ok(())
    }
}

/// v2: key/value table for dataset-level flags and a covering index for
/// the station + status + date filter combination
pub struct AddStoreMetaAndFilterIndex;

impl Migration for AddStoreMetaAndFilterIndex {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "Add store_meta table and station/status/date composite index"
    }

    fn up(&self, tx: &Transaction<'_>) -> StoreResult<()> {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_station_status_date
                ON records(station, test_status, test_date);",
        )?;
        Ok(())
    }
}
