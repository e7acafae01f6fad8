use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::info;

use crate::runtime::ResolvedPaths;
use crate::store::{ensure_db_parent, open_connection, unix_timestamp};

/// One forward-only schema step, embedded at compile time.
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "pages",
        sql: include_str!("migrations/v001_pages.sql"),
    },
    SchemaStep {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);";

#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

pub fn latest_version() -> u32 {
    STEPS.iter().map(|step| step.version).max().unwrap_or(0)
}

/// Open (or create) the page database and bring it to the latest schema.
pub fn migrate_database(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(&paths.db_path)?;
    let mut connection = open_connection(&paths.db_path)?;
    run_migrations(&mut connection)
}

/// Apply every step whose version is not yet recorded, each in its own transaction.
pub fn run_migrations(connection: &mut Connection) -> Result<MigrateReport> {
    connection
        .execute_batch(LEDGER_DDL)
        .context("failed to create schema_migrations table")?;
    let recorded = recorded_versions(connection)?;

    let mut applied = Vec::new();
    for step in STEPS.iter().filter(|step| !recorded.contains(&step.version)) {
        let label = format!("v{:03}_{}", step.version, step.name);
        let transaction = connection
            .transaction()
            .with_context(|| format!("failed to begin migration {label}"))?;
        transaction
            .execute_batch(step.sql)
            .with_context(|| format!("migration {label} failed"))?;
        transaction
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![step.version, step.name, unix_timestamp()?],
            )
            .with_context(|| format!("failed to record migration {label}"))?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit migration {label}"))?;
        info!(migration = %label, "applied schema migration");
        applied.push(AppliedMigration {
            version: step.version,
            name: step.name.to_string(),
        });
    }

    Ok(MigrateReport {
        applied,
        current_version: schema_version(connection)?,
    })
}

/// Steps not yet applied to the database at `paths.db_path`; all of them when it does not exist.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.is_file() {
        return Ok(STEPS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    let has_ledger: bool = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
            [],
            |row| row.get(0),
        )
        .context("failed to inspect sqlite_master")?;
    if !has_ledger {
        return Ok(STEPS.len());
    }
    let recorded = recorded_versions(&connection)?;
    Ok(STEPS
        .iter()
        .filter(|step| !recorded.contains(&step.version))
        .count())
}

/// Highest recorded version, 0 for an unmigrated database.
pub fn schema_version(connection: &Connection) -> Result<u32> {
    Ok(recorded_versions(connection)?.last().copied().unwrap_or(0))
}

fn recorded_versions(connection: &Connection) -> Result<BTreeSet<u32>> {
    let mut statement = connection
        .prepare("SELECT version FROM schema_migrations")
        .context("failed to read schema_migrations")?;
    let versions = statement
        .query_map([], |row| row.get::<_, u32>(0))
        .context("failed to read schema_migrations")?
        .collect::<rusqlite::Result<BTreeSet<_>>>()
        .context("failed to decode migration version")?;
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::runtime::PathSource;

    #[test]
    fn fresh_database_reaches_latest_version() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_root(temp.path().to_path_buf(), PathSource::Flag);
        assert_eq!(pending_migration_count(&paths).expect("pending"), STEPS.len());

        let report = migrate_database(&paths).expect("migrate");
        assert_eq!(report.applied.len(), STEPS.len());
        assert_eq!(report.applied[0].name, "pages");
        assert_eq!(report.current_version, latest_version());
        assert!(paths.db_path.exists());
        assert_eq!(pending_migration_count(&paths).expect("pending"), 0);
    }

    #[test]
    fn rerun_applies_nothing() {
        let mut connection = Connection::open_in_memory().expect("sqlite");
        run_migrations(&mut connection).expect("first run");
        let second = run_migrations(&mut connection).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, latest_version());
    }

    #[test]
    fn only_missing_steps_are_applied() {
        let mut connection = Connection::open_in_memory().expect("sqlite");
        connection.execute_batch(LEDGER_DDL).expect("ledger");
        connection
            .execute_batch(STEPS[0].sql)
            .expect("first step by hand");
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (1, 'pages', 0)",
                [],
            )
            .expect("record");

        let report = run_migrations(&mut connection).expect("migrate");
        assert_eq!(
            report.applied.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn failed_step_leaves_no_record() {
        let mut connection = Connection::open_in_memory().expect("sqlite");
        connection
            .execute_batch("CREATE TABLE pages (page_id TEXT);")
            .expect("conflicting table");
        // v002 indexes a column the conflicting table lacks.
        let error = run_migrations(&mut connection).expect_err("must fail");
        assert!(format!("{error:#}").contains("v002_indexes"));
        assert_eq!(schema_version(&connection).expect("version"), 1);
    }
}
