use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::hierarchy::{depth_of, namespace_of};
use crate::migrate::{run_migrations, schema_version};
use crate::page::{Page, PageSummary, TocEntry};

const LAST_SYNC_KEY: &str = "last_sync_unix";
const PAGE_COLUMNS: &str = "page_id, title, content, html_content, excerpt, table_of_contents, \
     last_modified, revision, permission, size_bytes";

/// Outcome of [`PageStore::upsert`].
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub page: Page,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub last_sync: Option<i64>,
    pub schema_version: u32,
}

/// SQLite-backed store of synchronized pages, keyed by page id.
pub struct PageStore {
    connection: Mutex<Connection>,
}

impl PageStore {
    /// Open (creating if needed) the database at `db_path` and apply pending migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::from_connection(connection)
    }

    fn from_connection(mut connection: Connection) -> Result<Self> {
        run_migrations(&mut connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow::anyhow!("page store connection lock poisoned"))
    }

    /// Insert or replace the row for `page.id` in one transaction.
    pub fn upsert(&self, page: &Page) -> Result<StoredPage> {
        let table_of_contents = serde_json::to_string(&page.table_of_contents)
            .with_context(|| format!("failed to encode table of contents for {}", page.id))?;
        let synced_at = unix_timestamp()?;

        let mut connection = self.lock()?;
        let transaction = connection
            .transaction()
            .context("failed to start page upsert transaction")?;
        let existed: bool = transaction
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pages WHERE page_id = ?1)",
                [&page.id],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up page {}", page.id))?;
        transaction
            .execute(
                "INSERT INTO pages (
                    page_id, title, content, html_content, excerpt, table_of_contents,
                    namespace, depth, last_modified, revision, permission, size_bytes, synced_at_unix
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(page_id) DO UPDATE SET
                    title = excluded.title,
                    content = excluded.content,
                    html_content = excluded.html_content,
                    excerpt = excluded.excerpt,
                    table_of_contents = excluded.table_of_contents,
                    namespace = excluded.namespace,
                    depth = excluded.depth,
                    last_modified = excluded.last_modified,
                    revision = excluded.revision,
                    permission = excluded.permission,
                    size_bytes = excluded.size_bytes,
                    synced_at_unix = excluded.synced_at_unix",
                params![
                    page.id,
                    page.title,
                    page.raw_content,
                    page.rendered_html,
                    page.excerpt,
                    table_of_contents,
                    namespace_of(&page.id),
                    i64::try_from(depth_of(&page.id)).context("page depth does not fit into i64")?,
                    page.last_modified,
                    page.revision,
                    page.permission,
                    page.size_bytes,
                    synced_at,
                ],
            )
            .with_context(|| format!("failed to upsert page {}", page.id))?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit page {}", page.id))?;

        Ok(StoredPage {
            page: page.clone(),
            created: !existed,
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Page>> {
        let connection = self.lock()?;
        connection
            .query_row(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE page_id = ?1"),
                [id],
                page_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load page {id}"))
    }

    /// Pages whose id starts with `prefix`, ordered by id.
    pub fn find_by_id_prefix(&self, prefix: &str) -> Result<Vec<Page>> {
        self.query_pages(
            &format!(
                "SELECT {PAGE_COLUMNS} FROM pages
                 WHERE substr(page_id, 1, length(?1)) = ?1
                 ORDER BY page_id"
            ),
            prefix,
        )
    }

    /// Pages whose namespace starts with `namespace_prefix`, ordered by id.
    pub fn find_by_namespace_prefix(&self, namespace_prefix: &str) -> Result<Vec<Page>> {
        self.query_pages(
            &format!(
                "SELECT {PAGE_COLUMNS} FROM pages
                 WHERE substr(namespace, 1, length(?1)) = ?1
                 ORDER BY page_id"
            ),
            namespace_prefix,
        )
    }

    pub fn all_pages(&self) -> Result<Vec<Page>> {
        self.find_by_id_prefix("")
    }

    pub fn count_all(&self) -> Result<usize> {
        let connection = self.lock()?;
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))
            .context("failed to count pages")?;
        usize::try_from(count).context("page count does not fit into usize")
    }

    pub fn most_recently_modified(&self, limit: usize) -> Result<Vec<Page>> {
        let limit = i64::try_from(limit).context("limit does not fit into i64")?;
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {PAGE_COLUMNS} FROM pages
                 ORDER BY last_modified DESC, page_id ASC
                 LIMIT ?1"
            ))
            .context("failed to prepare recent pages query")?;
        let rows = statement
            .query_map([limit], page_from_row)
            .context("failed to query recent pages")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode recent pages")
    }

    pub fn summaries_by_id_prefix(&self, prefix: &str) -> Result<Vec<PageSummary>> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT page_id, title, last_modified, size_bytes FROM pages
                 WHERE substr(page_id, 1, length(?1)) = ?1
                 ORDER BY page_id",
            )
            .context("failed to prepare page summary query")?;
        let rows = statement
            .query_map([prefix], |row| {
                Ok(PageSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    last_modified: row.get(2)?,
                    size_bytes: row.get(3)?,
                })
            })
            .with_context(|| format!("failed to query summaries under {prefix:?}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode page summaries")
    }

    pub fn ids_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(
                "SELECT page_id FROM pages
                 WHERE substr(page_id, 1, length(?1)) = ?1
                 ORDER BY page_id",
            )
            .context("failed to prepare page id query")?;
        let rows = statement
            .query_map([prefix], |row| row.get(0))
            .with_context(|| format!("failed to query page ids under {prefix:?}"))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("failed to decode page ids")
    }

    pub fn last_sync_timestamp(&self) -> Result<Option<i64>> {
        let connection = self.lock()?;
        let value: Option<String> = connection
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                [LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read last sync timestamp")?;
        match value {
            Some(value) => value
                .trim()
                .parse::<i64>()
                .map(Some)
                .with_context(|| format!("stored last sync timestamp is not an integer: {value}")),
            None => Ok(None),
        }
    }

    pub fn set_last_sync_timestamp(&self, timestamp: i64) -> Result<()> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![LAST_SYNC_KEY, timestamp.to_string()],
            )
            .context("failed to write last sync timestamp")?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let document_count = self.count_all()?;
        let last_sync = self.last_sync_timestamp()?;
        let connection = self.lock()?;
        let schema_version = schema_version(&connection)?;
        Ok(StoreStats {
            document_count,
            last_sync,
            schema_version,
        })
    }

    fn query_pages(&self, sql: &str, argument: &str) -> Result<Vec<Page>> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare(sql)
            .context("failed to prepare page query")?;
        let rows = statement
            .query_map([argument], page_from_row)
            .with_context(|| format!("failed to query pages for {argument:?}"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode pages")
    }
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<Page> {
    let table_of_contents: String = row.get(5)?;
    let table_of_contents: Vec<TocEntry> = serde_json::from_str(&table_of_contents)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(error)))?;
    Ok(Page {
        id: row.get(0)?,
        title: row.get(1)?,
        raw_content: row.get(2)?,
        rendered_html: row.get(3)?,
        excerpt: row.get(4)?,
        table_of_contents,
        last_modified: row.get(6)?,
        revision: row.get(7)?,
        permission: row.get(8)?,
        size_bytes: row.get(9)?,
    })
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}
