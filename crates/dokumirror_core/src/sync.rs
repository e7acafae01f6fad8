use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncSection;
use crate::remote::RemoteSource;
use crate::search::{SearchBackend, SearchIndex};
use crate::store::{PageStore, unix_timestamp};
use crate::transform::ContentTransformer;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_PAUSE_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub batch_pause: Duration,
    /// 0 lists the whole tree.
    pub list_depth: u32,
    pub since_skew_secs: i64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause: Duration::from_millis(DEFAULT_BATCH_PAUSE_MS),
            list_depth: 0,
            since_skew_secs: 0,
        }
    }
}

impl SyncOptions {
    pub fn from_config(section: &SyncSection) -> Self {
        Self {
            batch_size: section.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            batch_pause: Duration::from_millis(
                section.batch_pause_ms.unwrap_or(DEFAULT_BATCH_PAUSE_MS),
            ),
            list_depth: section.list_depth.unwrap_or(0),
            since_skew_secs: section.since_skew_secs.unwrap_or(0).max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Listing,
    Processing { batch: usize, of: usize },
    Finalizing,
}

/// Counters for one run. `processed` counts every attempted page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    /// Pages stored successfully whose search indexing failed.
    pub index_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSyncOutcome {
    pub page_id: String,
    pub created: bool,
    pub indexed: bool,
}

/// Pulls pages from a remote source into the store and search index.
pub struct SyncOrchestrator<R, B> {
    remote: R,
    store: Arc<PageStore>,
    index: SearchIndex<B>,
    transformer: ContentTransformer,
    options: SyncOptions,
    phase: SyncPhase,
}

impl<R: RemoteSource, B: SearchBackend> SyncOrchestrator<R, B> {
    pub fn new(
        remote: R,
        store: Arc<PageStore>,
        index: SearchIndex<B>,
        transformer: ContentTransformer,
        options: SyncOptions,
    ) -> Self {
        Self {
            remote,
            store,
            index,
            transformer,
            options,
            phase: SyncPhase::Idle,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn index(&self) -> &SearchIndex<B> {
        &self.index
    }

    /// Mirror every page the remote lists, then record the run start as the last sync.
    pub fn full_sync(&mut self) -> Result<SyncStats> {
        let result = self.run_full();
        self.phase = SyncPhase::Idle;
        result
    }

    /// Mirror pages changed since the last recorded sync.
    ///
    /// The last-sync cell only advances when the run reaches its end.
    pub fn incremental_sync(&mut self) -> Result<SyncStats> {
        let result = self.run_incremental();
        self.phase = SyncPhase::Idle;
        result
    }

    /// Mirror the pages under `namespace`. Partial runs never move the last-sync cell.
    pub fn namespace_sync(&mut self, namespace: &str) -> Result<SyncStats> {
        let result = self.run_namespace(namespace.trim());
        self.phase = SyncPhase::Idle;
        result
    }

    /// Fetch and store a single page, bubbling up any failure.
    pub fn sync_page(&mut self, id: &str) -> Result<PageSyncOutcome> {
        let result = self.process_page(id.trim());
        self.phase = SyncPhase::Idle;
        result
    }

    fn run_full(&mut self) -> Result<SyncStats> {
        let started_at = unix_timestamp()?;
        info!(depth = self.options.list_depth, "starting full sync");

        self.phase = SyncPhase::Listing;
        let listing = self
            .remote
            .list_all_page_ids(self.options.list_depth)
            .context("failed to list remote pages")?;
        let ids = dedupe_ids(listing.into_iter().map(|entry| entry.id));

        let stats = self.process_ids(&ids);
        self.finish(started_at, &stats)?;
        Ok(stats)
    }

    fn run_incremental(&mut self) -> Result<SyncStats> {
        let started_at = unix_timestamp()?;
        let last_sync = self.store.last_sync_timestamp()?.unwrap_or(0);
        let since = last_sync.saturating_sub(self.options.since_skew_secs).max(0);
        info!(last_sync, since, "starting incremental sync");

        self.phase = SyncPhase::Listing;
        let changes = self
            .remote
            .list_changed_since(since)
            .with_context(|| format!("failed to list remote changes since {since}"))?;
        let ids = dedupe_ids(changes.into_iter().map(|change| change.id));

        let stats = self.process_ids(&ids);
        self.finish(started_at, &stats)?;
        Ok(stats)
    }

    fn run_namespace(&mut self, namespace: &str) -> Result<SyncStats> {
        info!(namespace, depth = self.options.list_depth, "starting namespace sync");
        self.phase = SyncPhase::Listing;
        let listing = self
            .remote
            .list_page_ids_under(namespace, self.options.list_depth)
            .with_context(|| format!("failed to list remote pages under {namespace:?}"))?;
        let ids = dedupe_ids(listing.into_iter().map(|entry| entry.id));
        let stats = self.process_ids(&ids);
        info!(
            namespace,
            processed = stats.processed,
            errors = stats.errors,
            "namespace sync finished"
        );
        Ok(stats)
    }

    fn finish(&mut self, started_at: i64, stats: &SyncStats) -> Result<()> {
        self.phase = SyncPhase::Finalizing;
        self.store
            .set_last_sync_timestamp(started_at)
            .context("failed to record last sync timestamp")?;
        info!(
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            errors = stats.errors,
            index_failures = stats.index_failures,
            requests = self.remote.request_count(),
            "sync finished"
        );
        Ok(())
    }

    fn process_ids(&mut self, ids: &[String]) -> SyncStats {
        let mut stats = SyncStats::default();
        if ids.is_empty() {
            return stats;
        }
        if let Err(error) = self.index.ensure_ready() {
            warn!(backend = self.index.backend_name(), %error, "search index not ready; pages will still be stored");
        }

        let batch_size = self.options.batch_size.max(1);
        let total_batches = ids.len().div_ceil(batch_size);
        for (position, batch) in ids.chunks(batch_size).enumerate() {
            let batch_number = position + 1;
            self.phase = SyncPhase::Processing {
                batch: batch_number,
                of: total_batches,
            };
            info!(batch = batch_number, of = total_batches, pages = batch.len(), "processing batch");

            for id in batch {
                stats.processed += 1;
                match self.process_page(id) {
                    Ok(outcome) => {
                        if outcome.created {
                            stats.created += 1;
                        } else {
                            stats.updated += 1;
                        }
                        if !outcome.indexed {
                            stats.index_failures += 1;
                        }
                    }
                    Err(error) => {
                        stats.errors += 1;
                        warn!(page_id = %id, error = %format!("{error:#}"), "page sync failed");
                    }
                }
            }

            if batch_number < total_batches && !self.options.batch_pause.is_zero() {
                thread::sleep(self.options.batch_pause);
            }
        }
        stats
    }

    fn process_page(&mut self, id: &str) -> Result<PageSyncOutcome> {
        debug!(page_id = %id, "syncing page");
        let meta = self.remote.get_page_meta(id)?;
        let raw = self.remote.get_raw_content(id)?;
        let html = self.remote.get_rendered_html(id)?;
        let page = self
            .transformer
            .build_page(id, &meta, &raw, &html, unix_timestamp()?)?;

        let stored = self.store.upsert(&page)?;
        let indexed = match self.index.index_page(&stored.page) {
            Ok(()) => true,
            Err(error) => {
                warn!(page_id = %id, backend = self.index.backend_name(), %error, "stored page but indexing failed");
                false
            }
        };
        debug!(page_id = %id, created = stored.created, indexed, "page synced");

        Ok(PageSyncOutcome {
            page_id: page.id,
            created: stored.created,
            indexed,
        })
    }
}

/// Drop blank and repeated ids, keeping first-seen order.
fn dedupe_ids<I: IntoIterator<Item = String>>(ids: I) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
