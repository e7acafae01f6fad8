use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cache::TtlCache;
use crate::hierarchy::{
    DELIMITER, GroupEntry, HierarchyConfig, Subpages, derive_group_hierarchy, derive_subpages,
    subpage_base,
};
use crate::store::PageStore;
use crate::transform::RouteConfig;

/// Hierarchy views computed from the page store.
pub struct Navigator {
    store: Arc<PageStore>,
    config: HierarchyConfig,
    routes: RouteConfig,
    groups: TtlCache<Vec<GroupEntry>>,
}

impl Navigator {
    pub fn new(store: Arc<PageStore>, config: HierarchyConfig, routes: RouteConfig) -> Self {
        Self {
            store,
            config,
            routes,
            groups: TtlCache::new(),
        }
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    pub fn subpages(&self, page_id: &str) -> Result<Subpages> {
        let base = subpage_base(page_id, &self.config.index_segment);
        let prefix = if base.is_empty() {
            String::new()
        } else {
            format!("{base}{DELIMITER}")
        };
        let summaries = self.store.summaries_by_id_prefix(&prefix)?;
        Ok(derive_subpages(page_id, &summaries, &self.config, &self.routes))
    }

    /// Group entries under `prefix`, cached for `group_cache_ttl_secs`.
    pub fn groups(&self, prefix: &str) -> Result<Vec<GroupEntry>> {
        let prefix = prefix.trim().trim_matches(DELIMITER);
        let ttl = Duration::from_secs(self.config.group_cache_ttl_secs);
        self.groups.get_or_try_insert_with(prefix, ttl, || {
            let lookup = if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}{DELIMITER}")
            };
            let ids = self.store.ids_by_prefix(&lookup)?;
            Ok(derive_group_hierarchy(prefix, &ids, &self.config, &self.routes))
        })
    }

    /// Drop cached group listings, typically after a sync run.
    pub fn invalidate(&self) {
        self.groups.clear();
    }
}
