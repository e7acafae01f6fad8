use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::page::PageSummary;
use crate::transform::RouteConfig;

pub const DELIMITER: char = ':';
pub const ROOT_NAMESPACE: &str = "root";

/// Tunable data for hierarchy derivation. Loaded from the `[hierarchy]` config section.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HierarchyConfig {
    pub index_segment: String,
    /// Index page titles that never replace a folder's humanized name.
    pub generic_titles: Vec<String>,
    pub max_subpage_entries: usize,
    /// Standalone group pages with these names are dropped.
    pub excluded_names: Vec<String>,
    /// Standalone group pages whose name contains one of these are dropped.
    pub content_indicators: Vec<String>,
    pub min_name_length: usize,
    pub max_name_length: usize,
    pub group_cache_ttl_secs: u64,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            index_segment: "index".to_string(),
            generic_titles: to_strings(&["index", "home", "start"]),
            max_subpage_entries: 50,
            excluded_names: to_strings(&[
                "index",
                "start",
                "main",
                "home",
                "presse",
                "press",
                "news",
                "dance_competition",
                "dance_competitions",
                "event",
                "events",
            ]),
            content_indicators: to_strings(&[
                "competition",
                "event",
                "news",
                "press",
                "announcement",
            ]),
            min_name_length: 2,
            max_name_length: 30,
            group_cache_ttl_secs: 300,
        }
    }
}

impl HierarchyConfig {
    pub fn is_generic_title(&self, title: &str) -> bool {
        let normalized = title.trim().to_lowercase();
        self.generic_titles
            .iter()
            .any(|generic| generic.to_lowercase() == normalized)
    }

    fn accepts_group_page(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        if self
            .excluded_names
            .iter()
            .any(|excluded| excluded.to_lowercase() == lowered)
        {
            return false;
        }
        if self
            .content_indicators
            .iter()
            .any(|indicator| lowered.contains(&indicator.to_lowercase()))
        {
            return false;
        }
        let length = name.chars().count();
        length >= self.min_name_length && length <= self.max_name_length
    }
}

pub fn namespace_of(id: &str) -> String {
    match id.rsplit_once(DELIMITER) {
        Some((namespace, _)) => namespace.to_string(),
        None => ROOT_NAMESPACE.to_string(),
    }
}

pub fn depth_of(id: &str) -> usize {
    id.matches(DELIMITER).count()
}

pub fn last_segment(id: &str) -> &str {
    id.rsplit_once(DELIMITER)
        .map(|(_, segment)| segment)
        .unwrap_or(id)
}

/// `dance_competition-results` → `Dance competition results`.
pub fn humanize(segment: &str) -> String {
    let spaced = segment.replace(['_', '-'], " ");
    let trimmed = spaced.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn join_id(namespace: &str, segment: &str) -> String {
    if namespace.is_empty() {
        segment.to_string()
    } else {
        format!("{namespace}{DELIMITER}{segment}")
    }
}

/// Namespace whose children are listed for `page_id`. Index pages list their siblings.
pub fn subpage_base<'a>(page_id: &'a str, index_segment: &str) -> &'a str {
    if page_id == index_segment {
        return "";
    }
    page_id
        .strip_suffix(index_segment)
        .and_then(|rest| rest.strip_suffix(DELIMITER))
        .unwrap_or(page_id)
}

fn relative_to<'a>(base: &str, id: &'a str) -> Option<&'a str> {
    let relative = if base.is_empty() {
        id
    } else {
        id.strip_prefix(base)?.strip_prefix(DELIMITER)?
    };
    (!relative.is_empty()).then_some(relative)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Folder,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubpageEntry {
    pub id: String,
    pub title: String,
    pub href: String,
    pub kind: EntryKind,
    pub last_modified: Option<i64>,
    pub size_bytes: Option<i64>,
    pub children: Vec<SubpageEntry>,
}

impl SubpageEntry {
    fn page(summary: &PageSummary, routes: &RouteConfig) -> Self {
        Self {
            id: summary.id.clone(),
            title: summary.title.clone(),
            href: routes.page_href(&summary.id),
            kind: EntryKind::Page,
            last_modified: Some(summary.last_modified),
            size_bytes: summary.size_bytes,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Subpages {
    Listed { entries: Vec<SubpageEntry> },
    /// Too many descendants to render; carries the true count only.
    Hidden { count: usize },
}

/// Build the two-level subpage tree shown under `page_id`.
///
/// `pages` may contain anything; only ids one or two levels below the base
/// namespace are considered.
pub fn derive_subpages(
    page_id: &str,
    pages: &[PageSummary],
    config: &HierarchyConfig,
    routes: &RouteConfig,
) -> Subpages {
    let base = subpage_base(page_id, &config.index_segment);
    let base_index = join_id(base, &config.index_segment);

    let mut level_one: BTreeMap<&str, &PageSummary> = BTreeMap::new();
    let mut level_two: BTreeMap<&str, Vec<&PageSummary>> = BTreeMap::new();
    let mut count = 0usize;

    for summary in pages {
        if summary.id == page_id || summary.id == base_index {
            continue;
        }
        let Some(relative) = relative_to(base, &summary.id) else {
            continue;
        };
        let segments: Vec<&str> = relative.split(DELIMITER).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        match segments.as_slice() {
            [first] => {
                level_one.insert(*first, summary);
            }
            [first, _] => {
                level_two.entry(*first).or_default().push(summary);
            }
            _ => continue,
        }
        count += 1;
    }

    if count > config.max_subpage_entries {
        return Subpages::Hidden { count };
    }

    let mut entries = Vec::with_capacity(level_one.len() + level_two.len());
    for (segment, summary) in &level_one {
        if !level_two.contains_key(segment) {
            entries.push(SubpageEntry::page(summary, routes));
        }
    }

    for (segment, descendants) in &level_two {
        let folder_id = join_id(base, segment);
        let index_id = join_id(&folder_id, &config.index_segment);
        let index_page = descendants.iter().copied().find(|page| page.id == index_id);
        let matched = level_one.get(segment).copied();

        let title = index_page
            .map(|page| page.title.trim())
            .filter(|title| !title.is_empty() && !config.is_generic_title(title))
            .map(str::to_string)
            .unwrap_or_else(|| humanize(segment));
        let href = routes.page_href(
            index_page
                .or(matched)
                .map(|page| page.id.as_str())
                .unwrap_or(folder_id.as_str()),
        );

        let mut children: Vec<SubpageEntry> = descendants
            .iter()
            .filter(|page| page.id != index_id)
            .map(|page| SubpageEntry::page(page, routes))
            .collect();
        sort_entries(&mut children);

        entries.push(SubpageEntry {
            id: folder_id,
            title,
            href,
            kind: EntryKind::Folder,
            last_modified: matched.or(index_page).map(|page| page.last_modified),
            size_bytes: None,
            children,
        });
    }

    sort_entries(&mut entries);
    Subpages::Listed { entries }
}

fn sort_entries(entries: &mut [SubpageEntry]) {
    entries.sort_by_cached_key(|entry| (entry.kind != EntryKind::Folder, entry.title.to_lowercase()));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Namespace,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEntry {
    pub name: String,
    pub display_name: String,
    pub href: String,
    pub kind: GroupKind,
}

/// Extract group entries (for example teams) from the ids under `prefix`.
///
/// Second-level segments with deeper descendants become namespaces. Exactly
/// second-level pages are kept only when they pass the configured filters.
pub fn derive_group_hierarchy<S: AsRef<str>>(
    prefix: &str,
    page_ids: &[S],
    config: &HierarchyConfig,
    routes: &RouteConfig,
) -> Vec<GroupEntry> {
    let mut namespaces = BTreeSet::new();
    let mut standalone = BTreeSet::new();

    for id in page_ids {
        let Some(relative) = relative_to(prefix, id.as_ref()) else {
            continue;
        };
        match relative.split_once(DELIMITER) {
            Some((name, _)) if !name.is_empty() => {
                namespaces.insert(name);
            }
            None => {
                standalone.insert(relative);
            }
            _ => {}
        }
    }

    let mut entries: Vec<GroupEntry> = namespaces
        .iter()
        .map(|name| group_entry(prefix, name, GroupKind::Namespace, routes))
        .collect();
    entries.extend(
        standalone
            .iter()
            .filter(|name| !namespaces.contains(*name) && config.accepts_group_page(name))
            .map(|name| group_entry(prefix, name, GroupKind::Page, routes)),
    );

    entries.sort_by_cached_key(|entry| (entry.kind, entry.display_name.to_lowercase()));
    entries
}

fn group_entry(prefix: &str, name: &str, kind: GroupKind, routes: &RouteConfig) -> GroupEntry {
    GroupEntry {
        name: name.to_string(),
        display_name: humanize(name),
        href: routes.page_href(&join_id(prefix, name)),
        kind,
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
