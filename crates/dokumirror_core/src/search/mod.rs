use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{MirrorConfig, SearchBackendKind};
use crate::error::IndexError;
use crate::page::Page;
use crate::store::PageStore;
use crate::transform::{ELLIPSIS, RouteConfig};

pub mod sqlite_fts;
pub mod typesense;

pub use sqlite_fts::SqliteFtsBackend;
pub use typesense::{TypesenseBackend, TypesenseConfig};

pub const DEFAULT_QUERY_LIMIT: usize = 10;
pub const MAX_QUERY_LIMIT: usize = 50;
pub const DEFAULT_SUGGEST_LIMIT: usize = 5;
pub const MAX_SUGGEST_LIMIT: usize = 20;
pub const MIN_SUGGEST_CHARS: usize = 2;

const MIN_TOKEN_CHARS: usize = 2;
const HIGHLIGHT_CONTEXT_CHARS: usize = 80;
const FULL_MATCH_RATIO: f64 = 0.8;
const PARTIAL_MATCH_RATIO: f64 = 0.4;

/// Projection of a page sent to the search backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub namespace: String,
    pub last_modified: i64,
    pub url: String,
}

/// One backend match. `score` is informational; the hit order is authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

/// Full-text engine holding [`SearchDocument`]s.
pub trait SearchBackend {
    fn name(&self) -> &'static str;
    /// Create the collection or table if it does not exist yet.
    fn ensure_collection(&self) -> Result<(), IndexError>;
    fn upsert(&self, document: &SearchDocument) -> Result<(), IndexError>;
    /// Deleting an unknown id succeeds.
    fn delete(&self, id: &str) -> Result<(), IndexError>;
    /// Hits ordered by relevance, best first; equal relevance ordered by
    /// `last_modified` descending.
    fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub items: Vec<ItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl IndexReport {
    fn record(&mut self, id: &str, result: Result<(), IndexError>) {
        let error = match result {
            Ok(()) => {
                self.succeeded += 1;
                None
            }
            Err(error) => {
                self.failed += 1;
                Some(error.to_string())
            }
        };
        self.items.push(ItemOutcome {
            id: id.to_string(),
            error,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLevel {
    Full,
    Partial,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Highlight {
    pub title_highlighted: String,
    pub content_excerpt_highlighted: String,
    pub match_level: MatchLevel,
    pub matched_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub id: String,
    pub title: String,
    pub namespace: String,
    pub url: String,
}

/// Search facade over a backend, resolving hits against the page store.
pub struct SearchIndex<B> {
    backend: B,
    store: Arc<PageStore>,
    routes: RouteConfig,
}

impl<B: SearchBackend> SearchIndex<B> {
    pub fn new(backend: B, store: Arc<PageStore>, routes: RouteConfig) -> Self {
        Self {
            backend,
            store,
            routes,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn ensure_ready(&self) -> Result<(), IndexError> {
        self.backend.ensure_collection()
    }

    /// `raw_content` is stored already stripped of markup.
    pub fn document_for(&self, page: &Page) -> SearchDocument {
        SearchDocument {
            id: page.id.clone(),
            title: page.title.clone(),
            content: page.raw_content.clone(),
            namespace: page.namespace(),
            last_modified: page.last_modified,
            url: self.routes.page_href(&page.id),
        }
    }

    pub fn index_page(&self, page: &Page) -> Result<(), IndexError> {
        self.backend.upsert(&self.document_for(page))
    }

    /// Index every page; a failing item is recorded and the rest continue.
    pub fn reindex(&self, pages: &[Page]) -> IndexReport {
        let mut report = IndexReport::default();
        for page in pages {
            let result = self.index_page(page);
            if let Err(error) = &result {
                warn!(page_id = %page.id, backend = self.backend.name(), %error, "failed to index page");
            }
            report.record(&page.id, result);
        }
        debug!(
            succeeded = report.succeeded,
            failed = report.failed,
            "reindex batch finished"
        );
        report
    }

    /// Rebuild the index from everything in the store.
    pub fn reindex_all(&self) -> Result<IndexReport> {
        self.backend.ensure_collection().with_context(|| {
            format!("failed to prepare {} collection", self.backend.name())
        })?;
        let pages = self.store.all_pages()?;
        Ok(self.reindex(&pages))
    }

    pub fn remove<S: AsRef<str>>(&self, ids: &[S]) -> IndexReport {
        let mut report = IndexReport::default();
        for id in ids {
            let id = id.as_ref();
            let result = self.backend.delete(id);
            if let Err(error) = &result {
                warn!(page_id = %id, backend = self.backend.name(), %error, "failed to remove page from index");
            }
            report.record(id, result);
        }
        report
    }

    /// Pages matching `text` in backend order. A backend failure yields no results.
    pub fn query(&self, text: &str, limit: usize) -> Result<Vec<Page>> {
        let text = text.trim();
        if text.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_QUERY_LIMIT);

        let hits = match self.backend.search(text, limit) {
            Ok(hits) => hits,
            Err(error) => {
                warn!(backend = self.backend.name(), query = %text, %error, "search degraded to empty result");
                return Ok(Vec::new());
            }
        };

        let mut pages = Vec::with_capacity(hits.len());
        for hit in hits.into_iter().take(limit) {
            match self.store.find_by_id(&hit.id)? {
                Some(page) => pages.push(page),
                None => debug!(page_id = %hit.id, "search hit missing from store"),
            }
        }
        Ok(pages)
    }

    pub fn suggest(&self, text: &str, limit: usize) -> Result<Vec<Suggestion>> {
        if text.trim().chars().count() < MIN_SUGGEST_CHARS {
            return Ok(Vec::new());
        }
        let pages = self.query(text, limit.min(MAX_SUGGEST_LIMIT))?;
        Ok(pages
            .into_iter()
            .map(|page| Suggestion {
                url: self.routes.page_href(&page.id),
                namespace: page.namespace(),
                id: page.id,
                title: page.title,
            })
            .collect())
    }

    /// Mark every query token in the page title and around the first content match.
    pub fn highlight(&self, page: &Page, query: &str) -> Highlight {
        let tokens = query_tokens(query);
        let content = page.raw_content.as_str();
        let Some(pattern) = token_pattern(&tokens) else {
            return Highlight {
                title_highlighted: page.title.clone(),
                content_excerpt_highlighted: page.excerpt.clone(),
                match_level: MatchLevel::None,
                matched_tokens: 0,
                total_tokens: tokens.len(),
            };
        };

        let haystack = format!("{} {}", page.title, content).to_lowercase();
        let matched_tokens = tokens
            .iter()
            .filter(|token| haystack.contains(token.as_str()))
            .count();
        let ratio = matched_tokens as f64 / tokens.len() as f64;
        let match_level = if ratio >= FULL_MATCH_RATIO {
            MatchLevel::Full
        } else if ratio >= PARTIAL_MATCH_RATIO {
            MatchLevel::Partial
        } else {
            MatchLevel::None
        };

        let excerpt = match pattern.find(content) {
            Some(found) => context_window(content, found.start(), found.end()),
            None => page.excerpt.clone(),
        };

        Highlight {
            title_highlighted: mark(&pattern, &page.title),
            content_excerpt_highlighted: mark(&pattern, &excerpt),
            match_level,
            matched_tokens,
            total_tokens: tokens.len(),
        }
    }
}

/// Lowercased, deduplicated tokens of at least two chars, longest first.
fn query_tokens(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in query.split_whitespace() {
        let token = token.to_lowercase();
        if token.chars().count() >= MIN_TOKEN_CHARS && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens.sort_by_key(|token| std::cmp::Reverse(token.chars().count()));
    tokens
}

fn token_pattern(tokens: &[String]) -> Option<Regex> {
    if tokens.is_empty() {
        return None;
    }
    let alternation = tokens
        .iter()
        .map(|token| regex::escape(token))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?i){alternation}")).ok()
}

fn mark(pattern: &Regex, text: &str) -> String {
    pattern.replace_all(text, "<mark>$0</mark>").into_owned()
}

fn context_window(content: &str, start: usize, end: usize) -> String {
    let window_start = content[..start]
        .char_indices()
        .rev()
        .nth(HIGHLIGHT_CONTEXT_CHARS - 1)
        .map_or(0, |(index, _)| index);
    let window_end = content[end..]
        .char_indices()
        .nth(HIGHLIGHT_CONTEXT_CHARS)
        .map_or(content.len(), |(index, _)| end + index);

    let mut window = String::new();
    if window_start > 0 {
        window.push_str(ELLIPSIS);
    }
    window.push_str(content[window_start..window_end].trim());
    if window_end < content.len() {
        window.push_str(ELLIPSIS);
    }
    window
}

/// Backend chosen at runtime from `[search].backend`.
pub enum ConfiguredBackend {
    Typesense(TypesenseBackend),
    Sqlite(SqliteFtsBackend),
}

impl ConfiguredBackend {
    pub fn from_config(config: &MirrorConfig, search_db_path: &Path) -> Result<Self> {
        match config.search_backend() {
            SearchBackendKind::Typesense => {
                let settings = TypesenseConfig::from_config(config);
                Ok(Self::Typesense(TypesenseBackend::new(settings)?))
            }
            SearchBackendKind::Sqlite => Ok(Self::Sqlite(SqliteFtsBackend::open(search_db_path)?)),
        }
    }

    fn inner(&self) -> &dyn SearchBackend {
        match self {
            Self::Typesense(backend) => backend,
            Self::Sqlite(backend) => backend,
        }
    }
}

impl SearchBackend for ConfiguredBackend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn ensure_collection(&self) -> Result<(), IndexError> {
        self.inner().ensure_collection()
    }

    fn upsert(&self, document: &SearchDocument) -> Result<(), IndexError> {
        self.inner().upsert(document)
    }

    fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.inner().delete(id)
    }

    fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.inner().search(text, limit)
    }
}
