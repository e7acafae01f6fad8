use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::{SearchBackend, SearchDocument, SearchHit};
use crate::error::IndexError;
use crate::store::{ensure_db_parent, open_connection};

const BACKEND: &str = "sqlite";

/// Local FTS5 index, used when no Typesense server is available.
pub struct SqliteFtsBackend {
    connection: Mutex<Connection>,
}

impl SqliteFtsBackend {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_db_parent(path)?;
        Self::from_connection(open_connection(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(
            Connection::open_in_memory().context("failed to open in-memory sqlite")?,
        )
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        let backend = Self {
            connection: Mutex::new(connection),
        };
        backend
            .ensure_collection()
            .context("failed to create search_documents table")?;
        Ok(backend)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, IndexError> {
        self.connection.lock().map_err(|_| IndexError::Unavailable {
            backend: BACKEND,
            reason: "search connection lock poisoned".to_string(),
        })
    }
}

fn unavailable(error: rusqlite::Error) -> IndexError {
    IndexError::Unavailable {
        backend: BACKEND,
        reason: error.to_string(),
    }
}

/// Quote every word as an FTS5 prefix term so user punctuation is never parsed as syntax.
fn match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}\"*", word.to_lowercase()))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

impl SearchBackend for SqliteFtsBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn ensure_collection(&self) -> Result<(), IndexError> {
        self.lock()?
            .execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS search_documents USING fts5(
                    id UNINDEXED,
                    title,
                    content,
                    namespace UNINDEXED,
                    last_modified UNINDEXED,
                    url UNINDEXED
                );",
            )
            .map_err(unavailable)
    }

    fn upsert(&self, document: &SearchDocument) -> Result<(), IndexError> {
        let mut connection = self.lock()?;
        let transaction = connection.transaction().map_err(unavailable)?;
        transaction
            .execute("DELETE FROM search_documents WHERE id = ?1", [&document.id])
            .map_err(unavailable)?;
        transaction
            .execute(
                "INSERT INTO search_documents (id, title, content, namespace, last_modified, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    document.id,
                    document.title,
                    document.content,
                    document.namespace,
                    document.last_modified,
                    document.url,
                ],
            )
            .map_err(unavailable)?;
        transaction.commit().map_err(unavailable)
    }

    fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.lock()?
            .execute("DELETE FROM search_documents WHERE id = ?1", [id])
            .map_err(unavailable)?;
        Ok(())
    }

    fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let Some(expression) = match_expression(text) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let connection = self.lock()?;
        // Column weights follow declaration order; only title and content are ranked.
        let mut statement = connection
            .prepare(
                "SELECT id, bm25(search_documents, 0.0, 10.0, 1.0, 0.0, 0.0, 0.0) AS rank
                 FROM search_documents
                 WHERE search_documents MATCH ?1
                 ORDER BY rank ASC, CAST(last_modified AS INTEGER) DESC
                 LIMIT ?2",
            )
            .map_err(unavailable)?;
        let rows = statement
            .query_map(params![expression, limit], |row| {
                let rank: f64 = row.get(1)?;
                Ok(SearchHit {
                    id: row.get(0)?,
                    score: -rank,
                })
            })
            .map_err(unavailable)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(id: &str, title: &str, content: &str, last_modified: i64) -> SearchDocument {
        SearchDocument {
            id: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            namespace: crate::hierarchy::namespace_of(id),
            last_modified,
            url: format!("/wiki/{id}"),
        }
    }

    fn ids(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|hit| hit.id.as_str()).collect()
    }

    #[test]
    fn title_matches_outrank_content_matches() {
        let backend = SqliteFtsBackend::open_in_memory().expect("backend");
        backend
            .upsert(&document("docs:intro", "Getting started", "see the vpn guide", 1))
            .expect("upsert");
        backend
            .upsert(&document("team:it:vpn", "VPN access", "how to connect", 2))
            .expect("upsert");

        let hits = backend.search("vpn", 10).expect("search");
        assert_eq!(ids(&hits), vec!["team:it:vpn", "docs:intro"]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let backend = SqliteFtsBackend::open_in_memory().expect("backend");
        backend
            .upsert(&document("start", "Welcome", "old words", 1))
            .expect("first");
        backend
            .upsert(&document("start", "Welcome", "fresh words", 2))
            .expect("second");
        assert!(backend.search("old", 10).expect("search").is_empty());
        assert_eq!(ids(&backend.search("fresh", 10).expect("search")), vec!["start"]);

        backend.delete("start").expect("delete");
        backend.delete("never-indexed").expect("delete unknown");
        assert!(backend.search("fresh", 10).expect("search").is_empty());
    }

    #[test]
    fn prefix_terms_and_punctuation_are_safe() {
        let backend = SqliteFtsBackend::open_in_memory().expect("backend");
        backend
            .upsert(&document("dev:cpp", "C++ handbook", "templates and concepts", 1))
            .expect("upsert");
        assert_eq!(ids(&backend.search("templ", 10).expect("prefix")), vec!["dev:cpp"]);
        assert_eq!(ids(&backend.search("\"c++\" AND (", 10).expect("punctuation")), vec!["dev:cpp"]);
        assert!(backend.search("  ++ ", 10).expect("no terms").is_empty());
    }

    #[test]
    fn match_expression_quotes_words() {
        assert_eq!(
            match_expression("Team-IT policy").as_deref(),
            Some("\"team\"* OR \"it\"* OR \"policy\"*")
        );
        assert_eq!(match_expression("!?"), None);
    }
}
