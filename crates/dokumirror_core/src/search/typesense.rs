use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{Value, json};

use super::{SearchBackend, SearchDocument, SearchHit};
use crate::config::{MirrorConfig, lookup_parsed, lookup_trimmed};
use crate::error::IndexError;

const BACKEND: &str = "typesense";
const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8108;
pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_COLLECTION: &str = "wiki_pages";
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

#[derive(Clone)]
pub struct TypesenseConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub collection: String,
    pub timeout_ms: u64,
}

impl fmt::Debug for TypesenseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypesenseConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("collection", &self.collection)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl TypesenseConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    pub fn from_config_with_lookup<F>(config: &MirrorConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let search = &config.search;
        Self {
            protocol: lookup_trimmed(&lookup, "TYPESENSE_PROTOCOL")
                .or_else(|| search.protocol.clone())
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            host: lookup_trimmed(&lookup, "TYPESENSE_HOST")
                .or_else(|| search.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: lookup_parsed(&lookup, "TYPESENSE_PORT")
                .or(search.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: lookup_trimmed(&lookup, "TYPESENSE_API_KEY"),
            collection: lookup_trimmed(&lookup, "TYPESENSE_COLLECTION_NAME")
                .or_else(|| search.collection.clone())
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            timeout_ms: search.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Typesense collection accessed over its REST API.
pub struct TypesenseBackend {
    client: Client,
    config: TypesenseConfig,
    base: Url,
}

impl TypesenseBackend {
    pub fn new(config: TypesenseConfig) -> Result<Self> {
        let base_url = config.base_url();
        let base = Url::parse(&base_url)
            .with_context(|| format!("invalid Typesense URL: {base_url}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Typesense URL cannot carry a path: {base_url}");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Typesense HTTP client")?;
        Ok(Self {
            client,
            config,
            base,
        })
    }

    pub fn config(&self) -> &TypesenseConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, IndexError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| IndexError::InvalidResponse {
                backend: BACKEND,
                details: format!("cannot build path on {}", self.base),
            })?
            .clear()
            .extend(segments);
        Ok(url)
    }

    fn collection_endpoint(&self, rest: &[&str]) -> Result<Url, IndexError> {
        let mut segments = vec!["collections", self.config.collection.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IndexError> {
        let request = match &self.config.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        };
        request.send().map_err(|error| IndexError::Unavailable {
            backend: BACKEND,
            reason: error.to_string(),
        })
    }

    fn read_json(response: Response) -> Result<Value, IndexError> {
        response.json().map_err(|error| IndexError::InvalidResponse {
            backend: BACKEND,
            details: format!("failed to decode JSON: {error}"),
        })
    }
}

impl SearchBackend for TypesenseBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn ensure_collection(&self) -> Result<(), IndexError> {
        let response = self.send(self.client.get(self.collection_endpoint(&[])?))?;
        match response.status() {
            StatusCode::OK => return Ok(()),
            StatusCode::NOT_FOUND => {}
            _ => return Err(status_error(response)),
        }

        let response = self.send(
            self.client
                .post(self.endpoint(&["collections"])?)
                .json(&collection_schema(&self.config.collection)),
        )?;
        // 409: created concurrently by another writer.
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(status_error(response))
    }

    fn upsert(&self, document: &SearchDocument) -> Result<(), IndexError> {
        let response = self.send(
            self.client
                .post(self.collection_endpoint(&["documents"])?)
                .query(&[("action", "upsert")])
                .json(document),
        )?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(status_error(response))
    }

    fn delete(&self, id: &str) -> Result<(), IndexError> {
        let response = self.send(self.client.delete(self.collection_endpoint(&["documents", id])?))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error(response))
    }

    fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let per_page = limit.max(1).to_string();
        let response = self.send(
            self.client
                .get(self.collection_endpoint(&["documents", "search"])?)
                .query(&[
                    ("q", text),
                    ("query_by", "title,content"),
                    ("sort_by", "_text_match:desc,last_modified:desc"),
                    ("include_fields", "id"),
                    ("per_page", per_page.as_str()),
                ]),
        )?;
        if !response.status().is_success() {
            return Err(status_error(response));
        }
        parse_search_hits(&Self::read_json(response)?)
    }
}

fn collection_schema(name: &str) -> Value {
    json!({
        "name": name,
        "fields": [
            { "name": "title", "type": "string" },
            { "name": "content", "type": "string" },
            { "name": "namespace", "type": "string", "facet": true },
            { "name": "last_modified", "type": "int64" },
            { "name": "url", "type": "string", "index": false, "optional": true }
        ],
        "default_sorting_field": "last_modified"
    })
}

fn parse_search_hits(payload: &Value) -> Result<Vec<SearchHit>, IndexError> {
    let hits = payload
        .get("hits")
        .and_then(Value::as_array)
        .ok_or_else(|| IndexError::InvalidResponse {
            backend: BACKEND,
            details: "search response has no hits array".to_string(),
        })?;

    Ok(hits
        .iter()
        .filter_map(|hit| {
            let id = hit.pointer("/document/id").and_then(Value::as_str)?;
            let score = hit
                .get("text_match")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            Some(SearchHit {
                id: id.to_string(),
                score,
            })
        })
        .collect())
}

fn status_error(response: Response) -> IndexError {
    let status = response.status();
    let details = response
        .text()
        .ok()
        .map(|body| body.trim().to_string())
        .filter(|body| !body.is_empty())
        .unwrap_or_else(|| status.to_string());
    if status.is_server_error() {
        return IndexError::Unavailable {
            backend: BACKEND,
            reason: format!("HTTP {status}: {details}"),
        };
    }
    IndexError::Rejected {
        backend: BACKEND,
        status: status.as_u16(),
        details,
    }
}
