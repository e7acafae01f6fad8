use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{MirrorConfig, lookup_parsed, lookup_trimmed};
use crate::error::RemoteError;
use crate::page::PageMeta;

pub const DEFAULT_JSONRPC_ENDPOINT: &str = "/lib/exe/jsonrpc.php";
pub const DEFAULT_HTML_METHODS: [&str; 3] =
    ["core.getPageHTML", "wiki.getPageHTML", "core.renderPage"];
pub const DEFAULT_RENDER_FALLBACK_METHOD: &str = "core.getPageHTML";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// DokuWiki: "The requested page does not exist".
const PAGE_NOT_FOUND_CODE: i64 = 121;
/// DokuWiki: "There are no changes in the specified timeframe".
const NO_CHANGES_CODE: i64 = 321;
const INVALID_PAYLOAD_CODE: i64 = -32600;
const PARSE_ERROR_CODE: i64 = -32700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageListing {
    pub id: String,
    pub size_bytes: Option<i64>,
    pub last_modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChange {
    pub id: String,
    pub last_modified: Option<i64>,
    pub revision: Option<i64>,
}

/// Read-only surface of the remote wiki used by the sync pipeline.
pub trait RemoteSource {
    fn get_page_meta(&mut self, id: &str) -> Result<PageMeta, RemoteError>;
    fn get_raw_content(&mut self, id: &str) -> Result<String, RemoteError>;
    fn get_rendered_html(&mut self, id: &str) -> Result<String, RemoteError>;
    fn list_all_page_ids(&mut self, max_depth: u32) -> Result<Vec<PageListing>, RemoteError>;
    fn list_page_ids_under(
        &mut self,
        namespace: &str,
        max_depth: u32,
    ) -> Result<Vec<PageListing>, RemoteError>;
    fn list_changed_since(&mut self, timestamp: i64) -> Result<Vec<PageChange>, RemoteError>;
    fn request_count(&self) -> usize;
}

#[derive(Clone)]
pub struct DokuWikiClientConfig {
    pub base_url: String,
    pub jsonrpc_endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Tried in order by `get_rendered_html`; the first non-empty answer wins.
    pub html_methods: Vec<String>,
    pub render_fallback_method: String,
}

impl fmt::Debug for DokuWikiClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DokuWikiClientConfig")
            .field("base_url", &self.base_url)
            .field("jsonrpc_endpoint", &self.jsonrpc_endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("timeout_ms", &self.timeout_ms)
            .field("html_methods", &self.html_methods)
            .field("render_fallback_method", &self.render_fallback_method)
            .finish()
    }
}

impl DokuWikiClientConfig {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    /// Env > config > default. The password is only read from env.
    pub fn from_config_with_lookup<F>(config: &MirrorConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote = &config.remote;
        let html_methods = if remote.html_methods.is_empty() {
            DEFAULT_HTML_METHODS
                .iter()
                .map(|method| (*method).to_string())
                .collect()
        } else {
            remote.html_methods.clone()
        };
        Self {
            base_url: lookup_trimmed(&lookup, "DOKUWIKI_URI")
                .or_else(|| remote.url.clone())
                .unwrap_or_default(),
            jsonrpc_endpoint: lookup_trimmed(&lookup, "DOKUWIKI_JSONRPC_ENDPOINT")
                .or_else(|| remote.jsonrpc_endpoint.clone())
                .unwrap_or_else(|| DEFAULT_JSONRPC_ENDPOINT.to_string()),
            username: lookup_trimmed(&lookup, "DOKUWIKI_USERNAME").or_else(|| remote.username.clone()),
            password: lookup_trimmed(&lookup, "DOKUWIKI_PASSWORD"),
            user_agent: config.user_agent(),
            timeout_ms: lookup_parsed(&lookup, "DOKUWIKI_TIMEOUT_MS")
                .or(remote.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            html_methods,
            render_fallback_method: remote
                .render_fallback_method
                .clone()
                .unwrap_or_else(|| DEFAULT_RENDER_FALLBACK_METHOD.to_string()),
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.jsonrpc_endpoint.trim_start_matches('/')
        )
    }
}

/// JSON-RPC client for the DokuWiki remote API.
pub struct DokuWikiClient {
    client: Client,
    config: DokuWikiClientConfig,
    endpoint: Url,
    request_count: usize,
}

impl DokuWikiClient {
    pub fn new(config: DokuWikiClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            bail!("DokuWiki URL is not configured (set DOKUWIKI_URI or [remote].url)");
        }
        let endpoint_url = config.endpoint_url();
        let endpoint = Url::parse(&endpoint_url)
            .with_context(|| format!("invalid DokuWiki endpoint URL: {endpoint_url}"))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build DokuWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            endpoint,
            request_count: 0,
        })
    }

    pub fn config(&self) -> &DokuWikiClientConfig {
        &self.config
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value, RemoteError> {
        self.request_count += 1;
        debug!(method, request = self.request_count, "calling DokuWiki");
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_count,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }

        let response = request
            .send()
            .map_err(|error| RemoteError::unavailable(method, describe_transport_error(&error)))?;
        let status = response.status();
        if !status.is_success() {
            if is_retryable_status(status) {
                return Err(RemoteError::unavailable(method, format!("HTTP {status}")));
            }
            return Err(RemoteError::remote(
                method,
                i64::from(status.as_u16()),
                format!("HTTP {status}"),
            ));
        }

        let payload: Value = response.json().map_err(|error| {
            if error.is_timeout() {
                RemoteError::unavailable(method, describe_transport_error(&error))
            } else {
                RemoteError::remote(
                    method,
                    PARSE_ERROR_CODE,
                    format!("failed to decode JSON response: {error}"),
                )
            }
        })?;
        decode_rpc_payload(method, payload)
    }

    fn call_string(&mut self, method: &str, id: &str) -> Result<String, RemoteError> {
        let result = self.call(method, json!([id]))?;
        match result {
            Value::String(text) => Ok(text),
            Value::Null => Ok(String::new()),
            other => Err(unexpected_payload(method, &other)),
        }
    }
}

impl RemoteSource for DokuWikiClient {
    fn get_page_meta(&mut self, id: &str) -> Result<PageMeta, RemoteError> {
        let method = "core.getPageInfo";
        match self.call(method, json!([id])) {
            Ok(value) => parse_page_meta(method, id, value),
            Err(RemoteError::Remote { code, .. }) if code == PAGE_NOT_FOUND_CODE => {
                Err(RemoteError::NotFound(id.to_string()))
            }
            Err(error) => Err(error),
        }
    }

    fn get_raw_content(&mut self, id: &str) -> Result<String, RemoteError> {
        self.call_string("core.getPage", id)
    }

    fn get_rendered_html(&mut self, id: &str) -> Result<String, RemoteError> {
        let methods = self.config.html_methods.clone();
        for method in &methods {
            match self.call_string(method, id) {
                Ok(html) if !html.trim().is_empty() => return Ok(html),
                Ok(_) => debug!(method = %method, page_id = %id, "empty html, trying next method"),
                Err(error) => debug!(method = %method, page_id = %id, %error, "html method failed"),
            }
        }
        let fallback = self.config.render_fallback_method.clone();
        self.call_string(&fallback, id)
    }

    fn list_all_page_ids(&mut self, max_depth: u32) -> Result<Vec<PageListing>, RemoteError> {
        self.list_page_ids_under("", max_depth)
    }

    fn list_page_ids_under(
        &mut self,
        namespace: &str,
        max_depth: u32,
    ) -> Result<Vec<PageListing>, RemoteError> {
        let method = "core.listPages";
        let value = self.call(method, json!({ "namespace": namespace, "depth": max_depth }))?;
        parse_listing(method, value)
    }

    fn list_changed_since(&mut self, timestamp: i64) -> Result<Vec<PageChange>, RemoteError> {
        let method = "core.getRecentPageChanges";
        match self.call(method, json!([timestamp])) {
            Ok(value) => parse_changes(method, value),
            Err(RemoteError::Remote { code, .. }) if code == NO_CHANGES_CODE => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Unwrap a JSON-RPC envelope into its result, mapping error payloads.
fn decode_rpc_payload(method: &str, mut payload: Value) -> Result<Value, RemoteError> {
    if let Some(error) = payload.get("error")
        && let Some(error) = rpc_error(method, error)
    {
        return Err(error);
    }

    let result = match payload.get_mut("result") {
        Some(result) => result.take(),
        None => payload.get_mut("data").map(Value::take).unwrap_or(Value::Null),
    };

    // Older servers report failures inside the result object.
    if let Some(error) = result.get("error")
        && let Some(error) = rpc_error(method, error)
    {
        return Err(error);
    }
    Ok(result)
}

fn rpc_error(method: &str, error: &Value) -> Option<RemoteError> {
    if !error.is_object() {
        return None;
    }
    let code = error.get("code").and_then(value_as_i64).unwrap_or(-1);
    if code == 0 {
        return None;
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some(RemoteError::remote(method, code, message))
}

fn parse_page_meta(method: &str, id: &str, value: Value) -> Result<PageMeta, RemoteError> {
    let is_empty = match &value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if is_empty {
        return Err(RemoteError::NotFound(id.to_string()));
    }
    let info: PageInfoPayload = decode_value(method, value)?;
    let revision = info.revision.as_ref().or(info.version.as_ref()).and_then(value_as_i64);
    Ok(PageMeta {
        last_modified: info
            .last_modified
            .as_ref()
            .and_then(value_as_i64)
            .or(revision),
        revision,
        permission: info.permission.as_ref().or(info.perms.as_ref()).and_then(value_as_i64),
        size_bytes: info.size.as_ref().and_then(value_as_i64),
    })
}

fn parse_listing(method: &str, value: Value) -> Result<Vec<PageListing>, RemoteError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let items: Vec<ListingItem> = decode_value(method, value)?;
    Ok(items
        .into_iter()
        .filter(|item| !item.id.trim().is_empty())
        .map(|item| PageListing {
            id: item.id,
            size_bytes: item.size.as_ref().and_then(value_as_i64),
            last_modified: item.last_modified.as_ref().and_then(value_as_i64),
        })
        .collect())
}

fn parse_changes(method: &str, value: Value) -> Result<Vec<PageChange>, RemoteError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let items: Vec<ChangeItem> = decode_value(method, value)?;
    Ok(items
        .into_iter()
        .filter(|item| !item.id.trim().is_empty())
        .map(|item| {
            let revision = item.revision.as_ref().or(item.version.as_ref()).and_then(value_as_i64);
            PageChange {
                id: item.id,
                last_modified: item
                    .last_modified
                    .as_ref()
                    .and_then(value_as_i64)
                    .or(revision),
                revision,
            }
        })
        .collect())
}

fn decode_value<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, RemoteError> {
    serde_json::from_value(value).map_err(|error| {
        RemoteError::remote(
            method,
            INVALID_PAYLOAD_CODE,
            format!("unexpected payload shape: {error}"),
        )
    })
}

fn unexpected_payload(method: &str, value: &Value) -> RemoteError {
    let kind = match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(_) | Value::Null => "string",
    };
    RemoteError::remote(
        method,
        INVALID_PAYLOAD_CODE,
        format!("expected a string result, got {kind}"),
    )
}

/// Integers arrive as numbers or numeric strings depending on server version.
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn describe_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("request timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Deserialize, Default)]
struct PageInfoPayload {
    #[serde(default, rename = "lastModified", alias = "last_modified")]
    last_modified: Option<Value>,
    #[serde(default)]
    revision: Option<Value>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    permission: Option<Value>,
    #[serde(default)]
    perms: Option<Value>,
    #[serde(default)]
    size: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct ListingItem {
    #[serde(default, alias = "name")]
    id: String,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default, rename = "lastModified", alias = "mtime")]
    last_modified: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct ChangeItem {
    #[serde(default, alias = "name")]
    id: String,
    #[serde(default, rename = "lastModified")]
    last_modified: Option<Value>,
    #[serde(default)]
    revision: Option<Value>,
    #[serde(default)]
    version: Option<Value>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::RemoteSection;
    use crate::test_http::{CannedServer, RecordedRequest};

    fn client_for(server: &CannedServer) -> DokuWikiClient {
        let base_url = server.base_url();
        let config = DokuWikiClientConfig::from_config_with_lookup(&MirrorConfig::default(), |key| {
            (key == "DOKUWIKI_URI").then(|| base_url.clone())
        });
        DokuWikiClient::new(config).expect("client")
    }

    fn rpc_method(request: &RecordedRequest) -> String {
        let body: Value = serde_json::from_str(&request.body).expect("json-rpc body");
        body["method"].as_str().unwrap_or_default().to_string()
    }

    #[test]
    fn client_config_prefers_env_over_config() {
        let config = MirrorConfig {
            remote: RemoteSection {
                url: Some("https://config.example.org".to_string()),
                username: Some("config-user".to_string()),
                timeout_ms: Some(1_000),
                ..RemoteSection::default()
            },
            ..MirrorConfig::default()
        };
        let env = HashMap::from([
            ("DOKUWIKI_URI".to_string(), "https://env.example.org/".to_string()),
            ("DOKUWIKI_PASSWORD".to_string(), "secret".to_string()),
            ("DOKUWIKI_TIMEOUT_MS".to_string(), "2500".to_string()),
        ]);

        let resolved =
            DokuWikiClientConfig::from_config_with_lookup(&config, |key| env.get(key).cloned());
        assert_eq!(resolved.base_url, "https://env.example.org/");
        assert_eq!(resolved.username.as_deref(), Some("config-user"));
        assert_eq!(resolved.password.as_deref(), Some("secret"));
        assert_eq!(resolved.timeout_ms, 2_500);
        assert_eq!(
            resolved.endpoint_url(),
            "https://env.example.org/lib/exe/jsonrpc.php"
        );
        assert_eq!(resolved.html_methods, DEFAULT_HTML_METHODS.to_vec());
        assert!(!format!("{resolved:?}").contains("secret"));
    }

    #[test]
    fn client_requires_base_url() {
        let config = DokuWikiClientConfig::from_config_with_lookup(&MirrorConfig::default(), |_| None);
        let error = DokuWikiClient::new(config).err().expect("must fail");
        assert!(error.to_string().contains("DokuWiki URL is not configured"));
    }

    #[test]
    fn decode_returns_result_on_success() {
        let payload = json!({ "jsonrpc": "2.0", "id": 1, "result": "page text" });
        let value = decode_rpc_payload("core.getPage", payload).expect("decode");
        assert_eq!(value, json!("page text"));

        let legacy = json!({ "error": { "code": 0, "message": "success" }, "data": [1, 2] });
        assert_eq!(
            decode_rpc_payload("core.listPages", legacy).expect("decode"),
            json!([1, 2])
        );
    }

    #[test]
    fn decode_maps_error_payloads() {
        let payload = json!({
            "jsonrpc": "2.0",
            "error": { "code": 121, "message": "The requested page does not exist" }
        });
        match decode_rpc_payload("core.getPageInfo", payload) {
            Err(RemoteError::Remote { code, message, .. }) => {
                assert_eq!(code, 121);
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let nested = json!({ "result": { "error": { "message": "forbidden" } } });
        assert!(matches!(
            decode_rpc_payload("core.getPage", nested),
            Err(RemoteError::Remote { code: -1, .. })
        ));
    }

    #[test]
    fn page_meta_accepts_numeric_strings() {
        let meta = parse_page_meta(
            "core.getPageInfo",
            "start",
            json!({ "name": "start", "lastModified": "1700000000", "version": 1699999999, "size": 42, "perms": 8 }),
        )
        .expect("meta");
        assert_eq!(meta.last_modified, Some(1_700_000_000));
        assert_eq!(meta.revision, Some(1_699_999_999));
        assert_eq!(meta.size_bytes, Some(42));
        assert_eq!(meta.permission, Some(8));
    }

    #[test]
    fn empty_page_info_is_not_found() {
        assert!(matches!(
            parse_page_meta("core.getPageInfo", "gone", json!({})),
            Err(RemoteError::NotFound(id)) if id == "gone"
        ));
        assert!(matches!(
            parse_page_meta("core.getPageInfo", "gone", Value::Null),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn listing_and_changes_accept_legacy_field_names() {
        let listing = parse_listing(
            "core.listPages",
            json!([
                { "id": "team:it", "size": 100, "lastModified": 1700000000 },
                { "name": "start", "size": "12" },
                { "id": "" }
            ]),
        )
        .expect("listing");
        assert_eq!(
            listing,
            vec![
                PageListing {
                    id: "team:it".to_string(),
                    size_bytes: Some(100),
                    last_modified: Some(1_700_000_000),
                },
                PageListing {
                    id: "start".to_string(),
                    size_bytes: Some(12),
                    last_modified: None,
                },
            ]
        );

        let changes = parse_changes(
            "core.getRecentPageChanges",
            json!([{ "name": "team:hr", "version": 1700000500 }]),
        )
        .expect("changes");
        assert_eq!(changes[0].id, "team:hr");
        assert_eq!(changes[0].last_modified, Some(1_700_000_500));
    }

    #[test]
    fn malformed_listing_is_a_remote_error() {
        let error = parse_listing("core.listPages", json!({ "unexpected": true })).expect_err("must fail");
        assert!(matches!(error, RemoteError::Remote { code: INVALID_PAYLOAD_CODE, .. }));
    }

    #[test]
    fn retryable_status_is_unavailable_and_other_statuses_are_remote() {
        let server = CannedServer::start(vec![(503, "busy"), (429, ""), (403, "denied")]);
        let mut client = client_for(&server);

        assert!(matches!(
            client.get_raw_content("start"),
            Err(RemoteError::Unavailable { method, .. }) if method == "core.getPage"
        ));
        assert!(matches!(
            client.get_raw_content("start"),
            Err(RemoteError::Unavailable { .. })
        ));
        assert!(matches!(
            client.get_raw_content("start"),
            Err(RemoteError::Remote { code: 403, .. })
        ));
        assert_eq!(client.request_count(), 3);

        let requests = server.finish();
        assert!(requests.iter().all(|request| request.method == "POST"));
        assert_eq!(requests[0].target, "/lib/exe/jsonrpc.php");
        assert_eq!(rpc_method(&requests[0]), "core.getPage");
    }

    #[test]
    fn missing_page_info_maps_to_not_found() {
        let server = CannedServer::start(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":121,"message":"The requested page does not exist"}}"#,
        )]);
        let mut client = client_for(&server);

        assert!(matches!(
            client.get_page_meta("gone"),
            Err(RemoteError::NotFound(id)) if id == "gone"
        ));
        server.finish();
    }

    #[test]
    fn rendered_html_tries_methods_in_order() {
        let server = CannedServer::start(vec![
            (200, r#"{"jsonrpc":"2.0","id":1,"result":""}"#),
            (200, r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#),
            (200, r#"{"jsonrpc":"2.0","id":3,"result":"<p>hello</p>"}"#),
        ]);
        let mut client = client_for(&server);

        assert_eq!(client.get_rendered_html("start").expect("html"), "<p>hello</p>");

        let methods: Vec<String> = server.finish().iter().map(rpc_method).collect();
        assert_eq!(methods, DEFAULT_HTML_METHODS.to_vec());
    }

    #[test]
    fn render_fallback_runs_after_every_method_fails() {
        let server = CannedServer::start(vec![
            (500, ""),
            (200, r#"{"jsonrpc":"2.0","id":2,"result":null}"#),
            (200, r#"{"jsonrpc":"2.0","id":3,"result":"<h1>Start</h1>"}"#),
        ]);
        let mut client = client_for(&server);
        client.config.html_methods = vec!["core.getPageHTML".to_string(), "wiki.getPageHTML".to_string()];
        client.config.render_fallback_method = "core.renderPage".to_string();

        assert_eq!(client.get_rendered_html("start").expect("html"), "<h1>Start</h1>");

        let requests = server.finish();
        assert_eq!(rpc_method(&requests[2]), "core.renderPage");
        let params: Value = serde_json::from_str(&requests[2].body).expect("body");
        assert_eq!(params["params"], json!(["start"]));
    }
}
