use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hierarchy::HierarchyConfig;
use crate::transform::RouteConfig;

pub const DEFAULT_USER_AGENT: &str = "dokumirror/0.1";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub routes: RouteConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
}

/// `[remote]`: the DokuWiki instance being mirrored. Credentials come from env only.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub url: Option<String>,
    pub jsonrpc_endpoint: Option<String>,
    pub username: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub html_methods: Vec<String>,
    pub render_fallback_method: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackendKind {
    #[default]
    Typesense,
    Sqlite,
}

impl SearchBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Typesense => "typesense",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SearchSection {
    pub backend: Option<SearchBackendKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub collection: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub batch_size: Option<usize>,
    pub batch_pause_ms: Option<u64>,
    pub list_depth: Option<u32>,
    pub excerpt_length: Option<usize>,
    /// Seconds subtracted from the last-sync timestamp when asking for changes.
    pub since_skew_secs: Option<i64>,
}

impl MirrorConfig {
    pub fn search_backend(&self) -> SearchBackendKind {
        self.search.backend.unwrap_or_default()
    }

    pub fn user_agent(&self) -> String {
        self.remote
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Read an environment-style value through `lookup`, ignoring blank values.
pub(crate) fn lookup_trimmed<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn lookup_parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup_trimmed(lookup, key).and_then(|value| value.parse::<T>().ok())
}
