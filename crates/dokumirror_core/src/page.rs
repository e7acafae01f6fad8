use serde::{Deserialize, Serialize};

use crate::hierarchy::{depth_of, namespace_of};

/// Latest synchronized snapshot of a remote page.
///
/// Namespace and depth are not fields: they are always derived from `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub raw_content: String,
    pub rendered_html: String,
    pub excerpt: String,
    pub table_of_contents: Vec<TocEntry>,
    pub last_modified: i64,
    pub revision: Option<i64>,
    pub permission: Option<i64>,
    pub size_bytes: Option<i64>,
}

impl Page {
    pub fn namespace(&self) -> String {
        namespace_of(&self.id)
    }

    pub fn depth(&self) -> usize {
        depth_of(&self.id)
    }

    pub fn summary(&self) -> PageSummary {
        PageSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            last_modified: self.last_modified,
            size_bytes: self.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub level: u8,
    pub title: String,
    pub anchor_id: String,
}

/// Page metadata as reported by the remote source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
    pub last_modified: Option<i64>,
    pub revision: Option<i64>,
    pub permission: Option<i64>,
    pub size_bytes: Option<i64>,
}

/// Lightweight projection used by hierarchy derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub id: String,
    pub title: String,
    pub last_modified: i64,
    pub size_bytes: Option<i64>,
}
