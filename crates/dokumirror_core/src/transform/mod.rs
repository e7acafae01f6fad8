mod links;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::TransformError;
use crate::hierarchy::{DELIMITER, humanize, last_segment};
use crate::page::{Page, PageMeta, TocEntry};
use links::LinkRewriter;

pub const ELLIPSIS: &str = "...";
pub const PLACEHOLDER_ANCHOR: &str = "heading";
pub const DEFAULT_EXCERPT_LENGTH: usize = 200;

/// DokuWiki headings use six `=` for level 1 down to two for level 5.
const TITLE_MARKER_WIDTHS: [usize; 2] = [6, 5];
const HEADING_MARKER_WIDTHS: [usize; 5] = [6, 5, 4, 3, 2];

/// Application routes that rewritten links and images point at.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouteConfig {
    pub page_prefix: String,
    pub media_route: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            page_prefix: "/wiki/".to_string(),
            media_route: "/wiki/fetch".to_string(),
        }
    }
}

impl RouteConfig {
    pub fn page_href(&self, id: &str) -> String {
        format!("{}{id}", self.page_prefix)
    }

    pub fn media_href(&self, media: &str, sizing: &[(String, String)]) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("media", media);
        for (key, value) in sizing {
            query.append_pair(key, value);
        }
        format!("{}?{}", self.media_route, query.finish())
    }
}

/// Normalizes fetched DokuWiki content into [`Page`] records.
///
/// All patterns are compiled once here; the methods are otherwise pure.
pub struct ContentTransformer {
    routes: RouteConfig,
    excerpt_length: usize,
    links: LinkRewriter,
    title_markers: Vec<Regex>,
    heading_markers: Vec<Regex>,
    wiki_link: Regex,
    embed: Regex,
    inline_format: Regex,
    italic: Regex,
    horizontal_rule: Regex,
    list_marker: Regex,
    tag: Regex,
    whitespace: Regex,
    heading_open: Regex,
    heading_close: Regex,
    numeric_entity: Regex,
}

impl ContentTransformer {
    pub fn new(routes: RouteConfig, excerpt_length: usize) -> Result<Self, regex::Error> {
        let title_markers = TITLE_MARKER_WIDTHS
            .iter()
            .map(|width| {
                Regex::new(&format!(
                    r"(?m)^[ \t]*={{{width}}}[ \t]*([^=\s].*?)[ \t]*={{{width}}}"
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let heading_markers = HEADING_MARKER_WIDTHS
            .iter()
            .map(|width| Regex::new(&format!(r"={{{width}}}[ \t]*(.+?)[ \t]*={{{width}}}")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            routes,
            excerpt_length,
            links: LinkRewriter::new()?,
            title_markers,
            heading_markers,
            wiki_link: Regex::new(r"\[\[([^\]|]*)(?:\|([^\]]*))?\]\]")?,
            embed: Regex::new(r"\{\{([^}|]*)(?:\|([^}]*))?\}\}")?,
            inline_format: Regex::new(r"\*\*|__|''")?,
            italic: Regex::new(r"(^|[^:])//")?,
            horizontal_rule: Regex::new(r"(?m)^[ \t]*-{4,}[ \t]*$")?,
            list_marker: Regex::new(r"(?m)^[ \t]*(?:[*-]|\d+\.)[ \t]+")?,
            tag: Regex::new(r"<[^>]*>")?,
            whitespace: Regex::new(r"\s+")?,
            heading_open: Regex::new(r"(?i)<h([1-6])(?:\s[^>]*)?>")?,
            heading_close: Regex::new(r"(?i)</h[1-6]\s*>")?,
            numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);")?,
        })
    }

    pub fn routes(&self) -> &RouteConfig {
        &self.routes
    }

    /// Assemble a page from the three remote payloads.
    ///
    /// Fails without side effects when either payload normalizes to nothing.
    pub fn build_page(
        &self,
        id: &str,
        meta: &PageMeta,
        raw: &str,
        html: &str,
        fetched_at: i64,
    ) -> Result<Page, TransformError> {
        validate_page_id(id)?;
        if raw.trim().is_empty() {
            return Err(TransformError::EmptyContent(id.to_string()));
        }
        if html.trim().is_empty() {
            return Err(TransformError::EmptyHtml(id.to_string()));
        }

        let raw_content = self.strip_markup(raw);
        if raw_content.is_empty() {
            return Err(TransformError::EmptyContent(id.to_string()));
        }
        let rendered_html = self.rewrite_links(html);

        Ok(Page {
            id: id.to_string(),
            title: self.extract_title(id, raw),
            excerpt: self.generate_excerpt(&raw_content, self.excerpt_length),
            table_of_contents: self.extract_table_of_contents(&rendered_html),
            raw_content,
            rendered_html,
            last_modified: meta.last_modified.unwrap_or(fetched_at),
            revision: meta.revision,
            permission: meta.permission,
            size_bytes: meta.size_bytes,
        })
    }

    pub fn extract_title(&self, id: &str, raw: &str) -> String {
        let raw = raw.replace("\r\n", "\n");
        for marker in &self.title_markers {
            if let Some(caps) = marker.captures(&raw) {
                let title = caps[1].trim();
                if !title.is_empty() {
                    return title.to_string();
                }
            }
        }
        humanize(last_segment(id))
    }

    pub fn strip_markup(&self, raw: &str) -> String {
        let mut text = raw.replace("\r\n", "\n");
        for marker in &self.heading_markers {
            text = marker.replace_all(&text, "${1}").into_owned();
        }
        text = self
            .embed
            .replace_all(&text, |caps: &Captures| {
                caps.get(2)
                    .map(|caption| caption.as_str().trim().to_string())
                    .unwrap_or_default()
            })
            .into_owned();
        text = self
            .wiki_link
            .replace_all(&text, |caps: &Captures| {
                caps.get(2)
                    .map(|label| label.as_str().trim())
                    .filter(|label| !label.is_empty())
                    .unwrap_or_else(|| caps.get(1).map_or("", |target| target.as_str().trim()))
                    .to_string()
            })
            .into_owned();
        text = self.inline_format.replace_all(&text, "").into_owned();
        text = self.italic.replace_all(&text, "${1}").into_owned();
        text = self.horizontal_rule.replace_all(&text, "").into_owned();
        text = self.list_marker.replace_all(&text, "").into_owned();
        let text = self.strip_tags(&text);
        self.collapse_whitespace(&text)
    }

    /// Headings of the rendered page in document order.
    ///
    /// An opening tag without a matching close before the next heading is skipped.
    pub fn extract_table_of_contents(&self, html: &str) -> Vec<TocEntry> {
        let opens: Vec<(usize, usize, u8)> = self
            .heading_open
            .captures_iter(html)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let level = caps[1].parse::<u8>().ok()?;
                Some((whole.start(), whole.end(), level))
            })
            .collect();

        let mut entries = Vec::new();
        for (position, (_, body_start, level)) in opens.iter().enumerate() {
            let limit = opens
                .get(position + 1)
                .map(|(next_start, _, _)| *next_start)
                .unwrap_or(html.len());
            let segment = &html[*body_start..limit];
            let Some(close) = self.heading_close.find(segment) else {
                continue;
            };
            let text = self.collapse_whitespace(&self.decode_entities(
                &self.strip_tags(&segment[..close.start()]),
            ));
            if text.is_empty() {
                continue;
            }
            entries.push(TocEntry {
                level: *level,
                anchor_id: anchor_id(&text),
                title: text,
            });
        }
        entries
    }

    pub fn generate_excerpt(&self, content: &str, max_length: usize) -> String {
        let plain = self.collapse_whitespace(&self.strip_tags(content));
        let cut = plain.char_indices().nth(max_length).map(|(index, _)| index);
        let Some(cut) = cut else {
            return plain;
        };

        let head = &plain[..cut];
        let truncated = if plain[cut..].starts_with(' ') {
            head
        } else {
            match head.rfind(' ') {
                Some(space) if space > 0 => &head[..space],
                _ => head,
            }
        };
        format!("{}{ELLIPSIS}", truncated.trim_end())
    }

    pub fn rewrite_links(&self, html: &str) -> String {
        self.links.rewrite(html, &self.routes)
    }

    pub fn strip_tags(&self, text: &str) -> String {
        self.tag.replace_all(text, " ").into_owned()
    }

    fn collapse_whitespace(&self, text: &str) -> String {
        self.whitespace.replace_all(text, " ").trim().to_string()
    }

    fn decode_entities(&self, text: &str) -> String {
        let decoded = self.numeric_entity.replace_all(text, |caps: &Captures| {
            let value = &caps[1];
            let code = match value.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => value.parse::<u32>().ok(),
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        });
        decoded
            .replace("&nbsp;", " ")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&")
    }
}

/// Lowercase, keep `[a-z0-9]`, join words with single hyphens.
pub fn anchor_id(text: &str) -> String {
    let mut anchor = String::with_capacity(text.len());
    let mut pending_separator = false;
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_separator && !anchor.is_empty() {
                anchor.push('-');
            }
            pending_separator = false;
            anchor.push(ch);
        } else if ch.is_whitespace() || ch == '-' {
            pending_separator = true;
        }
    }
    if anchor.is_empty() {
        PLACEHOLDER_ANCHOR.to_string()
    } else {
        anchor
    }
}

pub fn validate_page_id(id: &str) -> Result<(), TransformError> {
    let valid = !id.is_empty()
        && id.trim() == id
        && id.split(DELIMITER).all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(TransformError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformer() -> ContentTransformer {
        ContentTransformer::new(RouteConfig::default(), DEFAULT_EXCERPT_LENGTH)
            .expect("patterns compile")
    }

    #[test]
    fn title_prefers_widest_heading_marker() {
        let transformer = transformer();
        let raw = "===== Section =====\ntext\n====== Main Title ======\n";
        assert_eq!(transformer.extract_title("docs:guide", raw), "Main Title");
        assert_eq!(
            transformer.extract_title("docs:guide", "intro\n===== Only Section =====\n"),
            "Only Section"
        );
    }

    #[test]
    fn title_ignores_text_after_closing_marker() {
        let transformer = transformer();
        let raw = "====== Release Notes ====== {{tag>changelog}}\nbody\n";
        assert_eq!(transformer.extract_title("docs:notes", raw), "Release Notes");
        assert_eq!(
            transformer.extract_title("docs:notes", "===== Errata =====  see below\n"),
            "Errata"
        );
    }

    #[test]
    fn title_falls_back_to_humanized_segment() {
        let transformer = transformer();
        assert_eq!(
            transformer.extract_title("team:it:dance_competition-results", "no headings here"),
            "Dance competition results"
        );
        assert_eq!(
            transformer.extract_title("team:it:policy", "==== Minor ===="),
            "Policy"
        );
    }

    #[test]
    fn strip_markup_removes_supported_markers() {
        let transformer = transformer();
        let raw = "====== Welcome ======\r\n\
                   Read the **rules** and //notes// first.\n\
                   ===== Links =====\n\
                   See [[team:it|IT team]] or [[start]] and [[https://example.org]].\n\
                   {{wiki:logo.png?200|Company logo}} {{wiki:spacer.gif}}\n\
                   ----\n\
                   \x20 * __first__ item\n\
                   \x20 - ''second'' item\n\
                   1. third <del>old</del> item\n";
        let text = transformer.strip_markup(raw);
        assert_eq!(
            text,
            "Welcome Read the rules and notes first. Links See IT team or start and \
             https://example.org. Company logo first item second item third old item"
        );
        for marker in ["==", "[[", "]]", "{{", "}}", "**", "__", "''", "<", ">", "----"] {
            assert!(!text.contains(marker), "left {marker} in {text}");
        }
    }

    #[test]
    fn table_of_contents_follows_document_order() {
        let transformer = transformer();
        let html = concat!(
            "<h1>Overview</h1><p>x</p>",
            r#"<h2 id="x" class="sectionedit2">Getting <em>Started</em></h2>"#,
            "<H3>Q &amp; A</H3>",
            "<h2>Unclosed heading<p>lost</p>",
            "<h3>Über &amp; Co.</h3>",
            "<h4>!!!</h4>",
            "<h5>  </h5>",
            "<h6>Last&#39;s</h6>",
        );
        let toc = transformer.extract_table_of_contents(html);
        let summary: Vec<(u8, &str, &str)> = toc
            .iter()
            .map(|entry| (entry.level, entry.title.as_str(), entry.anchor_id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "Overview", "overview"),
                (2, "Getting Started", "getting-started"),
                (3, "Q & A", "q-a"),
                (3, "Über & Co.", "ber-co"),
                (4, "!!!", PLACEHOLDER_ANCHOR),
                (6, "Last's", "lasts"),
            ]
        );
    }

    #[test]
    fn anchor_id_collapses_separators() {
        assert_eq!(anchor_id("  Hello -- World  "), "hello-world");
        assert_eq!(anchor_id("v1.2 release"), "v12-release");
        assert_eq!(anchor_id("---"), PLACEHOLDER_ANCHOR);
    }

    #[test]
    fn excerpt_keeps_short_content() {
        let transformer = transformer();
        assert_eq!(
            transformer.generate_excerpt("  <p>Short   text</p> ", 200),
            "Short text"
        );
    }

    #[test]
    fn excerpt_truncates_at_word_boundary() {
        let transformer = transformer();
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];
        let mut content = String::new();
        let mut n = 0;
        while content.chars().count() < 250 {
            if !content.is_empty() {
                content.push(' ');
            }
            content.push_str(words[n % words.len()]);
            n += 1;
        }
        let content: String = content.chars().take(250).collect();
        assert_eq!(content.chars().count(), 250);

        let excerpt = transformer.generate_excerpt(&content, 200);
        assert!(excerpt.chars().count() <= 203);
        assert!(excerpt.ends_with(ELLIPSIS));
        let body = excerpt.trim_end_matches(ELLIPSIS);
        assert!(content.starts_with(body));
        assert_eq!(&content[body.len()..body.len() + 1], " ");
    }

    #[test]
    fn excerpt_cuts_exactly_when_boundary_follows() {
        let transformer = transformer();
        assert_eq!(transformer.generate_excerpt("abcd efgh", 4), "abcd...");
        assert_eq!(transformer.generate_excerpt("abcdefgh", 4), "abcd...");
        assert_eq!(transformer.generate_excerpt("ab cdefgh", 4), "ab...");
    }

    #[test]
    fn build_page_composes_all_fields() {
        let transformer = transformer();
        let meta = PageMeta {
            last_modified: Some(1_700_000_123),
            revision: Some(1_700_000_123),
            permission: Some(8),
            size_bytes: Some(512),
        };
        let page = transformer
            .build_page(
                "team:it:policy",
                &meta,
                "====== IT Policy ======\nAll [[team:it:contacts|contacts]] apply.",
                r#"<h1>IT Policy</h1><p><a href="/doku.php?id=team:it:contacts">contacts</a></p>"#,
                42,
            )
            .expect("build page");

        assert_eq!(page.title, "IT Policy");
        assert_eq!(page.raw_content, "IT Policy All contacts apply.");
        assert_eq!(page.excerpt, page.raw_content);
        assert!(page.rendered_html.contains(r#"href="/wiki/team:it:contacts""#));
        assert_eq!(page.table_of_contents.len(), 1);
        assert_eq!(page.table_of_contents[0].anchor_id, "it-policy");
        assert_eq!(page.namespace(), "team:it");
        assert_eq!(page.depth(), 2);
        assert_eq!(page.last_modified, 1_700_000_123);
        assert_eq!(page.permission, Some(8));
    }

    #[test]
    fn build_page_rejects_empty_payloads() {
        let transformer = transformer();
        let meta = PageMeta::default();
        assert_eq!(
            transformer.build_page("a", &meta, "  ", "<p>x</p>", 1),
            Err(TransformError::EmptyContent("a".to_string()))
        );
        assert_eq!(
            transformer.build_page("a", &meta, "text", "\n", 1),
            Err(TransformError::EmptyHtml("a".to_string()))
        );
        assert_eq!(
            transformer.build_page("a", &meta, "{{only:image.png}}", "<img>", 1),
            Err(TransformError::EmptyContent("a".to_string()))
        );
        assert_eq!(
            transformer.build_page("a::b", &meta, "text", "<p>x</p>", 1),
            Err(TransformError::InvalidId("a::b".to_string()))
        );
    }

    #[test]
    fn build_page_defaults_last_modified_to_fetch_time() {
        let transformer = transformer();
        let page = transformer
            .build_page("start", &PageMeta::default(), "Hello", "<p>Hello</p>", 99)
            .expect("build page");
        assert_eq!(page.last_modified, 99);
        assert_eq!(page.title, "Start");
        assert_eq!(page.namespace(), "root");
    }

    #[test]
    fn media_href_encodes_query() {
        let routes = RouteConfig::default();
        assert_eq!(
            routes.media_href("ns:a b.png", &[("w".to_string(), "20".to_string())]),
            "/wiki/fetch?media=ns%3Aa+b.png&w=20"
        );
        assert_eq!(routes.page_href("team:it"), "/wiki/team:it");
    }
}
