use regex::{Captures, Regex};
use url::form_urlencoded;

use super::RouteConfig;

/// Sizing parameters passed through to the media route; everything else is dropped.
const SIZE_PARAMS: [&str; 2] = ["w", "h"];

/// Textual rewriting of DokuWiki URLs into application routes.
///
/// Every output form falls outside every input pattern, so a second pass is a no-op.
pub(crate) struct LinkRewriter {
    /// `https://host/doku.php?id=x`, `/doku.php?id=x`
    absolute_link: Regex,
    /// `?id=x`
    query_link: Regex,
    /// `doku.php?id=x`, `./doku.php?id=x`
    relative_link: Regex,
    /// `doku.php?do=edit&id=x`
    action_link: Regex,
    fetch_src: Regex,
    media_src: Regex,
    css_fetch: Regex,
}

impl LinkRewriter {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            absolute_link: Regex::new(
                r#"(?i)href=["'](?:https?://[^/"']+)?/doku\.php\?id=([^"'&#]+)[^"'#]*(#[^"']*)?["']"#,
            )?,
            query_link: Regex::new(r#"(?i)href=["']\?id=([^"'&#]+)[^"'#]*(#[^"']*)?["']"#)?,
            relative_link: Regex::new(r#"(?i)href=["'](?:\./)?doku\.php\?id=([^"'&#]+)[^"'#]*(#[^"']*)?["']"#)?,
            action_link: Regex::new(
                r#"(?i)href=["'](?:https?://[^/"']+)?(?:\./|/)?doku\.php\?([^"']*\bdo=[^"']*)["']"#,
            )?,
            fetch_src: Regex::new(
                r#"(?i)src=["'](?:https?://[^/"']+)?/lib/exe/fetch\.php\?([^"']*)["']"#,
            )?,
            media_src: Regex::new(
                r#"(?i)src=["'](?:https?://[^/"']+)?/_?media/([^"'?]+)(?:\?([^"']*))?["']"#,
            )?,
            css_fetch: Regex::new(
                r#"(?i)url\(\s*["']?(?:https?://[^/"')]+)?/lib/exe/fetch\.php\?([^"')]*)["']?\s*\)"#,
            )?,
        })
    }

    pub(crate) fn rewrite(&self, html: &str, routes: &RouteConfig) -> String {
        let mut output = html.to_string();

        for rule in [&self.absolute_link, &self.query_link, &self.relative_link] {
            output = rule
                .replace_all(&output, |caps: &Captures| {
                    let fragment = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                    page_attr(routes, &caps[1], fragment)
                })
                .into_owned();
        }

        output = self
            .action_link
            .replace_all(&output, |caps: &Captures| {
                let matched = &caps[1];
                let (query, fragment) = match matched.find('#') {
                    Some(pos) => (&matched[..pos], &matched[pos..]),
                    None => (matched, ""),
                };
                match query_param(query, "id") {
                    Some(id) => page_attr(routes, &id, fragment),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        output = self
            .fetch_src
            .replace_all(&output, |caps: &Captures| {
                match query_param(&caps[1], "media") {
                    Some(media) => src_attr(routes, &media, &sizing_params(&caps[1])),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();

        output = self
            .media_src
            .replace_all(&output, |caps: &Captures| {
                let media = decode_component(&caps[1]).replace('/', ":");
                let sizing = caps
                    .get(2)
                    .map(|query| sizing_params(query.as_str()))
                    .unwrap_or_default();
                src_attr(routes, &media, &sizing)
            })
            .into_owned();

        self.css_fetch
            .replace_all(&output, |caps: &Captures| {
                match query_param(&caps[1], "media") {
                    Some(media) => format!(
                        "url('{}')",
                        routes.media_href(&media, &sizing_params(&caps[1]))
                    ),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

fn page_attr(routes: &RouteConfig, raw_id: &str, fragment: &str) -> String {
    let id = decode_component(raw_id);
    let id = id.trim().trim_start_matches(':');
    let href = format!("{}{fragment}", routes.page_href(id));
    format!("href=\"{}\"", href.replace('"', "&quot;"))
}

fn src_attr(routes: &RouteConfig, media: &str, sizing: &[(String, String)]) -> String {
    format!("src=\"{}\"", routes.media_href(media, sizing))
}

/// Percent-decode a single URL component (`+` decodes to a space).
pub(crate) fn decode_component(raw: &str) -> String {
    form_urlencoded::parse(format!("v={raw}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

fn query_pairs(query: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(query.replace("&amp;", "&").as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query_pairs(query)
        .into_iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn sizing_params(query: &str) -> Vec<(String, String)> {
    let pairs = query_pairs(query);
    SIZE_PARAMS
        .iter()
        .filter_map(|name| {
            pairs
                .iter()
                .find(|(key, value)| {
                    key == name && !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
                })
                .cloned()
        })
        .collect()
}
