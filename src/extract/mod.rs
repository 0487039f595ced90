//! HTML content extraction
//!
//! The default `ContentExtractor` is backed by `scraper`. All functions
//! here are synchronous and are dispatched through the worker pool by
//! callers; `scraper::Html` is not `Send`, so a parsed document never
//! crosses an await point.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{HarvestError, HarvestResult};
use crate::guard::CanonicalUrl;

/// Tags whose text is never page content.
const NON_CONTENT_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// A link discovered on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLink {
    pub url: String,
    pub anchor: String,
    /// True when the link leaves the page's registrable domain.
    pub external: bool,
}

/// Document metadata: title, description, and social-card tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical: Option<String>,
    pub language: Option<String>,
    pub open_graph: BTreeMap<String, String>,
    pub twitter: BTreeMap<String, String>,
}

/// Cleaned main-content extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleContent {
    pub title: Option<String>,
    pub text: String,
    pub word_count: usize,
}

/// Structural features consumed by the change tracker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSkeleton {
    /// Element tag names in document order.
    pub tags: Vec<String>,
    /// Distinct CSS classes on the page.
    pub classes: BTreeSet<String>,
    pub element_count: usize,
}

/// Content extraction seam. The engine ships `HtmlExtractor`; tests may
/// substitute fixed outputs.
pub trait ContentExtractor: Send + Sync {
    fn text(&self, html: &str) -> String;
    fn links(&self, html: &str, base: &CanonicalUrl) -> Vec<PageLink>;
    fn metadata(&self, html: &str) -> PageMetadata;
    fn article(&self, html: &str) -> ArticleContent;
    fn headings(&self, html: &str) -> Vec<String>;
    fn skeleton(&self, html: &str) -> PageSkeleton;
    fn select(&self, html: &str, selectors: &BTreeMap<String, String>)
    -> HarvestResult<BTreeMap<String, serde_json::Value>>;
    /// Remove elements matching the given selectors, returning the
    /// remaining HTML. Used by the tracker's exclusion option.
    fn strip(&self, html: &str, selectors: &[String]) -> String;
    /// Keep only elements matching the selector, concatenating their
    /// outer HTML. Used for element-granularity change tracking.
    fn keep(&self, html: &str, selector_css: &str) -> HarvestResult<String>;
}

/// Default extractor over `scraper`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    fn visible_text(root: scraper::ElementRef<'_>) -> String {
        let mut out = String::new();
        collect_text(root, &mut out);
        normalize_whitespace(&out)
    }
}

fn collect_text(element: scraper::ElementRef<'_>, out: &mut String) {
    if NON_CONTENT_TAGS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = scraper::ElementRef::wrap(child) {
            collect_text(child_el, out);
        }
    }
}

fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(css: &str) -> HarvestResult<Selector> {
    Selector::parse(css)
        .map_err(|e| HarvestError::InvalidArgument(format!("selector '{css}': {e}")))
}

impl ContentExtractor for HtmlExtractor {
    fn text(&self, html: &str) -> String {
        let doc = Html::parse_document(html);
        HtmlExtractor::visible_text(doc.root_element())
    }

    fn links(&self, html: &str, base: &CanonicalUrl) -> Vec<PageLink> {
        let doc = Html::parse_document(html);
        let Ok(sel) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        let own_domain = base.registrable_domain();
        let mut seen = BTreeSet::new();
        let mut links = Vec::new();
        for el in doc.select(&sel) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            let trimmed = href.trim();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("javascript:")
                || trimmed.starts_with("mailto:")
                || trimmed.starts_with("tel:")
            {
                continue;
            }
            let Ok(resolved) = base.join(trimmed) else {
                continue;
            };
            if !seen.insert(resolved.as_str().to_string()) {
                continue;
            }
            let anchor = normalize_whitespace(&el.text().collect::<String>());
            let external = resolved.registrable_domain() != own_domain;
            links.push(PageLink {
                url: resolved.as_str().to_string(),
                anchor,
                external,
            });
        }
        links
    }

    fn metadata(&self, html: &str) -> PageMetadata {
        let doc = Html::parse_document(html);
        let mut meta = PageMetadata::default();

        if let Ok(sel) = Selector::parse("title") {
            meta.title = doc
                .select(&sel)
                .next()
                .map(|t| normalize_whitespace(&t.text().collect::<String>()))
                .filter(|t| !t.is_empty());
        }
        if let Ok(sel) = Selector::parse("html") {
            meta.language = doc
                .select(&sel)
                .next()
                .and_then(|el| el.value().attr("lang"))
                .map(str::to_string);
        }
        if let Ok(sel) = Selector::parse("link[rel='canonical']") {
            meta.canonical = doc
                .select(&sel)
                .next()
                .and_then(|el| el.value().attr("href"))
                .map(str::to_string);
        }
        if let Ok(sel) = Selector::parse("meta") {
            for el in doc.select(&sel) {
                let value = el.value().attr("content").unwrap_or_default().to_string();
                if value.is_empty() {
                    continue;
                }
                if let Some(name) = el.value().attr("name") {
                    let name = name.to_ascii_lowercase();
                    if name == "description" && meta.description.is_none() {
                        meta.description = Some(value.clone());
                    } else if let Some(card) = name.strip_prefix("twitter:") {
                        meta.twitter.insert(card.to_string(), value.clone());
                    }
                }
                if let Some(property) = el.value().attr("property") {
                    let property = property.to_ascii_lowercase();
                    if let Some(og) = property.strip_prefix("og:") {
                        meta.open_graph.insert(og.to_string(), value.clone());
                    }
                }
            }
        }
        meta
    }

    fn article(&self, html: &str) -> ArticleContent {
        let doc = Html::parse_document(html);
        let title = Selector::parse("h1, title").ok().and_then(|sel| {
            doc.select(&sel)
                .next()
                .map(|t| normalize_whitespace(&t.text().collect::<String>()))
                .filter(|t| !t.is_empty())
        });

        // Prefer semantic containers; fall back to the densest block,
        // then the whole body.
        let mut text = String::new();
        for container in ["article", "main", "[role='main']"] {
            if let Ok(sel) = Selector::parse(container) {
                if let Some(el) = doc.select(&sel).next() {
                    text = HtmlExtractor::visible_text(el);
                    if !text.is_empty() {
                        break;
                    }
                }
            }
        }
        if text.is_empty() {
            if let Ok(sel) = Selector::parse("div, section") {
                text = doc
                    .select(&sel)
                    .map(|el| HtmlExtractor::visible_text(el))
                    .max_by_key(String::len)
                    .unwrap_or_default();
            }
        }
        if text.is_empty() {
            text = self.text(html);
        }

        let word_count = text.split_whitespace().count();
        ArticleContent {
            title,
            text,
            word_count,
        }
    }

    fn headings(&self, html: &str) -> Vec<String> {
        let doc = Html::parse_document(html);
        let Ok(sel) = Selector::parse("h1, h2, h3, h4, h5, h6") else {
            return Vec::new();
        };
        doc.select(&sel)
            .map(|el| normalize_whitespace(&el.text().collect::<String>()))
            .filter(|h| !h.is_empty())
            .collect()
    }

    fn skeleton(&self, html: &str) -> PageSkeleton {
        let doc = Html::parse_document(html);
        let Ok(sel) = Selector::parse("*") else {
            return PageSkeleton::default();
        };
        let mut tags = Vec::new();
        let mut classes = BTreeSet::new();
        for el in doc.select(&sel) {
            tags.push(el.value().name().to_string());
            for class in el.value().classes() {
                classes.insert(class.to_string());
            }
        }
        let element_count = tags.len();
        PageSkeleton {
            tags,
            classes,
            element_count,
        }
    }

    fn select(
        &self,
        html: &str,
        selectors: &BTreeMap<String, String>,
    ) -> HarvestResult<BTreeMap<String, serde_json::Value>> {
        let doc = Html::parse_document(html);
        let mut out = BTreeMap::new();
        for (name, css) in selectors {
            let sel = selector(css)?;
            let values: Vec<String> = doc
                .select(&sel)
                .map(|el| normalize_whitespace(&el.text().collect::<String>()))
                .filter(|v| !v.is_empty())
                .collect();
            let value = match values.len() {
                0 => serde_json::Value::Null,
                1 => serde_json::Value::String(values.into_iter().next().unwrap_or_default()),
                _ => serde_json::Value::Array(
                    values.into_iter().map(serde_json::Value::String).collect(),
                ),
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    fn keep(&self, html: &str, selector_css: &str) -> HarvestResult<String> {
        let doc = Html::parse_document(html);
        let sel = selector(selector_css)?;
        Ok(doc
            .select(&sel)
            .map(|el| el.html())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn strip(&self, html: &str, selectors: &[String]) -> String {
        if selectors.is_empty() {
            return html.to_string();
        }
        // scraper cannot mutate the tree; rebuild the document text by
        // skipping matched elements' serialized ranges.
        let doc = Html::parse_document(html);
        let mut excluded: Vec<String> = Vec::new();
        for css in selectors {
            if let Ok(sel) = Selector::parse(css) {
                for el in doc.select(&sel) {
                    excluded.push(el.html());
                }
            }
        }
        let mut result = html.to_string();
        // Longest first so nested matches do not break outer removal.
        excluded.sort_by_key(|s| std::cmp::Reverse(s.len()));
        for fragment in excluded {
            result = result.replace(&fragment, "");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html lang="en"><head>
        <title>Sample Page</title>
        <meta name="description" content="A sample.">
        <meta property="og:title" content="Sample OG">
        <meta name="twitter:card" content="summary">
        <link rel="canonical" href="https://example.com/sample">
        <script>var x = "ignore me";</script>
      </head><body>
        <h1>Welcome</h1>
        <article><p>Main content body text here.</p></article>
        <a href="/about">About us</a>
        <a href="https://other.org/page">Elsewhere</a>
        <a href="#section">Skip</a>
        <a href="mailto:x@example.com">Mail</a>
      </body></html>"##;

    fn base() -> CanonicalUrl {
        CanonicalUrl::parse("https://example.com/").expect("base")
    }

    #[test]
    fn text_skips_scripts() {
        let text = HtmlExtractor.text(PAGE);
        assert!(text.contains("Main content body text"));
        assert!(!text.contains("ignore me"));
    }

    #[test]
    fn links_resolve_and_classify() {
        let links = HtmlExtractor.links(PAGE, &base());
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://example.com/about");
        assert!(!links[0].external);
        assert_eq!(links[0].anchor, "About us");
        assert!(links[1].external);
    }

    #[test]
    fn metadata_collects_social_tags() {
        let meta = HtmlExtractor.metadata(PAGE);
        assert_eq!(meta.title.as_deref(), Some("Sample Page"));
        assert_eq!(meta.description.as_deref(), Some("A sample."));
        assert_eq!(meta.canonical.as_deref(), Some("https://example.com/sample"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.open_graph.get("title").map(String::as_str), Some("Sample OG"));
        assert_eq!(meta.twitter.get("card").map(String::as_str), Some("summary"));
    }

    #[test]
    fn article_prefers_semantic_container() {
        let article = HtmlExtractor.article(PAGE);
        assert_eq!(article.title.as_deref(), Some("Welcome"));
        assert_eq!(article.text, "Main content body text here.");
        assert_eq!(article.word_count, 5);
    }

    #[test]
    fn structured_selection_single_and_multi() {
        let mut selectors = BTreeMap::new();
        selectors.insert("title".to_string(), "h1".to_string());
        selectors.insert("links".to_string(), "a".to_string());
        selectors.insert("absent".to_string(), "footer".to_string());
        let out = HtmlExtractor.select(PAGE, &selectors).expect("select");
        assert_eq!(out["title"], serde_json::json!("Welcome"));
        assert!(out["links"].is_array());
        assert!(out["absent"].is_null());
    }

    #[test]
    fn invalid_selector_is_an_argument_error() {
        let mut selectors = BTreeMap::new();
        selectors.insert("bad".to_string(), ":::".to_string());
        let err = HtmlExtractor.select(PAGE, &selectors).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn skeleton_counts_elements_and_classes() {
        let skeleton =
            HtmlExtractor.skeleton(r#"<div class="a b"><p class="a">x</p><p>y</p></div>"#);
        assert!(skeleton.tags.contains(&"div".to_string()));
        assert!(skeleton.classes.contains("a"));
        assert!(skeleton.classes.contains("b"));
        assert!(skeleton.element_count >= 3);
    }

    #[test]
    fn strip_removes_matched_elements() {
        let html = r#"<body><div class="ad">Buy now</div><p>Keep me</p></body>"#;
        let stripped = HtmlExtractor.strip(html, &["div.ad".to_string()]);
        assert!(!stripped.contains("Buy now"));
        assert!(stripped.contains("Keep me"));
    }

    #[test]
    fn keep_retains_only_matches() {
        let html = r#"<div class="price">$10</div><div class="noise">x</div>"#;
        let kept = HtmlExtractor.keep(html, "div.price").expect("keep");
        assert!(kept.contains("$10"));
        assert!(!kept.contains("noise"));
    }

    #[test]
    fn headings_in_document_order() {
        let html = "<h1>One</h1><h2>Two</h2><h3>Three</h3>";
        assert_eq!(HtmlExtractor.headings(html), ["One", "Two", "Three"]);
    }
}
