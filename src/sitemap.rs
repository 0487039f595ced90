//! Sitemap ingestion
//!
//! Parses the `<urlset>` / `<sitemapindex>` subset of the sitemap
//! protocol that matters for URL discovery, and fetches robots-declared
//! sitemaps (following a bounded number of child sitemaps from an
//! index). Feeds `map_site` alongside crawl discovery.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

static LOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").unwrap_or_else(|_| unreachable!()));

/// Parsed sitemap document.
#[derive(Debug, Clone, Default)]
pub struct SitemapDoc {
    /// Page URLs from a `<urlset>`.
    pub urls: Vec<String>,
    /// Child sitemap URLs from a `<sitemapindex>`.
    pub children: Vec<String>,
}

/// Parse sitemap XML. Entity-decodes `&amp;` in locations.
#[must_use]
pub fn parse(xml: &str) -> SitemapDoc {
    let is_index = xml.contains("<sitemapindex");
    let locations: Vec<String> = LOC_RE
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
        .collect();
    if is_index {
        SitemapDoc {
            urls: Vec::new(),
            children: locations,
        }
    } else {
        SitemapDoc {
            urls: locations,
            children: Vec::new(),
        }
    }
}

/// Fetch the given sitemap URLs (expanding at most `max_children`
/// child sitemaps per index) and return up to `max_urls` page URLs.
pub async fn collect_urls(
    client: &reqwest::Client,
    sitemap_urls: &[String],
    max_children: usize,
    max_urls: usize,
) -> Vec<String> {
    let mut urls = Vec::new();
    for sitemap_url in sitemap_urls {
        if urls.len() >= max_urls {
            break;
        }
        let Some(doc) = fetch_one(client, sitemap_url).await else {
            continue;
        };
        urls.extend(doc.urls);
        for child in doc.children.into_iter().take(max_children) {
            if urls.len() >= max_urls {
                break;
            }
            if let Some(child_doc) = fetch_one(client, &child).await {
                urls.extend(child_doc.urls);
            }
        }
    }
    urls.truncate(max_urls);
    urls.dedup();
    urls
}

async fn fetch_one(client: &reqwest::Client, url: &str) -> Option<SitemapDoc> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "sitemap fetch failed");
        return None;
    }
    let body = response.text().await.ok()?;
    Some(parse(&body))
}
