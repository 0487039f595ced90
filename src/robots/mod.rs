//! robots.txt cache
//!
//! Fetches and memoizes per-host robots.txt with a TTL. The parser
//! covers the directive subset the engine acts on: `User-agent`,
//! `Allow`, `Disallow`, `Crawl-delay`, `Sitemap`. Rule matching is
//! longest-prefix wins; on equal length `Allow` beats `Disallow`.
//! Fetch failures default to allow-all (configurable).

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RobotsConfig;
use crate::guard::CanonicalUrl;

/// One `Allow`/`Disallow` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    allow: bool,
    path: String,
}

/// Rules for one `User-agent` block (possibly several agents).
#[derive(Debug, Clone, Default)]
struct RuleGroup {
    agents: Vec<String>,
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

/// Parsed robots.txt for one host.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<RuleGroup>,
    sitemaps: Vec<String>,
}

impl RobotsRules {
    /// Parse robots.txt content. Unknown directives are skipped.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut sitemaps = Vec::new();
        let mut current: Option<RuleGroup> = None;
        // Consecutive User-agent lines share the block that follows.
        let mut collecting_agents = false;

        for line in content.lines() {
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if collecting_agents {
                        if let Some(group) = current.as_mut() {
                            group.agents.push(value.to_ascii_lowercase());
                        }
                    } else {
                        if let Some(group) = current.take() {
                            groups.push(group);
                        }
                        current = Some(RuleGroup {
                            agents: vec![value.to_ascii_lowercase()],
                            ..RuleGroup::default()
                        });
                        collecting_agents = true;
                    }
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    if let Some(group) = current.as_mut() {
                        // Empty Disallow means allow-all; record nothing.
                        if !value.is_empty() {
                            group.rules.push(Rule {
                                allow: key == "allow",
                                path: value.to_string(),
                            });
                        }
                    }
                }
                "crawl-delay" => {
                    collecting_agents = false;
                    if let Some(group) = current.as_mut() {
                        group.crawl_delay = value.parse::<f64>().ok().filter(|d| *d >= 0.0);
                    }
                }
                "sitemap" => {
                    // Sitemap is host-global, independent of any group.
                    sitemaps.push(value.to_string());
                }
                _ => {}
            }
        }
        if let Some(group) = current.take() {
            groups.push(group);
        }

        Self { groups, sitemaps }
    }

    /// Pick the group with the most specific user-agent match, falling
    /// back to the `*` group.
    fn group_for(&self, user_agent: &str) -> Option<&RuleGroup> {
        let ua = user_agent.to_ascii_lowercase();
        let mut best: Option<(&RuleGroup, usize)> = None;
        for group in &self.groups {
            for agent in &group.agents {
                let score = if agent == "*" {
                    Some(0)
                } else if ua.contains(agent.as_str()) {
                    Some(agent.len())
                } else {
                    None
                };
                if let Some(score) = score {
                    let better = match best {
                        Some((_, current)) => score > current,
                        None => true,
                    };
                    if better {
                        best = Some((group, score));
                    }
                }
            }
        }
        best.map(|(g, _)| g)
    }

    /// Whether `path` is fetchable for `user_agent`.
    #[must_use]
    pub fn allowed(&self, path: &str, user_agent: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };
        // Longest matching rule wins; on a tie Allow beats Disallow.
        let mut verdict = true;
        let mut best_len = 0usize;
        let mut best_allow = false;
        for rule in &group.rules {
            if path.starts_with(&rule.path) {
                let len = rule.path.len();
                if len > best_len || (len == best_len && rule.allow && !best_allow) {
                    best_len = len;
                    best_allow = rule.allow;
                    verdict = rule.allow;
                }
            }
        }
        if best_len == 0 { true } else { verdict }
    }

    /// Crawl-delay for the best-matching group.
    #[must_use]
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent)
            .and_then(|g| g.crawl_delay)
            .map(Duration::from_secs_f64)
    }

    #[must_use]
    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }
}

#[derive(Debug, Clone)]
struct CachedRobots {
    rules: RobotsRules,
    /// None when the fetch failed and fail_open applied.
    fetched: bool,
    stored_at: Instant,
}

/// TTL'd per-host robots.txt cache.
pub struct RobotsCache {
    config: RobotsConfig,
    client: reqwest::Client,
    entries: DashMap<String, CachedRobots>,
}

impl RobotsCache {
    #[must_use]
    pub fn new(config: RobotsConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            entries: DashMap::new(),
        }
    }

    /// Whether the URL is fetchable for `user_agent`.
    pub async fn allowed(&self, url: &CanonicalUrl, user_agent: &str) -> bool {
        let entry = self.entry_for(url.scheme(), url.host(), url.port_or_default()).await;
        if !entry.fetched && self.config.fail_open {
            return true;
        }
        entry.rules.allowed(url.path(), user_agent)
    }

    /// Crawl-delay declared for `user_agent` on this host, if any.
    pub async fn crawl_delay(&self, url: &CanonicalUrl, user_agent: &str) -> Option<Duration> {
        let entry = self.entry_for(url.scheme(), url.host(), url.port_or_default()).await;
        entry.rules.crawl_delay(user_agent)
    }

    /// Sitemap URLs declared in robots.txt for this host.
    pub async fn sitemaps(&self, url: &CanonicalUrl) -> Vec<String> {
        let entry = self.entry_for(url.scheme(), url.host(), url.port_or_default()).await;
        entry.rules.sitemaps().to_vec()
    }

    /// Seed the cache directly; used by tests and offline runs.
    pub fn insert_rules(&self, host: &str, content: &str) {
        self.entries.insert(
            host.to_ascii_lowercase(),
            CachedRobots {
                rules: RobotsRules::parse(content),
                fetched: true,
                stored_at: Instant::now(),
            },
        );
    }

    async fn entry_for(&self, scheme: &str, host: &str, port: u16) -> CachedRobots {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        if let Some(cached) = self.entries.get(host) {
            if cached.stored_at.elapsed() < ttl {
                return cached.clone();
            }
        }

        let fetched = self.fetch_rules(scheme, host, port).await;
        let entry = match fetched {
            Some(rules) => CachedRobots {
                rules,
                fetched: true,
                stored_at: Instant::now(),
            },
            None => CachedRobots {
                rules: RobotsRules::default(),
                fetched: false,
                stored_at: Instant::now(),
            },
        };
        self.entries.insert(host.to_ascii_lowercase(), entry.clone());
        entry
    }

    async fn fetch_rules(&self, scheme: &str, host: &str, port: u16) -> Option<RobotsRules> {
        let default_port = matches!(
            (scheme, port),
            ("http", 80) | ("https", 443)
        );
        let robots_url = if default_port {
            format!("{scheme}://{host}/robots.txt")
        } else {
            format!("{scheme}://{host}:{port}/robots.txt")
        };

        let response = self
            .client
            .get(&robots_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!(host = %host, status = %response.status(), "robots.txt not available");
            return None;
        }
        let body = response.text().await.ok()?;
        Some(RobotsRules::parse(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
User-agent: *
Disallow: /private/
Allow: /private/public/
Crawl-delay: 2

User-agent: harvester
Disallow: /slow/

Sitemap: https://example.com/sitemap.xml
";

    #[test]
    fn longest_match_wins() {
        let rules = RobotsRules::parse(SAMPLE);
        assert!(!rules.allowed("/private/data", "other-bot"));
        assert!(rules.allowed("/private/public/page", "other-bot"));
        assert!(rules.allowed("/open", "other-bot"));
    }

    #[test]
    fn tie_prefers_allow() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow: /a/\nAllow: /a/\n");
        assert!(rules.allowed("/a/page", "bot"));
    }

    #[test]
    fn specific_agent_group_beats_wildcard() {
        let rules = RobotsRules::parse(SAMPLE);
        // harvester matches its own group, which has no /private rule.
        assert!(rules.allowed("/private/data", "webharvest/0.1 harvester"));
        assert!(!rules.allowed("/slow/page", "webharvest/0.1 harvester"));
    }

    #[test]
    fn crawl_delay_and_sitemaps_parsed() {
        let rules = RobotsRules::parse(SAMPLE);
        assert_eq!(rules.crawl_delay("anybot"), Some(Duration::from_secs(2)));
        assert_eq!(rules.sitemaps(), ["https://example.com/sitemap.xml"]);
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n");
        assert!(rules.allowed("/anything", "bot"));
    }

    #[test]
    fn stacked_user_agents_share_rules() {
        let rules = RobotsRules::parse("User-agent: a\nUser-agent: b\nDisallow: /x/\n");
        assert!(!rules.allowed("/x/1", "a"));
        assert!(!rules.allowed("/x/1", "b"));
        assert!(rules.allowed("/x/1", "c"));
    }

    #[tokio::test]
    async fn seeded_cache_answers_without_network() {
        let cache = RobotsCache::new(RobotsConfig::default(), reqwest::Client::new());
        cache.insert_rules("example.com", "User-agent: *\nDisallow: /admin/\n");
        let blocked = CanonicalUrl::parse("https://example.com/admin/panel").expect("url");
        let open = CanonicalUrl::parse("https://example.com/docs").expect("url");
        assert!(!cache.allowed(&blocked, "bot").await);
        assert!(cache.allowed(&open, "bot").await);
    }
}
