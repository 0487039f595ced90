//! External capability contracts
//!
//! The engine depends on a few collaborators only by contract: semantic
//! scoring and synthesis (LLM providers), browser rendering, and web
//! search. Each is a small trait taken as `Arc<dyn _>`; deterministic
//! fallbacks keep every pipeline functional when a capability is not
//! installed, and tests inject fixed implementations.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};

/// Scores topical relevance of a document, in `[0, 1]`.
pub trait SemanticScorer: Send + Sync {
    fn score<'a>(&'a self, topic: &'a str, document: &'a str) -> BoxFuture<'a, HarvestResult<f64>>;

    /// Expand a topic into query variants. Implementations may return
    /// an empty list to fall back to the deterministic expander.
    fn expand_queries<'a>(
        &'a self,
        topic: &'a str,
        count: usize,
    ) -> BoxFuture<'a, HarvestResult<Vec<String>>>;
}

/// Output of a synthesis pass over research findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Synthesis {
    pub summary: String,
    pub themes: Vec<String>,
    pub gaps: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Produces a narrative synthesis from scored findings.
pub trait Synthesizer: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        topic: &'a str,
        excerpts: &'a [String],
    ) -> BoxFuture<'a, HarvestResult<Synthesis>>;
}

/// A page rendered by a real browser.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
    /// PNG screenshots captured during the session.
    pub screenshots: Vec<Vec<u8>>,
}

/// Scripted browser actions for `scrape_with_actions`.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum BrowserAction {
    Click { selector: String },
    Type { selector: String, text: String },
    WaitFor { selector: String },
    Scroll { pixels: i64 },
    Screenshot,
}

/// Drives a browser session; the engine assumes nothing about how the
/// implementation renders or what evasions it applies.
pub trait BrowserSession: Send + Sync {
    fn open<'a>(
        &'a self,
        url: &'a str,
        actions: &'a [BrowserAction],
    ) -> BoxFuture<'a, HarvestResult<RenderedPage>>;
}

/// One result from a search capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Web search capability.
pub trait SearchProvider: Send + Sync {
    fn search<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, HarvestResult<Vec<SearchHit>>>;
}

/// Placeholder browser used when no real session is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBrowser;

impl BrowserSession for UnavailableBrowser {
    fn open<'a>(
        &'a self,
        _url: &'a str,
        _actions: &'a [BrowserAction],
    ) -> BoxFuture<'a, HarvestResult<RenderedPage>> {
        Box::pin(async { Err(HarvestError::CapabilityUnavailable("browser_session")) })
    }
}

/// Optional capability bundle handed to the engine at construction.
#[derive(Default, Clone)]
pub struct Capabilities {
    pub semantic: Option<std::sync::Arc<dyn SemanticScorer>>,
    pub synthesizer: Option<std::sync::Arc<dyn Synthesizer>>,
    pub browser: Option<std::sync::Arc<dyn BrowserSession>>,
    pub search: Option<std::sync::Arc<dyn SearchProvider>>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("semantic", &self.semantic.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .field("browser", &self.browser.is_some())
            .field("search", &self.search.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_actions_deserialize_tagged() {
        let actions: Vec<BrowserAction> = serde_json::from_str(
            r##"[
                {"type": "click", "selector": "#login"},
                {"type": "type", "selector": "input", "text": "hello"},
                {"type": "screenshot"}
            ]"##,
        )
        .expect("parse");
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], BrowserAction::Click { .. }));
    }

    #[test]
    fn unknown_action_fields_rejected() {
        let result: Result<BrowserAction, _> =
            serde_json::from_str(r#"{"type": "click", "selector": "a", "frames": 2}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unavailable_browser_reports_capability() {
        let browser = UnavailableBrowser;
        let err = browser.open("https://example.com", &[]).await.unwrap_err();
        assert_eq!(err.kind(), "CapabilityUnavailable");
    }
}
