//! webharvest binary: run the MCP server on stdio.
//!
//! stdout carries the MCP transport; all diagnostics go to stderr via
//! `tracing`. Configuration comes from the file named by
//! `WEBHARVEST_CONFIG`, defaulting to a complete built-in config.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use webharvest::capabilities::Capabilities;
use webharvest::config::EngineConfig;
use webharvest::mcp::{Engine, serve_stdio};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(EngineConfig::load()?);
    tracing::info!(
        data_dir = %config.data_dir().display(),
        "starting webharvest"
    );

    // Browser, search, and LLM capabilities are wired by embedders;
    // the standalone binary runs with the deterministic built-ins.
    let engine = Engine::new(config, Capabilities::default())?;
    serve_stdio(engine).await
}
