//! Shared scaffolding for integration tests: an engine wired to a
//! throwaway data directory with private-address fetches allowed (the
//! mock HTTP servers live on loopback).

use std::sync::Arc;

use webharvest::capabilities::Capabilities;
use webharvest::config::EngineConfig;
use webharvest::mcp::Engine;
use webharvest::pipeline::Pipeline;

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub config: Arc<EngineConfig>,
    _data_dir: tempfile::TempDir,
}

pub fn config_for_tests(data_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = Some(data_dir.to_path_buf());
    // Mock servers bind to 127.0.0.1.
    config.ssrf.block_private = false;
    // Keep retry latency out of the test clock.
    config.retry.base_backoff_ms = 20;
    config.retry.max_backoff_ms = 100;
    config.rate_limit.rps = 1_000.0;
    config.rate_limit.burst = 1_000;
    config
}

pub fn harness() -> TestHarness {
    harness_with(Capabilities::default(), |_| {})
}

pub fn harness_with(
    capabilities: Capabilities,
    tweak: impl FnOnce(&mut EngineConfig),
) -> TestHarness {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut config = config_for_tests(data_dir.path());
    tweak(&mut config);
    let config = Arc::new(config);
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config)).expect("pipeline"));
    let engine =
        Engine::with_pipeline(pipeline, Arc::clone(&config), capabilities).expect("engine");
    engine.start();
    TestHarness {
        engine,
        config,
        _data_dir: data_dir,
    }
}
