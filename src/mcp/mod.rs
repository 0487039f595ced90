//! MCP tool surface
//!
//! Argument schemas, the credit ledger, the engine that dispatches
//! validated tool calls onto the core subsystems, and the rmcp stdio
//! server.

pub mod args;
pub mod credits;
pub mod engine;
pub mod server;

pub use credits::{Charge, CreditLedger};
pub use engine::Engine;
pub use server::{HarvestServer, serve_stdio};
