//! MCP Proxy Router Library
//!
//! Aggregating Model Context Protocol (MCP) proxy that multiplexes a single
//! upstream MCP endpoint over many downstream MCP servers, keeping only a
//! bounded number of them live under an LRU admission policy.
//!
//! # Features
//!
//! - **Aggregation**: the union of tools/prompts/resources from all live
//!   backends exposed as one MCP endpoint with per-item routing
//! - **Bounded live set**: at most K backends materialized at once; the rest
//!   of the catalog stays cold until a call or `add_new_mcp` admits them
//! - **Dynamic discovery**: built-in `search_mcps` over a durable catalog
//!   with vector embeddings and a keyword fallback
//! - **Streaming**: `tools/list_changed` notifications pushed to the
//!   connected client over a long-lived SSE stream
//! - **Multi-Transport**: stdio, SSE, and Streamable HTTP backends

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod active_set;
pub mod adder;
pub mod cli;
pub mod client;
pub mod config;
pub mod config_store;
pub mod dispatch;
pub mod embeddings;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
