//! mcp-forge: one stable MCP endpoint in front of many child tool providers.
//!
//! The broker keeps a durable registry of providers, talks to each of them
//! over stdio or HTTP on demand, scaffolds and builds new managed providers,
//! and records every provider-touching operation in an append-only audit log.
//!
//! ```text
//!   agent ──▶ channels (stdio | http) ──▶ tools ──▶ Broker
//!                                                    │
//!        ┌──────────────┬──────────────┬─────────────┼──────────────┐
//!        ▼              ▼              ▼             ▼              ▼
//!    registry       transport      scaffold        build          audit
//!                (process|network)              (sandbox/docker)
//! ```

pub mod audit;
pub mod broker;
pub mod build;
pub mod channels;
pub mod config;
pub mod error;
pub mod registry;
pub mod safety;
pub mod sandbox;
pub mod scaffold;
pub mod tools;
pub mod transport;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorKind};
