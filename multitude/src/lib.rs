//! Multi-tenant scrape proxy.
//!
//! A single HTTP endpoint accepts scrape requests naming a database target
//! (`/metrics?target=10.0.0.1:27017`). The proxy builds one exporter per target
//! on first use, keeps it in a concurrent cache, and hands every later scrape of
//! that target to the same exporter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  HTTP Request   │────>│ Target Resolver │────>│   Dispatcher    │
//! │ (?target=host)  │     │  (TargetId)     │     │                 │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//!                         ┌─────────────────┐     ┌────────▼────────┐
//!                         │ ExporterFactory │<────│  ExporterCache  │
//!                         │  (on miss only) │     │ (get-or-create) │
//!                         └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! Run the proxy binary with a configuration file:
//!
//! ```bash
//! multitude --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ProxyConfig`] for configuration options.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exporter;
pub mod http;
pub mod probe;
pub mod target;

pub use cache::{CacheStats, EvictionPolicy, ExporterCache, ExporterEntry, SharedCache};
pub use config::ProxyConfig;
pub use dispatch::Dispatcher;
pub use error::{ProxyError, Result};
pub use exporter::{ConstructionError, Exporter, ExporterFactory, ExporterOptions};
pub use http::HttpServer;
pub use probe::{ProbeExporter, ProbeExporterFactory};
pub use target::{TargetId, TargetResolver};
