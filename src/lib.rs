//! # insight
//!
//! A small event counter service:
//! - Clients report that an event of a given `(app, type)` pair happened
//! - Each pair keeps a durable, increment-only total in an embedded store
//! - Totals are exposed on a Prometheus scrape endpoint
//!
//! ## Architecture
//!
//! ```text
//!   POST /add ──► CounterStore::increment ──► Backend (one write txn, synced)
//!                        │
//!                        └──(after commit)──► CounterMirror ◄── GET /metrics
//!
//!   startup:  Backend scan ──► Bootstrapper ──► CounterMirror (totals, once)
//! ```
//!
//! The store is the source of truth; the mirror is rebuilt from it on every
//! start before any request is accepted.
//!
//! ## Usage
//!
//! ```bash
//! insight serve --http-addr 0.0.0.0:8080 --db ./insight.db
//!
//! curl -X POST localhost:8080/add -d '{"type": "start", "app": "svc"}'
//! curl localhost:8080/metrics
//!
//! # Offline listing of every stored total
//! insight dump --db ./insight.db --json
//! ```

pub mod common;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use common::{Config, CounterMirror, Error, ErrorKind, Result};
pub use service::InsightServer;
pub use store::{Backend, Bootstrapper, CounterStore, CounterTotal};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
