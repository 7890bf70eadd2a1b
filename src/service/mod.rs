//! HTTP service around the counter store
//!
//! The server opens the store, reconciles the metrics mirror, and only then
//! starts accepting requests on the ingestion and scrape endpoints.

pub mod http;
pub mod server;

pub use http::{create_router, AddRequest, AddResponse, AppState};
pub use server::{shutdown_signal, InsightServer};
