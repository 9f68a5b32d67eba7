//! HTTP API Module
//!
//! Provides the record resource and the primary write hand-off.

mod http;

pub use http::{create_router, AppState, HttpServer, NO_RECORDS_MESSAGE};
