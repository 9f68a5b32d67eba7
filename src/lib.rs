//! RegionDB - Multi-Region Record Service
//!
//! A small HTTP record service that runs in every region of a deployment on
//! top of a replicated SQLite file. Exactly one region is the primary and
//! accepts writes; every other node opens the database read-only, serves
//! reads locally, and answers writes with a `fly-replay` header that tells
//! the edge proxy to re-run the request in the primary region.
//!
//! # Architecture
//!
//! - [`topology`] derives the node role from the region environment
//! - [`store`] holds the append-only record table behind [`store::RecordStore`]
//! - [`api`] serves `GET /` and `POST /` and applies the write routing rule
//!
//! There is no election or failover: the platform decides which region is
//! primary, and a restart picks up any change.

pub mod api;
pub mod config;
pub mod error;
pub mod store;
pub mod topology;

pub use config::NodeConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::HttpServer;
    pub use crate::config::{NodeConfig, RegionConfig};
    pub use crate::error::{Error, Result};
    pub use crate::store::{Record, RecordStore, SqliteStore, StoreMode};
    pub use crate::topology::{NodeRole, Topology, WriteRoute};
}
