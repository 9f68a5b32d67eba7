//! Region Topology
//!
//! Decides whether this node may write, and if not, where writes belong.
//! The answer is derived from the region configuration on every call; the
//! platform is trusted completely, so there is no election, heartbeat or
//! split-brain detection here.

use serde::Serialize;

use crate::config::RegionConfig;

/// Response header that asks the edge proxy to replay the request elsewhere
pub const REPLAY_HEADER: &str = "fly-replay";

/// Role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    /// Node accepts writes
    Primary,
    /// Node serves reads and hands writes off to the primary region
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Replica => write!(f, "REPLICA"),
        }
    }
}

/// Where a write request should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRoute {
    /// Apply the write on this node
    Local,
    /// Ask the edge proxy to replay the request in another region
    Replay { region: String },
}

impl WriteRoute {
    /// Value of the replay header for this route, if one is needed
    pub fn replay_header_value(&self) -> Option<String> {
        match self {
            WriteRoute::Local => None,
            WriteRoute::Replay { region } => Some(format!("region={}", region)),
        }
    }
}

/// Topology resolver for a single node
#[derive(Debug, Clone)]
pub struct Topology {
    region: RegionConfig,
}

impl Topology {
    /// Create a resolver over validated region configuration
    pub fn new(region: RegionConfig) -> Self {
        Self { region }
    }

    /// Check if this node is the primary
    pub fn is_primary(&self) -> bool {
        self.region.current_region == self.region.primary_region
    }

    /// Get the primary region
    pub fn primary_region(&self) -> &str {
        &self.region.primary_region
    }

    /// Get the region this node runs in
    pub fn current_region(&self) -> &str {
        &self.region.current_region
    }

    /// Get the application name
    pub fn app_name(&self) -> &str {
        &self.region.app_name
    }

    /// Get the role of this node
    pub fn role(&self) -> NodeRole {
        if self.is_primary() {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        }
    }

    /// Decide where a write should go
    pub fn route_write(&self) -> WriteRoute {
        if self.is_primary() {
            WriteRoute::Local
        } else {
            WriteRoute::Replay {
                region: self.region.primary_region.clone(),
            }
        }
    }
}
