//! RegionDB Configuration
//!
//! Node configuration is assembled once at startup from command line flags
//! and the region environment, validated, and then passed by reference into
//! the components that need it. Nothing here is re-read per request.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming the application
pub const APP_NAME_ENV: &str = "FLY_APP_NAME";

/// Environment variable naming the region this node runs in
pub const REGION_ENV: &str = "FLY_REGION";

/// Environment variable naming the region that holds the writable primary
pub const PRIMARY_REGION_ENV: &str = "FLY_PRIMARY_REGION";

/// Main RegionDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Record store configuration
    pub database: DatabaseConfig,

    /// Region topology
    pub region: RegionConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite data source name (file path or `file:` URI)
    pub dsn: String,

    /// How long a statement waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Upper bound on concurrently open read connections
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,

    /// How long a request waits to obtain a connection, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Region topology, as provided by the hosting platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Application name
    pub app_name: String,

    /// Region this node runs in
    pub current_region: String,

    /// Region of the primary node
    pub primary_region: String,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP bind address; a leading `:` binds all interfaces
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Upper bound on a single request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_readers() -> u32 {
    8
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_api_address() -> String {
    ":8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl DatabaseConfig {
    /// Create a database configuration with default tuning
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_readers: default_max_readers(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    /// Validate the database configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.dsn.is_empty() {
            return Err(crate::Error::Config("flag required: --dsn DSN".into()));
        }
        if self.max_readers == 0 {
            return Err(crate::Error::Config("database.max_readers must be positive".into()));
        }
        Ok(())
    }

    /// Get busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RegionConfig {
    /// Read the region topology from the process environment
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the region topology through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            app_name: lookup(APP_NAME_ENV).unwrap_or_default(),
            current_region: lookup(REGION_ENV).unwrap_or_default(),
            primary_region: lookup(PRIMARY_REGION_ENV).unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the region topology
    pub fn validate(&self) -> crate::Result<()> {
        let required = [
            (APP_NAME_ENV, &self.app_name),
            (REGION_ENV, &self.current_region),
            (PRIMARY_REGION_ENV, &self.primary_region),
        ];

        for (name, value) in required {
            if value.is_empty() {
                return Err(crate::Error::Config(format!("{} must be set", name)));
            }
        }

        // Echoed back in the replay header, so it must be a valid header value.
        if !self.primary_region.chars().all(is_header_char) {
            return Err(crate::Error::Config(format!(
                "{} contains characters not allowed in a header: {:?}",
                PRIMARY_REGION_ENV, self.primary_region
            )));
        }

        Ok(())
    }
}

fn is_header_char(c: char) -> bool {
    c == '\t' || (' '..='~').contains(&c)
}

impl ApiConfig {
    /// Address in a form the socket layer accepts
    pub fn listen_address(&self) -> String {
        if self.bind_address.starts_with(':') {
            format!("0.0.0.0{}", self.bind_address)
        } else {
            self.bind_address.clone()
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl NodeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.database.validate()?;

        if self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(crate::Error::Config("api.request_timeout_secs must be positive".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or json, got {}",
                    other
                )))
            }
        }

        self.region.validate()
    }
}
