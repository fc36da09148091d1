use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::TransportConfig;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     region = "us-east"
//                    insecure_skip_verify = true
//
//   env var:         CLOUDBRIDGE_REGION=us-east
//                    CLOUDBRIDGE_TOKEN=...

pub const DEFAULT_REGION: &str = "eu-central";
pub const DEFAULT_DOMAIN: &str = "2gc.ru";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Log verbosity requested by configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Full relay URL; replaces the region-derived one when set.
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            token: None,
            region: default_region(),
            domain: default_domain(),
            relay_url: None,
            timeout_secs: default_timeout_secs(),
            log_level: LogLevel::default(),
            insecure_skip_verify: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}
fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}
fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY.as_millis() as u64
}
fn default_inbox_capacity() -> usize {
    DEFAULT_INBOX_CAPACITY
}

/// Build a figment that layers: defaults → TOML file (if given) → `CLOUDBRIDGE_*` env vars.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CLOUDBRIDGE_"))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Client configuration, passed explicitly to [`crate::Client::new`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub token: String,
    pub region: String,
    pub domain: String,
    pub relay_url: Option<String>,
    /// Upper bound on the relay handshake.
    pub timeout: Duration,
    pub log_level: LogLevel,
    pub insecure_skip_verify: bool,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Per-peer inbox size; overflowing it closes the peer connection.
    pub inbox_capacity: usize,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            region: default_region(),
            domain: default_domain(),
            relay_url: None,
            timeout: DEFAULT_TIMEOUT,
            log_level: LogLevel::default(),
            insecure_skip_verify: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            token: fc.token.clone().unwrap_or_default(),
            region: fc.region.clone(),
            domain: fc.domain.clone(),
            relay_url: fc.relay_url.clone().filter(|url| !url.is_empty()),
            timeout: Duration::from_secs(fc.timeout_secs),
            log_level: fc.log_level,
            insecure_skip_verify: fc.insecure_skip_verify,
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            inbox_capacity: fc.inbox_capacity,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// `wss://relay.<region>.<domain>/v1/connect`, unless overridden.
    pub fn endpoint(&self) -> String {
        match &self.relay_url {
            Some(url) => url.clone(),
            None => format!("wss://relay.{}.{}/v1/connect", self.region, self.domain),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.relay_url.is_none() && self.region.trim().is_empty() {
            return Err(ConfigError::Invalid("region must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".into()));
        }
        if self.inbox_capacity == 0 {
            return Err(ConfigError::Invalid("inbox_capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.endpoint(),
            token: self.token.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            connect_timeout: self.timeout,
            reconnect_delay: self.reconnect_delay,
        }
    }
}
