//! # Configuration Management
//!
//! Centralized configuration for endpoints and the connections they own.
//!
//! Every policy constant of the protocol (datagram size, retry budgets, timeouts,
//! reassembly limits, send pacing) lives here with a documented default rather than
//! being hardcoded in the state machines.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`UDPC_*`)
//! - Direct instantiation with defaults, optionally through `default_with_overrides()`
//!
//! ## Security Considerations
//! - The default datagram size (1200 bytes) stays below common path MTUs
//! - Reassembly is bounded by both age and a per-connection byte budget
//! - `AuthPolicy::Strict` refuses peers that present no identity key

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default protocol identifier; peers with a different id cannot connect.
pub const DEFAULT_PROTOCOL_ID: u32 = 0x50F0_4948;

/// Largest datagram the protocol will ever produce or accept
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Smallest configurable datagram size; must fit a handshake response
pub const MIN_DATAGRAM_SIZE: usize = 256;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct UdpcConfig {
    /// Socket and connection-table settings
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Sequencing, acknowledgement, retransmission and timeout settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Fragmentation and reassembly limits
    #[serde(default)]
    pub fragmentation: FragmentationConfig,

    /// Handshake and peer authentication settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UdpcConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("UDPC_ADDRESS") {
            config.endpoint.address = addr;
        }

        if let Ok(id) = std::env::var("UDPC_PROTOCOL_ID") {
            let parsed = match id.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => id.parse::<u32>(),
            };
            config.endpoint.protocol_id = parsed.map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid UDPC_PROTOCOL_ID '{id}': {e}"))
            })?;
        }

        if let Ok(size) = std::env::var("UDPC_MAX_DATAGRAM_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.reliability.max_datagram_size = val;
            }
        }

        if let Ok(timeout) = std::env::var("UDPC_INACTIVITY_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.reliability.inactivity_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(heartbeat) = std::env::var("UDPC_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.reliability.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(tick) = std::env::var("UDPC_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.endpoint.tick_interval = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.endpoint.validate());
        errors.extend(self.reliability.validate());
        errors.extend(self.fragmentation.validate(&self.reliability));
        errors.extend(self.security.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Endpoint (connection manager) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Local bind address (e.g., "0.0.0.0:9000")
    pub address: String,

    /// Protocol identifier exchanged during the handshake
    pub protocol_id: u32,

    /// Whether handshake requests from unknown peers are answered
    pub accept_new_connections: bool,

    /// Maximum number of live connections
    pub max_connections: usize,

    /// Interval of the periodic tick driving timers
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Whether connection events are recorded for the application
    pub events_enabled: bool,

    /// Maximum number of messages queued per connection awaiting transmission
    pub max_send_queue: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:0"),
            protocol_id: DEFAULT_PROTOCOL_ID,
            accept_new_connections: true,
            max_connections: 1000,
            tick_interval: Duration::from_millis(8),
            events_enabled: true,
            max_send_queue: 256,
        }
    }
}

impl EndpointConfig {
    /// Validate endpoint configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Endpoint address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid endpoint address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.tick_interval.as_millis() < 1 {
            errors.push("Tick interval too short (minimum: 1ms)".to_string());
        } else if self.tick_interval.as_millis() > 333 {
            errors.push("Tick interval too long (maximum: 333ms)".to_string());
        }

        if self.max_send_queue == 0 {
            errors.push("Send queue limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Reliability engine and connection lifecycle configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReliabilityConfig {
    /// Largest datagram sent on the wire, header and tag included
    pub max_datagram_size: usize,

    /// An idle connection sends an ack-only keepalive after this long
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Initial retransmission timeout, doubled on every retry
    #[serde(with = "duration_serde")]
    pub retransmit_timeout: Duration,

    /// Upper bound for the backed-off retransmission timeout
    #[serde(with = "duration_serde")]
    pub max_retransmit_timeout: Duration,

    /// Retransmissions allowed per datagram before the connection fails
    pub max_retries: u32,

    /// A connection that receives nothing for this long fails
    #[serde(with = "duration_serde")]
    pub inactivity_timeout: Duration,

    /// Interval between handshake retransmissions
    #[serde(with = "duration_serde")]
    pub handshake_retry_interval: Duration,

    /// Handshake retransmissions before giving up
    pub handshake_max_retries: u32,

    /// How long a disconnecting connection may drain its reliable queue
    #[serde(with = "duration_serde")]
    pub disconnect_drain_timeout: Duration,

    /// Round-trip time at or below which the link counts as good
    #[serde(with = "duration_serde")]
    pub good_rtt_limit: Duration,

    /// Flush interval while in good mode
    #[serde(with = "duration_serde")]
    pub good_send_interval: Duration,

    /// Flush interval while in bad mode
    #[serde(with = "duration_serde")]
    pub bad_send_interval: Duration,

    /// Datagrams emitted per flush in good mode
    pub good_mode_burst: usize,

    /// Datagrams emitted per flush in bad mode
    pub bad_mode_burst: usize,

    /// Initial time a connection must show good RTT before leaving bad mode
    #[serde(with = "duration_serde")]
    pub mode_toggle_period: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: 1200,
            heartbeat_interval: Duration::from_millis(150),
            retransmit_timeout: Duration::from_secs(1),
            max_retransmit_timeout: Duration::from_secs(8),
            max_retries: 10,
            inactivity_timeout: Duration::from_secs(10),
            handshake_retry_interval: Duration::from_millis(500),
            handshake_max_retries: 10,
            disconnect_drain_timeout: Duration::from_secs(1),
            good_rtt_limit: Duration::from_millis(250),
            good_send_interval: Duration::from_millis(33),
            bad_send_interval: Duration::from_millis(100),
            good_mode_burst: 64,
            bad_mode_burst: 16,
            mode_toggle_period: Duration::from_secs(30),
        }
    }
}

impl ReliabilityConfig {
    /// Time from the first transmission of a reliable datagram until the retransmission
    /// that would exceed `max_retries` falls due.
    pub fn retransmission_span(&self) -> Duration {
        let mut span = Duration::ZERO;
        let mut timeout = self.retransmit_timeout;
        let mut attempts = self.max_retries.saturating_add(1);
        while attempts > 0 && !timeout.is_zero() && timeout < self.max_retransmit_timeout {
            span = span.saturating_add(timeout);
            timeout = timeout.saturating_mul(2).min(self.max_retransmit_timeout);
            attempts -= 1;
        }
        span.saturating_add(self.max_retransmit_timeout.saturating_mul(attempts))
    }

    /// Validate reliability configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_datagram_size < MIN_DATAGRAM_SIZE {
            errors.push(format!(
                "Max datagram size too small: {} (minimum: {MIN_DATAGRAM_SIZE})",
                self.max_datagram_size
            ));
        } else if self.max_datagram_size > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Max datagram size too large: {} (maximum: {MAX_DATAGRAM_SIZE})",
                self.max_datagram_size
            ));
        }

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        }

        if self.heartbeat_interval >= self.inactivity_timeout {
            errors.push("Heartbeat interval must be shorter than inactivity timeout".to_string());
        }

        if self.retransmit_timeout.as_millis() < 10 {
            errors.push("Retransmit timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_retransmit_timeout < self.retransmit_timeout {
            errors.push(
                "Max retransmit timeout cannot be shorter than retransmit timeout".to_string(),
            );
        }

        if self.max_retries == 0 {
            errors.push("Max retries must be greater than 0".to_string());
        }

        if self.inactivity_timeout.as_millis() < 100 {
            errors.push("Inactivity timeout too short (minimum: 100ms)".to_string());
        } else if self.inactivity_timeout.as_secs() > 3600 {
            errors.push("Inactivity timeout too long (maximum: 1 hour)".to_string());
        }

        if self.handshake_retry_interval.as_millis() < 10 {
            errors.push("Handshake retry interval too short (minimum: 10ms)".to_string());
        }

        if self.good_mode_burst == 0 || self.bad_mode_burst == 0 {
            errors.push("Send bursts must be greater than 0".to_string());
        }

        if self.bad_send_interval < self.good_send_interval {
            errors.push("Bad mode must not send faster than good mode".to_string());
        }

        if self.mode_toggle_period.as_millis() < 1000 {
            errors.push("Mode toggle period too short (minimum: 1s)".to_string());
        }

        errors
    }
}

/// Fragmentation and reassembly configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FragmentationConfig {
    /// Largest application message accepted for sending or reassembly
    pub max_message_size: usize,

    /// Unreliable partial messages older than this are discarded. Reliable partial
    /// messages are discarded after this long without a new fragment, but never before
    /// the peer's retransmission schedule could have run out.
    #[serde(with = "duration_serde")]
    pub reassembly_timeout: Duration,

    /// Bytes of reliable-channel fragments buffered per connection. Senders also keep
    /// their unacknowledged reliable messages within this many bytes.
    pub reassembly_budget: usize,

    /// Bytes of unreliable-channel fragments buffered per connection
    pub unreliable_reassembly_budget: usize,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            max_message_size: 256 * 1024,
            reassembly_timeout: Duration::from_secs(5),
            reassembly_budget: 1024 * 1024,
            unreliable_reassembly_budget: 512 * 1024,
        }
    }
}

impl FragmentationConfig {
    /// Validate fragmentation configuration against the datagram size in use
    pub fn validate(&self, reliability: &ReliabilityConfig) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        }

        let capacity = crate::protocol::fragment::fragment_capacity(reliability.max_datagram_size);
        if capacity > 0 && self.max_message_size > capacity * usize::from(u16::MAX) {
            errors.push(format!(
                "Max message size {} needs more than {} fragments",
                self.max_message_size,
                u16::MAX
            ));
        }

        if self.reassembly_budget < self.max_message_size {
            errors.push("Reassembly budget cannot be smaller than max message size".to_string());
        }

        if self.unreliable_reassembly_budget < self.max_message_size {
            errors.push(
                "Unreliable reassembly budget cannot be smaller than max message size".to_string(),
            );
        }

        if self.reassembly_timeout.as_millis() < 100 {
            errors.push("Reassembly timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// How peers without an identity key are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthPolicy {
    /// Peers are accepted whether or not they present an identity
    #[default]
    Fallback,
    /// Only peers presenting a valid identity signature are accepted
    Strict,
}

/// Handshake and authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Policy for peers that present no identity key
    pub auth_policy: AuthPolicy,

    /// Maximum age of a handshake request timestamp
    #[serde(with = "duration_serde")]
    pub handshake_max_age: Duration,

    /// Lifetime of remembered handshake nonces
    #[serde(with = "duration_serde")]
    pub replay_cache_ttl: Duration,

    /// Maximum remembered handshake nonces
    pub replay_cache_entries: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_policy: AuthPolicy::Fallback,
            handshake_max_age: Duration::from_secs(30),
            replay_cache_ttl: Duration::from_secs(300),
            replay_cache_entries: 10_000,
        }
    }
}

impl SecurityConfig {
    /// Validate security configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.handshake_max_age.as_secs() < 1 {
            errors.push("Handshake max age too short (minimum: 1s)".to_string());
        }

        if self.replay_cache_ttl < self.handshake_max_age {
            errors.push("Replay cache TTL must cover the handshake max age".to_string());
        }

        if self.replay_cache_entries == 0 {
            errors.push("Replay cache must hold at least one entry".to_string());
        }

        errors
    }
}

/// Where and how log records are written. Installed by
/// [`init_logging`](crate::utils::logging::init_logging).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Reported in the startup record.
    pub app_name: String,

    /// Default filter level when `RUST_LOG` is unset.
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,
    pub log_to_file: bool,
    /// Appended to, created if missing. Required when `log_to_file` is set.
    pub log_file_path: Option<PathBuf>,

    /// One JSON object per record instead of human-readable lines.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("udpc"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.app_name.len() {
            0 => errors.push("Application name cannot be empty".to_string()),
            len if len > 64 => {
                errors.push(format!("Application name too long: {len} characters (maximum: 64)"))
            }
            _ => {}
        }

        match (&self.log_file_path, self.log_to_file) {
            (None, true) => {
                errors.push("log_file_path must be specified when log_to_file is true".to_string())
            }
            (Some(path), true) => {
                let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
                if let Some(dir) = parent.filter(|p| !p.exists()) {
                    errors.push(format!("Log file directory does not exist: {}", dir.display()));
                }
            }
            _ => {}
        }

        if !(self.log_to_console || self.log_to_file) {
            errors.push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
