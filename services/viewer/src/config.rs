//! Configuration management for the viewer service.
//!
//! Configuration is layered: `config/default.toml`, then
//! `config/{RUN_MODE}.toml`, then `VIEWER_`-prefixed environment variables
//! with `__` as the section separator (e.g. `VIEWER_SERVER__BASE_URL`).

use crate::reconnect::ReconnectPolicy;
use crate::session::SessionOptions;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the viewer service.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    /// Vision server connection
    pub server: ServerConfig,

    /// Session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Overlay style
    #[serde(default)]
    pub render: RenderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Service-level settings
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Vision server connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// WebSocket base URL (e.g., "ws://vision:8000")
    pub base_url: String,

    /// Camera identifiers to view
    #[serde(default)]
    pub cameras: Vec<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Whether to listen on the notification side channel
    #[serde(default = "default_notifications")]
    pub notifications: bool,
}

/// Per-session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Reconnect strategy (fixed or exponential)
    #[serde(default = "default_reconnect_strategy")]
    pub reconnect_strategy: String,

    /// Delay before reconnecting in milliseconds (initial delay when exponential)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds (exponential only)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Backoff multiplier (exponential only)
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    /// Randomization factor applied to each delay (exponential only)
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,

    /// Frames allowed to wait for the renderer
    #[serde(default = "default_render_queue")]
    pub render_queue: usize,

    /// Capacity of each session's event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Overlay style for interaction boxes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenderConfig {
    /// Stroke width in pixels
    #[serde(default = "default_stroke_width")]
    pub stroke_width: u32,

    /// Dash pattern as on/off run lengths
    #[serde(default = "default_dash_pattern")]
    pub dash_pattern: Vec<u32>,

    /// Stroke colour as RGBA
    #[serde(default = "default_stroke_color")]
    pub stroke_color: [u8; 4],
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Interval between stats log lines in seconds
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

// Default value functions
fn default_connection_timeout() -> u64 {
    10
}
fn default_notifications() -> bool {
    true
}
fn default_reconnect_strategy() -> String {
    "fixed".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_reconnect_multiplier() -> f64 {
    2.0
}
fn default_reconnect_jitter() -> f64 {
    0.5
}
fn default_render_queue() -> usize {
    1
}
fn default_event_capacity() -> usize {
    64
}
fn default_stroke_width() -> u32 {
    3
}
fn default_dash_pattern() -> Vec<u32> {
    vec![6, 4]
}
fn default_stroke_color() -> [u8; 4] {
    [255, 59, 48, 255]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_health_interval() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_strategy: default_reconnect_strategy(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_jitter: default_reconnect_jitter(),
            render_queue: default_render_queue(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            stroke_width: default_stroke_width(),
            dash_pattern: default_dash_pattern(),
            stroke_color: default_stroke_color(),
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

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            metrics_port: None,
            health_interval_secs: default_health_interval(),
        }
    }
}

impl ViewerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with VIEWER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. VIEWER_SERVER__BASE_URL, VIEWER_SERVER__CAMERAS=cam-1,cam-2
            .add_source(Self::environment())
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(Self::environment()).build()?;
        config.try_deserialize()
    }

    fn environment() -> Environment {
        Environment::with_prefix("VIEWER")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("server.cameras")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "server.base_url".to_string(),
            ));
        }
        if !self.server.base_url.starts_with("ws://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.base_url".to_string(),
                message: "URL must start with ws://".to_string(),
            });
        }

        if let Some(bad) = self
            .server
            .cameras
            .iter()
            .find(|c| c.is_empty() || c.contains('/') || c.contains(char::is_whitespace))
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.cameras".to_string(),
                message: format!("Invalid camera id {bad:?}"),
            });
        }

        match self.session.reconnect_strategy.as_str() {
            "fixed" | "exponential" => {}
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "session.reconnect_strategy".to_string(),
                    message: format!("Unknown strategy {other:?}, expected fixed or exponential"),
                });
            }
        }

        if self.session.reconnect_delay_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "session.reconnect_delay_ms".to_string(),
                message: "Delay must be greater than 0".to_string(),
            });
        }

        if self.session.reconnect_strategy == "exponential" {
            if self.session.reconnect_max_delay_ms < self.session.reconnect_delay_ms {
                return Err(ConfigValidationError::InvalidValue {
                    field: "session.reconnect_max_delay_ms".to_string(),
                    message: "Maximum delay must not be below the initial delay".to_string(),
                });
            }
            if self.session.reconnect_multiplier < 1.0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "session.reconnect_multiplier".to_string(),
                    message: "Multiplier must be at least 1.0".to_string(),
                });
            }
            if !(0.0..=1.0).contains(&self.session.reconnect_jitter) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "session.reconnect_jitter".to_string(),
                    message: "Jitter must be between 0.0 and 1.0".to_string(),
                });
            }
        }

        if self.session.render_queue == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "session.render_queue".to_string(),
                message: "Queue size must be greater than 0".to_string(),
            });
        }

        if self.render.stroke_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "render.stroke_width".to_string(),
                message: "Stroke width must be greater than 0".to_string(),
            });
        }

        if self.service.health_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.health_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Options for every session built from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            reconnect: self.session.reconnect_policy(),
            render_queue: self.session.render_queue,
            event_capacity: self.session.event_capacity,
            render: self.render.clone(),
        }
    }
}

impl ServerConfig {
    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl SessionConfig {
    /// Get reconnect delay as Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Get maximum reconnect delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        if self.reconnect_strategy == "exponential" {
            ReconnectPolicy::Exponential {
                initial_delay: self.reconnect_delay(),
                max_delay: self.reconnect_max_delay(),
                multiplier: self.reconnect_multiplier,
                jitter: self.reconnect_jitter,
            }
        } else {
            ReconnectPolicy::Fixed {
                delay: self.reconnect_delay(),
            }
        }
    }
}

impl ServiceConfig {
    /// Get health log interval as Duration.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
