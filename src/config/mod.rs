use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_INTERVAL_SECS: i64 = 180;
pub const DEFAULT_CITY_CODE: &str = "99999";
pub const DEFAULT_STATE_DIR: &str = "monitor_state";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub showstart: ShowstartConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream API endpoint and the session material captured from a logged-in client.
#[derive(Debug, Clone, Deserialize)]
pub struct ShowstartConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Signing secret - loaded from env SHOWSTART_SIGN
    #[serde(default)]
    pub sign: String,
    /// Session token - loaded from env SHOWSTART_TOKEN
    #[serde(default)]
    pub token: String,
    /// Raw cookie header - loaded from env SHOWSTART_COOKIE
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub st_flpv: String,
    #[serde(default)]
    pub cusid: String,
    #[serde(default)]
    pub cusname: String,
    #[serde(default)]
    pub cversion: String,
    #[serde(default)]
    pub cterminal: String,
    #[serde(default)]
    pub cdeviceinfo: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_city_code")]
    pub city_code: String,
    /// Poll interval. Zero or negative falls back to 180s.
    #[serde(default = "default_interval")]
    pub interval_seconds: i64,
    /// Comma-separated notification endpoints.
    #[serde(default)]
    pub webhook_url: String,
    /// Comma-separated operator alert endpoints.
    #[serde(default)]
    pub alert_webhook_url: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Also notify when a matching activity first becomes visible.
    #[serde(default)]
    pub notify_new_events: bool,
    #[serde(default = "default_detail_base_url")]
    pub detail_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_base_url() -> String {
    "https://wap.showstart.com/v3".to_string()
}
fn default_detail_base_url() -> String {
    "https://wap.showstart.com/pages/activity/detail/detail".to_string()
}
fn default_city_code() -> String {
    DEFAULT_CITY_CODE.to_string()
}
fn default_interval() -> i64 {
    DEFAULT_INTERVAL_SECS
}
fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ShowstartConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            sign: String::new(),
            token: String::new(),
            cookie: String::new(),
            st_flpv: String::new(),
            cusid: String::new(),
            cusname: String::new(),
            cversion: String::new(),
            cterminal: String::new(),
            cdeviceinfo: String::new(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable: true,
            keywords: Vec::new(),
            city_code: default_city_code(),
            interval_seconds: default_interval(),
            webhook_url: String::new(),
            alert_webhook_url: String::new(),
            state_dir: default_state_dir(),
            notify_new_events: false,
            detail_base_url: default_detail_base_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl MonitorConfig {
    /// Effective poll interval in seconds, never zero.
    pub fn interval_secs(&self) -> u64 {
        if self.interval_seconds <= 0 {
            DEFAULT_INTERVAL_SECS as u64
        } else {
            self.interval_seconds as u64
        }
    }
}

impl Config {
    /// Load config from a TOML file, overlay secrets from the environment, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;

        // Secrets may live outside the config file
        if let Ok(sign) = std::env::var("SHOWSTART_SIGN") {
            config.showstart.sign = sign;
        }
        if let Ok(token) = std::env::var("SHOWSTART_TOKEN") {
            config.showstart.token = token;
        }
        if let Ok(cookie) = std::env::var("SHOWSTART_COOKIE") {
            config.showstart.cookie = cookie;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment or validating.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Build a config from environment variables only (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).unwrap_or_default();

        let mut config = Config {
            showstart: ShowstartConfig {
                base_url: std::env::var("SHOWSTART_BASE_URL")
                    .unwrap_or_else(|_| default_base_url()),
                sign: env("SHOWSTART_SIGN"),
                token: env("SHOWSTART_TOKEN"),
                cookie: env("SHOWSTART_COOKIE"),
                st_flpv: env("SHOWSTART_ST_FLPV"),
                cusid: env("SHOWSTART_CUSID"),
                cusname: env("SHOWSTART_CUSNAME"),
                cversion: env("SHOWSTART_CVERSION"),
                cterminal: env("SHOWSTART_CTERMINAL"),
                cdeviceinfo: env("SHOWSTART_CDEVICEINFO"),
            },
            monitor: MonitorConfig {
                keywords: env("MONITOR_KEYWORDS")
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect(),
                city_code: std::env::var("MONITOR_CITY_CODE")
                    .unwrap_or_else(|_| default_city_code()),
                interval_seconds: std::env::var("MONITOR_INTERVAL_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_interval),
                webhook_url: env("MONITOR_WEBHOOK_URL"),
                alert_webhook_url: env("MONITOR_ALERT_WEBHOOK_URL"),
                state_dir: std::env::var("MONITOR_STATE_DIR")
                    .unwrap_or_else(|_| default_state_dir()),
                ..MonitorConfig::default()
            },
            logging: LoggingConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable combinations and fill in defaults for values that are
    /// present but empty.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let monitor = &mut self.monitor;
        if !monitor.enable {
            return Err(ConfigError::Invalid("monitor is disabled".to_string()));
        }

        monitor.keywords = monitor
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if monitor.keywords.is_empty() {
            return Err(ConfigError::Invalid("monitor.keywords is empty".to_string()));
        }

        if monitor.interval_seconds <= 0 {
            monitor.interval_seconds = DEFAULT_INTERVAL_SECS;
        }
        if monitor.city_code.trim().is_empty() {
            monitor.city_code = default_city_code();
        }
        if monitor.state_dir.trim().is_empty() {
            monitor.state_dir = default_state_dir();
        }
        if monitor.webhook_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "monitor.webhook_url is required".to_string(),
            ));
        }

        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.showstart.sign.is_empty() && !self.showstart.token.is_empty()
    }
}
