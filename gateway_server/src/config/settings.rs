//! Settings loaded from a TOML file with `GATEWAY_`-prefixed environment
//! overrides, the way the teacher's own `config/settings.rs` builds its
//! `Settings` struct — expanded here to the PLC/import/output/server
//! sections an Ensemble actually needs to `deploy()`.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_modbus_port() -> u16 {
    502
}

fn default_opcua_port() -> u16 {
    4840
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlcConfig {
    Modbus {
        key: String,
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default)]
        unit_id: u8,
        poll_interval_ms: u64,
        #[serde(default = "default_retry_attempts")]
        connect_retry_attempts: u32,
        #[serde(default = "default_retry_delay_ms")]
        connect_retry_delay_ms: u64,
        #[serde(default = "default_retry_backoff")]
        connect_retry_backoff: f64,
    },
    Opcua {
        key: String,
        host: String,
        #[serde(default = "default_opcua_port")]
        port: u16,
        #[serde(default)]
        publishing_interval_ms: f64,
        poll_interval_ms: u64,
    },
    Database {
        key: String,
        dsn: String,
        poll_interval_ms: u64,
    },
}

impl PlcConfig {
    pub fn key(&self) -> &str {
        match self {
            PlcConfig::Modbus { key, .. } => key,
            PlcConfig::Opcua { key, .. } => key,
            PlcConfig::Database { key, .. } => key,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        let ms = match self {
            PlcConfig::Modbus { poll_interval_ms, .. } => *poll_interval_ms,
            PlcConfig::Opcua { poll_interval_ms, .. } => *poll_interval_ms,
            PlcConfig::Database { poll_interval_ms, .. } => *poll_interval_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TagImportConfig {
    pub filename: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_quotechar")]
    pub quotechar: char,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlarmImportConfig {
    pub filename: String,
    #[serde(default = "default_alarmgroup")]
    pub alarmgroup: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_quotechar")]
    pub quotechar: char,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_delimiter() -> char {
    ';'
}

fn default_quotechar() -> char {
    '"'
}

fn default_encoding() -> String {
    "utf8".to_string()
}

fn default_alarmgroup() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    Log {
        alarmgroup: String,
    },
    File {
        alarmgroup: String,
        path: String,
    },
    Database {
        alarmgroup: String,
        dsn: String,
        table: String,
    },
    Mail {
        alarmgroup: String,
        smtp_host: String,
        smtp_port: u16,
        username: String,
        password: String,
        from: String,
        to: String,
    },
}

fn default_http_port() -> u16 {
    80
}

fn default_ws_port() -> u16 {
    8081
}

fn default_relative_path() -> String {
    "./public".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_relative_path")]
    pub relative_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_port: default_http_port(),
            ws_port: default_ws_port(),
            relative_path: default_relative_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub plcs: Vec<PlcConfig>,
    #[serde(default)]
    pub tag_import: Vec<TagImportConfig>,
    #[serde(default)]
    pub alarm_import: Vec<AlarmImportConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Settings {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(config_path))
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
