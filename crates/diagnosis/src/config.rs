//! Configuration accessor and the typed diagnosis settings derived from it.
//!
//! Keys live under the `runtime.diagnosis.*` namespace. When loaded from the
//! environment, `runtime.diagnosis.http.address` is read from
//! `RUNTIME_DIAGNOSIS_HTTP_ADDRESS`.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const KEY_ENABLE: &str = "runtime.diagnosis.enable";
pub const KEY_MODE: &str = "runtime.diagnosis.mode";
pub const KEY_HTTP_ADDRESS: &str = "runtime.diagnosis.http.address";
pub const KEY_HTTP_WRITE_TIMEOUT: &str = "runtime.diagnosis.http.timeout.write";

pub const DEFAULT_HTTP_ADDRESS: &str = ":7070";
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

const ENV_PREFIX: &str = "RUNTIME_DIAGNOSIS_";

/// Flat key/value configuration with typed-default lookups.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every `RUNTIME_DIAGNOSIS_*` environment variable.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let values = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .map(|(name, value)| (name.to_lowercase().replace('_', "."), value))
            .collect();
        Self { values }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn bool_default(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "1" || v == "yes" || v == "on" => true,
            Some(v) if v == "false" || v == "0" || v == "no" || v == "off" => false,
            _ => default,
        }
    }

    pub fn string_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }
}

/// How collected diagnosis data leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http,
    File,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Http => "http",
            Mode::File => "file",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings read once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisConfig {
    pub mode: Mode,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub address: String,
    /// Bounds every response: streamed bodies end this long after the request
    /// arrived, and a socket write stalled this long drops the connection.
    pub write_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_HTTP_ADDRESS.to_string(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl DiagnosisConfig {
    /// Returns `Ok(None)` when diagnosis is disabled.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>, ConfigError> {
        if !cfg.bool_default(KEY_ENABLE, false) {
            return Ok(None);
        }

        let mode = cfg.string_default(KEY_MODE, "");
        let mode = match mode.trim().to_lowercase().as_str() {
            "" => return Err(ConfigError::MissingMode),
            "http" => Mode::Http,
            "file" => Mode::File,
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        };

        let write_timeout = humantime::parse_duration(
            cfg.string_default(KEY_HTTP_WRITE_TIMEOUT, "2m").trim(),
        )
        .unwrap_or(DEFAULT_WRITE_TIMEOUT);

        Ok(Some(Self {
            mode,
            http: HttpSettings {
                address: cfg.string_default(KEY_HTTP_ADDRESS, DEFAULT_HTTP_ADDRESS),
                write_timeout,
            },
        }))
    }
}

/// Expands the `:port` shorthand to all interfaces.
pub(crate) fn listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}
