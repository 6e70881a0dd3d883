//! Startup configuration.
//!
//! Read once when the process starts and immutable afterwards. The file format
//! is TOML with PascalCase sections and keys:
//!
//! ```toml
//! [Server]
//! Address = "0.0.0.0:3000"
//! Environment = "Development"
//!
//! [RateLimit]
//! MaxRequestsPerWindow = 100
//! WindowSizeMinutes = 1
//!
//! [RequestValidation]
//! MaxContentLengthBytes = 10485760
//! ValidateContentType = true
//! ValidateJsonFormat = true
//! ValidateHeaders = true
//! ```
//!
//! Every key is optional. Missing keys fall back to the defaults above, with
//! `Environment` defaulting to `Production`.

use std::path::Path;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::error::Error;

/// Whether error responses may carry diagnostic detail.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum RunMode {
    Development,
    #[default]
    Production,
}

impl RunMode {
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

impl std::str::FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(Error::Config(format!("unknown environment `{other}`"))),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub request_validation: ValidationConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub address: String,
    pub environment: RunMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:3000".to_owned(),
            environment: RunMode::Production,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateLimitConfig {
    pub max_requests_per_window: u32,
    pub window_size_minutes: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests_per_window: 100, window_size_minutes: 1 }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.window_size_minutes))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ValidationConfig {
    pub max_content_length_bytes: u64,
    pub validate_content_type: bool,
    pub validate_json_format: bool,
    pub validate_headers: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_content_length_bytes: 10 * 1024 * 1024,
            validate_content_type: true,
            validate_json_format: true,
            validate_headers: true,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Loads from the process environment.
    ///
    /// `PORTICO_CONFIG` names a TOML file (defaults are used when unset);
    /// `PORTICO_ENV` and `PORTICO_ADDR` then override the server section.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = match var("PORTICO_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(env) = var("PORTICO_ENV") {
            config.server.environment = env.parse()?;
        }
        if let Some(addr) = var("PORTICO_ADDR") {
            config.server.address = addr;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.rate_limit.max_requests_per_window == 0 {
            return Err(Error::Config("RateLimit.MaxRequestsPerWindow must be positive".into()));
        }
        if self.rate_limit.window_size_minutes == 0 {
            return Err(Error::Config("RateLimit.WindowSizeMinutes must be positive".into()));
        }
        if self.request_validation.max_content_length_bytes == 0 {
            return Err(Error::Config(
                "RequestValidation.MaxContentLengthBytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.rate_limit.max_requests_per_window, 100);
        assert_eq!(config.rate_limit.window(), TimeDelta::minutes(1));
        assert_eq!(config.request_validation.max_content_length_bytes, 10 * 1024 * 1024);
        assert!(config.request_validation.validate_json_format);
        assert_eq!(config.server.environment, RunMode::Production);
    }

    #[test]
    fn pascal_case_keys_are_read() {
        let config = Config::from_toml_str(
            r#"
            [Server]
            Environment = "Development"

            [RateLimit]
            MaxRequestsPerWindow = 5
            WindowSizeMinutes = 3

            [RequestValidation]
            MaxContentLengthBytes = 2048
            ValidateHeaders = false
            "#,
        )
        .unwrap();
        assert!(config.server.environment.is_development());
        assert_eq!(config.rate_limit.max_requests_per_window, 5);
        assert_eq!(config.rate_limit.window(), TimeDelta::minutes(3));
        assert_eq!(config.request_validation.max_content_length_bytes, 2048);
        assert!(!config.request_validation.validate_headers);
        assert!(config.request_validation.validate_content_type);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = Config::from_toml_str("[RateLimit]\nMaxRequestsPerWindow = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn environment_overrides_apply() {
        let config = Config::from_vars(|key| match key {
            "PORTICO_ENV" => Some("dev".to_owned()),
            "PORTICO_ADDR" => Some("127.0.0.1:8080".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.server.environment, RunMode::Development);
        assert_eq!(config.server.address, "127.0.0.1:8080");
    }

    #[test]
    fn unknown_environment_is_an_error() {
        assert!(Config::from_vars(|key| (key == "PORTICO_ENV").then(|| "staging".to_owned())).is_err());
    }
}
