//! Application configuration.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:8080"
//! read_header_timeout_ms = 10000
//! max_body_bytes = 4194304
//!
//! [logger]
//! level = "info"
//! format = "json"
//!
//! [router]
//! allowed_methods = ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH", "OPTIONS", "LOCK", "UNLOCK"]
//!
//! [policy]
//! secret = "change-me"
//! guest_policies = [1]
//! ```
//!
//! The core never reads the config itself. [`App`](crate::App) copies the
//! relevant sections into the Context values under [`VALUE_CONFIG`] and
//! friends.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::method::{DEFAULT_ALLOWED_METHODS, DEFAULT_ANY_METHODS};

/// Standard Context value keys injected by the bootstrap.
pub const VALUE_CONFIG: &str = "config";
pub const VALUE_SERVER: &str = "server";
pub const VALUE_POLICY: &str = "policy";
pub const VALUE_EXTENDER: &str = "extender";
pub const VALUE_VALIDATOR: &str = "validator";
pub const VALUE_TEMPLATE: &str = "template";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub router: RouterSection,
    pub policy: PolicyConfig,
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        if self.router.allowed_methods.is_empty() {
            return Err(Error::Config("router.allowed_methods must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Deadline for reading request headers; 0 disables it.
    pub read_header_timeout_ms: u64,
    pub keep_alive: bool,
    pub max_header_bytes: usize,
    /// Default request body cap applied to every Context.
    pub max_body_bytes: usize,
    /// How long shutdown waits for in-flight connections; 0 waits forever.
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr.parse().map_err(|e| Error::Config(format!("server.addr `{}`: {e}", self.addr)))
    }

    pub fn read_header_timeout(&self) -> Option<Duration> {
        (self.read_header_timeout_ms > 0).then(|| Duration::from_millis(self.read_header_timeout_ms))
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        (self.shutdown_timeout_ms > 0).then(|| Duration::from_millis(self.shutdown_timeout_ms))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".into(),
            read_header_timeout_ms: 10_000,
            keep_alive: true,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 4 * 1024 * 1024,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `tracing` filter directive; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Text, output: LogOutput::Stdout }
    }
}

/// Which router core the bootstrap builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreKind {
    #[default]
    Std,
    Lock,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterSection {
    pub core: CoreKind,
    pub allowed_methods: Vec<String>,
    pub any_methods: Vec<String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            core: CoreKind::Std,
            allowed_methods: DEFAULT_ALLOWED_METHODS.iter().map(|m| (*m).to_owned()).collect(),
            any_methods: DEFAULT_ANY_METHODS.iter().map(|m| (*m).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// HMAC secret for signed bearers. Empty disables bearer parsing.
    pub secret: String,
    /// Policies applied to requests without a user id.
    pub guest_policies: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:8080");
        assert_eq!(config.router.any_methods.len(), 6);
        assert_eq!(config.logger.format, LogFormat::Text);
    }

    #[test]
    fn sections_override() {
        let config = AppConfig::from_toml(
            r#"
            [server]
            addr = "127.0.0.1:3000"
            shutdown_timeout_ms = 0

            [logger]
            format = "json"
            output = "stderr"

            [router]
            core = "lock"
            allowed_methods = ["GET", "LOCK"]

            [policy]
            secret = "s3cret"
            guest_policies = [7]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.socket_addr().unwrap().port(), 3000);
        assert_eq!(config.server.shutdown_timeout(), None);
        assert_eq!(config.logger.output, LogOutput::Stderr);
        assert_eq!(config.router.core, CoreKind::Lock);
        assert_eq!(config.policy.guest_policies, vec![7]);
    }

    #[test]
    fn bad_addr_is_a_config_error() {
        let err = AppConfig::from_toml("[server]\naddr = \"nope\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
