//! Request-scoped logging over `tracing`.
//!
//! A [`Logger`] is a cheap handle carrying ordered key/value fields. Each
//! event renders the fields into a single `fields` value so that the dynamic
//! set survives both the text and JSON formatters.
//!
//! Chaining with [`Logger::with_field`] mutates the handle in place; a copy is
//! only made with an explicit `clone`. The Context resets its logger to
//! [`Logger::root`] on release.

use std::fmt;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogOutput, LoggerConfig};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Logger {
    fields: Vec<(String, String)>,
}

impl Logger {
    /// A logger without fields.
    pub fn root() -> Self {
        Self::default()
    }

    /// Adds or replaces a field.
    pub fn with_field(&mut self, key: impl Into<String>, value: impl fmt::Display) -> &mut Self {
        let key = key.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn reset(&mut self) {
        self.fields.clear();
    }

    pub fn log(&self, level: Level, msg: impl fmt::Display) {
        let fields = Fields(&self.fields);
        match level {
            Level::TRACE => tracing::trace!(target: "keel", fields = %fields, "{msg}"),
            Level::DEBUG => tracing::debug!(target: "keel", fields = %fields, "{msg}"),
            Level::INFO => tracing::info!(target: "keel", fields = %fields, "{msg}"),
            Level::WARN => tracing::warn!(target: "keel", fields = %fields, "{msg}"),
            _ => tracing::error!(target: "keel", fields = %fields, "{msg}"),
        }
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        self.log(Level::DEBUG, msg);
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.log(Level::INFO, msg);
    }

    pub fn warning(&self, msg: impl fmt::Display) {
        self.log(Level::WARN, msg);
    }

    pub fn error(&self, msg: impl fmt::Display) {
        self.log(Level::ERROR, msg);
    }
}

struct Fields<'a>(&'a [(String, String)]);

impl fmt::Display for Fields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `config.level`.
///
/// Calling it again after a subscriber is set is not an error.
pub fn init(config: &LoggerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("logger.level `{}`: {e}", config.level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match (config.format, config.output) {
        (LogFormat::Text, LogOutput::Stdout) => builder.with_writer(std::io::stdout).try_init(),
        (LogFormat::Text, LogOutput::Stderr) => builder.with_writer(std::io::stderr).try_init(),
        (LogFormat::Json, LogOutput::Stdout) => builder.json().with_writer(std::io::stdout).try_init(),
        (LogFormat::Json, LogOutput::Stderr) => builder.json().with_writer(std::io::stderr).try_init(),
    };
    if let Err(e) = installed {
        tracing::debug!("logger already initialised: {e}");
    }
    Ok(())
}
