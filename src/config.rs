//! Configuration
//!
//! Connection settings for every database and the static description of
//! models declared outside of code. Loaded from a TOML file through the
//! `config` crate, with `DIVAN__` prefixed environment variables layered on
//! top (for example `DIVAN__DATABASES__MAIN__PORT=5985`).

use crate::error::{Error, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "DIVAN";

/// What `save` does with a document that was deleted from this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecreatePolicy {
    /// Write a new revision at the same id, on top of the tombstone
    #[default]
    SameId,
    /// Forget the old id and let the server assign a new one
    FreshId,
    /// Refuse with `Error::RecreateForbidden`
    Forbid,
}

impl std::str::FromStr for RecreatePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "same-id" => Ok(RecreatePolicy::SameId),
            "fresh-id" => Ok(RecreatePolicy::FreshId),
            "forbid" => Ok(RecreatePolicy::Forbid),
            other => Err(Error::Config(format!("unknown recreate policy '{}'", other))),
        }
    }
}

/// Connection settings for one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Server host, with or without scheme
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Server-side database name; the registry key is used when absent
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "http://127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5984
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: None,
            user: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Settings for a database with the given server-side name
    pub fn named(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Server root, e.g. `http://127.0.0.1:5984/`
    pub fn base_url(&self) -> Result<Url> {
        let host = self.host.trim_end_matches('/');
        let raw = if host.contains("://") {
            format!("{}:{}/", host, self.port)
        } else {
            format!("http://{}:{}/", host, self.port)
        };
        Url::parse(&raw).map_err(|e| Error::Config(format!("invalid host '{}': {}", self.host, e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A model declared in configuration rather than in code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Database key; defaults to the model name
    #[serde(default)]
    pub database: Option<String>,
    /// Attributes to build `by_<attr>` views for
    #[serde(default)]
    pub views: Vec<String>,
    #[serde(default)]
    pub recreate: RecreatePolicy,
    /// Publish views on demand when a query finds them missing
    #[serde(default = "default_auto_views")]
    pub auto_views: bool,
}

fn default_auto_views() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            database: None,
            views: Vec::new(),
            recreate: RecreatePolicy::default(),
            auto_views: default_auto_views(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DivanConfig {
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

impl DivanConfig {
    /// Load from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn with_database(mut self, key: impl Into<String>, database: DatabaseConfig) -> Self {
        self.databases.insert(key.into(), database);
        self
    }

    pub fn database(&self, key: &str) -> Result<&DatabaseConfig> {
        self.databases
            .get(key)
            .ok_or_else(|| Error::UnknownDatabase(key.to_string()))
    }
}
