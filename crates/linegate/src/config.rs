//! Bridge startup configuration.

use crate::health::HealthConfig;
use crate::process::ChildCommand;
use crate::transport::TransportConfig;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HEALTH_PORT: u16 = 8001;
pub const DEFAULT_MESSAGE_PATH: &str = "/message";
const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no child command configured")]
    MissingCommand,
    #[error("invalid base URL {url:?}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid route path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// Normalize a route path to start with `/`.
///
/// Rejects anything the router would read as a capture or wildcard, so a
/// configured path only ever matches itself.
pub fn route_path(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason| ConfigError::InvalidPath {
        path: raw.to_string(),
        reason,
    };
    if raw.contains(['{', '}']) {
        return Err(invalid("braces are not allowed"));
    }
    if raw.split('/').any(|seg| seg.starts_with(':') || seg.starts_with('*')) {
        return Err(invalid("segments must not start with `:` or `*`"));
    }
    if raw.starts_with('/') {
        Ok(raw.to_string())
    } else {
        Ok(format!("/{}", raw))
    }
}

/// Normalized paths in first-seen order, duplicates removed.
pub fn route_paths(raw: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut paths: Vec<String> = Vec::with_capacity(raw.len());
    for path in raw {
        let path = route_path(path)?;
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    Ok(paths)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Command line run through the platform shell.
    pub command: String,
    pub port: u16,
    /// Only the hostname is used, as the bind host.
    pub base_url: Option<String>,
    pub message_path: String,
    pub cors: bool,
    pub health_endpoints: Vec<String>,
    pub health_port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            port: DEFAULT_PORT,
            base_url: None,
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            cors: false,
            health_endpoints: Vec::new(),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl BridgeConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_message_path(mut self, path: impl Into<String>) -> Self {
        self.message_path = path.into();
        self
    }

    pub fn with_cors(mut self, cors: bool) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_health_endpoint(mut self, path: impl Into<String>) -> Self {
        self.health_endpoints.push(path.into());
        self
    }

    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }

    /// Check everything that can be checked before binding anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.child_command()?;
        self.transport_config()?;
        self.health_config()?;
        Ok(())
    }

    pub fn child_command(&self) -> Result<ChildCommand, ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        Ok(ChildCommand::shell(self.command.clone()))
    }

    /// Hostname of `base_url`, or all interfaces.
    pub fn bind_host(&self) -> Result<String, ConfigError> {
        let Some(raw) = self.base_url.as_deref() else {
            return Ok(DEFAULT_HOST.to_string());
        };
        let url = url::Url::parse(raw).map_err(|source| ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            source,
        })?;
        // IPv6 hosts come back bracketed; sockets want them bare.
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        Ok(host)
    }

    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        Ok(TransportConfig {
            host: self.bind_host()?,
            port: self.port,
            path: route_path(&self.message_path)?,
            cors: self.cors,
            ..Default::default()
        })
    }

    pub fn health_config(&self) -> Result<HealthConfig, ConfigError> {
        Ok(HealthConfig {
            host: self.bind_host()?,
            port: self.health_port,
            paths: route_paths(&self.health_endpoints)?,
            cors: self.cors,
        })
    }
}
