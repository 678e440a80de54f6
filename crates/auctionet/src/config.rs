// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! One TOML file configures either role:
//!
//! ```toml
//! name = "auctionet-node"
//!
//! [server]
//! bind_address = "0.0.0.0"
//! port = 12244
//!
//! [agent]
//! server_address = "127.0.0.1:12244"
//!
//! [protocol]
//! handshake_timeout_ms = 5000
//!
//! [modules.first_price]
//! capacity = "10"
//! ```

use crate::module::ModuleConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Auctioning server section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// UDP port (0 picks an ephemeral port).
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub domain_id: u32,
}

/// Agent section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    /// `host:port` of the auctioning server.
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Local address the per-server sockets bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub domain_id: u32,
}

/// Session protocol tuning shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Inbound messages buffered per session before new ones are dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Configuration groups handed to each module's `init`, by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

fn default_node_name() -> String {
    "auctionet".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    12244
}

fn default_server_address() -> String {
    "127.0.0.1:12244".to_string()
}

fn default_handshake_timeout() -> u64 {
    5_000
}

fn default_max_message_size() -> usize {
    MAX_DATAGRAM_SIZE
}

fn default_queue_depth() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            domain_id: 0,
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            bind_address: default_bind_address(),
            domain_id: 0,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            max_message_size: default_max_message_size(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            log_level: default_log_level(),
            server: ServerSection::default(),
            agent: AgentSection::default(),
            protocol: ProtocolConfig::default(),
            modules: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Address the server listens on.
    pub fn server_bind(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "server.bind_address {:?} is not an IP address",
                self.server.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Address of the server an agent talks to.
    pub fn agent_server(&self) -> Result<SocketAddr, ConfigError> {
        self.agent.server_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "agent.server_address {:?} is not host:port",
                self.agent.server_address
            ))
        })
    }

    pub fn agent_bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.agent.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "agent.bind_address {:?} is not an IP address",
                self.agent.bind_address
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("Node name is empty".into()));
        }
        self.server_bind()?;
        self.agent_server()?;
        self.agent_bind_ip()?;

        let p = &self.protocol;
        if p.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("protocol.handshake_timeout_ms must be > 0".into()));
        }
        if p.max_message_size < 64 || p.max_message_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_message_size must be within 64..={}",
                MAX_DATAGRAM_SIZE
            )));
        }
        if p.queue_depth == 0 {
            return Err(ConfigError::Invalid("protocol.queue_depth must be > 0".into()));
        }
        if self.modules.keys().any(String::is_empty) {
            return Err(ConfigError::Invalid("Module group with empty name".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_bind().unwrap().port(), 12244);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            name = "edge"

            [server]
            port = 0

            [modules.first_price]
            capacity = "8"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.protocol.queue_depth, 64);
        assert_eq!(config.modules["first_price"].get("capacity"), Some("8"));
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = NodeConfig::default();
        config.protocol.handshake_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = NodeConfig::default();
        config.agent.server_address = "nowhere".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.protocol.max_message_size = 100_000;
        assert!(config.validate().is_err());

        assert!(matches!(
            NodeConfig::from_toml_str("[server]\nport = \"x\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn serialization_roundtrip_keeps_modules() {
        let mut config = NodeConfig::default();
        config
            .modules
            .insert("fixed_bidder".into(), ModuleConfig::new().with("max_price", "4"));
        let text = config.to_toml().unwrap();
        assert!(text.contains("[modules.fixed_bidder]"));
        assert_eq!(NodeConfig::from_toml_str(&text).unwrap(), config);
    }
}
