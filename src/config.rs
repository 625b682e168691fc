//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PORTGATE_SERVER_ADDR`,
//!    `PORTGATE_SERVER_PORT`, `PORTGATE_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `portgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The config file is read-only: portgate never creates or rewrites it. An
//! unreadable or malformed `portgate.toml` found implicitly falls back to
//! the compiled defaults; a file named explicitly via `--config` must parse.
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! addr = "frps.example.com"
//! port = 7000
//! token = "your-secret-token"
//!
//! [client]
//! binary = "frpc"
//! stop_grace_ms = 3000
//!
//! [bridge]
//! bind = "127.0.0.1"
//! local_port_base = 24000
//!
//! [allocator]
//! public_port_base = 20000
//!
//! [logging]
//! level = "info"
//!
//! # Optional — declarative mappings brought up by `portgate serve`
//! [[mapping]]
//! name = "plc"
//! kind = "serial"
//! device = "/dev/ttyUSB0"
//! baud = 9600
//! public_port = 20001
//! autostart = true
//!
//! [[mapping]]
//! name = "ssh"
//! kind = "tcp"
//! host = "127.0.0.1"
//! port = 22
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::Error;
use crate::manager::{MappingSource, MappingSpec};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Declarative mappings brought up at startup.
    #[serde(default, rename = "mapping")]
    pub mappings: Vec<MappingEntry>,
}

/// Forwarding server (frps) endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server address. Override with `PORTGATE_SERVER_ADDR`.
    #[serde(default = "default_server_addr")]
    pub addr: String,
    /// Server control port (default 7000). Override with `PORTGATE_SERVER_PORT`.
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Authentication token passed to the forwarding client. Override with
    /// `PORTGATE_TOKEN`. Defaults to `"change-me"` which triggers a startup
    /// warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// The external forwarding-client process.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Forwarding client binary, resolved via `PATH` unless absolute
    /// (default `frpc`).
    #[serde(default = "default_client_binary")]
    pub binary: String,
    /// Grace period in milliseconds between SIGTERM and SIGKILL when the
    /// client is stopped (default 3000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

/// Serial bridge listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Address the per-mapping bridge listeners bind (default `127.0.0.1` —
    /// only the forwarding client should reach them).
    #[serde(default = "default_bridge_bind")]
    pub bind: String,
    /// Lowest loopback port handed to bridge listeners (default 24000).
    #[serde(default = "default_local_port_base")]
    pub local_port_base: u16,
}

/// Public port allocation.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// Lowest public port suggested for new mappings (default 20000).
    #[serde(default = "default_public_port_base")]
    pub public_port_base: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `[[mapping]]` stanza. Kept flat for TOML ergonomics; converted into a
/// typed [`MappingSpec`] via [`MappingEntry::to_spec`].
#[derive(Debug, Clone, Deserialize)]
pub struct MappingEntry {
    pub name: Option<String>,
    /// `"serial"` or `"tcp"`.
    pub kind: String,
    /// Serial mappings: device path (e.g. `/dev/ttyUSB0`).
    pub device: Option<String>,
    /// Serial mappings: baud rate (default 9600).
    pub baud: Option<u32>,
    /// TCP mappings: target host (default `127.0.0.1`).
    pub host: Option<String>,
    /// TCP mappings: target port.
    pub port: Option<u16>,
    /// Explicit public port; suggested by the allocator when omitted.
    pub public_port: Option<u16>,
    /// Start the mapping as soon as `serve` comes up (default true).
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

impl MappingEntry {
    /// Convert the flat TOML shape into a validated mapping spec.
    pub fn to_spec(&self) -> Result<MappingSpec, Error> {
        let source = match self.kind.as_str() {
            "serial" => {
                let device = self
                    .device
                    .clone()
                    .ok_or_else(|| Error::InvalidMapping("serial mapping requires `device`".into()))?;
                MappingSource::Serial {
                    device,
                    baud: self.baud.unwrap_or(9600),
                }
            }
            "tcp" => {
                let port = self
                    .port
                    .ok_or_else(|| Error::InvalidMapping("tcp mapping requires `port`".into()))?;
                MappingSource::Tcp {
                    host: self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                    port,
                }
            }
            other => {
                return Err(Error::InvalidMapping(format!(
                    "unknown mapping kind `{other}` (expected `serial` or `tcp`)"
                )))
            }
        };
        Ok(MappingSpec {
            name: self.name.clone(),
            source,
            public_port: self.public_port,
        })
    }
}

fn default_server_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_server_port() -> u16 {
    7000
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_client_binary() -> String {
    "frpc".to_string()
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_bridge_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port_base() -> u16 {
    24000
}
fn default_public_port_base() -> u16 {
    20000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_autostart() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            bridge: BridgeConfig::default(),
            allocator: AllocatorConfig::default(),
            logging: LoggingConfig::default(),
            mappings: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            port: default_server_port(),
            token: default_token(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: default_client_binary(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: default_bridge_bind(),
            local_port_base: default_local_port_base(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            public_port_base: default_public_port_base(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `portgate.toml` in the current directory; a missing or
    /// malformed implicit file falls back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("portgate.toml").exists() {
            std::fs::read_to_string("portgate.toml")
                .ok()
                .and_then(|content| toml::from_str(&content).ok())
                .unwrap_or_default()
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(addr) = std::env::var("PORTGATE_SERVER_ADDR") {
            config.server.addr = addr;
        }
        if let Ok(port) = std::env::var("PORTGATE_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(token) = std::env::var("PORTGATE_TOKEN") {
            config.server.token = token;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [server]
            addr = "frps.example.com"
            port = 7100
            token = "secret"

            [client]
            binary = "/usr/local/bin/frpc"

            [[mapping]]
            name = "plc"
            kind = "serial"
            device = "/dev/ttyUSB0"
            baud = 115200
            public_port = 20001

            [[mapping]]
            kind = "tcp"
            port = 22
            autostart = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.addr, "frps.example.com");
        assert_eq!(config.server.port, 7100);
        assert_eq!(config.client.binary, "/usr/local/bin/frpc");
        assert_eq!(config.client.stop_grace_ms, 3000);
        assert_eq!(config.mappings.len(), 2);
        assert!(config.mappings[0].autostart);
        assert!(!config.mappings[1].autostart);

        let spec = config.mappings[0].to_spec().unwrap();
        match spec.source {
            MappingSource::Serial { ref device, baud } => {
                assert_eq!(device, "/dev/ttyUSB0");
                assert_eq!(baud, 115200);
            }
            MappingSource::Tcp { .. } => panic!("expected serial source"),
        }
        assert_eq!(spec.public_port, Some(20001));
    }

    #[test]
    fn defaults_are_applied() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.token, "change-me");
        assert_eq!(config.bridge.local_port_base, 24000);
        assert_eq!(config.allocator.public_port_base, 20000);
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn to_spec_rejects_incomplete_mappings() {
        let entry: MappingEntry = toml::from_str(r#"kind = "serial""#).unwrap();
        assert!(entry.to_spec().is_err());

        let entry: MappingEntry = toml::from_str(r#"kind = "tcp""#).unwrap();
        assert!(entry.to_spec().is_err());

        let entry: MappingEntry = toml::from_str(r#"kind = "udp""#).unwrap();
        assert!(entry.to_spec().is_err());
    }
}
