//! Client configuration loading.
//!
//! TOML file plus command line overrides. Every subscription entry yields
//! one negotiation session whose source is this host and whose target is the
//! subscribed topic. Plugin `spec` tables are decoded by the plugin itself.

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun3.l.google.com:19302",
    "stun:stun.cunicu.li:3478",
    "stun:stun.easyvoip.com:3478",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity; also the topic this host receives messages on.
    pub hostname: String,
    /// Port advertised alongside local interface addresses, and the local
    /// port punch datagrams are sent from.
    pub endpoint_port: u16,
    /// Base URL of the host registry, e.g. `http://reg.example.net:6976`.
    pub server: String,
    /// Base URL of the signaling broker.
    pub signal_server: String,
    /// Probed in order; first success wins.
    pub stun_server: Vec<String>,
    pub subscriptions: Vec<Subscription>,
    pub plugins: Vec<PluginConfig>,
    pub loglevel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Plugin-specific table, decoded by the named plugin at load time.
    #[serde(default)]
    pub spec: toml::Table,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hostname: String::new(),
            endpoint_port: 0,
            server: String::new(),
            signal_server: String::new(),
            stun_server: DEFAULT_STUN_SERVERS.iter().map(|s| (*s).to_owned()).collect(),
            subscriptions: Vec::new(),
            plugins: Vec::new(),
            loglevel: "info".to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config invalid: {0}")]
    Invalid(&'static str),
}

pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

impl ClientConfig {
    /// Checks run after flag overrides, just before startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::Invalid("hostname is required"));
        }
        if self.signal_server.is_empty() && !self.subscriptions.is_empty() {
            return Err(ConfigError::Invalid(
                "signal_server is required when subscriptions are configured",
            ));
        }
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("server is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_config_parses() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
hostname = "h1"
endpoint_port = 51820
server = "http://reg.example.net:6976"
signal_server = "http://sig.example.net:7777"
stun_server = ["stun:stun.example.net:3478"]

[[subscriptions]]
topic = "h2"

[[subscriptions]]
topic = "h3"

[[plugins]]
name = "wg"
spec = {{ iface = "wg0" }}
"#
        )
        .unwrap();

        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.hostname, "h1");
        assert_eq!(cfg.endpoint_port, 51820);
        assert_eq!(cfg.stun_server, vec!["stun:stun.example.net:3478"]);
        assert_eq!(cfg.subscriptions.len(), 2);
        assert_eq!(cfg.subscriptions[1].topic, "h3");
        assert_eq!(cfg.plugins.len(), 1);
        assert_eq!(cfg.plugins[0].name, "wg");
        assert_eq!(
            cfg.plugins[0].spec.get("iface").and_then(|v| v.as_str()),
            Some("wg0")
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn default_stun_servers_apply() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.stun_server.len(), 3);
    }

    #[test]
    fn validation_requires_hostname_and_server() {
        let cfg = ClientConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
