//! Registry server configuration loading.
//!
//! TOML is the config source; command line flags override file values.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity of this server (informational in logs).
    pub hostname: String,
    /// Listen address for the registry API and the embedded broker.
    pub addr: String,
    /// Optional extra listener that serves only the signaling routes,
    /// for deployments that keep the broker on its own port.
    pub signal_addr: Option<String>,
    pub loglevel: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: String::new(),
            addr: "0.0.0.0:6976".to_owned(),
            signal_addr: None,
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
}

pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_for_missing_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "hostname = \"registry-1\"").unwrap();
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.hostname, "registry-1");
        assert_eq!(cfg.addr, "0.0.0.0:6976");
        assert_eq!(cfg.loglevel, "info");
        assert!(cfg.signal_addr.is_none());
    }

    #[test]
    fn parse_error_is_reported() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "addr = [not toml").unwrap();
        assert!(matches!(load_config(f.path()), Err(ConfigError::Parse(_))));
    }
}
