//! Standalone broker configuration.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub addr: String,
    pub loglevel: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            addr: "0.0.0.0:7777".to_owned(),
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

pub fn load_config(path: &Path) -> Result<SignalConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:7777");
        assert_eq!(cfg.loglevel, "info");
    }

    #[test]
    fn file_values_win_over_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "addr = \"127.0.0.1:9000\"\nloglevel = \"debug\"").unwrap();
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:9000");
        assert_eq!(cfg.loglevel, "debug");
    }
}
