//! Plugin loading and the built-in WireGuard plugin.
//!
//! Plugins are handed every host message the reconciler sees, each on its
//! own task; a plugin that hangs or fails never stalls the cycle. Loading
//! happens once at startup from the `plugins` config table.

use async_trait::async_trait;
use kh_proto::{HostMessage, HostMessageKind};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown plugin: {0}")]
    Unknown(String),
    #[error("invalid spec for plugin {0}: {1}")]
    InvalidSpec(String, toml::de::Error),
}

#[async_trait]
pub trait Plugin: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, msg: &HostMessage);
}

/// Instantiate every configured plugin. Unknown names abort startup.
pub fn load_plugins(
    configs: &[crate::config::PluginConfig],
) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        match cfg.name.as_str() {
            "wg" => {
                let spec: WgSpec = cfg
                    .spec
                    .clone()
                    .try_into()
                    .map_err(|e| PluginError::InvalidSpec(cfg.name.clone(), e))?;
                plugins.push(Arc::new(WgPlugin::new(spec)));
            }
            other => return Err(PluginError::Unknown(other.to_owned())),
        }
        info!(plugin = %cfg.name, "plugin loaded");
    }
    Ok(plugins)
}

// ---------------------------------------------------------------------------
// WireGuard plugin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WgSpec {
    pub iface: String,
    /// Seconds between keepalives programmed on the peer.
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u32,
}

fn default_keepalive() -> u32 {
    10
}

/// Reprograms a local WireGuard tunnel with the peer's external endpoint.
///
/// The message hostname is passed as the `peer` argument, i.e. hostnames
/// double as peer public keys in this deployment model.
#[derive(Debug)]
pub struct WgPlugin {
    spec: WgSpec,
}

impl WgPlugin {
    pub fn new(spec: WgSpec) -> Self {
        WgPlugin { spec }
    }

    async fn set_peer_endpoint(&self, peer: &str, endpoint: &str) {
        let keepalive = self.spec.persistent_keepalive.to_string();
        let args = [
            "set",
            &self.spec.iface,
            "peer",
            peer,
            "persistent-keepalive",
            &keepalive,
            "endpoint",
            endpoint,
        ];
        match tokio::process::Command::new("wg").args(args).output().await {
            Ok(output) if output.status.success() => {
                info!(iface = %self.spec.iface, peer, endpoint, "peer endpoint updated");
            }
            Ok(output) => {
                error!(
                    iface = %self.spec.iface,
                    peer,
                    endpoint,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "wg set failed"
                );
            }
            Err(e) => {
                error!(iface = %self.spec.iface, peer, error = %e, "failed to run wg");
            }
        }
    }
}

#[async_trait]
impl Plugin for WgPlugin {
    fn name(&self) -> &str {
        "wg"
    }

    async fn handle(&self, msg: &HostMessage) {
        match msg.kind {
            HostMessageKind::HostPunchNotification | HostMessageKind::HostOnlineNotification => {
                let Some(external) = msg.external else {
                    debug!(hostname = %msg.hostname, "no external address, nothing to program");
                    return;
                };
                self.set_peer_endpoint(&msg.hostname, &external.socket_addr().to_string())
                    .await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;

    fn plugin_config(name: &str, spec_toml: &str) -> PluginConfig {
        PluginConfig {
            name: name.to_owned(),
            spec: toml::from_str(spec_toml).unwrap(),
        }
    }

    #[test]
    fn wg_plugin_loads_with_spec() {
        let plugins = load_plugins(&[plugin_config("wg", "iface = \"wg0\"")]).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name(), "wg");
    }

    #[test]
    fn unknown_plugin_is_a_startup_error() {
        let err = load_plugins(&[plugin_config("nope", "")]).unwrap_err();
        assert!(matches!(err, PluginError::Unknown(name) if name == "nope"));
    }

    #[test]
    fn missing_iface_is_an_invalid_spec() {
        let err = load_plugins(&[plugin_config("wg", "")]).unwrap_err();
        assert!(matches!(err, PluginError::InvalidSpec(name, _) if name == "wg"));
    }

    #[test]
    fn keepalive_defaults_to_ten() {
        let spec: WgSpec = toml::from_str("iface = \"wg0\"").unwrap();
        assert_eq!(spec.persistent_keepalive, 10);
    }
}
