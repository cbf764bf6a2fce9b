use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub matter_server_url: String,
    pub http_addr: String,
    pub reconnect: ReconnectConf,
    pub relay: RelayConf,
    pub device_info: DeviceInfoConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConf {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConf {
    pub ping_interval_secs: u64,
    /// Simulation de décharge batterie (démo uniquement)
    pub simulate_battery_drain: bool,
    pub status_update_interval_secs: u64,
}

/// Fiche produit exposée par GET /api/status
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceInfoConf {
    pub product_name: String,
    pub manufacturer: String,
    pub hardware_version: String,
    pub software_version: String,
    pub serial_number: String,
    pub matter_version: String,
    /// Absente => hôte de la requête HTTP
    pub ip_address: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            matter_server_url: "ws://127.0.0.1:5580/ws".into(),
            http_addr: "0.0.0.0:5005".into(),
            reconnect: ReconnectConf::default(),
            relay: RelayConf::default(),
            device_info: DeviceInfoConf::default(),
        }
    }
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { max_attempts: 5, delay_secs: 5 }
    }
}

impl Default for RelayConf {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            simulate_battery_drain: false,
            status_update_interval_secs: 1,
        }
    }
}

impl Default for DeviceInfoConf {
    fn default() -> Self {
        let unknown = || "unknown".to_string();
        Self {
            product_name: unknown(),
            manufacturer: unknown(),
            hardware_version: unknown(),
            software_version: unknown(),
            serial_number: unknown(),
            matter_version: unknown(),
            ip_address: None,
        }
    }
}

impl RelayConf {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn status_update_interval(&self) -> Duration {
        Duration::from_secs(self.status_update_interval_secs.max(1))
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("RVC_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_from(&path).await;
    apply_env_overrides(&mut cfg);
    cfg
}

/// Lit la config YAML; fichier absent ou invalide => config par défaut.
pub async fn load_config_from<P: AsRef<Path>>(path: P) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        info!("[kernel] no {} found, using default config", path.display());
        return KernelConfig::default();
    }

    let txt = fs::read_to_string(path).await.unwrap_or_default();
    parse_config(&txt).unwrap_or_else(|e| {
        warn!("[kernel] {e}, using default config");
        KernelConfig::default()
    })
}

pub fn parse_config(txt: &str) -> BridgeResult<KernelConfig> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    let cfg: KernelConfig =
        serde_yaml::from_str(txt).map_err(|e| BridgeError::Config(e.to_string()))?;
    validate_server_url(&cfg.matter_server_url)?;
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut KernelConfig) {
    if let Ok(url) = std::env::var("MATTER_SERVER_WS_URL") {
        match validate_server_url(&url) {
            Ok(()) => cfg.matter_server_url = url,
            Err(e) => warn!("[kernel] ignoring MATTER_SERVER_WS_URL: {e}"),
        }
    }
    if let Ok(addr) = std::env::var("RVC_HTTP_ADDR") {
        cfg.http_addr = addr;
    }
}

pub fn validate_server_url(url: &str) -> BridgeResult<()> {
    let url = url.trim();
    let host = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| BridgeError::Config(format!("'{url}' is not a ws:// or wss:// url")))?;
    if host.is_empty() || host.starts_with('/') {
        return Err(BridgeError::Config(format!("'{url}' has no host")));
    }
    Ok(())
}
