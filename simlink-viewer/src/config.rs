//! Load config from file and environment.

use serde::Deserialize;
use simlink_core::{AssetRequest, AssetTransferConfig, ManagerConfig};
use std::path::PathBuf;
use tracing::warn;

/// Viewer configuration. File: ~/.config/simlink/config.toml or /etc/simlink/config.toml.
/// Env overrides: SIMLINK_SERVER, SIMLINK_PORT, SIMLINK_TEMPLATE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Simulator host (default 127.0.0.1).
    #[serde(default = "default_server")]
    pub server: String,
    /// Simulator UDP port (default 9000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Message template file; the bundled template when unset.
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    /// Frame loop period (default 33 ms).
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Asset transfers idle this long are cancelled (default 60 s).
    #[serde(default = "default_asset_timeout_ms")]
    pub asset_timeout_ms: u64,
    #[serde(default)]
    pub net: ManagerConfig,
    #[serde(default)]
    pub asset: AssetTransferConfig,
    /// Assets fetched at startup.
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetEntry {
    pub id: String,
    pub metadata_uri: String,
    pub data_uri: String,
}

impl From<AssetEntry> for AssetRequest {
    fn from(e: AssetEntry) -> Self {
        AssetRequest {
            id: e.id,
            metadata_uri: e.metadata_uri,
            data_uri: e.data_uri,
        }
    }
}

fn default_server() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_asset_timeout_ms() -> u64 {
    60_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            template_path: None,
            frame_interval_ms: default_frame_interval_ms(),
            asset_timeout_ms: default_asset_timeout_ms(),
            net: ManagerConfig::default(),
            asset: AssetTransferConfig::default(),
            assets: Vec::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SIMLINK_SERVER") {
        if !s.is_empty() {
            c.server = s;
        }
    }
    if let Ok(s) = std::env::var("SIMLINK_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid SIMLINK_PORT"),
        }
    }
    if let Some(p) = std::env::var_os("SIMLINK_TEMPLATE") {
        c.template_path = Some(PathBuf::from(p));
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/simlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/simlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "invalid config, using defaults"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}
