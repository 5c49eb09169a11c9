use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use wgpanel_core::InterfaceTemplate;
use wgpanel_core::export::{DEFAULT_DNS, Overrides};

pub const DEFAULT_DOCUMENT: &str = "/etc/wireguard/wg0.conf";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Server configuration file managed by this tool.
    pub document: PathBuf,
    pub interface: InterfaceSettings,
    pub export: ExportSettings,
}

/// Values used when generating a fresh interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterfaceSettings {
    pub address: String,
    pub listen_port: u16,
    pub device: String,
    pub uplink: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportSettings {
    pub dns: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            document: PathBuf::from(DEFAULT_DOCUMENT),
            interface: InterfaceSettings::default(),
            export: ExportSettings::default(),
        }
    }
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        let template = InterfaceTemplate::default();
        Self {
            address: template.address.to_string(),
            listen_port: template.listen_port,
            device: template.device,
            uplink: template.uplink,
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            dns: DEFAULT_DNS.to_string(),
            endpoint: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid interface address {0:?}, expected an IPv4 CIDR such as 11.0.0.1/24")]
    InvalidAddress(String),

    #[error("listen_port must be non-zero")]
    InvalidPort,

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// `Address` must carry an explicit prefix; a bare host would make a /32.
fn parse_interface_address(value: &str) -> Result<Ipv4Network, SettingsError> {
    let invalid = || SettingsError::InvalidAddress(value.to_string());
    if !value.contains('/') {
        return Err(invalid());
    }
    let network: Ipv4Network = value.trim().parse().map_err(|_| invalid())?;
    if network.prefix() > 30 {
        return Err(invalid());
    }
    Ok(network)
}

impl Settings {
    /// Template for `generate`, validated against the interface settings.
    pub fn template(&self) -> Result<InterfaceTemplate, SettingsError> {
        let iface = &self.interface;
        let address = parse_interface_address(&iface.address)?;
        if iface.listen_port == 0 {
            return Err(SettingsError::InvalidPort);
        }
        if iface.device.trim().is_empty() {
            return Err(SettingsError::Empty("interface.device"));
        }
        if iface.uplink.trim().is_empty() {
            return Err(SettingsError::Empty("interface.uplink"));
        }
        Ok(InterfaceTemplate {
            address,
            listen_port: iface.listen_port,
            device: iface.device.clone(),
            uplink: iface.uplink.clone(),
        })
    }

    /// Export overrides with command line values taking precedence.
    pub fn overrides(&self, dns: Option<String>, endpoint: Option<String>) -> Overrides {
        Overrides {
            dns: dns.or_else(|| Some(self.export.dns.clone())),
            endpoint: endpoint.or_else(|| self.export.endpoint.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.template()?;
        if self.export.dns.trim().is_empty() {
            warn!("export.dns is empty");
            return Err(SettingsError::Empty("export.dns"));
        }
        Ok(())
    }
}

pub async fn load(path: &Path) -> Result<Settings, SettingsError> {
    debug!(path = %path.display(), "loading settings");

    let settings = match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let settings: Settings = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                document = %settings.document.display(),
                "loaded settings"
            );
            settings
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "settings file not found, using defaults");
            Settings::default()
        }
        Err(e) => return Err(SettingsError::Read(e)),
    };

    settings.validate()?;
    Ok(settings)
}
