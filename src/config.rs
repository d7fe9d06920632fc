//! Plugin configuration.
//!
//! Settings come from a TOML file and can be overridden on the command line.
//! A missing file means defaults.

use crate::driver::{
    DriverConfig, DEFAULT_DEVICE_WAIT, DEFAULT_FSTYPE, DEFAULT_MOUNT_ROOT, DEFAULT_SETTLE_DELAY,
};
use crate::error::{Error, Result};
use crate::transport::{ChannelSettings, PortRange, VSOCKET_BACKEND};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vmvol_protocol::{cid, ports};

/// Application name for config file storage.
const APP_NAME: &str = "vmvol";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/vmvol/config.toml";

/// Default driver name, also the plugin spec file stem.
pub const DEFAULT_DRIVER_NAME: &str = "vsphere";

/// Default address the plugin HTTP shim listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1519";

/// Default directory for the plugin spec file.
pub const DEFAULT_SPEC_DIR: &str = "/etc/docker/plugins";

/// Plugin configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Name the container engine knows the driver by.
    pub driver_name: String,

    /// Directory under which volumes are mounted.
    pub mount_root: PathBuf,

    /// Port of the hypervisor volume service.
    pub service_port: u32,

    /// Context id of the hypervisor.
    pub remote_cid: u32,

    /// Transport backend name (`vsocket` or `dummy`).
    pub backend: String,

    /// Serve from an in-memory volume service with directory-backed volumes.
    pub mock: bool,

    /// Filesystem created when none is requested.
    pub default_fstype: String,

    /// How long to wait for an attached device node.
    #[serde(with = "duration_str")]
    pub device_wait_timeout: Duration,

    /// Delay used instead of waiting when device watching is unsupported.
    #[serde(with = "duration_str")]
    pub settle_delay: Duration,

    /// Socket read/write deadline for each RPC. Zero disables it.
    #[serde(with = "duration_str")]
    pub rpc_timeout: Duration,

    /// Address the plugin HTTP shim listens on.
    pub listen_addr: String,

    /// Directory to write the plugin spec file into. `None` skips it.
    pub spec_dir: Option<PathBuf>,

    /// Local ports the client may bind.
    pub client_ports: PortRange,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            service_port: ports::VOLUME_SERVICE,
            remote_cid: cid::HYPERVISOR,
            backend: VSOCKET_BACKEND.to_string(),
            mock: false,
            default_fstype: DEFAULT_FSTYPE.to_string(),
            device_wait_timeout: DEFAULT_DEVICE_WAIT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            rpc_timeout: Duration::from_secs(30),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            spec_dir: Some(PathBuf::from(DEFAULT_SPEC_DIR)),
            client_ports: PortRange::default(),
        }
    }
}

impl PluginConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Otherwise the system path is tried,
    /// then the user config directory, and defaults are used if neither
    /// file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_file(path)?,
            None => match Self::default_paths().into_iter().find(|p| p.exists()) {
                Some(path) => Self::load_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| Error::ConfigLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Candidate config files, in lookup order.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_NAME).join(CONFIG_FILE));
        }
        paths
    }

    /// Check the settings for values the driver cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.client_ports.first > self.client_ports.last {
            return Err(Error::config(format!(
                "client port range {} is reversed",
                self.client_ports
            )));
        }
        if self.client_ports.is_empty() {
            return Err(Error::config("client port range is empty"));
        }
        if self.mount_root.as_os_str().is_empty() {
            return Err(Error::config("mount root is empty"));
        }
        if self.driver_name.is_empty() {
            return Err(Error::config("driver name is empty"));
        }
        Ok(())
    }

    /// Orchestrator settings.
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            mount_root: self.mount_root.clone(),
            default_fstype: self.default_fstype.clone(),
            device_wait_timeout: self.device_wait_timeout,
            settle_delay: self.settle_delay,
        }
    }

    /// Transport settings.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            ports: self.client_ports,
            timeout: (!self.rpc_timeout.is_zero()).then_some(self.rpc_timeout),
        }
    }

    /// Path of the plugin spec file, if one should be written.
    pub fn spec_file(&self) -> Option<PathBuf> {
        self.spec_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.spec", self.driver_name)))
    }
}

/// serde adapter for human-readable durations ("1s", "500ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
