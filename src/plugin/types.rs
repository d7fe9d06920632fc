//! Volume plugin request and response bodies.
//!
//! Field names follow the container engine's volume plugin protocol.

use crate::driver::VolumeInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vmvol_protocol::VolumeOpts;

/// Interface name reported on activation.
pub const VOLUME_DRIVER_INTERFACE: &str = "VolumeDriver";

/// Body of `/VolumeDriver.Create`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    /// Volume name.
    #[serde(default)]
    pub name: String,
    /// Driver options; the engine may send `null`.
    #[serde(default)]
    pub opts: Option<VolumeOpts>,
}

/// Body of requests that only carry a volume name.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRequest {
    /// Volume name.
    #[serde(default)]
    pub name: String,
}

/// Body of `/VolumeDriver.Mount` and `/VolumeDriver.Unmount`.
#[derive(Debug, Default, Deserialize)]
pub struct MountRequest {
    /// Volume name.
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Id of the container using the volume.
    #[serde(rename = "ID", default)]
    pub id: String,
}

/// Response with only an error field. Empty means success.
#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResponse {
    /// Error text.
    pub err: String,
}

impl ErrResponse {
    /// Success response.
    pub fn ok() -> Self {
        Self::default()
    }
}

/// Response carrying a mount point.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountResponse {
    /// Where the volume is mounted.
    pub mountpoint: String,
    /// Error text.
    pub err: String,
}

/// Volume as seen by the container engine.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeDescription {
    /// Volume name.
    pub name: String,
    /// Mount point.
    pub mountpoint: String,
    /// Service status, omitted when empty.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub status: Map<String, Value>,
}

impl From<VolumeInfo> for VolumeDescription {
    fn from(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mountpoint.display().to_string(),
            status: info.status,
        }
    }
}

/// Response of `/VolumeDriver.Get`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    /// The volume.
    pub volume: VolumeDescription,
    /// Error text.
    pub err: String,
}

/// Response of `/VolumeDriver.List`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResponse {
    /// All volumes.
    pub volumes: Vec<VolumeDescription>,
    /// Error text.
    pub err: String,
}

/// Capability set.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitySet {
    /// `global` or `local`.
    pub scope: String,
}

/// Response of `/VolumeDriver.Capabilities`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    /// Driver capabilities.
    pub capabilities: CapabilitySet,
}

/// Response of `/Plugin.Activate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    /// Implemented plugin interfaces.
    pub implements: Vec<&'static str>,
}
