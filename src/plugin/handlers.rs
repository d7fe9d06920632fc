//! Volume plugin endpoint handlers.
//!
//! The engine posts its bodies with a plugin-specific content type, so
//! handlers take raw bytes and decode them here. Driver calls block on RPC,
//! mkfs and mount, and run on the blocking pool.

use axum::{body::Bytes, extract::State, Json};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::driver::VolumeDriver;
use crate::plugin::error::PluginError;
use crate::plugin::types::{
    ActivateResponse, CapabilitiesResponse, CapabilitySet, CreateRequest, ErrResponse,
    GetResponse, ListResponse, MountRequest, MountResponse, NameRequest, VOLUME_DRIVER_INTERFACE,
};

/// Decode a request body. An empty body decodes as the default value.
fn parse_request<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, PluginError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| PluginError::BadRequest(format!("invalid request body: {}", e)))
}

fn require_name(name: &str) -> Result<(), PluginError> {
    if name.is_empty() {
        return Err(PluginError::BadRequest("volume name is required".into()));
    }
    Ok(())
}

/// Run a driver operation on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, PluginError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// POST /Plugin.Activate
pub async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec![VOLUME_DRIVER_INTERFACE],
    })
}

/// POST /VolumeDriver.Create
pub async fn create(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, PluginError> {
    let req: CreateRequest = parse_request(&body)?;
    require_name(&req.name)?;

    let opts = req.opts.unwrap_or_default();
    run_blocking(move || driver.create(&req.name, opts)).await?;
    Ok(Json(ErrResponse::ok()))
}

/// POST /VolumeDriver.Remove
pub async fn remove(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, PluginError> {
    let req: NameRequest = parse_request(&body)?;
    require_name(&req.name)?;

    run_blocking(move || driver.remove(&req.name)).await?;
    Ok(Json(ErrResponse::ok()))
}

/// POST /VolumeDriver.Mount
pub async fn mount(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<MountResponse>, PluginError> {
    let req: MountRequest = parse_request(&body)?;
    require_name(&req.name)?;
    debug!(name = %req.name, id = %req.id, "mount requested");

    let mount_point = run_blocking(move || driver.mount(&req.name)).await?;
    Ok(Json(MountResponse {
        mountpoint: mount_point.display().to_string(),
        err: String::new(),
    }))
}

/// POST /VolumeDriver.Unmount
pub async fn unmount(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, PluginError> {
    let req: MountRequest = parse_request(&body)?;
    require_name(&req.name)?;
    debug!(name = %req.name, id = %req.id, "unmount requested");

    run_blocking(move || driver.unmount(&req.name)).await?;
    Ok(Json(ErrResponse::ok()))
}

/// POST /VolumeDriver.Path
pub async fn path(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<MountResponse>, PluginError> {
    let req: NameRequest = parse_request(&body)?;
    require_name(&req.name)?;

    Ok(Json(MountResponse {
        mountpoint: driver.path(&req.name).display().to_string(),
        err: String::new(),
    }))
}

/// POST /VolumeDriver.Get
pub async fn get(
    State(driver): State<Arc<VolumeDriver>>,
    body: Bytes,
) -> Result<Json<GetResponse>, PluginError> {
    let req: NameRequest = parse_request(&body)?;
    require_name(&req.name)?;

    let info = run_blocking(move || driver.get(&req.name)).await?;
    Ok(Json(GetResponse {
        volume: info.into(),
        err: String::new(),
    }))
}

/// POST /VolumeDriver.List
pub async fn list(State(driver): State<Arc<VolumeDriver>>) -> Result<Json<ListResponse>, PluginError> {
    let volumes = run_blocking(move || driver.list()).await?;
    Ok(Json(ListResponse {
        volumes: volumes.into_iter().map(Into::into).collect(),
        err: String::new(),
    }))
}

/// POST /VolumeDriver.Capabilities
pub async fn capabilities(State(driver): State<Arc<VolumeDriver>>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: CapabilitySet {
            scope: driver.capabilities().scope.to_string(),
        },
    })
}
