//! Container engine volume plugin served over HTTP.
//!
//! # Example
//!
//! ```bash
//! # Start the plugin
//! vmvol serve --listen 127.0.0.1:1519
//!
//! # Mount a volume the way the engine does
//! curl -X POST http://127.0.0.1:1519/VolumeDriver.Mount \
//!   -d '{"Name": "vol1", "ID": "abc"}'
//! ```

pub mod error;
pub mod handlers;
pub mod types;

use axum::{routing::post, Router};
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::driver::VolumeDriver;
use crate::error::Result;

/// Create the plugin router with all endpoints.
///
/// Requests have no timeout: a driver call cannot be cancelled once it has
/// started. Each RPC is bounded by the transport's socket deadline.
pub fn create_router(driver: Arc<VolumeDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(handlers::activate))
        .route("/VolumeDriver.Create", post(handlers::create))
        .route("/VolumeDriver.Remove", post(handlers::remove))
        .route("/VolumeDriver.Mount", post(handlers::mount))
        .route("/VolumeDriver.Unmount", post(handlers::unmount))
        .route("/VolumeDriver.Path", post(handlers::path))
        .route("/VolumeDriver.Get", post(handlers::get))
        .route("/VolumeDriver.List", post(handlers::list))
        .route("/VolumeDriver.Capabilities", post(handlers::capabilities))
        .layer(TraceLayer::new_for_http())
        .with_state(driver)
}

/// Write the plugin discovery file pointing the engine at `listen_addr`.
pub fn write_spec_file(path: &Path, listen_addr: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("tcp://{}\n", listen_addr))?;
    info!(path = %path.display(), addr = %listen_addr, "wrote plugin spec file");
    Ok(())
}
