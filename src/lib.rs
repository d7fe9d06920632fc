//! vmvol - guest-side volume plugin backed by a hypervisor storage service.
//!
//! Volumes live on the hypervisor and are reached over vsock. This crate
//! provides:
//! - [`transport`]: pluggable one-request-per-connection channels
//! - [`rpc`]: the client used by the guest and the symmetric server
//! - [`driver`]: the volume lifecycle orchestrator with mount ref counting
//! - [`plugin`]: the container engine's volume plugin protocol over HTTP
//! - [`mock`]: in-memory service and directory-backed volumes for running without a hypervisor

#![warn(missing_docs)]

pub mod config;
pub mod driver;
pub mod error;
pub mod fs;
pub mod mock;
pub mod ops;
pub mod plugin;
pub mod refcount;
pub mod rpc;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
