//! One-shot RPC over a pluggable transport.
//!
//! - [`RpcClient`]: guest side, one channel per call
//! - [`server`]: hypervisor-side peer, one connection per request

mod client;
pub mod server;

pub use client::RpcClient;
#[cfg(target_os = "linux")]
pub use server::RpcServer;
pub use server::{Connection, Incoming, RequestHandler};
