//! RPC client for the hypervisor volume service.

use crate::error::Result;
use crate::transport::BackendRegistry;
use tracing::{debug, warn};

/// Client that performs one request/reply exchange per call.
///
/// The client never retries: a failed call is reported as-is and the caller
/// decides whether to try again.
#[derive(Debug, Clone)]
pub struct RpcClient {
    registry: BackendRegistry,
    remote_cid: u32,
}

impl RpcClient {
    /// Create a client that talks to `remote_cid` using backends from `registry`.
    pub fn new(registry: BackendRegistry, remote_cid: u32) -> Self {
        Self {
            registry,
            remote_cid,
        }
    }

    /// Send `request` to `port` over the backend named `backend` and return the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backend` is not registered
    /// - the channel cannot be opened (bind exhaustion, connection refused)
    /// - the exchange fails (short read, oversized message, timeout)
    pub fn call(&self, port: u32, request: &[u8], backend: &str) -> Result<Vec<u8>> {
        let backend = self.registry.get(backend)?;
        let mut channel = backend.open(self.remote_cid, port)?;
        let binding = channel.binding().clone();

        let result = channel.send_and_receive(request);
        channel.close();

        match result {
            Ok(reply) => {
                debug!(%binding, request_len = request.len(), reply_len = reply.len(), "rpc call complete");
                Ok(reply)
            }
            Err(e) => {
                warn!(%binding, error = %e, "rpc call failed");
                Err(e.into())
            }
        }
    }
}
