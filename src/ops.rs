//! Remote volume operations.
//!
//! [`VolumeOps`] is the orchestrator's view of the hypervisor volume service.
//! [`RemoteVolumeOps`] implements it by sending the JSON command envelope over
//! an [`RpcClient`].

use crate::error::{Error, Result};
use crate::rpc::RpcClient;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;
use vmvol_protocol::{reply_error, Command, DeviceSpec, VolumeOpts, VolumeRequest, VolumeSummary};

/// Volume service operations used by the orchestrator.
pub trait VolumeOps: Send + Sync {
    /// Create a volume.
    fn create(&self, name: &str, opts: &VolumeOpts) -> Result<()>;

    /// Delete a volume.
    fn remove(&self, name: &str) -> Result<()>;

    /// Attach the volume's disk to this VM and report where it landed.
    fn attach(&self, name: &str) -> Result<DeviceSpec>;

    /// Detach the volume's disk from this VM.
    fn detach(&self, name: &str) -> Result<()>;

    /// List all volumes known to the service.
    fn list(&self) -> Result<Vec<VolumeSummary>>;

    /// Fetch the status object for one volume.
    fn get(&self, name: &str) -> Result<Map<String, Value>>;
}

/// [`VolumeOps`] backed by the hypervisor service over RPC.
#[derive(Debug, Clone)]
pub struct RemoteVolumeOps {
    client: RpcClient,
    port: u32,
    backend: String,
}

impl RemoteVolumeOps {
    /// Create ops that call `port` through `backend`.
    pub fn new(client: RpcClient, port: u32, backend: impl Into<String>) -> Self {
        Self {
            client,
            port,
            backend: backend.into(),
        }
    }

    /// Send one command and return the raw reply, with service errors surfaced.
    fn send(&self, cmd: Command, name: &str, opts: &VolumeOpts) -> Result<Vec<u8>> {
        let request = VolumeRequest::new(cmd, name, opts.clone());
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Error::protocol(cmd.as_str(), e.to_string()))?;

        debug!(cmd = %cmd, name = %name, backend = %self.backend, "sending volume command");
        let reply = self.client.call(self.port, &payload, &self.backend)?;

        if let Some(message) = reply_error(&reply) {
            return Err(Error::Remote(message));
        }
        Ok(reply)
    }

    /// Send a command whose success reply carries no data.
    fn send_unit(&self, cmd: Command, name: &str, opts: &VolumeOpts) -> Result<()> {
        self.send(cmd, name, opts).map(drop)
    }

    /// Send a command and decode its reply. A `null` reply decodes as `None`.
    fn send_parsed<T: DeserializeOwned>(&self, cmd: Command, name: &str) -> Result<Option<T>> {
        let reply = self.send(cmd, name, &VolumeOpts::new())?;
        serde_json::from_slice(&reply).map_err(|e| Error::protocol(cmd.as_str(), e.to_string()))
    }
}

impl VolumeOps for RemoteVolumeOps {
    fn create(&self, name: &str, opts: &VolumeOpts) -> Result<()> {
        self.send_unit(Command::Create, name, opts)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.send_unit(Command::Remove, name, &VolumeOpts::new())
    }

    fn attach(&self, name: &str) -> Result<DeviceSpec> {
        self.send_parsed(Command::Attach, name)?
            .ok_or_else(|| Error::protocol(Command::Attach.as_str(), "empty reply"))
    }

    fn detach(&self, name: &str) -> Result<()> {
        self.send_unit(Command::Detach, name, &VolumeOpts::new())
    }

    fn list(&self) -> Result<Vec<VolumeSummary>> {
        Ok(self.send_parsed(Command::List, "")?.unwrap_or_default())
    }

    fn get(&self, name: &str) -> Result<Map<String, Value>> {
        Ok(self.send_parsed(Command::Get, name)?.unwrap_or_default())
    }
}
