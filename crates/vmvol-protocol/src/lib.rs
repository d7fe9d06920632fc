//! Protocol types for vmvol guest-hypervisor communication.
//!
//! This crate defines the wire protocol spoken over vsock between the guest
//! volume plugin and the hypervisor-side volume service.
//!
//! # Protocol Overview
//!
//! Every exchange uses a fresh connection carrying exactly one request and
//! one reply. The request is JSON prefixed with a 4-byte big-endian length
//! header. The reply is raw JSON terminated by the server closing the
//! connection.
//!
//! ```text
//! guest -> host:  +----------------+-------------------+
//!                 | Length (4 BE)  | JSON command      |
//!                 +----------------+-------------------+
//! host -> guest:  | JSON reply ... until EOF           |
//! ```

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Protocol version carried in every command envelope.
pub const PROTOCOL_VERSION: u32 = 2;

/// Maximum size of a request or reply payload (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Pending-connection queue depth for the service listener.
pub const LISTEN_BACKLOG: usize = 128;

/// Well-known vsock ports.
pub mod ports {
    /// Hypervisor volume service port.
    pub const VOLUME_SERVICE: u32 = 1019;
    /// Lowest local port a client may bind.
    pub const CLIENT_FIRST: u32 = 100;
    /// Highest local port a client may bind (last privileged port).
    pub const CLIENT_LAST: u32 = 1023;
}

/// vsock CID constants.
pub mod cid {
    /// Hypervisor CID.
    pub const HYPERVISOR: u32 = 2;
    /// Any CID (for listening and client binds).
    pub const ANY: u32 = u32::MAX;
}

/// Volume option keys understood by the guest plugin.
pub mod opts {
    /// Filesystem type to create on a new volume.
    pub const FSTYPE: &str = "fstype";
    /// Source volume for a clone. Skips filesystem provisioning.
    pub const CLONE_FROM: &str = "clone-from";
}

/// Status field keys read from a `get` reply.
pub mod status {
    /// Access mode (`read-write` or `read-only`).
    pub const ACCESS: &str = "access";
    /// Filesystem type.
    pub const FSTYPE: &str = "fstype";
    /// Read-only access value.
    pub const READ_ONLY: &str = "read-only";
}

/// Free-form volume options (`Opts` in the envelope).
pub type VolumeOpts = BTreeMap<String, String>;

// ============================================================================
// Command Envelope
// ============================================================================

/// Remote volume command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Create a volume.
    Create,
    /// Remove a volume.
    Remove,
    /// Attach a volume to the calling guest.
    Attach,
    /// Detach a volume from the calling guest.
    Detach,
    /// List all volumes.
    List,
    /// Get a volume's status.
    Get,
}

impl Command {
    /// Command name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Create => "create",
            Command::Remove => "remove",
            Command::Attach => "attach",
            Command::Detach => "detach",
            Command::List => "list",
            Command::Get => "get",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request sent to the volume service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Command to execute.
    pub cmd: Command,
    /// Target volume and options.
    pub details: RequestDetails,
    /// Protocol version.
    pub version: u32,
}

/// Per-command arguments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestDetails {
    /// Volume name (empty for `list`).
    #[serde(rename = "Name")]
    pub name: String,
    /// Volume options.
    #[serde(rename = "Opts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub opts: VolumeOpts,
}

impl VolumeRequest {
    /// Build a request for `cmd` on `name`.
    pub fn new(cmd: Command, name: impl Into<String>, opts: VolumeOpts) -> Self {
        Self {
            cmd,
            details: RequestDetails {
                name: name.into(),
                opts,
            },
            version: PROTOCOL_VERSION,
        }
    }
}

/// Structured error reply from the volume service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error text reported by the service.
    #[serde(rename = "Error")]
    pub error: String,
}

/// Attach reply: where the disk appeared on the guest's SCSI bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// SCSI unit number on the controller.
    #[serde(rename = "Unit")]
    pub unit: String,
    /// PCI slot number of the SCSI controller.
    #[serde(rename = "ControllerPciSlotNumber")]
    pub controller_pci_slot_number: String,
}

/// One entry in a `list` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSummary {
    /// Volume name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Service-defined attributes.
    #[serde(rename = "Attributes", default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Extract the service error text from a reply, if the reply is an error.
///
/// Anything that is not a JSON object with a string `Error` field is a
/// success reply.
pub fn reply_error(reply: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorReply>(reply)
        .ok()
        .map(|e| e.error)
}

// ============================================================================
// Wire Format Helpers
// ============================================================================

/// Encode a request payload to wire format (length-prefixed).
pub fn encode_request(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Write one length-prefixed request.
pub fn write_request<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let frame = encode_request(payload)?;
    writer.write_all(&frame).map_err(FrameError::Io)?;
    writer.flush().map_err(FrameError::Io)
}

/// Read one length-prefixed request.
pub fn read_request<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::TooShort,
        _ => FrameError::Io(e),
    })?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = Vec::with_capacity(len);
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(FrameError::Io)?;
    if buf.len() < len {
        return Err(FrameError::Incomplete {
            expected: len,
            got: buf.len(),
        });
    }

    tracing::trace!(len, "read request frame");
    Ok(buf)
}

/// Write a reply. The caller closes the connection afterwards to end it.
pub fn write_reply<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(payload).map_err(FrameError::Io)?;
    writer.flush().map_err(FrameError::Io)
}

/// Read a reply until the peer closes the connection.
///
/// Replies larger than [`MAX_MESSAGE_SIZE`] are rejected rather than
/// truncated. An empty reply means the peer hung up without answering.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    reader
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(FrameError::Io)?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(buf.len()));
    }
    if buf.is_empty() {
        return Err(FrameError::TooShort);
    }

    tracing::trace!(len = buf.len(), "read reply");
    Ok(buf)
}

/// Error framing a wire message.
#[derive(Debug)]
pub enum FrameError {
    /// Connection ended before a header (or any reply byte) arrived.
    TooShort,
    /// Message exceeds [`MAX_MESSAGE_SIZE`].
    TooLarge(usize),
    /// Connection ended in the middle of a payload.
    Incomplete {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// Underlying I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "connection closed before message arrived"),
            FrameError::TooLarge(size) => write!(
                f,
                "message too large: {} bytes (max {} bytes)",
                size, MAX_MESSAGE_SIZE
            ),
            FrameError::Incomplete { expected, got } => {
                write!(f, "incomplete message: expected {} bytes, got {}", expected, got)
            }
            FrameError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}
