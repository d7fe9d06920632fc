//! Pluggable request/reply transports to the hypervisor.
//!
//! A [`TransportBackend`] opens one [`Channel`] per request. The channel
//! carries exactly one request and one reply and is closed when dropped, so a
//! stuck or reset connection cannot leak into the next call.
//!
//! Backends are looked up by short name through a [`BackendRegistry`]:
//! - `vsocket`: live vsock channel (Linux only)
//! - `dummy`: answers every request with a canned success reply

mod dummy;
#[cfg(target_os = "linux")]
mod vsock;

pub use dummy::{DummyBackend, DUMMY_REPLY};
#[cfg(target_os = "linux")]
pub use vsock::{VsockBackend, VsockListener, VsockStream};

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vmvol_protocol::{ports, read_reply, write_request, FrameError, MAX_MESSAGE_SIZE};

/// Short name of the live vsock backend.
pub const VSOCKET_BACKEND: &str = "vsocket";

/// Short name of the no-op test backend.
pub const DUMMY_BACKEND: &str = "dummy";

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No backend is registered under the requested name.
    #[error("unknown transport backend '{name}' (available: {available})")]
    UnknownBackend {
        /// Requested name.
        name: String,
        /// Registered names.
        available: String,
    },

    /// Every local port in the reserved range is taken.
    #[error("no free local port in range {first}-{last}")]
    BindExhausted {
        /// First port of the range.
        first: u32,
        /// Last port of the range.
        last: u32,
    },

    /// Binding a local port failed for a reason other than address-in-use.
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        /// Port that was tried.
        port: u32,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Creating the socket failed.
    #[error("failed to create socket: {0}")]
    Socket(std::io::Error),

    /// Connecting to the remote service failed.
    #[error("failed to connect to cid {cid} port {port}: {source}")]
    Connect {
        /// Remote context id.
        cid: u32,
        /// Remote port.
        port: u32,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Message exceeds the protocol limit.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    Oversized {
        /// Observed size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// The peer violated the framing rules (short read, truncated payload).
    #[error("malformed message: {0}")]
    Framing(String),

    /// The socket read or write deadline expired.
    #[error("timed out waiting for the volume service")]
    Timeout,

    /// I/O error while exchanging the message.
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooLarge(size) => TransportError::Oversized {
                size,
                max: MAX_MESSAGE_SIZE,
            },
            FrameError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                TransportError::Timeout
            }
            FrameError::Io(e) => TransportError::Io(e),
            other => TransportError::Framing(other.to_string()),
        }
    }
}

// ============================================================================
// Channel Model
// ============================================================================

/// Inclusive range of local ports a client may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    /// Lowest port.
    pub first: u32,
    /// Highest port.
    pub last: u32,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            first: ports::CLIENT_FIRST,
            last: ports::CLIENT_LAST,
        }
    }
}

impl PortRange {
    /// Create a range. `first` must not exceed `last`.
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        if self.first > self.last {
            0
        } else {
            (self.last - self.first) as usize + 1
        }
    }

    /// Whether the range contains no ports.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ports in the order they are tried (highest first).
    pub fn descending(&self) -> impl Iterator<Item = u32> {
        (self.first..=self.last).rev()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

/// Bookkeeping for one live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketBinding {
    /// Local socket descriptor, if the backend uses one.
    pub socket: Option<i32>,
    /// Local port bound from the reserved range, if any.
    pub local_port: Option<u32>,
    /// Remote context id.
    pub remote_cid: u32,
    /// Remote service port.
    pub remote_port: u32,
}

impl fmt::Display for SocketBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(fd) = self.socket {
            write!(f, "fd {} ", fd)?;
        }
        match self.local_port {
            Some(port) => write!(f, "{} -> {}:{}", port, self.remote_cid, self.remote_port),
            None => write!(f, "-> {}:{}", self.remote_cid, self.remote_port),
        }
    }
}

/// Per-channel settings shared by socket backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Local ports to try when binding.
    pub ports: PortRange,
    /// Read/write deadline for the exchange. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ports: PortRange::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// A single-use request/reply channel.
pub trait Channel: Send {
    /// Describe the underlying binding.
    fn binding(&self) -> &SocketBinding;

    /// Send one request and block until the full reply has arrived.
    fn send_and_receive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Close the channel. Dropping the channel has the same effect.
    fn close(self: Box<Self>) {}
}

/// Factory for channels to a remote service.
pub trait TransportBackend: Send + Sync {
    /// Short name used for lookup (e.g., "vsocket").
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Open a channel to `cid`:`port`.
    fn open(&self, cid: u32, port: u32) -> Result<Box<dyn Channel>, TransportError>;
}

/// Name -> backend lookup table.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn TransportBackend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in backends for this platform.
    pub fn with_defaults(settings: ChannelSettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DummyBackend));

        #[cfg(target_os = "linux")]
        registry.register(Arc::new(VsockBackend::new(settings)));
        #[cfg(not(target_os = "linux"))]
        let _ = settings;

        registry
    }

    /// Register a backend, replacing any backend with the same name.
    pub fn register(&mut self, backend: Arc<dyn TransportBackend>) {
        self.backends.insert(backend.name(), backend);
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TransportBackend>, TransportError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownBackend {
                name: name.to_string(),
                available: self.describe().join(", "),
            })
    }

    /// `name (description)` for each registered backend, sorted by name.
    pub fn describe(&self) -> Vec<String> {
        self.names()
            .into_iter()
            .filter_map(|name| self.backends.get(name))
            .map(|b| format!("{} ({})", b.name(), b.description()))
            .collect()
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Bind a local port from `range`, trying ports from the top down.
///
/// `try_bind` is called with each candidate port. Address-in-use moves on to
/// the next port; any other error aborts. Returns the bound port together
/// with whatever `try_bind` produced.
pub fn bind_reserved_port<T, F>(range: PortRange, mut try_bind: F) -> Result<(u32, T), TransportError>
where
    F: FnMut(u32) -> std::io::Result<T>,
{
    for port in range.descending() {
        match try_bind(port) {
            Ok(bound) => return Ok((port, bound)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::trace!(port, "local port in use, trying next");
            }
            Err(e) => return Err(TransportError::Bind { port, source: e }),
        }
    }

    Err(TransportError::BindExhausted {
        first: range.first,
        last: range.last,
    })
}

/// Run one request/reply exchange over a connected stream.
pub fn exchange<S: Read + Write>(stream: &mut S, request: &[u8]) -> Result<Vec<u8>, TransportError> {
    write_request(stream, request)?;
    Ok(read_reply(stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{Error as IoError, ErrorKind};
    use std::os::unix::net::UnixStream;

    fn occupied(ports: HashSet<u32>) -> impl FnMut(u32) -> std::io::Result<u32> {
        move |port| {
            if ports.contains(&port) {
                Err(IoError::from(ErrorKind::AddrInUse))
            } else {
                Ok(port)
            }
        }
    }

    #[test]
    fn test_bind_takes_last_free_port() {
        let range = PortRange::new(100, 109);
        // Every port but the lowest is taken; descending order reaches it last.
        let taken: HashSet<u32> = (101..=109).collect();

        let (port, bound) = bind_reserved_port(range, occupied(taken)).unwrap();
        assert_eq!(port, 100);
        assert_eq!(bound, 100);
    }

    #[test]
    fn test_bind_exhausted_when_all_taken() {
        let range = PortRange::new(100, 109);
        let taken: HashSet<u32> = (100..=109).collect();

        let mut attempts = 0;
        let mut inner = occupied(taken);
        let result = bind_reserved_port(range, |p| {
            attempts += 1;
            inner(p)
        });
        assert!(matches!(
            result,
            Err(TransportError::BindExhausted {
                first: 100,
                last: 109
            })
        ));
        assert_eq!(attempts, range.len());
    }

    #[test]
    fn test_bind_aborts_on_other_errors() {
        let range = PortRange::new(100, 109);
        let mut attempts = 0;
        let result: Result<(u32, ()), _> = bind_reserved_port(range, |_| {
            attempts += 1;
            Err(IoError::from(ErrorKind::PermissionDenied))
        });
        assert!(matches!(result, Err(TransportError::Bind { port: 109, .. })));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_port_range_len() {
        assert_eq!(PortRange::default().len(), 924);
        assert_eq!(PortRange::new(5, 5).len(), 1);
        assert!(PortRange::new(6, 5).is_empty());
        assert_eq!(PortRange::new(1, 3).descending().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::with_defaults(ChannelSettings::default());
        assert_eq!(registry.get(DUMMY_BACKEND).unwrap().name(), DUMMY_BACKEND);

        #[cfg(target_os = "linux")]
        assert_eq!(registry.get(VSOCKET_BACKEND).unwrap().name(), VSOCKET_BACKEND);

        match registry.get("carrier-pigeon") {
            Err(TransportError::UnknownBackend { name, available }) => {
                assert_eq!(name, "carrier-pigeon");
                assert!(available.contains("dummy (no-op backend which only returns OK, for testing)"));
            }
            other => panic!("expected UnknownBackend, got {:?}", other.map(|b| b.name())),
        }
    }

    #[test]
    fn test_binding_display() {
        let mut binding = SocketBinding {
            socket: None,
            local_port: Some(1023),
            remote_cid: 2,
            remote_port: 1019,
        };
        assert_eq!(binding.to_string(), "1023 -> 2:1019");

        binding.socket = Some(7);
        binding.local_port = None;
        assert_eq!(binding.to_string(), "fd 7 -> 2:1019");
    }

    #[test]
    fn test_exchange_over_stream() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let peer = std::thread::spawn(move || {
            let request = vmvol_protocol::read_request(&mut server).unwrap();
            vmvol_protocol::write_reply(&mut server, &request).unwrap();
            // Dropping `server` closes the connection and ends the reply.
        });

        let reply = exchange(&mut client, br#"{"cmd":"list"}"#).unwrap();
        assert_eq!(reply, br#"{"cmd":"list"}"#);
        peer.join().unwrap();
    }

    #[test]
    fn test_exchange_peer_hangs_up_without_reply() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let peer = std::thread::spawn(move || {
            let _ = vmvol_protocol::read_request(&mut server).unwrap();
        });

        let result = exchange(&mut client, b"{}");
        assert!(matches!(result, Err(TransportError::Framing(_))));
        peer.join().unwrap();
    }

    #[test]
    fn test_exchange_times_out() {
        let (mut client, _server) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        let result = exchange(&mut client, b"{}");
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_oversized_frame_maps_to_transport_error() {
        let err = TransportError::from(FrameError::TooLarge(MAX_MESSAGE_SIZE + 1));
        assert!(matches!(err, TransportError::Oversized { .. }));
    }
}
