//! Live vsock backend and listener.

use super::{
    bind_reserved_port, exchange, Channel, ChannelSettings, SocketBinding, TransportBackend,
    TransportError, VSOCKET_BACKEND,
};
use nix::sys::socket::{
    accept, bind, connect, getpeername, listen, socket, AddressFamily, SockFlag, SockType,
    VsockAddr,
};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use vmvol_protocol::cid;

/// Backend that opens a fresh vsock connection per request.
#[derive(Debug, Clone)]
pub struct VsockBackend {
    settings: ChannelSettings,
}

impl VsockBackend {
    /// Create a backend using `settings` for every channel.
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

impl TransportBackend for VsockBackend {
    fn name(&self) -> &'static str {
        VSOCKET_BACKEND
    }

    fn description(&self) -> &'static str {
        "vSocket channel to the hypervisor"
    }

    fn open(&self, remote_cid: u32, remote_port: u32) -> Result<Box<dyn Channel>, TransportError> {
        let fd = vsock_socket().map_err(TransportError::Socket)?;

        // Privileged local ports let the service trust that the caller runs as root.
        let (local_port, ()) = bind_reserved_port(self.settings.ports, |port| {
            bind(fd.as_raw_fd(), &VsockAddr::new(cid::ANY, port)).map_err(std::io::Error::from)
        })?;

        connect(fd.as_raw_fd(), &VsockAddr::new(remote_cid, remote_port)).map_err(|e| {
            TransportError::Connect {
                cid: remote_cid,
                port: remote_port,
                source: e.into(),
            }
        })?;

        let binding = SocketBinding {
            socket: Some(fd.as_raw_fd()),
            local_port: Some(local_port),
            remote_cid,
            remote_port,
        };
        let stream = VsockStream::from_fd(fd);
        stream
            .set_timeouts(self.settings.timeout)
            .map_err(TransportError::Socket)?;

        tracing::debug!(%binding, "vsock channel connected");
        Ok(Box::new(VsockChannel { binding, stream }))
    }
}

struct VsockChannel {
    binding: SocketBinding,
    stream: VsockStream,
}

impl Channel for VsockChannel {
    fn binding(&self) -> &SocketBinding {
        &self.binding
    }

    fn send_and_receive(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        exchange(&mut self.stream, request)
    }
}

/// Connected vsock stream.
#[derive(Debug)]
pub struct VsockStream {
    file: File,
}

impl VsockStream {
    fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Apply `timeout` to both reads and writes. `None` disables the deadline.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        let timeout = timeout.unwrap_or(Duration::ZERO);
        set_socket_timeout(self.file.as_raw_fd(), libc::SO_RCVTIMEO, timeout)?;
        set_socket_timeout(self.file.as_raw_fd(), libc::SO_SNDTIMEO, timeout)
    }
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Listening vsock socket.
#[derive(Debug)]
pub struct VsockListener {
    fd: OwnedFd,
    port: u32,
}

impl VsockListener {
    /// Listen on `port` for any CID with a pending-connection queue of `backlog`.
    pub fn bind(port: u32, backlog: usize) -> std::io::Result<Self> {
        let fd = vsock_socket()?;
        bind(fd.as_raw_fd(), &VsockAddr::new(cid::ANY, port))?;
        listen(&fd, backlog)?;
        Ok(Self { fd, port })
    }

    /// Port this listener is bound to.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Accept one connection, returning the stream and the caller's CID.
    pub fn accept(&self) -> std::io::Result<(VsockStream, u32)> {
        let raw = accept(self.fd.as_raw_fd())?;
        // SAFETY: `accept` returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let peer: VsockAddr = getpeername(fd.as_raw_fd())?;
        Ok((VsockStream::from_fd(fd), peer.cid()))
    }
}

fn vsock_socket() -> std::io::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    Ok(fd)
}

fn set_socket_timeout(fd: RawFd, option: libc::c_int, timeout: Duration) -> std::io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
