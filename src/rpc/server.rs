//! Hypervisor-side RPC peer.
//!
//! Each accepted connection carries exactly one request and one reply and is
//! closed by the server once the reply is written. No state survives between
//! requests.

use crate::error::Result;
use crate::transport::TransportError;
use std::io::{Read, Write};
use tracing::{debug, info, warn};
use vmvol_protocol::{read_request, write_reply};

/// Service logic invoked for each request.
pub trait RequestHandler: Send + Sync {
    /// Produce the reply for `request` sent by guest `caller`.
    fn handle(&self, caller: u32, request: &[u8]) -> Vec<u8>;
}

impl<F> RequestHandler for F
where
    F: Fn(u32, &[u8]) -> Vec<u8> + Send + Sync,
{
    fn handle(&self, caller: u32, request: &[u8]) -> Vec<u8> {
        self(caller, request)
    }
}

/// An accepted connection awaiting its single reply.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
}

impl<S: Write> Connection<S> {
    /// Write the reply and close the connection.
    pub fn reply(mut self, payload: &[u8]) -> Result<()> {
        write_reply(&mut self.stream, payload).map_err(TransportError::from)?;
        Ok(())
    }
}

/// A decoded request.
#[derive(Debug)]
pub struct Incoming<S> {
    /// CID of the guest that sent the request, taken from the socket address.
    pub caller: u32,
    /// Request payload.
    pub payload: Vec<u8>,
    /// Connection to reply on.
    pub connection: Connection<S>,
}

impl<S: Read + Write> Incoming<S> {
    /// Read one request from a freshly accepted stream.
    pub fn read(mut stream: S, caller: u32) -> Result<Self> {
        let payload = read_request(&mut stream).map_err(TransportError::from)?;
        Ok(Self {
            caller,
            payload,
            connection: Connection { stream },
        })
    }
}

/// Serve a single connection: read the request, run `handler`, reply, close.
pub fn handle_connection<S, H>(stream: S, caller: u32, handler: &H) -> Result<()>
where
    S: Read + Write,
    H: RequestHandler + ?Sized,
{
    let incoming = Incoming::read(stream, caller)?;
    debug!(caller, len = incoming.payload.len(), "received request");

    let reply = handler.handle(incoming.caller, &incoming.payload);
    incoming.connection.reply(&reply)?;

    debug!(caller, len = reply.len(), "sent reply");
    Ok(())
}

#[cfg(target_os = "linux")]
pub use listener::RpcServer;

#[cfg(target_os = "linux")]
mod listener {
    use super::*;
    use crate::transport::{VsockListener, VsockStream};
    use vmvol_protocol::LISTEN_BACKLOG;

    /// vsock RPC server.
    #[derive(Debug)]
    pub struct RpcServer {
        listener: VsockListener,
    }

    impl RpcServer {
        /// Listen on `port` with the standard backlog.
        pub fn listen(port: u32) -> Result<Self> {
            let listener = VsockListener::bind(port, LISTEN_BACKLOG)?;
            info!(port, backlog = LISTEN_BACKLOG, "listening on vsock");
            Ok(Self { listener })
        }

        /// Port this server listens on.
        pub fn port(&self) -> u32 {
            self.listener.port()
        }

        /// Block until one request arrives.
        pub fn accept_one(&self) -> Result<Incoming<VsockStream>> {
            let (stream, caller) = self.listener.accept()?;
            Incoming::read(stream, caller)
        }

        /// Serve requests forever. Per-connection failures are logged and skipped.
        pub fn serve<H: RequestHandler + ?Sized>(&self, handler: &H) -> Result<()> {
            loop {
                match self.listener.accept() {
                    Ok((stream, caller)) => {
                        if let Err(e) = handle_connection(stream, caller, handler) {
                            warn!(caller, error = %e, "connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept error");
                    }
                }
            }
        }

        /// Stop listening.
        pub fn close(self) {
            info!(port = self.port(), "closing vsock listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::exchange;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_one_request_one_reply() {
        let (mut client, server) = UnixStream::pair().unwrap();

        let peer = std::thread::spawn(move || {
            let handler = |caller: u32, req: &[u8]| {
                format!("{{\"caller\":{},\"len\":{}}}", caller, req.len()).into_bytes()
            };
            handle_connection(server, 7, &handler).unwrap();
        });

        let reply = exchange(&mut client, br#"{"cmd":"get"}"#).unwrap();
        assert_eq!(reply, br#"{"caller":7,"len":13}"#);
        peer.join().unwrap();
    }

    #[test]
    fn test_incoming_exposes_caller_and_payload() {
        let (mut client, server) = UnixStream::pair().unwrap();
        vmvol_protocol::write_request(&mut client, b"ping").unwrap();

        let incoming = Incoming::read(server, 42).unwrap();
        assert_eq!(incoming.caller, 42);
        assert_eq!(incoming.payload, b"ping");
        incoming.connection.reply(b"pong").unwrap();

        let reply = vmvol_protocol::read_reply(&mut client).unwrap();
        assert_eq!(reply, b"pong");
    }

    #[test]
    fn test_truncated_request_is_error() {
        let (mut client, server) = UnixStream::pair().unwrap();
        client.write_all(&[0, 0, 0, 10, b'{']).unwrap();
        drop(client);

        let handler = |_: u32, _: &[u8]| b"null".to_vec();
        let result = handle_connection(server, 3, &handler);
        assert!(result.is_err());
    }
}
