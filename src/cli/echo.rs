//! Echo RPC server for transport bring-up.

use clap::Parser;

use vmvol::Result;
use vmvol_protocol::ports;

/// Run an echo RPC server.
#[derive(Parser, Debug)]
#[command(about = "Run an RPC server on vsock that answers each request with its own payload")]
pub struct EchoServerCmd {
    /// Port to listen on
    #[arg(short, long, default_value_t = ports::VOLUME_SERVICE)]
    port: u32,
}

impl EchoServerCmd {
    /// Run the echo server until killed.
    #[cfg(target_os = "linux")]
    pub fn run(self) -> Result<()> {
        let server = vmvol::rpc::RpcServer::listen(self.port)?;
        println!("echo server listening on vsock port {}", server.port());

        let echo = |caller: u32, payload: &[u8]| {
            tracing::info!(caller, len = payload.len(), "echoing request");
            payload.to_vec()
        };
        server.serve(&echo)
    }

    /// Run the echo server until killed.
    #[cfg(not(target_os = "linux"))]
    pub fn run(self) -> Result<()> {
        let _ = self.port;
        Err(vmvol::error::Error::config("echo-server needs vsock, which is only available on Linux"))
    }
}
