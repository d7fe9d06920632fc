//! Raw RPC diagnostic command.

use clap::Parser;

use vmvol::error::Error;
use vmvol::rpc::RpcClient;
use vmvol::transport::{BackendRegistry, ChannelSettings, PortRange, VSOCKET_BACKEND};
use vmvol::Result;
use vmvol_protocol::{cid, ports, reply_error};

/// Send one request to the volume service.
#[derive(Parser, Debug)]
#[command(about = "Send one raw JSON request to the volume service and print the reply")]
#[command(after_long_help = "\
EXAMPLES:
  vmvol call '{\"cmd\":\"list\",\"details\":{\"Name\":\"\"},\"version\":2}'
  vmvol call --backend dummy '{\"cmd\":\"get\",\"details\":{\"Name\":\"vol1\"},\"version\":2}'")]
pub struct CallCmd {
    /// Service port
    #[arg(short, long, default_value_t = ports::VOLUME_SERVICE)]
    port: u32,

    /// Remote context id
    #[arg(long, default_value_t = cid::HYPERVISOR)]
    cid: u32,

    /// Transport backend (vsocket, dummy)
    #[arg(short, long, default_value = VSOCKET_BACKEND)]
    backend: String,

    /// Reply deadline; "0s" waits forever
    #[arg(long, default_value = "30s", value_name = "DURATION")]
    timeout: humantime::Duration,

    /// JSON request payload
    request: String,
}

impl CallCmd {
    /// Run the call command.
    pub fn run(self) -> Result<()> {
        serde_json::from_str::<serde_json::Value>(&self.request)
            .map_err(|e| Error::config(format!("request is not valid JSON: {}", e)))?;

        let timeout: std::time::Duration = self.timeout.into();
        let settings = ChannelSettings {
            ports: PortRange::default(),
            timeout: (!timeout.is_zero()).then_some(timeout),
        };
        let client = RpcClient::new(BackendRegistry::with_defaults(settings), self.cid);

        let reply = client.call(self.port, self.request.as_bytes(), &self.backend)?;
        println!("{}", String::from_utf8_lossy(&reply));

        match reply_error(&reply) {
            Some(message) => Err(Error::Remote(message)),
            None => Ok(()),
        }
    }
}
