//! Volume plugin server command.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use vmvol::config::PluginConfig;
use vmvol::driver::VolumeDriver;
use vmvol::error::Error;
use vmvol::fs::{Filesystem, HostFilesystem};
use vmvol::mock::{MockFilesystem, MockVolumeOps};
use vmvol::ops::{RemoteVolumeOps, VolumeOps};
use vmvol::rpc::RpcClient;
use vmvol::transport::BackendRegistry;
use vmvol::Result;

/// Serve the volume plugin.
#[derive(Parser, Debug)]
#[command(about = "Serve the volume plugin to the container engine")]
#[command(after_long_help = "\
PLUGIN ENDPOINTS (all POST):
  /Plugin.Activate
  /VolumeDriver.Create /VolumeDriver.Remove
  /VolumeDriver.Mount  /VolumeDriver.Unmount
  /VolumeDriver.Path   /VolumeDriver.Get
  /VolumeDriver.List   /VolumeDriver.Capabilities

EXAMPLES:
  vmvol serve                          Use /etc/vmvol/config.toml or defaults
  vmvol serve --mock                   Run without a hypervisor (in-memory volumes)
  vmvol serve -l 127.0.0.1:9000        Listen on port 9000")]
pub struct ServeCmd {
    /// Config file (defaults to /etc/vmvol/config.toml, then the user config dir)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address and port to listen on
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Directory under which volumes are mounted
    #[arg(long, value_name = "DIR")]
    mount_root: Option<PathBuf>,

    /// Volume service port on the hypervisor
    #[arg(long)]
    port: Option<u32>,

    /// Transport backend (vsocket, dummy)
    #[arg(long)]
    backend: Option<String>,

    /// Use an in-memory volume service; volumes are plain directories
    #[arg(long)]
    mock: bool,

    /// Deadline for each RPC (e.g. "30s"); "0s" disables it
    #[arg(long, value_name = "DURATION")]
    rpc_timeout: Option<humantime::Duration>,

    /// Do not write the plugin spec file
    #[arg(long)]
    no_spec_file: bool,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self) -> Result<()> {
        let config = self.resolve_config()?;

        let (ops, fs): (Box<dyn VolumeOps>, Box<dyn Filesystem>) = if config.mock {
            tracing::warn!("mock mode: volumes are in-memory and backed by plain directories");
            (Box::new(MockVolumeOps::new()), Box::new(MockFilesystem::new()))
        } else {
            let registry = BackendRegistry::with_defaults(config.channel_settings());
            // Fail before serving if the backend name is wrong.
            registry.get(&config.backend)?;

            let client = RpcClient::new(registry, config.remote_cid);
            let ops = RemoteVolumeOps::new(client, config.service_port, config.backend.clone());
            (Box::new(ops), Box::new(HostFilesystem::new()))
        };
        let driver = VolumeDriver::new(ops, fs, config.driver_config());

        std::fs::create_dir_all(&config.mount_root)?;
        if let Err(e) = driver.init_refcounts() {
            tracing::warn!(error = %e, "could not read mount table; starting with no mounted volumes");
        }

        tracing::info!(
            version = vmvol::VERSION,
            backend = %config.backend,
            mock = config.mock,
            port = config.service_port,
            mount_root = %config.mount_root.display(),
            "volume plugin starting"
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        runtime.block_on(run_server(Arc::new(driver), config))
    }

    fn resolve_config(&self) -> Result<PluginConfig> {
        let mut config = PluginConfig::load(self.config.as_deref())?;

        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(root) = &self.mount_root {
            config.mount_root = root.clone();
        }
        if let Some(port) = self.port {
            config.service_port = port;
        }
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        if self.mock {
            config.mock = true;
        }
        if let Some(timeout) = self.rpc_timeout {
            config.rpc_timeout = timeout.into();
        }
        if self.no_spec_file {
            config.spec_dir = None;
        }

        config.validate()?;
        Ok(config)
    }
}

async fn run_server(driver: Arc<VolumeDriver>, config: PluginConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| Error::config(format!("cannot listen on {}: {}", config.listen_addr, e)))?;
    let addr = listener.local_addr().map_err(Error::Io)?;

    let spec_file = config.spec_file();
    if let Some(path) = &spec_file {
        if let Err(e) = vmvol::plugin::write_spec_file(path, &addr.to_string()) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write plugin spec file");
        }
    }

    tracing::info!(address = %addr, driver = %config.driver_name, "volume plugin listening");

    let app = vmvol::plugin::create_router(driver);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    if let Some(path) = &spec_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Wait for shutdown signal. Mounted volumes stay mounted.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
