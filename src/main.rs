//! vmvol CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// vmvol - guest-side volume plugin for hypervisor-managed disks
#[derive(Parser, Debug)]
#[command(name = "vmvol")]
#[command(about = "Guest-side volume plugin for hypervisor-managed disks")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the volume plugin to the container engine.
    Serve(cli::serve::ServeCmd),

    /// Send one raw request to the volume service and print the reply.
    Call(cli::call::CallCmd),

    /// Run an RPC server that echoes every request back.
    EchoServer(cli::echo::EchoServerCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_json);

    tracing::debug!(version = vmvol::VERSION, "starting vmvol");

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Call(cmd) => cmd.run(),
        Commands::EchoServer(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmvol=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
