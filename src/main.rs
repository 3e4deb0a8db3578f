//! veertu CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// veertu - manage a Veertu VM through VeertuManage
#[derive(Parser, Debug)]
#[command(name = "veertu")]
#[command(about = "Manage a Veertu virtual machine")]
#[command(version)]
struct Cli {
    /// VeertuManage identifier of the VM.
    #[arg(long, global = true)]
    id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the VM state.
    Status(cli::lifecycle::StatusCmd),

    /// Import a box as a new VM.
    Import(cli::package::ImportCmd),

    /// Configure and boot the VM.
    Up(cli::lifecycle::UpCmd),

    /// Shut the VM down.
    Halt(cli::lifecycle::HaltCmd),

    /// Pause the VM.
    Suspend(cli::lifecycle::SuspendCmd),

    /// Resume a paused or stopped VM.
    Resume(cli::lifecycle::ResumeCmd),

    /// Delete the VM.
    #[command(alias = "rm")]
    Destroy(cli::lifecycle::DestroyCmd),

    /// List forwarded ports.
    Ports(cli::ports::PortsCmd),

    /// Forward a host port to the guest.
    Forward(cli::ports::ForwardCmd),

    /// Remove all forwarded ports.
    ClearPorts(cli::ports::ClearPortsCmd),

    /// Show the SSH endpoint.
    SshInfo(cli::ports::SshInfoCmd),

    /// Export the VM as a box.
    Export(cli::package::ExportCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = veertu::VERSION, "starting veertu");

    let result = match cli.command {
        Commands::Status(cmd) => cmd.run(cli.id),
        Commands::Import(cmd) => cmd.run(cli.id),
        Commands::Up(cmd) => cmd.run(cli.id),
        Commands::Halt(cmd) => cmd.run(cli.id),
        Commands::Suspend(cmd) => cmd.run(cli.id),
        Commands::Resume(cmd) => cmd.run(cli.id),
        Commands::Destroy(cmd) => cmd.run(cli.id),
        Commands::Ports(cmd) => cmd.run(cli.id),
        Commands::Forward(cmd) => cmd.run(cli.id),
        Commands::ClearPorts(cmd) => cmd.run(cli.id),
        Commands::SshInfo(cmd) => cmd.run(cli.id),
        Commands::Export(cmd) => cmd.run(cli.id),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("veertu=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
