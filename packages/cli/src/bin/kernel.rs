// ABOUTME: Entry point for the kernel binary
// ABOUTME: `serve` runs the API server, `reconcile` fails runs orphaned by a crash

use clap::{Parser, Subcommand};
use colored::*;
use kernel_config::KernelConfig;
use std::process;

#[derive(Parser)]
#[command(name = "kernel")]
#[command(about = "Kernel - run sandboxed agents and watch their logs live")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(long, help = "Listen host (overrides KERNEL_API_HOST)")]
        host: Option<String>,
        #[arg(long, help = "Listen port (overrides KERNEL_API_PORT)")]
        port: Option<u16>,
    },
    /// Mark runs left queued or running by a stopped server as failed
    Reconcile,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    kernel_cli::init_tracing();
    let mut config = KernelConfig::from_env()?;

    match command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            kernel_cli::run_server(config).await
        }
        Commands::Reconcile => {
            let swept = kernel_cli::reconcile(&config).await?;
            println!("{} Reconciled {} runs", "✓".green(), swept);
            Ok(())
        }
    }
}
