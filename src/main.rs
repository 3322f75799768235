use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use dropsync::config::{resolve_root, Config};
use dropsync::server::{run_server, ServerConfig};
use dropsync::sync::{run_client, ClientConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dropsync")]
#[command(version, about = "One-way directory replication over TCP")]
struct Cli {
    /// Config file (default: <config dir>/dropsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and stream its changes to a server
    Watch {
        /// Server address, host or host:port
        server: String,

        /// Directory to watch (default: current directory)
        dir: Option<PathBuf>,

        /// Server port when the address names none
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not send existing files on startup
        #[arg(long)]
        no_initial_scan: bool,
    },
    /// Receive changes into a directory
    Serve {
        /// Directory to replicate into (default: current directory)
        dir: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(cli.verbose, config.log_level.as_deref());

    match cli.command {
        Commands::Watch {
            server,
            dir,
            port,
            no_initial_scan,
        } => {
            let root = resolve_root(dir.as_deref())?;
            run_client(ClientConfig {
                server,
                port: port.unwrap_or(config.port),
                root,
                frame_window: config.frame_window(),
                initial_scan: config.initial_scan && !no_initial_scan,
            })
            .await?;
        }
        Commands::Serve { dir, port, bind } => {
            let root = resolve_root(dir.as_deref())?;
            run_server(ServerConfig {
                root,
                bind: bind.unwrap_or(config.bind),
                port: port.unwrap_or(config.port),
            })
            .await?;
        }
    }

    Ok(())
}

/// Log to stderr. RUST_LOG wins, then -v, then the configured level.
fn init_logging(verbose: u8, configured: Option<&str>) {
    let default_filter = match verbose {
        0 => configured.unwrap_or("dropsync=info").to_string(),
        1 => "dropsync=debug".to_string(),
        _ => "dropsync=trace".to_string(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
