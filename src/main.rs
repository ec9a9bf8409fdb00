use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vibecc::config::ServerConfig;
use vibecc::server;

#[derive(Parser)]
#[command(name = "vibecc")]
#[command(version, about = "Autonomous ticket-to-merge pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server and scheduler
    Serve {
        #[arg(long)]
        port: Option<u16>,

        /// Path to the SQLite database
        #[arg(long)]
        db: Option<PathBuf>,

        /// Path to the local working tree of the target repository
        #[arg(long)]
        repo_path: Option<PathBuf>,

        /// Directory for rolling log files (stderr only when omitted)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
}

fn init_tracing(verbose: bool, log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "vibecc=debug" } else { "vibecc=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vibecc.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db,
            repo_path,
            log_dir,
            dev,
        } => {
            let mut config = ServerConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(repo_path) = repo_path {
                config.runtime.repo_path = repo_path;
            }
            if let Some(log_dir) = log_dir {
                config.log_dir = Some(log_dir);
            }
            config.dev_mode = dev;

            let _log_guard = init_tracing(cli.verbose, config.log_dir.as_ref());
            server::start_server(config).await
        }
    }
}
