// Gantry daemon - hot-plug device events dispatched to sandboxed plugins
//
// The daemon owns:
// - device notification sources and the conditioning pipeline
// - the append-only event log and audit trail
// - plugin discovery, validation, and the isolated worker runtime
// - a JSON-RPC control socket for health, status, submit, and stop

use anyhow::Result;
use clap::{Parser, Subcommand};
use gantry_daemon::{client, lifecycle, server};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit codes for different failure classes.
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const RUNTIME_ERROR: i32 = 2;
    pub const CLIENT_ERROR: i32 = 3;
}

#[derive(Parser)]
#[command(name = "gantryd", version, about = "Hot-plug device plugin host")]
struct Cli {
    /// Config file path (defaults to the XDG config location).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Control socket path (defaults to the XDG runtime location).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Run,
    /// Query daemon health.
    Status,
    /// List registered plugins and running instances.
    Plugins,
    /// Submit a plugin package directory for validation (and start it).
    Submit {
        /// Package directory containing plugin.yaml.
        path: PathBuf,
        /// Validate only, do not start an instance.
        #[arg(long)]
        no_start: bool,
    },
    /// Stop a running plugin instance gracefully.
    Stop {
        /// Plugin id.
        id: String,
    },
    /// Re-read the config file; applies to newly loaded instances only.
    Reload,
    /// Ask a running daemon to shut down.
    Shutdown,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let Cli {
        config,
        socket,
        command,
    } = Cli::parse();
    let control_socket = socket.clone().unwrap_or_else(lifecycle::socket_path);

    let code = match command {
        Command::Run => run_daemon(config, socket).await,
        Command::Status => client_call(&control_socket, "health", json!({})).await,
        Command::Plugins => client_call(&control_socket, "plugin.list", json!({})).await,
        Command::Submit { path, no_start } => {
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            client_call(
                &control_socket,
                "plugin.submit",
                json!({ "path": path, "start": !no_start }),
            )
            .await
        }
        Command::Stop { id } => {
            client_call(&control_socket, "plugin.stop", json!({ "id": id })).await
        }
        Command::Reload => client_call(&control_socket, "config.reload", json!({})).await,
        Command::Shutdown => client_call(&control_socket, "shutdown", json!({})).await,
    };
    process::exit(code);
}

async fn run_daemon(config: Option<PathBuf>, socket: Option<PathBuf>) -> i32 {
    info!("starting gantryd v{}", env!("CARGO_PKG_VERSION"));

    let config_path = config.unwrap_or_else(gantry_config::default_config_path);
    let config = match gantry_config::ConfigHandle::load_or_default(&config_path) {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!("failed to load configuration: {e}");
            return exit_codes::CONFIG_ERROR;
        }
    };

    let snapshot = config.snapshot();
    let socket = socket
        .or_else(|| snapshot.daemon.socket_path.clone())
        .unwrap_or_else(lifecycle::socket_path);
    let pid_file = snapshot
        .daemon
        .pid_path
        .clone()
        .unwrap_or_else(lifecycle::pid_path);

    if lifecycle::is_daemon_running_at(&pid_file) {
        error!("gantryd already running (pid file {})", pid_file.display());
        return exit_codes::CONFIG_ERROR;
    }
    if let Err(e) = lifecycle::write_pid_file(&pid_file) {
        error!("failed to write pid file: {e}");
        return exit_codes::CONFIG_ERROR;
    }

    let result = serve(config, &socket).await;

    lifecycle::remove_pid_file(&pid_file);
    lifecycle::remove_socket(&socket);

    match result {
        Ok(()) => {
            info!("gantryd stopped");
            exit_codes::SUCCESS
        }
        Err(e) => {
            error!("daemon failed: {e}");
            exit_codes::RUNTIME_ERROR
        }
    }
}

async fn serve(config: Arc<gantry_config::ConfigHandle>, socket: &std::path::Path) -> Result<()> {
    let server = server::Server::bind(config, socket).await?;
    server.serve().await
}

async fn client_call(socket: &std::path::Path, method: &str, params: serde_json::Value) -> i32 {
    match client::request(socket, method, params).await {
        Ok(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(rendered) => println!("{rendered}"),
                Err(_) => println!("{result}"),
            }
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_codes::CLIENT_ERROR
        }
    }
}
