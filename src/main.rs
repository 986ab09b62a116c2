//! Culvert daemon - keeps a client tunnel alive and serves its diagnostics.
//!
//! Runs one tunnel controller against a remote server and exposes the
//! engine's pull-based log over a local TCP poll socket.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use culvert_client::{
    ControllerConfig, InterfaceConfigurator, InterfaceSettings, SettingsError, StartHandle,
    TunnelController,
};
use culvert_transport::TcpConnector;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Culvert - Client-side tunnel daemon
#[derive(Parser, Debug)]
#[command(name = "culvert")]
#[command(about = "Culvert - Client-side tunnel daemon")]
#[command(version)]
#[command(long_about = r#"
Culvert keeps one tunnel to a remote server alive and exposes the
engine's diagnostic log over a local poll socket.

EXAMPLES:
  # Start with the built-in defaults, polling on port 9910
  culvert 9910

  # Start against a configuration file
  culvert 9910 /etc/culvert/culvert.yaml

Poll the diagnostic log with netcat: every line sent to the poll socket
returns the oldest buffered engine log entry, or an empty line once the
buffer is drained.
"#)]
struct Args {
    /// Port for the local diagnostic poll listener
    port: u16,

    /// Optional YAML configuration file
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// On-disk configuration shape.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: ServerSection,

    #[serde(default = "default_tunnel_type")]
    tunnel_type: String,

    #[serde(default)]
    log_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    /// Tunnel server address (host:port)
    address: String,
}

fn default_tunnel_type() -> String {
    "packet".to_string()
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    server_address: String,
    tunnel_type: String,
    log_capacity: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:8080".to_string(),
            tunnel_type: default_tunnel_type(),
            log_capacity: None,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Load the configuration file, falling back to the defaults when the file
/// is absent or unparseable. A file that parses but is unusable is an error.
fn load_config(path: Option<&PathBuf>) -> Result<DaemonConfig> {
    let Some(path) = path else {
        return Ok(DaemonConfig::default());
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(
                "Failed to read config file {}: {err}; using defaults",
                path.display()
            );
            return Ok(DaemonConfig::default());
        }
    };
    resolve_config(&contents, &path.display().to_string())
}

fn resolve_config(contents: &str, origin: &str) -> Result<DaemonConfig> {
    let file: ConfigFile = match serde_yaml::from_str(contents) {
        Ok(file) => file,
        Err(err) => {
            warn!("Failed to parse config {origin}: {err}; using defaults");
            return Ok(DaemonConfig::default());
        }
    };
    let config = DaemonConfig {
        server_address: file.server.address,
        tunnel_type: file.tunnel_type,
        log_capacity: file.log_capacity,
    };
    if config.server_address.trim().is_empty() {
        anyhow::bail!("config {origin} has an empty server address");
    }
    Ok(config)
}

/// Configurator that records interface settings in the log instead of
/// touching any host interface.
#[derive(Debug)]
struct LoggingConfigurator;

#[async_trait::async_trait]
impl InterfaceConfigurator for LoggingConfigurator {
    async fn apply(&self, settings: InterfaceSettings) -> Result<(), SettingsError> {
        info!(
            address = %settings.address,
            netmask = %settings.netmask,
            dns = ?settings.dns_servers,
            overhead = settings.overhead_bytes,
            "interface settings received"
        );
        Ok(())
    }
}

/// Log every connection state the controller moves through.
fn spawn_state_watcher(controller: &TunnelController) {
    let mut states = controller.watch_state();
    tokio::spawn(async move {
        loop {
            {
                let state = states.borrow_and_update().clone();
                info!("Tunnel state: {state:?}");
            }
            if states.changed().await.is_err() {
                break;
            }
        }
    });
}

/// Serve one diagnostic client: each inbound line is a poll, each response
/// line the oldest buffered log entry (empty once drained).
async fn serve_poll_client(stream: TcpStream, controller: TunnelController) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let response = controller.handle_app_message(line.as_bytes());
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

async fn run_poll_server(listener: TcpListener, controller: TunnelController) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Diagnostic client connected from {peer}");
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_poll_client(stream, controller).await {
                        warn!("Diagnostic client error: {err}");
                    }
                });
            }
            Err(err) => {
                error!("Failed to accept diagnostic client: {err}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    info!(
        "Culvert {} ({}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Unusable configuration: {err:#}");
            process::exit(1);
        }
    };
    info!("Tunnel server address: {}", config.server_address);

    let listener = match TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                "Failed to bind diagnostic listener on port {}: {err}",
                args.port
            );
            process::exit(1);
        }
    };
    info!("Diagnostic poll listener on 127.0.0.1:{}", args.port);

    let controller = TunnelController::new(
        ControllerConfig {
            tunnel_type: config.tunnel_type.clone(),
            log_capacity: config.log_capacity,
        },
        Arc::new(TcpConnector::new()),
        Arc::new(LoggingConfigurator),
    );
    spawn_state_watcher(&controller);

    // A failed start does not kill the daemon; the poll socket keeps
    // serving whatever diagnostics the attempt queued.
    match controller.start(&config.server_address) {
        Ok(StartHandle::Pending(start_rx)) => {
            tokio::spawn(async move {
                match start_rx.await {
                    Ok(Ok(())) => info!("Tunnel established"),
                    Ok(Err(err)) => error!("Tunnel start failed: {err}"),
                    Err(_) => error!("Tunnel start outcome was dropped"),
                }
            });
        }
        Ok(StartHandle::AlreadyStarted) => {}
        Err(err) => error!("Tunnel start rejected: {err}"),
    }

    let poll_controller = controller.clone();
    tokio::spawn(async move {
        run_poll_server(listener, poll_controller).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    if controller.stop().await.is_err() {
        warn!("Stop confirmation was dropped");
    }
    info!("Culvert stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let yaml = "server:\n  address: tunnel.example.com:8080\ntunnel_type: packet\nlog_capacity: 64\n";
        let config = resolve_config(yaml, "test").unwrap();
        assert_eq!(config.server_address, "tunnel.example.com:8080");
        assert_eq!(config.tunnel_type, "packet");
        assert_eq!(config.log_capacity, Some(64));
    }

    #[test]
    fn test_optional_fields_take_defaults() {
        let yaml = "server:\n  address: 10.0.0.1:8080\n";
        let config = resolve_config(yaml, "test").unwrap();
        assert_eq!(config.tunnel_type, "packet");
        assert_eq!(config.log_capacity, None);
    }

    #[test]
    fn test_unparseable_config_falls_back_to_defaults() {
        let config = resolve_config("server: [unclosed", "test").unwrap();
        assert_eq!(
            config.server_address,
            DaemonConfig::default().server_address
        );
    }

    #[test]
    fn test_missing_server_section_falls_back_to_defaults() {
        let config = resolve_config("tunnel_type: packet\n", "test").unwrap();
        assert_eq!(
            config.server_address,
            DaemonConfig::default().server_address
        );
    }

    #[test]
    fn test_empty_server_address_is_fatal() {
        let yaml = "server:\n  address: \"\"\n";
        assert!(resolve_config(yaml, "test").is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = PathBuf::from("/nonexistent/culvert-test.yaml");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(
            config.server_address,
            DaemonConfig::default().server_address
        );
    }

    #[test]
    fn test_no_file_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server_address, "127.0.0.1:8080");
        assert_eq!(config.tunnel_type, "packet");
        assert_eq!(config.log_capacity, None);
    }
}
