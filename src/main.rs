//! wsgate server
//!
//! Runs a transport server with a single gateway registration that echoes
//! every JSON message back to its sender. Useful for exercising clients and
//! liveness settings against a real gateway.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use wsgate::config::{GatewayConfig, LivenessSettings, CONFIG_FILE};
use wsgate::gateway::{create_server_web_socket_connection, JsonConnectionFactory, ServerOptions};
use wsgate::server::TransportServer;

/// Liveness strategy selectable from the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LivenessArg {
    TransportPing,
    ProtocolPing,
    Disabled,
}

/// WebSocket upgrade gateway
///
/// Serves a JSON echo endpoint with heartbeat-based liveness
#[derive(Parser, Debug)]
#[command(name = "wsgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Upgrade path to claim
    #[arg(long)]
    path: Option<String>,

    /// Liveness strategy
    #[arg(long, value_enum)]
    liveness: Option<LivenessArg>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(liveness) = self.liveness {
            config.liveness = match (liveness, config.liveness) {
                (LivenessArg::TransportPing, current @ LivenessSettings::TransportPing { .. }) => {
                    current
                }
                (LivenessArg::ProtocolPing, current @ LivenessSettings::ProtocolPing { .. }) => {
                    current
                }
                (LivenessArg::TransportPing, _) => LivenessSettings::default(),
                (LivenessArg::ProtocolPing, _) => LivenessSettings::ProtocolPing {
                    idle_timeout_ms: wsgate::config::DEFAULT_IDLE_TIMEOUT_MS,
                },
                (LivenessArg::Disabled, _) => LivenessSettings::Disabled,
            };
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("wsgate v{}", env!("CARGO_PKG_VERSION"));

    let config = args.apply(GatewayConfig::load(&args.config)?);
    config.validate()?;
    debug!("Configuration: {:?}", config);

    let server = TransportServer::bind(&config.socket_addr(), config.transport()).await?;

    let options = ServerOptions::new(server.clone())
        .with_path(config.path.clone())
        .with_liveness(config.liveness.mode())
        .with_socket_config(config.socket());

    let registration =
        create_server_web_socket_connection(options, JsonConnectionFactory, |connection| {
            let echo = connection.clone();
            connection.on_message(move |message| {
                if let Err(e) = echo.send(&message) {
                    debug!("Failed to echo message: {}", e);
                }
            });
            connection.on_close(|info| debug!("Connection closed with code {}", info.code));
        })?;

    info!(
        "Gateway listening on ws://{}{}",
        server.local_addr(),
        config.path
    );

    // Spawn shutdown signal handler
    let server_handle = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    let open = registration.client_count();
    if open > 0 {
        info!("Closing {} open connections...", open);
    }
    registration.close();

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
