//! Portcullis tunnel endpoint CLI
//!
//! Runs one tunnel endpoint in either role: `server` accepts transport
//! connections and dials forward targets, `client` connects out and binds
//! the local ends of forwarding rules. The server can additionally front a
//! RADIUS backend pool with the session-sticky proxy.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portcullis_proto::Remote;
use portcullis_radius::{RadiusProxyConfig, RADIUS_AUTH_PORT};
use portcullis_transport_quic::{QuicConfig, QuicConnector, QuicListener};
use portcullis_tunnel::{RadiusSettings, Tunnel, TunnelConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Multiplexed forwarding tunnel with a session-sticky RADIUS proxy
#[derive(Parser, Debug)]
#[command(name = "portcullis")]
#[command(about = "Multiplexed forwarding tunnel with a session-sticky RADIUS proxy")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "PORTCULLIS_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept tunnel connections and dial forward targets
    Server(ServerArgs),

    /// Connect to a server and bind forwarding rules locally
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "PORTCULLIS_LISTEN", default_value = "0.0.0.0:4443")]
    listen: SocketAddr,

    /// TLS certificate path (PEM); omit to generate a self-signed one
    #[arg(long, requires = "key")]
    cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long, requires = "cert")]
    key: Option<String>,

    /// Allow clients to bind forwarding rules through this endpoint
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    outbound: bool,

    /// Keepalive interval in seconds; 0 disables
    #[arg(long, default_value_t = 0)]
    keepalive_secs: u64,

    /// UDP address for the RADIUS proxy; omit to disable it
    #[arg(long)]
    radius_listen: Option<SocketAddr>,

    /// RADIUS shared secret
    #[arg(long, env = "PORTCULLIS_RADIUS_SECRET", default_value = "")]
    radius_secret: String,

    /// Initial RADIUS backend (host or host:port), repeatable
    #[arg(long = "radius-backend")]
    radius_backends: Vec<String>,

    /// RADIUS sticky session timeout in seconds
    #[arg(long, default_value_t = 20)]
    radius_session_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server address (host:port)
    #[arg(long, env = "PORTCULLIS_SERVER")]
    server: String,

    /// Server name for TLS verification (defaults to the server host)
    #[arg(long)]
    server_name: Option<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Keepalive interval in seconds; 0 disables
    #[arg(long, default_value_t = 25)]
    keepalive_secs: u64,

    /// Seconds `active_conn` waits for an activation in progress
    #[arg(long, env = "PORTCULLIS_ACTIVATION_WAIT", default_value_t = 35)]
    activation_wait_secs: u64,

    /// Forwarding rules: [local-host:]local-port:remote-host:remote-port
    #[arg(required = true)]
    remotes: Vec<String>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let quic_config = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => QuicConfig::server_from_files(cert, key),
        _ => {
            warn!("No certificate configured, generating a self-signed one");
            QuicConfig::server_self_signed()
        }
    };

    let listener = QuicListener::bind(args.listen, Arc::new(quic_config))
        .context("Failed to bind QUIC listener")?;
    info!(listen = %listener.local_addr()?, "Server listening");

    let base_config = TunnelConfig::default()
        .with_outbound(args.outbound)
        .with_keepalive(Duration::from_secs(args.keepalive_secs));

    let radius = args.radius_listen.map(|listen| {
        let addrs = args
            .radius_backends
            .iter()
            .map(|addr| normalize_backend(addr))
            .collect();
        let mut proxy = RadiusProxyConfig::new(args.radius_secret.clone(), addrs);
        proxy.session_timeout = Duration::from_secs(args.radius_session_timeout_secs);
        RadiusSettings { listen, proxy }
    });

    loop {
        let (conn, remote) = listener.accept().await.context("Listener failed")?;
        info!(peer = %remote, "Tunnel connected");

        let mut config = base_config.clone();
        config.radius = radius.clone();

        let tunnel = Arc::new(Tunnel::new(config));
        if let Err(e) = tunnel.start_radius_proxy().await {
            error!(error = %e, "Failed to start RADIUS proxy");
        }

        tokio::spawn(async move {
            match tunnel.clone().bind(CancellationToken::new(), conn).await {
                Ok(()) => info!(peer = %remote, "Tunnel disconnected"),
                Err(e) => warn!(peer = %remote, error = %e, "Tunnel failed"),
            }
            tunnel.shutdown();
        });
    }
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let remotes = args
        .remotes
        .iter()
        .map(|rule| Remote::parse(rule))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid forwarding rule")?;

    let (host, addr) = resolve_server(&args.server).await?;
    let server_name = args.server_name.clone().unwrap_or(host);

    let quic_config = if args.insecure {
        QuicConfig::client_insecure()
    } else {
        QuicConfig::client_default()
    };
    let connector = QuicConnector::new(Arc::new(quic_config))?;

    let tunnel = Arc::new(Tunnel::new(
        TunnelConfig::default()
            .with_inbound(true)
            .with_keepalive(Duration::from_secs(args.keepalive_secs))
            .with_activation_wait(Duration::from_secs(args.activation_wait_secs)),
    ));

    // Forwarders outlive individual connections; they resolve the active
    // transport per accepted connection and ride out reconnects.
    let root = CancellationToken::new();
    {
        let tunnel = tunnel.clone();
        let ctx = root.child_token();
        tokio::spawn(async move {
            if let Err(e) = tunnel.bind_remotes(ctx, &remotes).await {
                error!(error = %e, "Forwarding rules failed");
            }
        });
    }

    loop {
        match connector.connect(addr, &server_name).await {
            Ok(conn) => {
                info!(server = %addr, "Connected");
                match tunnel.clone().bind(root.child_token(), conn).await {
                    Ok(()) => info!("Disconnected"),
                    Err(e) => warn!(error = %e, "Connection lost"),
                }
            }
            Err(e) => warn!(server = %addr, error = %e, "Connect failed"),
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        info!("Retrying");
    }
}

/// Append the fixed RADIUS port when a backend is given as a bare host
fn normalize_backend(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, RADIUS_AUTH_PORT)
    }
}

/// Resolve `host:port` to a socket address, preferring IPv4
async fn resolve_server(server: &str) -> Result<(String, SocketAddr)> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr));
    }

    let host = server
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .with_context(|| format!("Missing port in server address '{}'", server))?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("Failed to resolve '{}'", server))?
        .collect();

    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("No addresses found for '{}'", server))?;

    Ok((host, addr))
}
