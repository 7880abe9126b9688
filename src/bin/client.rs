//! Shadow Tunnel Client
//!
//! Listens on a local SOCKS5 port, and for every accepted connection runs
//! a tunnel session to the configured SSR-style server: SOCKS5
//! negotiation, upstream dial, obfuscation handshake, then bidirectional
//! streaming. Ctrl-C shuts every live tunnel down.

use anyhow::{Context, Result};
use clap::Parser;
use shadow_tunnel::{tunnel::Tunnel, Config, ServerEnv};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Shadow Tunnel Client - SOCKS5 front-end for SSR-style servers
#[derive(Parser, Debug)]
#[command(name = "shadow-client")]
#[command(about = "Shadow Tunnel Client - SOCKS5 front-end for SSR-style servers")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write a default configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Local SOCKS5 listen address as host:port (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Remote server as host:port (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.generate_config {
        let config = Config::default();
        config
            .save(&args.config)
            .context("Failed to write default configuration")?;
        info!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;

    if let Some(listen) = &args.listen {
        let (host, port) = split_host_port(listen).context("Invalid --listen address")?;
        config.listen_host = host;
        config.listen_port = port;
    }
    if let Some(server) = &args.server {
        let (host, port) = split_host_port(server).context("Invalid --server address")?;
        config.remote_host = host;
        config.remote_port = port;
    }

    info!("Shadow Tunnel Client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Upstream: {}:{} ({}/{}/{})",
        config.remote_host, config.remote_port, config.method, config.protocol, config.obfs
    );
    if config.over_tls_enable {
        info!(
            "TLS wrapping enabled, SNI: {}",
            config
                .over_tls_server_domain
                .as_deref()
                .unwrap_or(&config.remote_host)
        );
    }

    let listen_addr = config.listen_addr();
    let env = Arc::new(ServerEnv::new(config));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("SOCKS5 proxy listening on {}", listen_addr);

    let accept_env = Arc::clone(&env);
    let accept_loop = async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("SOCKS5 connection from {}", peer);
                    stream.set_nodelay(true).ok();
                    Tunnel::spawn(Arc::clone(&accept_env), stream);
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            env.registry().shutdown_all();
        }
    }

    Ok(())
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .context("expected host:port")?;
    let port: u16 = port.parse().context("invalid port")?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}
