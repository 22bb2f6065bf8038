//! wsmux-server binary: CLI parsing, logging, TLS setup, and the accept loop.

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use wsmux_server::config::ServerConfig;
use wsmux_server::server::GatewayServer;

/// wsmux-server — WebSocket multiplexing gateway
#[derive(Parser, Debug)]
#[command(name = "wsmux-server", version, about = "WebSocket multiplexing gateway")]
struct Cli {
    /// Host and port to listen on
    #[arg(long)]
    listen: Option<String>,

    /// Hostnames the gateway is allowed to dial out to (repeatable).
    /// Empty allows all.
    #[arg(long)]
    allowed_hostnames: Vec<String>,

    /// PEM-encoded certificate file. Providing this enables TLS
    #[arg(long)]
    tls_cert: Option<String>,

    /// PEM-encoded private key file
    #[arg(long)]
    tls_key: Option<String>,

    /// PEM-encoded CA certificate. Providing this enables client cert auth
    #[arg(long)]
    tls_ca: Option<String>,

    /// Maximum size, in bytes, of any client message
    #[arg(long)]
    frame_size_limit: Option<u64>,

    /// Read timeout for upstream handshakes, in seconds
    #[arg(long)]
    read_timeout: Option<u64>,

    /// Write timeout for all sockets, in seconds
    #[arg(long)]
    write_timeout: Option<u64>,

    /// Upper bound on client-requested dial timeouts, in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.wsmux/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wsmux-server");

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.tls_cert.as_deref(),
        cli.tls_key.as_deref(),
        cli.tls_ca.as_deref(),
        cli.frame_size_limit,
        cli.read_timeout,
        cli.write_timeout,
        cli.dial_timeout,
        &cli.allowed_hostnames,
    ) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&server_config.tls_cert, &server_config.tls_key) {
        (Some(cert), Some(key)) => {
            match load_tls_config(cert, key, server_config.tls_ca.as_deref()) {
                Ok(config) => Some(config),
                Err(error) => {
                    error!(error = %error, "failed to load TLS config");
                    std::process::exit(1);
                }
            }
        }
        (None, None) => None,
        _ => {
            error!("--tls-cert and --tls-key must be provided together");
            std::process::exit(1);
        }
    };

    let server = GatewayServer::new(server_config, tls_config);

    tokio::select! {
        result = server.run() => {
            if let Err(error) = result {
                error!(error = %error, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("wsmux-server stopped");
}

/// Load TLS certificate and key from PEM files. A CA bundle, when given,
/// turns on client-certificate authentication.
fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let builder = rustls::ServerConfig::builder();
    let tls_config = match ca_path {
        Some(ca_path) => {
            let ca_pem = std::fs::read(ca_path)
                .map_err(|e| format!("cannot read CA {}: {e}", ca_path.display()))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
                roots.add(cert?)?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(roots.into()).build()?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    };

    Ok(tls_config)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
