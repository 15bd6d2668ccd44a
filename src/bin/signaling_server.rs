//! Standalone signaling server binary
//!
//! Run with:
//!   cargo run --bin signaling-server -- --port 8080
//!
//! With TLS:
//!   cargo run --bin signaling-server -- --port 8443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};

use switchboard::SignalingServer;

/// Rendezvous endpoint for switchboard network instances
#[derive(Parser, Debug)]
#[command(name = "signaling-server")]
#[command(about = "Rendezvous endpoint for switchboard network instances")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Load TLS certificates from PEM file
fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            rustls_pemfile::Item::Pkcs8Key(key) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            rustls_pemfile::Item::Sec1Key(key) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            _ => continue,
        }
    }

    bail!("No private key found in {:?}", path)
}

/// Create TLS acceptor from certificate and key files
fn create_tls_acceptor(cert_path: &PathBuf, key_path: &PathBuf) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --cert and --key must be provided for TLS");
            bail!("TLS configuration incomplete");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    info!("Signaling server starting on {}", addr);
    if tls_acceptor.is_some() {
        info!("Protocol: wss:// (WebSocket Secure)");
    } else {
        info!("Protocol: ws:// (WebSocket)");
    }

    let server = Arc::new(SignalingServer::new());
    if let Some(acceptor) = tls_acceptor {
        run_tls_server(addr, acceptor, server).await?;
    } else {
        server.run(&addr.to_string()).await?;
    }

    Ok(())
}

/// Accept TLS connections and hand the decrypted streams to the server
async fn run_tls_server(
    addr: SocketAddr,
    tls_acceptor: TlsAcceptor,
    server: Arc<SignalingServer>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("TLS signaling server listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let acceptor = tls_acceptor.clone();
                let server = server.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("TLS handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };

                    if let Err(e) = server.serve_stream(tls_stream).await {
                        warn!("Connection error for {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}
