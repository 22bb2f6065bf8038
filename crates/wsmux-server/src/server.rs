//! Listener: accepts TCP connections, terminates TLS when configured,
//! performs the HTTP upgrade, and hands each upgraded stream to a
//! [`Session`].

use crate::config::{GatewayConfig, ServerConfig};
use crate::handshake;
use crate::session::{BoxStream, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use wsmux_core::{BufferPool, MuxError, MuxResult};

pub struct GatewayServer {
    listen: String,
    tls: Option<TlsAcceptor>,
    gateway: Arc<GatewayConfig>,
    pool: BufferPool,
}

impl GatewayServer {
    /// Build a server from resolved configuration. `tls` enables TLS
    /// termination when present.
    pub fn new(config: ServerConfig, tls: Option<tokio_rustls::rustls::ServerConfig>) -> Self {
        Self {
            listen: config.listen,
            tls: tls.map(|c| TlsAcceptor::from(Arc::new(c))),
            gateway: Arc::new(config.gateway),
            pool: BufferPool::new(),
        }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> MuxResult<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| MuxError::Other(format!("cannot bind {}: {e}", self.listen)))?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener. Split out so tests
    /// can bind an ephemeral port themselves.
    pub async fn serve(&self, listener: TcpListener) -> MuxResult<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, tls = self.tls.is_some(), "wsmux listening");

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(error = %error, "tcp accept failed");
                    continue;
                }
            };

            let tls = self.tls.clone();
            let gateway = Arc::clone(&self.gateway);
            let pool = self.pool.clone();
            tokio::spawn(async move {
                handle_connection(stream, remote, tls, gateway, pool).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    tls: Option<TlsAcceptor>,
    gateway: Arc<GatewayConfig>,
    pool: BufferPool,
) {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(remote = %remote, error = %error, "set_nodelay failed");
    }

    let mut upgraded: BoxStream = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(error) => {
                warn!(remote = %remote, error = %error, "tls accept failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    if let Err(error) = handshake::accept(&mut upgraded).await {
        warn!(remote = %remote, error = %error, "websocket upgrade failed");
        return;
    }

    debug!(remote = %remote, "connection upgraded");
    Session::new(upgraded, gateway, pool).run().await;
}
