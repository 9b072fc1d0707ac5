//! Inbound application listener
//!
//! Accepts application connections continuously, runs the startup
//! handshake on each of them concurrently and forwards the authenticated
//! ones to the connection driver. Nothing here touches the registry.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{HandshakeSettings, PendingConnection, establish, within};
use crate::entry::{Direction, TransportKind};
use crate::error::DialError;
use crate::link::BoxedStream;

#[derive(Clone)]
enum Acceptor {
    Plain,
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::TlsAcceptor),
}

impl Acceptor {
    fn transport(&self) -> TransportKind {
        match self {
            Acceptor::Plain => TransportKind::Plain,
            #[cfg(feature = "tls")]
            Acceptor::Tls(_) => TransportKind::Tls,
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, DialError> {
        match self {
            Acceptor::Plain => Ok(Box::new(stream)),
            #[cfg(feature = "tls")]
            Acceptor::Tls(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| DialError::Handshake(format!("TLS accept failed: {}", e)))?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Listener for application connections
pub struct AppListener {
    listener: TcpListener,
    acceptor: Acceptor,
    local_addr: SocketAddr,
}

impl AppListener {
    /// Bind a plain TCP listener
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Self::bind_with(addr, Acceptor::Plain).await
    }

    /// Bind a listener that wraps every accepted connection in TLS
    #[cfg(feature = "tls")]
    pub async fn bind_tls(
        addr: SocketAddr,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> std::io::Result<Self> {
        Self::bind_with(addr, Acceptor::Tls(acceptor)).await
    }

    async fn bind_with(addr: SocketAddr, acceptor: Acceptor) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Listening for {} application connections on {}",
            acceptor.transport(),
            local_addr
        );
        Ok(Self { listener, acceptor, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.acceptor.transport()
    }

    /// Accept connections until `cancel` fires
    pub fn spawn(
        self,
        settings: HandshakeSettings,
        established_tx: mpsc::Sender<PendingConnection>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(settings, established_tx, cancel))
    }

    async fn run(
        self,
        settings: HandshakeSettings,
        established_tx: mpsc::Sender<PendingConnection>,
        cancel: CancellationToken,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(
                            "Error accepting application connection on {}: {}",
                            self.local_addr, e
                        );
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
            }

            debug!(%peer, "Accepted application connection");
            let acceptor = self.acceptor.clone();
            let settings = settings.clone();
            let established_tx = established_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let handshake = async {
                    // a TLS peer may stall before the application handshake starts
                    let accepted = acceptor.accept(stream);
                    let stream = within(settings.timeout, &peer.to_string(), accepted).await?;
                    let transport = acceptor.transport();
                    establish(stream, peer, Direction::Inbound, transport, &settings).await
                };
                let pending = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = handshake => match result {
                        Ok(pending) => pending,
                        Err(e) => {
                            warn!(%peer, "Closing application connection: {}", e);
                            return;
                        }
                    },
                };
                if established_tx.send(pending).await.is_err() {
                    debug!(%peer, "Connection driver stopped, dropping application connection");
                }
            });
        }
        info!("Application listener on {} stopped", self.local_addr);
    }
}
