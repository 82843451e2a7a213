use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::error::CommError;
use crate::network::connection::{Connection, ConnectionContext, ConnectionDirection};
use crate::network::handshake::Handshaker;
use crate::network::tls::{peer_cert_hash, TlsConfig};

/// Accept loop: every inbound socket gets a TLS session and a passive
/// handshake before it is registered with the connection store.
pub(crate) struct NetworkServer {
    listener: TcpListener,
    tls: TlsConfig,
    handshaker: Arc<Handshaker>,
    ctx: ConnectionContext,
}

impl NetworkServer {
    pub(crate) fn new(
        listener: TcpListener,
        tls: TlsConfig,
        handshaker: Arc<Handshaker>,
        ctx: ConnectionContext,
    ) -> Self {
        Self {
            listener,
            tls,
            handshaker,
            ctx,
        }
    }

    pub(crate) async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    tracing::warn!("❌ Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            tracing::debug!("🔌 New peer connection from: {}", addr);
            let tls = self.tls.clone();
            let handshaker = self.handshaker.clone();
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                handle_inbound(stream, addr, tls, handshaker, ctx).await;
            });
        }
        tracing::debug!("🛑 Accept loop on {:?} stopped", self.listener.local_addr().ok());
    }
}

async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    tls: TlsConfig,
    handshaker: Arc<Handshaker>,
    ctx: ConnectionContext,
) {
    let endpoint = addr.to_string();
    let established = tokio::time::timeout(ctx.conn_timeout, async {
        let mut stream = tls.accept_server(stream).await?;
        let remote_cert = peer_cert_hash(&stream);
        let info = handshaker
            .authenticate_passive(&mut stream, remote_cert.as_deref(), &endpoint)
            .await?;
        Ok::<_, CommError>((stream, info))
    })
    .await;

    let (stream, info) = match established {
        Ok(Ok(established)) => established,
        Ok(Err(CommError::Blacklisted(pki_id))) => {
            tracing::debug!("🚫 Dropped inbound connection from blacklisted {}", pki_id);
            return;
        }
        Ok(Err(CommError::Disconnected)) => {
            // Reachability checks hang up right after TLS
            tracing::debug!("🔌 {} hung up before the handshake", endpoint);
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("🚫 Rejected inbound connection from {}: {}", endpoint, e);
            return;
        }
        Err(_) => {
            tracing::warn!("⏱️  Handshake with {} timed out", endpoint);
            return;
        }
    };

    if ctx.cancel.is_cancelled() {
        return;
    }
    let store = ctx.store.clone();
    let conn = Connection::spawn(stream, info, ConnectionDirection::Inbound, ctx);
    store.on_inbound(conn);
}
