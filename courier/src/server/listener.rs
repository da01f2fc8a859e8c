use std::net::SocketAddr;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use courier_protocol::error::CourierError;
use courier_protocol::event::Event;
use courier_protocol::stream::BoxedStream;
use courier_protocol::tls::common_name;
use crate::server::connection_handler::{handle_connection, ConnectionContext};

pub(crate) struct Listener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: ConnectionContext,
}

impl Listener {
    pub fn new(listener: TcpListener, acceptor: Option<TlsAcceptor>, ctx: ConnectionContext) -> Listener {
        Listener {
            listener,
            acceptor,
            ctx,
        }
    }

    /// Accepts connections until the server is stopped, then waits for all connections to wind down
    pub async fn accept_loop(self) {
        let mut connections = JoinSet::new();
        loop {
            select! {
                _ = self.ctx.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(stream, peer, self.acceptor.clone(), self.ctx.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task failed");
                    }
                }
            }
        }

        debug!(connections = connections.len(), "listener stopped, waiting for connections to close");
        while connections.join_next().await.is_some() {}
    }
}

#[instrument(name = "accepted_connection", skip_all, fields(peer = %peer, connection_id = %Uuid::new_v4()))]
async fn serve_connection(stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>, ctx: ConnectionContext) {
    info!("new connection");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable Nagle's algorithm");
    }

    let result = match establish(stream, peer, acceptor, &ctx).await {
        Ok((stream, peer_fields)) => handle_connection(stream, peer_fields, &ctx).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => info!("connection closed"),
        Err(CourierError::Shutdown) => debug!("connection closed for shutdown"),
        Err(CourierError::Eof) => warn!("connection closed unexpectedly in the middle of a message"),
        Err(e) => warn!(error = %e, "connection failed"),
    }
}

/// Completes the TLS handshake if configured, and collects the fields identifying the peer
async fn establish(stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>, ctx: &ConnectionContext) -> Result<(BoxedStream, Event), CourierError> {
    let mut peer_fields = Event::new();
    if ctx.config.add_peer_fields {
        peer_fields.insert("peer".to_string(), Value::String(peer.to_string()));
    }

    let Some(acceptor) = acceptor else {
        return Ok((Box::new(stream), peer_fields));
    };

    let handshake_timeout = ctx.config.tls_handshake_timeout;
    let accepted = select! {
        _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
        accepted = timeout(handshake_timeout, acceptor.accept(stream)) => accepted,
    };
    let tls_stream = accepted
        .map_err(|_| CourierError::Timeout(format!("TLS handshake did not complete within {:?}", handshake_timeout)))?
        .map_err(|e| CourierError::Tls(format!("handshake failed: {}", e)))?;

    let cn = tls_stream.get_ref().1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(common_name);
    match &cn {
        Some(cn) => info!(%cn, "client certificate verified"),
        None => debug!("TLS established without client certificate"),
    }
    if ctx.config.add_peer_fields {
        if let Some(cn) = cn {
            peer_fields.insert("peer_ssl_cn".to_string(), Value::String(cn));
        }
    }

    Ok((Box::new(tls_stream), peer_fields))
}
