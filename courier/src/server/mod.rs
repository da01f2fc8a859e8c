pub mod server_config;
mod connection_handler;
mod listener;

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use courier_protocol::event::{Event, EventSerializer, JsonSerializer};
use courier_protocol::event_queue::EventQueue;
use courier_protocol::tls;
use crate::server::connection_handler::ConnectionContext;
use crate::server::listener::Listener;
use crate::server::server_config::{ServerConfig, ServerTransport};

/// Receives events from any number of clients. Binding a server starts accepting connections
///  on the current tokio runtime; received events are delivered through [Server::run].
///
/// Events are delivered at least once: a client retransmits a payload that was not fully
///  acknowledged before its connection broke.
pub struct Server {
    local_addr: SocketAddr,
    events: Arc<EventQueue<Event>>,
    cancel: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        Server::bind_with_serializer(config, Arc::new(JsonSerializer)).await
    }

    pub async fn bind_with_serializer(config: ServerConfig, serializer: Arc<dyn EventSerializer>) -> anyhow::Result<Server> {
        config.validate()?;

        let acceptor = match config.transport {
            ServerTransport::Tcp => None,
            ServerTransport::Tls => Some(tls_acceptor(&config)?),
            ServerTransport::Zmq => bail!("the ZMQ transport is not supported"),
        };

        let listener = TcpListener::bind((config.address.as_str(), config.port)).await
            .with_context(|| format!("failed to listen on {}:{}", config.address, config.port))?;
        let local_addr = listener.local_addr()?;
        if config.port == 0 {
            warn!(%local_addr, "no port configured, listening on an ephemeral port");
        }
        else {
            info!(%local_addr, transport = ?config.transport, "listening");
        }

        let capacity = NonZeroUsize::new(config.event_queue_capacity)
            .context("event queue capacity must be positive")?;
        let events = Arc::new(EventQueue::new(capacity));
        let cancel = CancellationToken::new();

        let ctx = ConnectionContext {
            config: Arc::new(config),
            events: events.clone(),
            serializer,
            cancel: cancel.clone(),
        };
        let accept_loop = tokio::spawn(Listener::new(listener, acceptor, ctx).accept_loop());

        Ok(Server {
            local_addr,
            events,
            cancel,
            accept_loop: Mutex::new(Some(accept_loop)),
        })
    }

    /// The address actually bound, which differs from the configured one for port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Passes received events to `callback`, one at a time and in the order each connection
    ///  received them, until the server is stopped.
    ///
    /// Delivery blocks while the callback runs: a slow callback makes connections send partial
    ///  acknowledgements and eventually stop reading.
    pub async fn run<F: FnMut(Event)>(&self, mut callback: F) {
        loop {
            let event = select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.pop(None) => event,
            };
            if let Ok(event) = event {
                callback(event);
            }
        }
    }

    /// Stops accepting connections, closes all open connections and waits until they are closed.
    ///  Events received but not yet delivered are discarded; their payloads were not
    ///  acknowledged, so clients send them again.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let accept_loop = self.accept_loop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(accept_loop) = accept_loop {
            if let Err(e) = accept_loop.await {
                warn!(error = %e, "listener task failed");
            }
            info!(local_addr = %self.local_addr, "server stopped");
        }
        self.events.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn tls_acceptor(config: &ServerConfig) -> anyhow::Result<TlsAcceptor> {
    let (Some(cert_path), Some(key_path)) = (&config.ssl_certificate, &config.ssl_key) else {
        bail!("'ssl_certificate' and 'ssl_key' are required for the TLS transport");
    };
    let certs = tls::load_certificates(cert_path)
        .with_context(|| format!("loading server certificate {:?}", cert_path))?;
    let key = tls::load_private_key(key_path, config.ssl_key_passphrase.as_deref())
        .with_context(|| format!("loading server key {:?}", key_path))?;

    let client_roots = if config.ssl_verify {
        let mut roots = match &config.ssl_verify_ca {
            Some(path) => tls::load_root_store(path)
                .with_context(|| format!("loading client CA {:?}", path))?,
            None => rustls::RootCertStore::empty(),
        };
        if config.ssl_verify_default_ca {
            roots.roots.extend(tls::default_root_store().roots);
        }
        Some(roots)
    }
    else {
        None
    };

    let server_config = tls::server_config(certs, key, client_roots, config.min_tls_version)?;
    Ok(TlsAcceptor::from(server_config))
}
