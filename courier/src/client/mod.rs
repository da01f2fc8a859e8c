pub mod client_config;
pub mod connector;
pub mod pending_payload;
mod connection;
mod io_session;
mod spooler;

use std::num::NonZeroUsize;
use std::sync::Arc;
use anyhow::Context;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use courier_protocol::error::CourierError;
use courier_protocol::event::{Event, EventSerializer, JsonSerializer};
use courier_protocol::event_queue::EventQueue;
use crate::client::client_config::ClientConfig;
use crate::client::connector::{connector_for, Connector};
use crate::client::io_session::{IoAction, IoSession};
use crate::client::spooler::{SendReadiness, Spooler};

/// Ships events to a single server. Creating a client spawns its spooler and connection tasks
///  on the current tokio runtime; it connects (and reconnects) in the background.
///
/// Dropping a client without calling [Client::shutdown] abandons unacknowledged events.
pub struct Client {
    input: Arc<EventQueue<Option<Event>>>,
    control: Arc<EventQueue<IoAction>>,
    cancel: CancellationToken,
    spooler: Option<JoinHandle<()>>,
    io_session: Option<JoinHandle<bool>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;
        let connector = connector_for(&config)?;
        Client::with_connector(config, connector, Arc::new(JsonSerializer))
    }

    /// Uses a custom transport and event serialization
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>, serializer: Arc<dyn EventSerializer>) -> anyhow::Result<Client> {
        config.validate()?;
        let spool_size = NonZeroUsize::new(config.spool_size)
            .context("spool size must be positive")?;

        let config = Arc::new(config);
        let input = Arc::new(EventQueue::new(spool_size));
        let control = Arc::new(EventQueue::new(NonZeroUsize::MIN));
        let readiness = Arc::new(SendReadiness::new());
        let cancel = CancellationToken::new();

        let span = info_span!("client_connection", server = %connector.describe());

        let spooler = Spooler::new(input.clone(), control.clone(), readiness.clone(), config.spool_size, config.idle_timeout, cancel.clone());
        let spooler = tokio::spawn(spooler.run().instrument(span.clone()));

        let io_session = IoSession::new(config, connector, serializer, control.clone(), readiness, cancel.clone());
        let io_session = tokio::spawn(io_session.run().instrument(span));

        Ok(Client {
            input,
            control,
            cancel,
            spooler: Some(spooler),
            io_session: Some(io_session),
        })
    }

    /// Queues an event for shipping, waiting while the spool queue is full
    pub async fn publish(&self, event: Event) -> Result<(), CourierError> {
        select! {
            _ = self.cancel.cancelled() => Err(CourierError::Shutdown),
            result = self.input.push(Some(event), None) => result.map_err(|_| CourierError::Shutdown),
        }
    }

    /// A graceful shutdown (`force == false`) flushes remaining events and waits until the
    ///  server acknowledged all of them, reconnecting as necessary. A forced shutdown stops
    ///  immediately. Returns `true` if every published event was acknowledged.
    pub async fn shutdown(mut self, force: bool) -> bool {
        if force {
            self.cancel.cancel();
        }
        else {
            debug!("shutting down gracefully");
            let _ = self.publish_shutdown().await;
        }

        if let Some(spooler) = self.spooler.take() {
            if let Err(e) = spooler.await {
                warn!(error = %e, "spooler task failed");
            }
        }
        if !force {
            // after the spooler's last flush so the session sees every spool before this
            let _ = self.control.push(IoAction::Shutdown, None).await;
        }

        match self.io_session.take() {
            Some(io_session) => match io_session.await {
                Ok(drained) => drained,
                Err(e) => {
                    warn!(error = %e, "connection task failed");
                    false
                }
            },
            None => false,
        }
    }

    async fn publish_shutdown(&self) -> Result<(), CourierError> {
        self.input.push(None, None).await
            .map_err(|_| CourierError::Shutdown)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
