use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use courier_protocol::error::CourierError;
use courier_protocol::event::{Event, EventSerializer};
use courier_protocol::event_queue::EventQueue;
use courier_protocol::message::{AcknMessage, ProtocolMessage};
use courier_protocol::nonce::Nonce;
use crate::client::client_config::ClientConfig;
use crate::client::connection::ClientConnection;
use crate::client::connector::Connector;
use crate::client::pending_payload::{AckOutcome, PayloadChain, PendingPayload};
use crate::client::spooler::SendReadiness;

/// Everything the session reacts to, funnelled through a single queue. Actions originating from
///  a connection carry its generation, and actions from an older connection are discarded.
pub(crate) enum IoAction {
    /// the writer can take another frame
    SendReady { generation: u64 },
    /// a spool of events from the spooler
    Events(Vec<Event>),
    Received { generation: u64, message: ProtocolMessage },
    Failed { generation: u64, error: CourierError },
    /// graceful shutdown: finish once everything is acknowledged
    Shutdown,
}

/// state that is reset with every connection
struct ConnectionState {
    can_send: bool,
    pending_ping: bool,
    ping_supported: bool,
    deadline: Instant,
}

/// Owns the payload chain and drives the connection lifecycle: connect, send payloads as the
///  writer becomes ready, apply acknowledgements, keep the connection alive with PING while
///  idle, and reconnect with backoff on any failure, retransmitting unacknowledged payloads
///  oldest first.
pub(crate) struct IoSession {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    serializer: Arc<dyn EventSerializer>,
    control: Arc<EventQueue<IoAction>>,
    readiness: Arc<SendReadiness>,
    cancel: CancellationToken,

    chain: PayloadChain,
    /// spools that arrived while the writer was not ready
    backlog: VecDeque<Vec<Event>>,
    generation: u64,
    shutdown_requested: bool,
}

impl IoSession {
    pub fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        serializer: Arc<dyn EventSerializer>,
        control: Arc<EventQueue<IoAction>>,
        readiness: Arc<SendReadiness>,
        cancel: CancellationToken,
    ) -> IoSession {
        IoSession {
            config,
            connector,
            serializer,
            control,
            readiness,
            cancel,
            chain: PayloadChain::new(),
            backlog: VecDeque::new(),
            generation: 0,
            shutdown_requested: false,
        }
    }

    /// Returns `true` if every published event was acknowledged
    pub async fn run(mut self) -> bool {
        loop {
            match self.connect_and_run().await {
                Ok(()) => break,
                Err(e) if !e.is_recoverable() => break,
                Err(e) => warn!(error = %e, pending_payloads = self.chain.len(), "connection failed"),
            }

            self.readiness.clear();
            self.chain.rewind();
            if self.backoff().await.is_break() {
                break;
            }
        }

        let drained = self.is_drained();
        if drained {
            info!("session finished, all events acknowledged");
        }
        else {
            warn!(pending_payloads = self.chain.len(), backlog = self.backlog.len(), "session finished with unacknowledged events");
        }
        drained
    }

    fn is_drained(&self) -> bool {
        self.chain.is_empty() && self.backlog.is_empty()
    }

    async fn connect_and_run(&mut self) -> Result<(), CourierError> {
        self.generation += 1;
        debug!(generation = self.generation, "connecting");

        let mut connection = select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CourierError::Shutdown),
            result = ClientConnection::establish(self.generation, self.connector.as_ref(), &self.config, self.control.clone()) => result?,
        };
        let remote = connection.remote_version()
            .map(|v| v.client_version())
            .unwrap_or_else(|| "unidentified".to_string());
        info!(generation = self.generation, %remote, pending_payloads = self.chain.len(), "connected");

        let result = self.run_connection(&mut connection).await;
        connection.disconnect().await;
        result
    }

    async fn run_connection(&mut self, conn: &mut ClientConnection) -> Result<(), CourierError> {
        let mut state = ConnectionState {
            can_send: false,
            pending_ping: false,
            ping_supported: true,
            deadline: self.idle_deadline(),
        };

        loop {
            let action = select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CourierError::Shutdown),
                action = self.control.pop_until(Some(state.deadline)) => action,
            };

            match action {
                Ok(action) => {
                    if self.handle_action(conn, &mut state, action)?.is_break() {
                        return Ok(());
                    }
                }
                Err(_) => self.on_deadline(conn, &mut state)?,
            }
        }
    }

    /// waiting for acknowledgements is bounded by the network timeout, idling by keepalive
    fn idle_deadline(&self) -> Instant {
        if self.chain.is_empty() {
            Instant::now() + self.config.keepalive_timeout
        }
        else {
            Instant::now() + self.config.network_timeout
        }
    }

    fn handle_action(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState, action: IoAction) -> Result<ControlFlow<()>, CourierError> {
        match action {
            IoAction::SendReady { generation } if generation == conn.generation() => self.on_send_ready(conn, state)?,
            IoAction::Events(events) => self.on_events(conn, state, events)?,
            IoAction::Received { generation, message } if generation == conn.generation() => return self.on_received(conn, state, message),
            IoAction::Failed { generation, error } if generation == conn.generation() => return Err(error),
            IoAction::Shutdown => return Ok(self.on_shutdown(state)),
            IoAction::SendReady { .. } | IoAction::Received { .. } | IoAction::Failed { .. } => {
                trace!("discarding action from a previous connection");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_deadline(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState) -> Result<(), CourierError> {
        if !self.chain.is_empty() {
            return Err(CourierError::Timeout(format!("no acknowledgement within {:?} with {} payloads pending", self.config.network_timeout, self.chain.len())));
        }
        if state.pending_ping {
            return Err(CourierError::Timeout(format!("no PONG within {:?}", self.config.network_timeout)));
        }

        if state.ping_supported {
            debug!("connection idle, sending PING");
            // the writer signals readiness again once the PING is written
            state.can_send = false;
            self.readiness.clear();
            conn.send(&ProtocolMessage::Ping)?;
            state.pending_ping = true;
            state.deadline = Instant::now() + self.config.network_timeout;
        }
        else {
            state.deadline = Instant::now() + self.config.keepalive_timeout;
        }
        Ok(())
    }

    fn on_send_ready(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState) -> Result<(), CourierError> {
        if self.chain.is_retrying() {
            if let Some(body) = self.chain.next_retry(self.serializer.as_ref())? {
                debug!(pending_payloads = self.chain.len(), "retransmitting payload");
                conn.send_jdat(&body)?;
                state.deadline = Instant::now() + self.config.network_timeout;
                return Ok(());
            }
        }

        if conn.is_send_paused() {
            // signalled before the pause took effect, resuming signals again
            return Ok(());
        }
        if self.chain.len() >= self.config.max_pending_payloads {
            conn.pause_send()?;
            return Ok(());
        }

        if let Some(events) = self.backlog.pop_front() {
            trace!(events = events.len(), "sending spool from backlog");
            return self.send_payload(conn, state, events);
        }
        if self.shutdown_requested {
            trace!("send ready, but shutdown is pending");
            return Ok(());
        }

        trace!("ready for events");
        state.can_send = true;
        self.readiness.signal();
        Ok(())
    }

    fn on_events(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState, events: Vec<Event>) -> Result<(), CourierError> {
        if state.can_send && self.backlog.is_empty() {
            state.can_send = false;
            self.send_payload(conn, state, events)
        }
        else {
            trace!(events = events.len(), "writer busy, saving spool to backlog");
            self.backlog.push_back(events);
            Ok(())
        }
    }

    fn send_payload(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState, events: Vec<Event>) -> Result<(), CourierError> {
        if self.chain.len() + 1 >= self.config.max_pending_payloads {
            conn.pause_send()?;
        }

        let mut nonce = Nonce::new_random();
        while self.chain.contains_nonce(&nonce) {
            nonce = Nonce::new_random();
        }
        let mut payload = PendingPayload::new(events, nonce, self.serializer.as_ref())?;
        let body = payload.generate(self.serializer.as_ref())?;

        debug!(%nonce, events = payload.sequence_len(), pending_payloads = self.chain.len() + 1, "sending payload");
        self.chain.push(payload);
        conn.send_jdat(&body)?;

        if self.chain.len() == 1 {
            state.deadline = Instant::now() + self.config.network_timeout;
        }
        Ok(())
    }

    fn on_received(&mut self, conn: &mut ClientConnection, state: &mut ConnectionState, message: ProtocolMessage) -> Result<ControlFlow<()>, CourierError> {
        match message {
            ProtocolMessage::Pong => {
                if !state.pending_ping {
                    debug!("received PONG without a pending PING");
                }
                state.pending_ping = false;
            }
            ProtocolMessage::Ackn(ackn) => self.on_ackn(conn, ackn)?,
            ProtocolMessage::Unknown => {
                if state.pending_ping {
                    info!("server does not support PING, disabling keepalive for this connection");
                    state.pending_ping = false;
                    state.ping_supported = false;
                }
                else {
                    debug!("server replied '????' to a message");
                }
            }
            other => debug!(signature = %other.signature(), "ignoring unexpected message from server"),
        }

        if self.chain.is_empty() {
            if self.shutdown_requested && self.backlog.is_empty() {
                info!("all payloads acknowledged, completing shutdown");
                return Ok(ControlFlow::Break(()));
            }
            state.deadline = Instant::now() + self.config.keepalive_timeout;
        }
        else {
            state.deadline = Instant::now() + self.config.network_timeout;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_ackn(&mut self, conn: &mut ClientConnection, ackn: AcknMessage) -> Result<(), CourierError> {
        match self.chain.ack(&ackn.nonce, ackn.sequence) {
            AckOutcome::UnknownNonce => {
                debug!(nonce = %ackn.nonce, sequence = ackn.sequence, "ignoring acknowledgement for unknown payload");
            }
            AckOutcome::Partial { lines } => {
                trace!(nonce = %ackn.nonce, sequence = ackn.sequence, lines, "partial acknowledgement");
            }
            AckOutcome::Complete { lines } => {
                debug!(nonce = %ackn.nonce, lines, pending_payloads = self.chain.len(), "payload acknowledged");
                conn.resume_send()?;
            }
        }
        Ok(())
    }

    fn on_shutdown(&mut self, state: &mut ConnectionState) -> ControlFlow<()> {
        if self.is_drained() {
            info!("shutdown requested, nothing pending");
            return ControlFlow::Break(());
        }

        info!(pending_payloads = self.chain.len(), backlog = self.backlog.len(), "shutdown requested, waiting for outstanding acknowledgements");
        self.shutdown_requested = true;
        state.can_send = false;
        self.readiness.clear();
        ControlFlow::Continue(())
    }

    /// Waits out the reconnect backoff, still accepting spools and shutdown requests
    async fn backoff(&mut self) -> ControlFlow<()> {
        let deadline = Instant::now() + self.config.reconnect_backoff;
        debug!(backoff = ?self.config.reconnect_backoff, "waiting before reconnecting");

        loop {
            let action = select! {
                biased;
                _ = self.cancel.cancelled() => return ControlFlow::Break(()),
                action = self.control.pop_until(Some(deadline)) => action,
            };

            match action {
                Err(_) => return ControlFlow::Continue(()),
                Ok(IoAction::Events(events)) => self.backlog.push_back(events),
                Ok(IoAction::Shutdown) => {
                    if self.is_drained() {
                        info!("shutdown requested while disconnected, nothing pending");
                        return ControlFlow::Break(());
                    }
                    info!(pending_payloads = self.chain.len(), "shutdown requested while disconnected, reconnecting to deliver pending payloads");
                    self.shutdown_requested = true;
                }
                Ok(_) => trace!("discarding action from a previous connection"),
            }
        }
    }
}
