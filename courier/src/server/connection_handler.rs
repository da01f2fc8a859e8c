use std::collections::VecDeque;
use std::sync::Arc;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use courier_protocol::error::CourierError;
use courier_protocol::event::{Event, EventSerializer};
use courier_protocol::event_queue::{EventQueue, QueueTimeout};
use courier_protocol::frame::{read_frame_body, read_frame_header, Frame, Signature};
use courier_protocol::jdat::JdatEvents;
use courier_protocol::message::{AcknMessage, JdatMessage, ProtocolMessage};
use courier_protocol::nonce::Nonce;
use courier_protocol::stream::BoxedStream;
use courier_protocol::version::VersionInfo;
use crate::server::server_config::ServerConfig;

/// Shared by all connections of a server
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub events: Arc<EventQueue<Event>>,
    pub serializer: Arc<dyn EventSerializer>,
    pub cancel: CancellationToken,
}

enum WriterCommand {
    Frame(Bytes),
    /// a JDAT payload was received, acknowledgements for it will follow
    Track(Nonce),
    Ack { nonce: Nonce, sequence: u32, complete: bool },
}

struct InFlightPayload {
    jdat: JdatMessage,
    _permit: OwnedSemaphorePermit,
}

enum HandshakeState {
    AwaitingHelo,
    Streaming,
}

/// Serves a single client connection until it closes, fails, or the server shuts down.
///
/// Three loops share the connection: the receiver reads and answers frames and passes payloads
///  on, the processor decodes payloads and delivers their events, and the sender writes all
///  outgoing frames. A clean close by the client lets payloads already received finish
///  processing and be acknowledged.
pub(crate) async fn handle_connection(stream: BoxedStream, peer_fields: Event, ctx: &ConnectionContext) -> Result<(), CourierError> {
    let (reader, writer) = tokio::io::split(stream);
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (payload_tx, payload_rx) = mpsc::unbounded_channel();
    let in_flight = Arc::new(Semaphore::new(ctx.config.max_in_flight_payloads));

    tokio::try_join!(
        receive_loop(reader, write_tx.clone(), payload_tx, in_flight, ctx),
        process_loop(payload_rx, write_tx, peer_fields, ctx),
        send_loop(writer, write_rx, ctx),
    )?;
    Ok(())
}

fn enqueue(writer: &mpsc::UnboundedSender<WriterCommand>, command: WriterCommand) -> Result<(), CourierError> {
    writer.send(command)
        .map_err(|_| CourierError::protocol("connection writer has terminated"))
}

fn enqueue_message(writer: &mpsc::UnboundedSender<WriterCommand>, message: &ProtocolMessage) -> Result<(), CourierError> {
    enqueue(writer, WriterCommand::Frame(message.to_frame_bytes()?))
}

async fn receive_loop(
    mut reader: ReadHalf<BoxedStream>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    payloads: mpsc::UnboundedSender<InFlightPayload>,
    in_flight: Arc<Semaphore>,
    ctx: &ConnectionContext,
) -> Result<(), CourierError> {
    let config = &ctx.config;
    let mut state = if config.disable_handshake {
        HandshakeState::Streaming
    }
    else {
        HandshakeState::AwaitingHelo
    };

    loop {
        // reading pauses while the maximum number of payloads is in flight
        let permit = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            permit = in_flight.clone().acquire_owned() => permit
                .map_err(|_| CourierError::protocol("in-flight limiter closed"))?,
        };

        let header = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            header = timeout(config.idle_timeout, read_frame_header(&mut reader)) => header,
        };
        let header = match header {
            Err(_) => return Err(CourierError::Timeout(format!("no data from client within {:?}", config.idle_timeout))),
            Ok(Err(CourierError::Eof)) => {
                // one permit is held by this loop
                let pending = config.max_in_flight_payloads.saturating_sub(in_flight.available_permits() + 1);
                if pending > 0 {
                    warn!(pending, "client closed the connection with payloads in flight");
                }
                else {
                    debug!("client closed the connection");
                }
                return Ok(());
            }
            Ok(header) => header?,
        };

        if header.length > config.max_packet_size {
            return Err(CourierError::protocol(format!("{} message of {} bytes exceeds the maximum packet size of {}", header.signature, header.length, config.max_packet_size)));
        }
        if header.signature == Signature::JDAT && (header.length as usize) < JdatMessage::MIN_LEN {
            return Err(CourierError::protocol(format!("JDAT message too small ({} bytes)", header.length)));
        }

        let body = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            body = timeout(config.idle_timeout, read_frame_body(&mut reader, &header)) => body,
        };
        let body = body.map_err(|_| CourierError::Timeout(format!("{} message incomplete after {:?}", header.signature, config.idle_timeout)))??;
        let message = ProtocolMessage::from_frame(&Frame { signature: header.signature, body })?;

        if let HandshakeState::AwaitingHelo = state {
            state = HandshakeState::Streaming;
            match &message {
                ProtocolMessage::Helo(version) => {
                    info!(client = %version.client_version(), supports_evnt = version.supports_evnt(), "remote identified");
                    enqueue_message(&writer, &ProtocolMessage::Vers(VersionInfo::current()))?;
                    continue;
                }
                ProtocolMessage::Jdat(_) | ProtocolMessage::Ping => {
                    info!("client did not send HELO, assuming a client without handshake support");
                }
                other => return Err(CourierError::protocol(format!("unexpected {} message during handshake", other.signature()))),
            }
        }

        match message {
            ProtocolMessage::Ping => {
                trace!("PING");
                enqueue_message(&writer, &ProtocolMessage::Pong)?;
            }
            ProtocolMessage::Jdat(jdat) => {
                trace!(nonce = %jdat.nonce, len = jdat.compressed.len(), "received payload");
                enqueue(&writer, WriterCommand::Track(jdat.nonce))?;
                payloads.send(InFlightPayload { jdat, _permit: permit })
                    .map_err(|_| CourierError::protocol("payload processor has terminated"))?;
            }
            other => {
                debug!(signature = %other.signature(), "unsupported message, replying '????'");
                enqueue_message(&writer, &ProtocolMessage::Unknown)?;
            }
        }
    }
}

async fn process_loop(
    mut payloads: mpsc::UnboundedReceiver<InFlightPayload>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    peer_fields: Event,
    ctx: &ConnectionContext,
) -> Result<(), CourierError> {
    loop {
        let payload = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            payload = payloads.recv() => payload,
        };
        let Some(payload) = payload else {
            return Ok(());
        };
        process_payload(&payload.jdat, &writer, &peer_fields, ctx).await?;
    }
}

/// Delivers a payload's events in order. While delivery is blocked past the ack timeout, the
///  number of events delivered so far is acknowledged to keep the client waiting.
async fn process_payload(jdat: &JdatMessage, writer: &mpsc::UnboundedSender<WriterCommand>, peer_fields: &Event, ctx: &ConnectionContext) -> Result<(), CourierError> {
    let ack_timeout = ctx.config.ack_timeout;
    let mut sequence: u32 = 0;
    let mut deadline = Instant::now() + ack_timeout;

    for event in JdatEvents::inflate(&jdat.compressed, ctx.serializer.as_ref())? {
        let mut event = event?;
        for (k, v) in peer_fields {
            event.insert(k.clone(), v.clone());
        }

        let mut pending = event;
        loop {
            let pushed = select! {
                _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
                pushed = ctx.events.push_until(pending, Some(deadline)) => pushed,
            };
            match pushed {
                Ok(()) => break,
                Err(QueueTimeout(event)) => {
                    trace!(nonce = %jdat.nonce, sequence, "event delivery blocked, sending partial acknowledgement");
                    enqueue(writer, WriterCommand::Ack { nonce: jdat.nonce, sequence, complete: false })?;
                    pending = event;
                    deadline = Instant::now() + ack_timeout;
                }
            }
        }
        sequence = sequence.saturating_add(1);
    }

    debug!(nonce = %jdat.nonce, events = sequence, "payload processed");
    enqueue(writer, WriterCommand::Ack { nonce: jdat.nonce, sequence, complete: true })
}

async fn send_loop(mut writer: WriteHalf<BoxedStream>, mut commands: mpsc::UnboundedReceiver<WriterCommand>, ctx: &ConnectionContext) -> Result<(), CourierError> {
    let ack_timeout = ctx.config.ack_timeout;
    let write_timeout = ctx.config.idle_timeout;

    // payloads awaiting their final acknowledgement, oldest first, with the last sequence sent
    let mut in_flight: VecDeque<(Nonce, u32)> = VecDeque::new();
    let keepalive = sleep(ack_timeout);
    tokio::pin!(keepalive);

    loop {
        let frame = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            command = commands.recv() => match command {
                None => return Ok(()),
                Some(WriterCommand::Frame(frame)) => frame,
                Some(WriterCommand::Track(nonce)) => {
                    if in_flight.is_empty() {
                        keepalive.as_mut().reset(Instant::now() + ack_timeout);
                    }
                    in_flight.push_back((nonce, 0));
                    continue;
                }
                Some(WriterCommand::Ack { nonce, sequence, complete }) => {
                    match in_flight.front_mut() {
                        Some(front) if front.0 == nonce => front.1 = sequence,
                        _ => debug!(%nonce, "acknowledging a payload that is not the oldest in flight"),
                    }
                    if complete {
                        in_flight.pop_front();
                    }
                    keepalive.as_mut().reset(Instant::now() + ack_timeout);
                    ack_frame(nonce, sequence)?
                }
            },
            _ = &mut keepalive, if !in_flight.is_empty() => {
                let (nonce, sequence) = in_flight[0];
                trace!(%nonce, sequence, "no progress on payload, repeating acknowledgement");
                keepalive.as_mut().reset(Instant::now() + ack_timeout);
                ack_frame(nonce, sequence)?
            }
        };

        let written = select! {
            _ = ctx.cancel.cancelled() => return Err(CourierError::Shutdown),
            written = timeout(write_timeout, async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }) => written,
        };
        written.map_err(|_| CourierError::Timeout(format!("write to client blocked for {:?}", write_timeout)))??;
    }
}

fn ack_frame(nonce: Nonce, sequence: u32) -> Result<Bytes, CourierError> {
    ProtocolMessage::Ackn(AcknMessage { nonce, sequence }).to_frame_bytes()
}
