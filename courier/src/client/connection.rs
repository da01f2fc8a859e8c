use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument, Span};
use courier_protocol::error::CourierError;
use courier_protocol::event_queue::EventQueue;
use courier_protocol::frame::{frame_bytes, read_frame, Signature};
use courier_protocol::message::ProtocolMessage;
use courier_protocol::stream::BoxedStream;
use courier_protocol::version::VersionInfo;
use crate::client::client_config::ClientConfig;
use crate::client::connector::Connector;
use crate::client::io_session::IoAction;

enum WriterCommand {
    Frame(Bytes),
    Pause,
    Resume,
}

/// A single established connection to the server. Two worker tasks do the actual I/O and report
///  back to the session through its action queue, tagging everything with the connection's
///  generation so that reports from a previous connection can be told apart.
///
/// The writer worker signals readiness (`SendReady`) before each frame it writes unless sending
///  is paused, which is how the session learns it can hand over another payload.
pub(crate) struct ClientConnection {
    generation: u64,
    remote_version: Option<VersionInfo>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    send_paused: bool,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl ClientConnection {
    pub async fn establish(generation: u64, connector: &dyn Connector, config: &ClientConfig, control: Arc<EventQueue<IoAction>>) -> Result<ClientConnection, CourierError> {
        let stream = timeout(config.network_timeout, connector.connect()).await
            .map_err(|_| CourierError::Timeout(format!("connecting to {}", connector.describe())))??;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let remote_version = if config.disable_handshake {
            None
        }
        else {
            Some(handshake(&mut reader, &mut writer, config.network_timeout, config.max_frame_len).await?)
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        workers.spawn(
            run_writer(generation, writer, rx, control.clone(), config.network_timeout, cancel.clone())
                .instrument(Span::current())
        );
        workers.spawn(
            run_reader(generation, reader, config.max_frame_len, control, cancel.clone())
                .instrument(Span::current())
        );

        Ok(ClientConnection {
            generation,
            remote_version,
            writer: tx,
            send_paused: false,
            cancel,
            workers,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_version(&self) -> Option<&VersionInfo> {
        self.remote_version.as_ref()
    }

    fn enqueue(&self, command: WriterCommand) -> Result<(), CourierError> {
        self.writer.send(command)
            .map_err(|_| CourierError::protocol("connection writer has terminated"))
    }

    pub fn send(&self, message: &ProtocolMessage) -> Result<(), CourierError> {
        self.enqueue(WriterCommand::Frame(message.to_frame_bytes()?))
    }

    pub fn send_jdat(&self, body: &Bytes) -> Result<(), CourierError> {
        self.enqueue(WriterCommand::Frame(frame_bytes(Signature::JDAT, body)?))
    }

    pub fn is_send_paused(&self) -> bool {
        self.send_paused
    }

    pub fn pause_send(&mut self) -> Result<(), CourierError> {
        if !self.send_paused {
            debug!("pausing send");
            self.send_paused = true;
            self.enqueue(WriterCommand::Pause)?;
        }
        Ok(())
    }

    pub fn resume_send(&mut self) -> Result<(), CourierError> {
        if self.send_paused {
            debug!("resuming send");
            self.send_paused = false;
            self.enqueue(WriterCommand::Resume)?;
        }
        Ok(())
    }

    /// Stops both workers, closing the stream once they are gone
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        while self.workers.join_next().await.is_some() {}
    }
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W, network_timeout: Duration, max_frame_len: u32) -> Result<VersionInfo, CourierError>
where R: AsyncRead + Unpin, W: AsyncWrite + Unpin
{
    let helo = ProtocolMessage::Helo(VersionInfo::current()).to_frame_bytes()?;
    timeout(network_timeout, write_frame(writer, &helo)).await
        .map_err(|_| CourierError::Timeout("sending HELO".to_string()))??;

    let frame = timeout(network_timeout, read_frame(reader, max_frame_len)).await
        .map_err(|_| CourierError::Timeout("waiting for the handshake reply".to_string()))??;

    match ProtocolMessage::from_frame(&frame)? {
        ProtocolMessage::Vers(version) => {
            info!(server = %version.client_version(), supports_evnt = version.supports_evnt(), "remote identified");
            Ok(version)
        }
        ProtocolMessage::Unknown => {
            info!("remote does not support the handshake");
            Ok(VersionInfo::default())
        }
        other => Err(CourierError::protocol(format!("unexpected {} reply to HELO", other.signature()))),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<(), CourierError> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// returns `false` if the connection was cancelled while waiting for room in the queue
async fn push_action(control: &EventQueue<IoAction>, action: IoAction, cancel: &CancellationToken) -> bool {
    select! {
        _ = cancel.cancelled() => false,
        result = control.push(action, None) => result.is_ok(),
    }
}

async fn run_writer(
    generation: u64,
    mut writer: WriteHalf<BoxedStream>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    control: Arc<EventQueue<IoAction>>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut paused = false;
    if !push_action(&control, IoAction::SendReady { generation }, &cancel).await {
        return;
    }

    loop {
        let command = select! {
            _ = cancel.cancelled() => return,
            command = commands.recv() => command,
        };

        match command {
            None => return,
            Some(WriterCommand::Pause) => paused = true,
            Some(WriterCommand::Resume) => {
                paused = false;
                if !push_action(&control, IoAction::SendReady { generation }, &cancel).await {
                    return;
                }
            }
            Some(WriterCommand::Frame(frame)) => {
                if !paused && !push_action(&control, IoAction::SendReady { generation }, &cancel).await {
                    return;
                }

                trace!(len = frame.len(), "writing frame");
                let result = select! {
                    _ = cancel.cancelled() => return,
                    result = timeout(write_timeout, write_frame(&mut writer, &frame)) => result,
                };
                let error = match result {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => CourierError::Timeout("writing to the server".to_string()),
                };
                push_action(&control, IoAction::Failed { generation, error }, &cancel).await;
                return;
            }
        }
    }
}

async fn run_reader(
    generation: u64,
    mut reader: ReadHalf<BoxedStream>,
    max_frame_len: u32,
    control: Arc<EventQueue<IoAction>>,
    cancel: CancellationToken,
) {
    loop {
        let result = select! {
            _ = cancel.cancelled() => return,
            result = read_frame(&mut reader, max_frame_len) => result,
        };

        match result.and_then(|frame| ProtocolMessage::from_frame(&frame)) {
            Ok(message) => {
                trace!(signature = %message.signature(), "received frame");
                if !push_action(&control, IoAction::Received { generation, message }, &cancel).await {
                    return;
                }
            }
            Err(error) => {
                push_action(&control, IoAction::Failed { generation, error }, &cancel).await;
                return;
            }
        }
    }
}
