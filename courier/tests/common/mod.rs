#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Level;
use courier::Event;
use courier::server::server_config::{ServerConfig, ServerTransport};
use courier::server::Server;
use courier_protocol::frame::read_frame;
use courier_protocol::message::{AcknMessage, ProtocolMessage};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn line_event(n: usize) -> Event {
    let mut event = Event::new();
    event.insert("message".to_string(), json!(format!("line {}", n)));
    event.insert("host".to_string(), json!("h"));
    event.insert("path".to_string(), json!("p"));
    event
}

pub fn tcp_server_config() -> ServerConfig {
    let mut config = ServerConfig::new("127.0.0.1", 0);
    config.transport = ServerTransport::Tcp;
    config
}

/// A bound server whose delivered events are forwarded to `events`
pub struct RunningServer {
    pub server: Arc<Server>,
    pub events: mpsc::UnboundedReceiver<Event>,
    runner: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub async fn bind(config: ServerConfig) -> RunningServer {
        let server = Arc::new(Server::bind(config).await.unwrap());
        let (tx, events) = mpsc::unbounded_channel();
        let runner = tokio::spawn(deliver(server.clone(), tx));
        RunningServer { server, events, runner: Some(runner) }
    }

    /// Binds without consuming events, see [RunningServer::start_consuming]
    pub async fn bind_stalled(config: ServerConfig) -> RunningServer {
        let server = Arc::new(Server::bind(config).await.unwrap());
        let (_, events) = mpsc::unbounded_channel();
        RunningServer { server, events, runner: None }
    }

    pub fn start_consuming(&mut self) {
        let (tx, events) = mpsc::unbounded_channel();
        self.events = events;
        self.runner = Some(tokio::spawn(deliver(self.server.clone(), tx)));
    }

    pub fn port(&self) -> u16 {
        self.server.local_addr().port()
    }

    pub async fn next_event(&mut self) -> Event {
        timeout(Duration::from_secs(10), self.events.recv()).await
            .expect("timed out waiting for an event")
            .expect("server stopped delivering")
    }

    pub async fn assert_no_event(&mut self, duration: Duration) {
        let result = timeout(duration, self.events.recv()).await;
        assert!(!matches!(result, Ok(Some(_))), "unexpected event {:?}", result);
    }

    pub async fn stop(mut self) {
        self.server.stop().await;
        if let Some(runner) = self.runner.take() {
            runner.await.unwrap();
        }
    }
}

async fn deliver(server: Arc<Server>, tx: mpsc::UnboundedSender<Event>) {
    server.run(|event| {
        let _ = tx.send(event);
    }).await;
}

/// A raw protocol peer for driving a server frame by frame
pub struct RawClient {
    pub stream: TcpStream,
}

impl RawClient {
    pub async fn connect(port: u16) -> RawClient {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        RawClient { stream }
    }

    pub async fn send(&mut self, message: ProtocolMessage) {
        self.stream.write_all(&message.to_frame_bytes().unwrap()).await.unwrap();
    }

    pub async fn send_raw(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
    }

    pub async fn read(&mut self) -> ProtocolMessage {
        let frame = timeout(Duration::from_secs(10), read_frame(&mut self.stream, u32::MAX)).await
            .expect("timed out waiting for a frame")
            .unwrap();
        ProtocolMessage::from_frame(&frame).unwrap()
    }

    pub async fn read_ackn(&mut self) -> AcknMessage {
        match self.read().await {
            ProtocolMessage::Ackn(ackn) => ackn,
            other => panic!("expected ACKN, got {:?}", other),
        }
    }

    pub async fn assert_closed(&mut self) {
        let result = timeout(Duration::from_secs(10), read_frame(&mut self.stream, u32::MAX)).await
            .expect("connection was not closed");
        assert!(result.is_err(), "expected the connection to be closed, got {:?}", result);
    }
}
