//! Reliable, at-least-once shipping of structured log events from a client to a server.
//!
//! The [client::Client] batches published events into payloads, sends them over a single
//!  connection and keeps every payload until the server has acknowledged all of its events,
//!  retransmitting after a reconnect. The [server::Server] accepts any number of connections,
//!  decodes payloads and hands events to the application through a bounded queue, using partial
//!  acknowledgements to keep clients waiting while the application applies backpressure.
//!
//! The wire format lives in [courier_protocol].

pub mod client;
pub mod server;

pub use courier_protocol::event::{Event, EventSerializer, JsonSerializer};
pub use courier_protocol::error::CourierError;
pub use courier_protocol::tls::TlsVersion;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
