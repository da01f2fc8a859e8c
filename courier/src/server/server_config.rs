use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use courier_protocol::message::JdatMessage;
use courier_protocol::tls::TlsVersion;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ServerTransport {
    Tcp,
    #[default]
    Tls,
    /// recognised for configuration compatibility, but not available in this implementation
    Zmq,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: ServerTransport,
    pub address: String,
    /// 0 binds an ephemeral port, see [crate::server::Server::local_addr]
    pub port: u16,

    pub ssl_certificate: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_key_passphrase: Option<String>,
    /// require and verify client certificates
    pub ssl_verify: bool,
    /// trust the public web PKI roots for client certificates
    pub ssl_verify_default_ca: bool,
    /// trust anchors for client certificates, a PEM file or a directory of them
    pub ssl_verify_ca: Option<PathBuf>,
    pub min_tls_version: TlsVersion,
    pub tls_handshake_timeout: Duration,

    /// upper bound for any received frame, and for JDAT payloads in particular
    pub max_packet_size: u32,
    /// adds `peer` (and `peer_ssl_cn` with client certificates) to every event
    pub add_peer_fields: bool,
    pub disable_handshake: bool,

    /// a connection without any received frame for this long is closed
    pub idle_timeout: Duration,
    /// how long event delivery may block before a partial acknowledgement is sent
    pub ack_timeout: Duration,
    /// reading pauses while this many payloads are received but not yet fully acknowledged
    pub max_in_flight_payloads: usize,
    /// capacity of the queue between connections and the application callback
    pub event_queue_capacity: usize,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> ServerConfig {
        ServerConfig {
            transport: ServerTransport::default(),
            address: address.into(),
            port,
            ssl_certificate: None,
            ssl_key: None,
            ssl_key_passphrase: None,
            ssl_verify: false,
            ssl_verify_default_ca: false,
            ssl_verify_ca: None,
            min_tls_version: TlsVersion::default(),
            tls_handshake_timeout: Duration::from_secs(10),
            max_packet_size: 10*1024*1024,
            add_peer_fields: false,
            disable_handshake: false,
            idle_timeout: Duration::from_secs(1800),
            ack_timeout: Duration::from_secs(5),
            max_in_flight_payloads: 2,
            event_queue_capacity: 1,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.transport {
            ServerTransport::Tcp => {}
            ServerTransport::Tls => {
                if self.ssl_certificate.is_none() || self.ssl_key.is_none() {
                    bail!("'ssl_certificate' and 'ssl_key' are required for the TLS transport");
                }
                if self.ssl_verify && !self.ssl_verify_default_ca && self.ssl_verify_ca.is_none() {
                    bail!("'ssl_verify' requires 'ssl_verify_ca' or 'ssl_verify_default_ca'");
                }
            }
            ServerTransport::Zmq => bail!("the ZMQ transport is not supported, use TCP or TLS"),
        }

        if self.address.is_empty() {
            bail!("a listen address is required");
        }
        if (self.max_packet_size as usize) < JdatMessage::MIN_LEN {
            bail!("max packet size must be at least {} bytes", JdatMessage::MIN_LEN);
        }
        if self.max_in_flight_payloads == 0 {
            bail!("max in-flight payloads must be positive");
        }
        if self.event_queue_capacity == 0 {
            bail!("event queue capacity must be positive");
        }
        if self.idle_timeout.is_zero() || self.ack_timeout.is_zero() || self.tls_handshake_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tls_config() -> ServerConfig {
        let mut config = ServerConfig::new("0.0.0.0", 0);
        config.ssl_certificate = Some(PathBuf::from("cert.pem"));
        config.ssl_key = Some(PathBuf::from("key.pem"));
        config
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("0.0.0.0", 0);
        assert_eq!(config.transport, ServerTransport::Tls);
        assert_eq!(config.max_packet_size, 10485760);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_in_flight_payloads, 2);
        assert!(!config.add_peer_fields);
    }

    #[test]
    fn test_valid() {
        tls_config().validate().unwrap();

        let mut tcp = ServerConfig::new("127.0.0.1", 0);
        tcp.transport = ServerTransport::Tcp;
        tcp.validate().unwrap();

        let mut verify = tls_config();
        verify.ssl_verify = true;
        verify.ssl_verify_default_ca = true;
        verify.validate().unwrap();
    }

    #[rstest]
    #[case::zmq(|c: &mut ServerConfig| c.transport = ServerTransport::Zmq)]
    #[case::no_certificate(|c: &mut ServerConfig| c.ssl_certificate = None)]
    #[case::no_key(|c: &mut ServerConfig| c.ssl_key = None)]
    #[case::verify_without_ca(|c: &mut ServerConfig| c.ssl_verify = true)]
    #[case::no_address(|c: &mut ServerConfig| c.address.clear())]
    #[case::tiny_packets(|c: &mut ServerConfig| c.max_packet_size = 16)]
    #[case::no_in_flight(|c: &mut ServerConfig| c.max_in_flight_payloads = 0)]
    #[case::no_queue(|c: &mut ServerConfig| c.event_queue_capacity = 0)]
    #[case::zero_ack_timeout(|c: &mut ServerConfig| c.ack_timeout = Duration::ZERO)]
    fn test_invalid(#[case] modify: fn(&mut ServerConfig)) {
        let mut config = tls_config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
