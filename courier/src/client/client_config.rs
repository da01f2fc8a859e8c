use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use courier_protocol::tls::TlsVersion;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ClientTransport {
    Tcp,
    #[default]
    Tls,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host names or IP addresses. Exactly one is supported.
    pub addresses: Vec<String>,
    pub port: u16,
    pub transport: ClientTransport,

    /// CA certificate(s) used to verify the server, required for TLS
    pub ssl_ca: Option<PathBuf>,
    /// client certificate presented to servers that verify peers
    pub ssl_certificate: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_key_passphrase: Option<String>,
    pub min_tls_version: TlsVersion,

    /// maximum number of events per payload
    pub spool_size: usize,
    /// a partially filled spool is flushed this long after the previous flush
    pub idle_timeout: Duration,
    pub disable_handshake: bool,

    /// a PING is sent after this long without traffic while nothing is pending
    pub keepalive_timeout: Duration,
    /// maximum wait for an acknowledgement, PONG, handshake reply, or a write to complete
    pub network_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// sending pauses while this many payloads are awaiting acknowledgement
    pub max_pending_payloads: usize,
    /// upper bound for frames received from the server
    pub max_frame_len: u32,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, port: u16) -> ClientConfig {
        ClientConfig {
            addresses: vec![address.into()],
            port,
            transport: ClientTransport::default(),
            ssl_ca: None,
            ssl_certificate: None,
            ssl_key: None,
            ssl_key_passphrase: None,
            min_tls_version: TlsVersion::default(),
            spool_size: 1024,
            idle_timeout: Duration::from_secs(5),
            disable_handshake: false,
            keepalive_timeout: Duration::from_secs(1800),
            network_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
            max_pending_payloads: 100,
            max_frame_len: 1024*1024,
        }
    }

    pub fn address(&self) -> &str {
        self.addresses.first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.addresses.len() {
            0 => bail!("a server address is required"),
            1 => {}
            n => bail!("only a single server address is supported, got {}", n),
        }
        if self.address().is_empty() {
            bail!("the server address must not be empty");
        }
        if self.port == 0 {
            bail!("a server port is required");
        }

        if self.transport == ClientTransport::Tls && self.ssl_ca.is_none() {
            bail!("'ssl_ca' is required for the TLS transport");
        }
        if self.ssl_certificate.is_some() != self.ssl_key.is_some() {
            bail!("'ssl_certificate' and 'ssl_key' must be configured together");
        }

        if self.spool_size == 0 {
            bail!("spool size must be positive");
        }
        if u32::try_from(self.spool_size).is_err() {
            bail!("spool size must not exceed {}", u32::MAX);
        }
        if self.max_pending_payloads == 0 {
            bail!("max pending payloads must be positive");
        }
        if self.idle_timeout.is_zero() || self.keepalive_timeout.is_zero() || self.network_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }
}
