use std::path::PathBuf;
use clap::Parser;
use clap_derive::Parser;
use serde_json::Value;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn, Level};
use courier::client::client_config::{ClientConfig, ClientTransport};
use courier::client::Client;
use courier::Event;

/// Ships every line read from stdin as an event
#[derive(Parser)]
struct Args {
    address: String,
    port: u16,

    /// plain TCP instead of TLS
    #[clap(long, default_value_t = false)]
    tcp: bool,
    #[clap(long)]
    ssl_ca: Option<PathBuf>,
    #[clap(long)]
    ssl_certificate: Option<PathBuf>,
    #[clap(long)]
    ssl_key: Option<PathBuf>,

    /// value of each event's `host` field
    #[clap(long, default_value = "localhost")]
    host: String,
    /// value of each event's `path` field
    #[clap(long, default_value = "-")]
    path: String,
    #[clap(long, default_value_t = 1024)]
    spool_size: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let mut config = ClientConfig::new(args.address.clone(), args.port);
    if args.tcp {
        config.transport = ClientTransport::Tcp;
    }
    config.ssl_ca = args.ssl_ca.clone();
    config.ssl_certificate = args.ssl_certificate.clone();
    config.ssl_key = args.ssl_key.clone();
    config.spool_size = args.spool_size;

    let client = Client::new(config)?;

    let mut lines = BufReader::new(stdin()).lines();
    let mut published = 0usize;
    let interrupted = loop {
        let line = select! {
            _ = tokio::signal::ctrl_c() => break true,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break false;
        };

        let mut event = Event::new();
        event.insert("message".to_string(), Value::String(line));
        event.insert("host".to_string(), Value::String(args.host.clone()));
        event.insert("path".to_string(), Value::String(args.path.clone()));
        client.publish(event).await?;
        published += 1;
    };

    info!(published, "input finished, shutting down");
    if client.shutdown(interrupted).await {
        info!("all events acknowledged");
    }
    else {
        warn!("some events were not acknowledged");
    }
    Ok(())
}
