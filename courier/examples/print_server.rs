use std::path::PathBuf;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tracing::{info, warn, Level};
use courier::server::server_config::{ServerConfig, ServerTransport};
use courier::server::Server;

/// Receives events and prints each of them as a line of JSON
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1")]
    address: String,
    #[clap(long, default_value_t = 0)]
    port: u16,

    /// plain TCP instead of TLS
    #[clap(long, default_value_t = false)]
    tcp: bool,
    #[clap(long)]
    ssl_certificate: Option<PathBuf>,
    #[clap(long)]
    ssl_key: Option<PathBuf>,
    /// require client certificates issued by these CAs (file or directory)
    #[clap(long)]
    ssl_verify_ca: Option<PathBuf>,

    #[clap(long, default_value_t = false)]
    add_peer_fields: bool,

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

    let mut config = ServerConfig::new(args.address, args.port);
    if args.tcp {
        config.transport = ServerTransport::Tcp;
    }
    config.ssl_certificate = args.ssl_certificate;
    config.ssl_key = args.ssl_key;
    config.ssl_verify = args.ssl_verify_ca.is_some();
    config.ssl_verify_ca = args.ssl_verify_ca;
    config.add_peer_fields = args.add_peer_fields;

    let server = Server::bind(config).await?;
    info!(local_addr = %server.local_addr(), "server running, press Ctrl-C to stop");

    select! {
        _ = server.run(|event| match serde_json::to_string(&event) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!(error = %e, "event can not be printed"),
        }) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    server.stop().await;
    Ok(())
}
