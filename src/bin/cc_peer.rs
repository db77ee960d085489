//! Command-line front end for the echo peer.

use clap::Parser;
use std::{net::{IpAddr, SocketAddr}, process::ExitCode, time::Duration};
use stochastic_cc::{EchoPeer, config::PeerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Echo peer for the congestion-controlled sender")]
struct Args {
    /// Address of the server.
    server: IpAddr,

    /// Server UDP port.
    #[arg(short, long, default_value_t = 60001)]
    port: u16,

    /// How long to run before giving up, in seconds.
    #[arg(short, long, default_value_t = 60)]
    time: u64,

    /// Extra delay added before each echo, in milliseconds.
    #[arg(short, long, default_value_t = 0)]
    delay: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stochastic_cc=info")),
        )
        .init();

    let args = Args::parse();
    let config = PeerConfig {
        extra_delay: Duration::from_millis(args.delay),
        ..PeerConfig::default()
    };
    let server = SocketAddr::new(args.server, args.port);

    let result = async {
        let peer = EchoPeer::connect(server, config).await?;
        peer.run(Duration::from_secs(args.time)).await
    }
    .await;

    match result {
        Ok(report) => {
            info!(?report, "Done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "Peer failed");
            ExitCode::FAILURE
        }
    }
}
