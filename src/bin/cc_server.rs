//! Command-line front end for the congestion-controlled sender.
//!
//! Waits for one peer to register, streams to it for `--time` seconds (or
//! until Ctrl-C) and logs the flow summary.

use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};
use stochastic_cc::{Config, ModelTable, Server};
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Model-assisted congestion-controlled UDP sender")]
struct Args {
    /// Label for this run, attached to every log line.
    #[arg(short, long, default_value = "run")]
    name: String,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 60001)]
    port: u16,

    /// Path to the model table.
    #[arg(short, long)]
    model: PathBuf,

    /// How long to stream, in seconds.
    #[arg(short, long, default_value_t = 60)]
    time: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stochastic_cc=info")),
        )
        .init();

    let args = Args::parse();
    let span = info_span!("server", name = %args.name);
    match run(args).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> stochastic_cc::Result<()> {
    let model = ModelTable::load(&args.model)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    let mut server = Server::bind(addr, Config::default(), model).await?;
    info!(addr = %server.local_addr()?, "Waiting for a peer");

    server.accept_peer().await?;
    let stop = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = server
        .run_until(Duration::from_secs(args.time), stop)
        .await?;
    info!(?summary, "Done");
    Ok(())
}
