//! tests/common/harness.rs
use std::{net::SocketAddr, sync::Once, time::Duration};
use stochastic_cc::{
    Config, EchoPeer, ModelTable, PeerReport, Server, config::PeerConfig, server::FlowSummary,
};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stochastic_cc=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_test_writer()
            .init();
    });
}

/// A table whose bounds no trend value reaches, so every epoch takes the
/// model branch and the single bucket keeps the window where it was.
pub const HOLDING_MODEL: &str = "\
1, 0, 0, 1, 1, -1000000000, 1000000000, 2000000000
1.0
";

/// Defaults with a short shutdown so tests finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.shutdown_grace = Duration::from_millis(200);
    config
}

/// A server and a peer running against each other over loopback UDP.
pub struct Loopback {
    pub server_addr: SocketAddr,
    pub server: JoinHandle<stochastic_cc::Result<FlowSummary>>,
    pub peer: JoinHandle<stochastic_cc::Result<PeerReport>>,
}

impl Loopback {
    /// Starts a server on an ephemeral port and a peer that registers with it.
    pub async fn start(run_for: Duration, config: Config, peer_config: PeerConfig) -> Self {
        init_tracing();
        let model = ModelTable::parse(HOLDING_MODEL).expect("model table should parse");
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap(), config, model)
            .await
            .expect("server should bind");
        let server_addr = server.local_addr().unwrap();

        let peer = EchoPeer::connect(server_addr, peer_config)
            .await
            .expect("peer should bind");
        let peer = tokio::spawn(peer.run(run_for + Duration::from_secs(5)));

        let server = tokio::spawn(async move {
            server.accept_peer().await?;
            server.run(run_for).await
        });

        Self {
            server_addr,
            server,
            peer,
        }
    }

    /// Waits for both sides to finish.
    pub async fn join(self) -> (FlowSummary, PeerReport) {
        let summary = self.server.await.unwrap().expect("server run failed");
        let report = self.peer.await.unwrap().expect("peer run failed");
        (summary, report)
    }
}
