//! 服务器：一条流的生命周期。
//! Server: the lifecycle of one flow.
//!
//! The server waits for a single peer to register, then runs the four
//! control loops against it for a fixed duration and tears them down in
//! order: the timeout supervisor first, then a short window in which the
//! pacer announces the end of the stream, then everything else.

use crate::{
    config::Config,
    control::{AckReceiver, ControllerState, DecisionEngine, Pacer, TimeoutHandle, TimeoutSupervisor},
    error::{Error, Result},
    model::ModelTable,
    socket::DatagramSocket,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info};

pub use crate::control::state::FlowSummary;

/// Size of the buffer the registration datagram is read into.
const HELLO_BUFFER: usize = 512;

/// A congestion-controlled sender for a single peer.
///
/// 面向单个对端的拥塞控制发送端。
pub struct Server<S: DatagramSocket = UdpSocket> {
    socket: Arc<S>,
    config: Config,
    model: Arc<ModelTable>,
    peer: Option<SocketAddr>,
}

impl Server<UdpSocket> {
    /// Binds a UDP socket and prepares a server around it.
    ///
    /// 绑定一个 UDP 套接字并基于它创建服务器。
    pub async fn bind(addr: SocketAddr, config: Config, model: ModelTable) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, config, model)
    }
}

impl<S: DatagramSocket> Server<S> {
    pub fn from_socket(socket: S, config: Config, model: ModelTable) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            socket: Arc::new(socket),
            config,
            model: Arc::new(model),
            peer: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The registered peer, if any.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Waits for the first datagram and registers its sender as the peer.
    /// The payload is ignored.
    ///
    /// 等待第一个数据报，并将其发送方注册为对端。内容被忽略。
    pub async fn accept_peer(&mut self) -> Result<SocketAddr> {
        let mut buf = [0u8; HELLO_BUFFER];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        info!(%peer, bytes = len, "Peer registered");
        self.peer = Some(peer);
        Ok(peer)
    }

    /// Runs the flow for `run_for`.
    pub async fn run(self, run_for: Duration) -> Result<FlowSummary> {
        self.run_until(run_for, std::future::pending()).await
    }

    /// Runs the flow until `run_for` elapses, `stop` completes or a loop
    /// fails, then shuts it down and returns its counters.
    ///
    /// 运行该流，直到 `run_for` 结束、`stop` 完成或某个循环失败，
    /// 然后关闭并返回统计信息。
    pub async fn run_until<F>(self, run_for: Duration, stop: F) -> Result<FlowSummary>
    where
        F: Future<Output = ()>,
    {
        let peer = self.peer.ok_or(Error::NotConnected)?;
        let session_id = i32::from(rand::random::<u16>());
        let state = Arc::new(ControllerState::new(&self.config.controller, session_id));
        state.restart_ack_clock(Instant::now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (timer_stop_tx, timer_stop_rx) = watch::channel(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(2);

        let timeout = TimeoutHandle::new(self.config.timeout.clone());
        timeout.arm_at(Instant::now() + self.config.timeout.initial);
        let supervisor = tokio::spawn(TimeoutSupervisor::new(state.clone(), timeout.clone()).run(timer_stop_rx));

        let receiver = AckReceiver::new(
            state.clone(),
            self.socket.clone(),
            peer,
            timeout,
            self.config.transport.recv_buffer_size,
        );
        let receiver = spawn_reporting(receiver.run(shutdown_rx.clone()), fatal_tx.clone());
        let pacer = Pacer::new(state.clone(), self.socket.clone(), peer, &self.config);
        let pacer = spawn_reporting(pacer.run(shutdown_rx.clone()), fatal_tx);

        let engine = DecisionEngine::new(state.clone(), self.model.clone(), self.config.controller.clone());
        info!(%peer, session_id, ?run_for, "Flow started");

        let mut failure = None;
        tokio::select! {
            epochs = engine.run(run_for, shutdown_rx) => debug!(epochs, "Run time elapsed"),
            Some(err) = fatal_rx.recv() => {
                error!(%err, "Control loop failed, shutting down");
                failure = Some(err);
            }
            _ = stop => info!("Stop requested"),
        }

        // The supervisor goes first so a late timeout cannot disturb the
        // end-of-stream packets.
        let _ = timer_stop_tx.send(true);
        supervisor.await?;

        state.end_stream();
        state.add_budget(1);
        tokio::time::sleep(self.config.transport.shutdown_grace).await;

        let _ = shutdown_tx.send(true);
        receiver.await?;
        pacer.await?;
        if failure.is_none() {
            failure = fatal_rx.try_recv().ok();
        }

        let summary = state.summary();
        info!(
            sent = summary.packets_sent,
            acked = summary.packets_acked,
            lost = summary.packets_lost,
            timeouts = summary.timeouts,
            backpressure = summary.backpressure_events,
            window = summary.final_window,
            "Flow finished"
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Spawns a loop whose error is forwarded to the flow instead of being lost
/// in its join handle.
fn spawn_reporting<F>(task: F, fatal: mpsc::Sender<Error>) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            let _ = fatal.send(err).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        packet::{HEADER_SIZE, Packet},
        testing::{MockSocket, PEER_ADDR, SERVER_ADDR, holding_model},
    };
    use std::io;

    fn config() -> Config {
        let mut config = Config::default();
        config.transport.shutdown_grace = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_run_without_peer_is_rejected() {
        let server =
            Server::from_socket(MockSocket::new(SERVER_ADDR), config(), holding_model(-5, 5))
                .unwrap();
        assert!(matches!(
            server.run(Duration::from_millis(10)).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.transport.mtu = 8;
        assert!(matches!(
            Server::from_socket(MockSocket::new(SERVER_ADDR), config, holding_model(-5, 5)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_flow_ends_with_end_of_stream_packet() {
        let mut server =
            Server::from_socket(MockSocket::new(SERVER_ADDR), config(), holding_model(-5, 5))
                .unwrap();
        server.socket.inject(b"hello", PEER_ADDR);
        assert_eq!(server.accept_peer().await.unwrap(), PEER_ADDR);

        let socket = server.socket.clone();
        let summary = server.run(Duration::from_millis(30)).await.unwrap();
        assert!(summary.packets_sent > 0);

        let sent = socket.sent();
        let last = Packet::decode(&mut &sent[sent.len() - 1].0[..HEADER_SIZE]).unwrap();
        assert!(last.is_end_of_stream());
        let first = Packet::decode(&mut &sent[0].0[..HEADER_SIZE]).unwrap();
        assert_eq!(first.seq, 1);
        assert!(first.session_id >= 0);
    }

    #[tokio::test]
    async fn test_fatal_send_error_ends_the_flow() {
        let mut server =
            Server::from_socket(MockSocket::new(SERVER_ADDR), config(), holding_model(-5, 5))
                .unwrap();
        server.socket.inject(b"hello", PEER_ADDR);
        server.accept_peer().await.unwrap();
        server
            .socket
            .fail_send_after(0, io::ErrorKind::PermissionDenied.into());

        let result = server.run(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
