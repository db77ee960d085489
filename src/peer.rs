//! 回显对端
//! Echo peer
//!
//! The receiving side of a flow. It registers with the server, then echoes
//! the header of every data packet back, optionally after a fixed extra
//! delay, until the server announces the end of the stream.

use crate::{
    config::PeerConfig,
    error::Result,
    packet::{HEADER_SIZE, Packet},
    socket::DatagramSocket,
};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{Instant, interval_at, sleep, sleep_until},
};
use tracing::{debug, info, trace, warn};

const HELLO: &[u8] = b"hello";

/// Largest datagram the peer reads; longer ones are truncated, which only
/// drops padding.
const RECV_BUFFER: usize = 65_536;

/// What a peer saw during its run.
///
/// 对端在运行期间观察到的情况。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerReport {
    pub packets_received: u64,
    pub packets_echoed: u64,
    /// Whether the run ended on an end-of-stream packet rather than its deadline.
    pub terminated_by_server: bool,
}

/// 回显对端
/// The echo peer
pub struct EchoPeer<S: DatagramSocket = UdpSocket> {
    socket: Arc<S>,
    server: SocketAddr,
    config: PeerConfig,
}

impl EchoPeer<UdpSocket> {
    /// Binds an ephemeral local socket of the server's address family.
    ///
    /// 绑定一个与服务器地址族相同的临时本地套接字。
    pub async fn connect(server: SocketAddr, config: PeerConfig) -> Result<Self> {
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_socket(socket, server, config))
    }
}

impl<S: DatagramSocket> EchoPeer<S> {
    pub fn from_socket(socket: S, server: SocketAddr, config: PeerConfig) -> Self {
        Self {
            socket: Arc::new(socket),
            server,
            config,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers with the server and echoes until the end of the stream or
    /// until `run_for` elapses. The hello is repeated until the first data
    /// packet arrives.
    ///
    /// 向服务器注册并回显，直到流结束或 `run_for` 到期。
    /// 在收到第一个数据包之前会重复发送 hello。
    pub async fn run(self, run_for: Duration) -> Result<PeerReport> {
        let echoed = Arc::new(AtomicU64::new(0));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let echo = tokio::spawn(echo_loop(
            self.socket.clone(),
            self.server,
            self.config.extra_delay,
            queue_rx,
            echoed.clone(),
        ));

        self.socket.send_to(HELLO, self.server).await?;
        info!(server = %self.server, "Hello sent");

        let mut hello = interval_at(
            Instant::now() + self.config.hello_interval,
            self.config.hello_interval,
        );
        let deadline = sleep(run_for);
        tokio::pin!(deadline);

        let mut report = PeerReport::default();
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    debug!("Peer run time elapsed");
                    break;
                }
                _ = hello.tick(), if report.packets_received == 0 => {
                    self.socket.send_to(HELLO, self.server).await?;
                    debug!("No data yet, hello repeated");
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(%err, "Receive failed");
                            continue;
                        }
                    };
                    if from != self.server {
                        continue;
                    }
                    let Some(packet) = Packet::decode(&mut &buf[..len]) else {
                        continue;
                    };

                    report.packets_received += 1;
                    if report.packets_received == 1 {
                        info!(session_id = packet.session_id, "Data flow started");
                    }
                    if packet.is_end_of_stream() {
                        info!(seq = packet.seq, "Server ended the stream");
                        report.terminated_by_server = true;
                        break;
                    }
                    trace!(seq = packet.seq, "Data packet received");

                    let mut header = [0u8; HEADER_SIZE];
                    header.copy_from_slice(&buf[..HEADER_SIZE]);
                    if queue_tx.send((Instant::now(), header)).is_err() {
                        break;
                    }
                }
            }
        }

        drop(queue_tx);
        echo.abort();
        if let Ok(Err(err)) = echo.await {
            return Err(err);
        }
        report.packets_echoed = echoed.load(Ordering::Relaxed);
        info!(
            received = report.packets_received,
            echoed = report.packets_echoed,
            terminated_by_server = report.terminated_by_server,
            "Peer finished"
        );
        Ok(report)
    }
}

/// Sends queued headers back in arrival order, each no earlier than its
/// arrival plus `extra_delay`.
async fn echo_loop<S: DatagramSocket>(
    socket: Arc<S>,
    server: SocketAddr,
    extra_delay: Duration,
    mut queue: mpsc::UnboundedReceiver<(Instant, [u8; HEADER_SIZE])>,
    echoed: Arc<AtomicU64>,
) -> Result<()> {
    while let Some((arrived, header)) = queue.recv().await {
        if !extra_delay.is_zero() {
            sleep_until(arrived + extra_delay).await;
        }
        socket.send_to(&header, server).await?;
        echoed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSocket, PEER_ADDR, SERVER_ADDR};
    use bytes::BytesMut;

    fn encoded(packet: Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.encode_padded(&mut buf, 1500);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_peer_echoes_headers_until_end_of_stream() {
        let socket = MockSocket::new(PEER_ADDR);
        for seq in 1..=3 {
            socket.inject(&encoded(Packet::new(seq, 4, 9)), SERVER_ADDR);
        }
        socket.inject(&encoded(Packet::new(99, 4, 9)), "10.0.0.1:9".parse().unwrap());
        socket.inject(&encoded(Packet::new(4, 4, -1)), SERVER_ADDR);

        let peer = EchoPeer::from_socket(socket, SERVER_ADDR, PeerConfig::default());
        let sent = peer.socket.clone();
        let report = peer.run(Duration::from_secs(5)).await.unwrap();

        assert!(report.terminated_by_server);
        assert_eq!(report.packets_received, 4);

        let sent = sent.sent();
        assert_eq!(sent[0].0, HELLO);
        // The end-of-stream packet itself is never echoed.
        for (bytes, to) in &sent[1..] {
            assert_eq!(*to, SERVER_ADDR);
            assert_eq!(bytes.len(), HEADER_SIZE);
            let packet = Packet::decode(&mut &bytes[..]).unwrap();
            assert!(!packet.is_end_of_stream());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_repeats_until_data_arrives() {
        let peer = EchoPeer::from_socket(
            MockSocket::new(PEER_ADDR),
            SERVER_ADDR,
            PeerConfig {
                hello_interval: Duration::from_millis(100),
                ..PeerConfig::default()
            },
        );
        let sent = peer.socket.clone();
        let report = peer.run(Duration::from_millis(350)).await.unwrap();

        assert!(!report.terminated_by_server);
        assert_eq!(report.packets_received, 0);
        assert_eq!(sent.sent().len(), 4);
        assert!(sent.sent().iter().all(|(bytes, _)| bytes == HELLO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_delay_holds_each_echo() {
        let socket = MockSocket::new(PEER_ADDR);
        socket.inject(&encoded(Packet::new(1, 4, 9)), SERVER_ADDR);
        let peer = EchoPeer::from_socket(
            socket,
            SERVER_ADDR,
            PeerConfig {
                extra_delay: Duration::from_millis(50),
                ..PeerConfig::default()
            },
        );
        let sent = peer.socket.clone();
        let task = tokio::spawn(peer.run(Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sent.sent().len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sent.sent().len(), 2);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.packets_echoed, 1);
    }
}
