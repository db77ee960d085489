//! ACK接收器与缺口检测
//! ACK receiver and gap detector
//!
//! Every echoed packet is classified against the in-order baseline:
//! the next expected sequence, a late arrival that may fill a recorded gap,
//! or a jump that opens new gaps.

use super::{state::ControllerState, timeout::TimeoutHandle};
use crate::{
    error::Result,
    packet::{Packet, Timestamp},
    socket::DatagramSocket,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, trace, warn};

/// How an acknowledgment was classified.
///
/// 确认的分类结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    /// Exactly the next expected sequence.
    /// 正好是下一个期望的序列号。
    InOrder,
    /// A late packet that filled a recorded gap.
    /// 填补了已记录缺口的迟到包。
    Recovered,
    /// A late packet with no gap record; it was already declared lost.
    /// 没有缺口记录的迟到包，已被判定为丢失。
    Discarded,
    /// A jump past the baseline that opened `opened` gap records.
    /// 越过基线的跳跃，新建了 `opened` 条缺口记录。
    Gap { opened: usize },
}

/// Applies one acknowledgment to the shared state.
///
/// 将一个确认应用到共享状态。
pub fn process_ack(
    state: &ControllerState,
    packet: &Packet,
    delay_ms: f64,
    now: Instant,
) -> AckClass {
    let last = state.last_in_order();

    let class = if packet.seq == last + 1 {
        state.record_ack(delay_ms, packet.window);
        AckClass::InOrder
    } else if packet.seq <= last {
        match state.missing().remove(packet.seq) {
            Some(_) => {
                state.record_ack(delay_ms, packet.window);
                AckClass::Recovered
            }
            None => {
                state.stats().on_discarded();
                trace!(seq = packet.seq, baseline = last, "Discarding expired late arrival");
                AckClass::Discarded
            }
        }
    } else {
        // Only sequences still in flight can become gaps; anything else was
        // already resolved by a timeout.
        let gaps = state.in_flight_table().windows_in(last + 1, packet.seq);
        state.missing().record_gaps(&gaps, now);
        state.record_ack(delay_ms, packet.window);
        AckClass::Gap { opened: gaps.len() }
    };

    state.advance_in_order(packet.seq, packet.session_id, now);
    state.in_flight_table().resolve(packet.seq);
    class
}

/// The loop that reads echoed packets from the socket.
///
/// 从套接字读取回显包的循环。
pub struct AckReceiver<S: DatagramSocket> {
    state: Arc<ControllerState>,
    socket: Arc<S>,
    peer: SocketAddr,
    timeout: TimeoutHandle,
    buffer_size: usize,
}

impl<S: DatagramSocket> AckReceiver<S> {
    pub fn new(
        state: Arc<ControllerState>,
        socket: Arc<S>,
        peer: SocketAddr,
        timeout: TimeoutHandle,
        buffer_size: usize,
    ) -> Self {
        Self {
            state,
            socket,
            peer,
            timeout,
            buffer_size,
        }
    }

    /// Runs until the termination flag is raised. A receive error ends the
    /// flow.
    ///
    /// 运行直到终止标志被设置。接收错误会终止该流。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                received = self.socket.recv_from(&mut buf) => received?,
            };

            if from != self.peer {
                debug!(addr = %from, "Ignoring datagram from unregistered address");
                continue;
            }
            let Some(packet) = Packet::decode(&mut &buf[..len]) else {
                warn!(addr = %from, bytes = len, "Dropping datagram shorter than a packet header");
                continue;
            };

            let delay_ms = packet.sent_at.millis_until(Timestamp::now());
            let now = Instant::now();
            self.timeout.arm_for_delay(delay_ms, now);

            let class = process_ack(&self.state, &packet, delay_ms, now);
            trace!(
                seq = packet.seq,
                delay_ms,
                in_flight = self.state.in_flight(),
                window = self.state.window(),
                ?class,
                "ACK received"
            );
        }
        debug!("ACK receiver stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ControllerConfig, TimeoutConfig},
        control::timeout::TimerState,
        testing::{MockSocket, PEER_ADDR, SERVER_ADDR},
    };
    use bytes::BytesMut;
    use std::time::Duration;

    fn state() -> ControllerState {
        ControllerState::new(&ControllerConfig::default(), 3)
    }

    fn sent(state: &ControllerState, count: u64, window: i32) {
        for _ in 0..count {
            let seq = state.allocate_sequence();
            state.in_flight_table().insert(seq, window);
            state.add_in_flight();
        }
    }

    fn ack(seq: u64) -> Packet {
        Packet::new(seq, 10, 3)
    }

    #[tokio::test]
    async fn test_in_order_acks_release_in_flight() {
        let state = state();
        sent(&state, 3, 10);
        for seq in 1..=3 {
            assert_eq!(process_ack(&state, &ack(seq), 5.0, Instant::now()), AckClass::InOrder);
        }
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.last_in_order(), 3);
        assert!(state.in_flight_table().is_empty());
    }

    #[tokio::test]
    async fn test_gap_opens_records_for_skipped_sequences() {
        let state = state();
        sent(&state, 6, 10);
        process_ack(&state, &ack(1), 5.0, Instant::now());
        let class = process_ack(&state, &ack(5), 5.0, Instant::now());
        assert_eq!(class, AckClass::Gap { opened: 3 });
        assert_eq!(state.missing().sequences(), vec![2, 3, 4]);
        assert_eq!(state.last_in_order(), 5);
        // Every gap record still has its in-flight entry.
        for seq in state.missing().sequences() {
            assert!(state.in_flight_table().window_of(seq).is_some());
        }
    }

    #[tokio::test]
    async fn test_filling_one_gap_removes_exactly_that_record() {
        let state = state();
        sent(&state, 6, 10);
        process_ack(&state, &ack(1), 5.0, Instant::now());
        process_ack(&state, &ack(5), 5.0, Instant::now());

        let class = process_ack(&state, &ack(3), 5.0, Instant::now());
        assert_eq!(class, AckClass::Recovered);
        assert_eq!(state.missing().sequences(), vec![2, 4]);
        assert_eq!(state.last_in_order(), 5);
        assert!(state.in_flight_table().window_of(3).is_none());
    }

    #[tokio::test]
    async fn test_late_arrival_without_record_is_discarded() {
        let state = state();
        sent(&state, 3, 10);
        process_ack(&state, &ack(1), 5.0, Instant::now());
        process_ack(&state, &ack(2), 5.0, Instant::now());
        let in_flight = state.in_flight();

        assert_eq!(process_ack(&state, &ack(1), 5.0, Instant::now()), AckClass::Discarded);
        assert_eq!(state.in_flight(), in_flight);
        assert_eq!(state.summary().discarded, 1);
    }

    #[tokio::test]
    async fn test_other_session_does_not_move_baseline() {
        let state = state();
        sent(&state, 2, 10);
        let stale = Packet::new(1, 10, 99);
        assert_eq!(process_ack(&state, &stale, 5.0, Instant::now()), AckClass::InOrder);
        assert_eq!(state.last_in_order(), 0);
    }

    #[tokio::test]
    async fn test_loss_phase_ack_grows_window_by_inverse() {
        let state = state();
        sent(&state, 1, 10);
        state.set_window(4.0);
        state.enter_loss_phase();
        process_ack(&state, &ack(1), 5.0, Instant::now());
        assert!((state.window() - 4.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_receiver_loop_arms_timeout_and_ignores_strangers() {
        let state = Arc::new(state());
        sent(&state, 2, 10);
        let socket = Arc::new(MockSocket::new(SERVER_ADDR));
        let timeout = TimeoutHandle::new(TimeoutConfig::default());
        let receiver = AckReceiver::new(
            state.clone(),
            socket.clone(),
            PEER_ADDR,
            timeout.clone(),
            2048,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receiver.run(shutdown_rx));

        let mut buf = BytesMut::new();
        ack(1).encode(&mut buf);
        socket.inject(&buf, "127.0.0.1:1".parse().unwrap());
        socket.inject(&buf, PEER_ADDR);
        socket.inject(b"short", PEER_ADDR);

        for _ in 0..50 {
            if state.last_in_order() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(state.last_in_order(), 1);
        assert_eq!(state.summary().packets_acked, 1);
        assert!(matches!(timeout.state(), TimerState::Armed(_)));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
