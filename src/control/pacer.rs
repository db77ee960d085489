//! 发送器：将发送预算转换为非阻塞发送。
//! Pacer: turns the send budget into non-blocking sends.
//!
//! A full OS send buffer is treated as congestion: the pacer backs the
//! window off and gives up the rest of its batch instead of waiting.

use super::state::ControllerState;
use crate::{
    config::Config,
    error::Result,
    packet::Packet,
    socket::{DatagramSocket, is_backpressure},
};
use bytes::BytesMut;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// How a batch ended.
///
/// 一批发送的结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every packet of the batch was accepted by the socket.
    Sent(u64),
    /// The socket refused `seq`; `sent` packets went out before it.
    Backpressure { sent: u64, seq: u64 },
}

/// 发送器
/// The pacer
pub struct Pacer<S: DatagramSocket> {
    state: Arc<ControllerState>,
    socket: Arc<S>,
    peer: SocketAddr,
    mtu: usize,
    multiplicative_decrease: f64,
    slow_start_exit_factor: f64,
    /// Reused for every packet.
    buf: BytesMut,
}

impl<S: DatagramSocket> Pacer<S> {
    pub fn new(state: Arc<ControllerState>, socket: Arc<S>, peer: SocketAddr, config: &Config) -> Self {
        let mtu = config.transport.mtu;
        Self {
            state,
            socket,
            peer,
            mtu,
            multiplicative_decrease: config.controller.multiplicative_decrease,
            slow_start_exit_factor: config.controller.slow_start_exit_factor,
            buf: BytesMut::with_capacity(mtu),
        }
    }

    /// Sends up to `count` packets, stopping at the first refused send.
    /// Only a non-backpressure socket error is returned as `Err`.
    ///
    /// 发送最多 `count` 个包，遇到第一次被拒绝的发送即停止。
    pub fn send_batch(&mut self, count: u64) -> Result<BatchOutcome> {
        for sent in 0..count {
            let seq = self.state.allocate_sequence();
            let window = self.state.window() as i32;
            let packet = Packet::new(seq, window, self.state.session_id());

            self.buf.clear();
            packet.encode_padded(&mut self.buf, self.mtu);

            // Recorded before the send: the echo may arrive before try_send_to returns.
            self.state.in_flight_table().insert(seq, window);
            self.state.add_in_flight();

            match self.socket.try_send_to(&self.buf, self.peer) {
                Ok(_) => {
                    self.state.stats().on_sent();
                    trace!(seq, window, "Packet sent");
                }
                Err(e) if is_backpressure(&e) => {
                    self.unrecord(seq);
                    self.on_backpressure(seq, window);
                    return Ok(BatchOutcome::Backpressure { sent, seq });
                }
                Err(e) => {
                    self.unrecord(seq);
                    return Err(e.into());
                }
            }
        }
        Ok(BatchOutcome::Sent(count))
    }

    /// Undoes the record of a packet the socket refused.
    fn unrecord(&self, seq: u64) {
        self.state.in_flight_table().resolve(seq);
        self.state.release_in_flight();
        self.state.rollback_sequence();
    }

    fn on_backpressure(&self, seq: u64, window: i32) {
        self.state.stats().on_backpressure();
        if self.state.exit_slow_start() {
            self.state.enter_loss_phase();
            let window = self
                .state
                .set_window(self.slow_start_exit_factor * f64::from(window));
            info!(seq, window, "Send buffer full, leaving slow start");
        } else {
            let window = self.state.decrease_window(self.multiplicative_decrease);
            debug!(seq, window, "Send buffer full, backing off");
        }
    }

    /// Waits for budget and sends it until the termination flag is raised.
    ///
    /// 等待预算并发送，直到终止标志被设置。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let budget = self.state.claim_budget();
            if budget == 0 {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = self.state.budget_ready().notified() => continue,
                }
            }
            self.send_batch(budget)?;
            tokio::task::yield_now().await;
        }
        debug!("Pacer stopped");
        Ok(())
    }
}
