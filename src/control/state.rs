//! 控制器共享状态
//! Shared controller state
//!
//! Every field that more than one loop touches lives here, either as an
//! atomic or behind a lock owned by a collection type. The window and delay
//! values are `f64`s stored as bit patterns so they can be updated with
//! compare-and-swap.

use super::{in_flight::InFlightTable, missing::MissingQueue};
use crate::{config::ControllerConfig, packet::END_OF_STREAM};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use tokio::{sync::Notify, time::Instant};

/// The smallest window the controller ever uses.
/// 控制器使用的最小窗口。
pub const MIN_WINDOW: f64 = 1.0;

/// An `f64` with atomic load, store and read-modify-write.
#[derive(Debug)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Applies `f` atomically and returns `(old, new)`.
    pub(crate) fn update(&self, f: impl Fn(f64) -> f64) -> (f64, f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let old = f64::from_bits(current);
            let new = f(old);
            match self.0.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (old, new),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Monotonic counters describing a flow.
///
/// 描述一条流的单调计数器。
#[derive(Debug, Default)]
pub struct FlowStats {
    sent: AtomicU64,
    acked: AtomicU64,
    lost: AtomicU64,
    backpressure: AtomicU64,
    timeouts: AtomicU64,
    discarded: AtomicU64,
}

impl FlowStats {
    pub(crate) fn on_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_backpressure(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a finished (or running) flow did.
///
/// 一条流（已结束或运行中）的统计摘要。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowSummary {
    /// Packets handed to the socket.
    pub packets_sent: u64,
    /// Packets acknowledged in order or recovered from the missing queue.
    pub packets_acked: u64,
    /// Packets declared lost by missing-sequence expiry.
    pub packets_lost: u64,
    /// Sends refused because the OS buffer was full.
    pub backpressure_events: u64,
    /// Full timeouts.
    pub timeouts: u64,
    /// Late arrivals that had already been declared lost.
    pub discarded: u64,
    /// The window estimate when the summary was taken.
    pub final_window: f64,
}

/// A point-in-time copy of the scalar state, for logging and assertions.
///
/// 标量状态的时间点副本，用于日志和断言。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub window: f64,
    pub in_flight: u64,
    pub send_budget: u64,
    pub min_delay: f64,
    pub latest_delay: f64,
    pub slow_start: bool,
    pub loss_phase: bool,
    pub last_in_order: u64,
    pub last_sent: u64,
    pub session_id: i32,
}

/// The state shared by the four control loops.
///
/// 四个控制循环共享的状态。
#[derive(Debug)]
pub struct ControllerState {
    window: AtomicF64,
    /// Baseline delay; only ever decreases.
    min_delay: AtomicF64,
    latest_delay: AtomicF64,
    in_flight: AtomicU64,
    send_budget: AtomicU64,
    budget_ready: Notify,
    slow_start: AtomicBool,
    loss_phase: AtomicBool,
    /// Highest sequence sent when the current loss phase began.
    loss_boundary: AtomicU64,
    /// Highest sequence acknowledged in order for the current session.
    last_in_order: AtomicU64,
    /// The sequence allocator; the last number handed out.
    last_sent: AtomicU64,
    session_id: AtomicI32,
    /// Largest send-time window seen on an ACK this epoch, outside loss phase.
    epoch_max_window: AtomicI32,
    epoch_delays: Mutex<Vec<f64>>,
    last_ack_at: Mutex<Instant>,
    in_flight_table: InFlightTable,
    missing: MissingQueue,
    stats: FlowStats,
}

impl ControllerState {
    /// Creates the state for a new flow: slow start on, no loss, window at
    /// its configured initial value.
    ///
    /// 为新流创建状态：处于慢启动、无丢包，窗口为配置的初始值。
    pub fn new(config: &ControllerConfig, session_id: i32) -> Self {
        Self {
            window: AtomicF64::new(config.initial_window.max(MIN_WINDOW)),
            min_delay: AtomicF64::new(f64::INFINITY),
            latest_delay: AtomicF64::new(0.0),
            in_flight: AtomicU64::new(0),
            send_budget: AtomicU64::new(0),
            budget_ready: Notify::new(),
            slow_start: AtomicBool::new(true),
            loss_phase: AtomicBool::new(false),
            loss_boundary: AtomicU64::new(0),
            last_in_order: AtomicU64::new(0),
            last_sent: AtomicU64::new(0),
            session_id: AtomicI32::new(session_id),
            epoch_max_window: AtomicI32::new(0),
            epoch_delays: Mutex::new(Vec::new()),
            last_ack_at: Mutex::new(Instant::now()),
            in_flight_table: InFlightTable::new(),
            missing: MissingQueue::new(),
            stats: FlowStats::default(),
        }
    }

    // ---- window -------------------------------------------------------

    pub fn window(&self) -> f64 {
        self.window.load()
    }

    /// Sets the window, never below [`MIN_WINDOW`].
    pub(crate) fn set_window(&self, value: f64) -> f64 {
        let value = value.max(MIN_WINDOW);
        self.window.store(value);
        value
    }

    /// `w ← max(1, factor · w)`
    pub(crate) fn decrease_window(&self, factor: f64) -> f64 {
        self.window.update(|w| (factor * w).max(MIN_WINDOW)).1
    }

    /// Scales from the window a lost packet was sent with, never raising the
    /// current window: `w ← max(1, min(w, factor · sent_window))`.
    pub(crate) fn decrease_window_for_loss(&self, sent_window: i32, factor: f64) -> f64 {
        self.window
            .update(|w| w.min(factor * f64::from(sent_window)).max(MIN_WINDOW))
            .1
    }

    // ---- phases -------------------------------------------------------

    pub fn is_slow_start(&self) -> bool {
        self.slow_start.load(Ordering::Acquire)
    }

    /// Leaves slow start. Returns whether this call made the transition.
    pub(crate) fn exit_slow_start(&self) -> bool {
        self.slow_start.swap(false, Ordering::AcqRel)
    }

    pub fn is_loss_phase(&self) -> bool {
        self.loss_phase.load(Ordering::Acquire)
    }

    /// Enters loss phase. Returns `true` only when a new loss phase starts,
    /// in which case the current send position becomes its boundary.
    ///
    /// 进入丢包阶段。只有开始新的丢包阶段时才返回 `true`。
    pub(crate) fn enter_loss_phase(&self) -> bool {
        let entered = !self.loss_phase.swap(true, Ordering::AcqRel);
        if entered {
            self.loss_boundary
                .store(self.last_sent.load(Ordering::Acquire), Ordering::Release);
        }
        entered
    }

    /// Ends the loss phase once a packet sent after it began has been
    /// acknowledged in order. Returns whether the phase ended.
    ///
    /// 当丢包阶段开始之后发送的包被按序确认时结束丢包阶段。
    pub(crate) fn try_exit_loss_phase(&self) -> bool {
        if !self.is_loss_phase() {
            return false;
        }
        let boundary = self.loss_boundary.load(Ordering::Acquire);
        if self.last_in_order.load(Ordering::Acquire) > boundary {
            self.loss_phase.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    // ---- in-flight counter ---------------------------------------------

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn add_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the counter, stopping at zero.
    pub(crate) fn release_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn reset_in_flight(&self) {
        self.in_flight.store(0, Ordering::Release);
    }

    // ---- send budget ---------------------------------------------------

    pub fn send_budget(&self) -> u64 {
        self.send_budget.load(Ordering::Acquire)
    }

    /// Adds to the budget and wakes the pacer. Unconsumed budget from earlier
    /// epochs is kept. Returns the budget that was pending before the call.
    ///
    /// 增加发送预算并唤醒发送器。之前未消耗的预算会被保留。
    pub(crate) fn add_budget(&self, packets: u64) -> u64 {
        if packets == 0 {
            return self.send_budget();
        }
        let pending = self.send_budget.fetch_add(packets, Ordering::AcqRel);
        self.budget_ready.notify_one();
        pending
    }

    /// Claims the whole pending budget.
    pub(crate) fn claim_budget(&self) -> u64 {
        self.send_budget.swap(0, Ordering::AcqRel)
    }

    pub(crate) fn budget_ready(&self) -> &Notify {
        &self.budget_ready
    }

    // ---- sequence numbers and session -------------------------------------

    /// Hands out the next sequence number.
    pub(crate) fn allocate_sequence(&self) -> u64 {
        self.last_sent.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns an allocated but unsent sequence number.
    pub(crate) fn rollback_sequence(&self) {
        let _ = self
            .last_sent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Acquire)
    }

    pub fn last_in_order(&self) -> u64 {
        self.last_in_order.load(Ordering::Acquire)
    }

    /// Moves the in-order baseline forward to `seq` if `session_id` is the
    /// current session. Returns whether it moved.
    ///
    /// 如果 `session_id` 是当前会话，则将按序基线推进到 `seq`。
    pub(crate) fn advance_in_order(&self, seq: u64, session_id: i32, now: Instant) -> bool {
        if session_id != self.session_id() {
            return false;
        }
        let moved = self
            .last_in_order
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                (seq > last).then_some(seq)
            })
            .is_ok();
        if moved {
            *self.last_ack_at.lock() = now;
        }
        moved
    }

    /// Raises the in-order baseline to `seq` regardless of session.
    pub(crate) fn raise_in_order_baseline(&self, seq: u64) {
        self.last_in_order.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::Acquire)
    }

    /// Marks every packet sent from now on as end-of-stream.
    ///
    /// 将此后发送的每个包标记为流结束。
    pub(crate) fn end_stream(&self) {
        self.session_id.store(END_OF_STREAM, Ordering::Release);
    }

    // ---- delay ---------------------------------------------------------

    pub fn min_delay(&self) -> f64 {
        self.min_delay.load()
    }

    pub fn latest_delay(&self) -> f64 {
        self.latest_delay.load()
    }

    /// Records one acknowledged packet: releases its in-flight slot, adds its
    /// delay to this epoch's samples, lowers the delay baseline if needed and
    /// either tracks the epoch's largest window or, during loss phase, grows
    /// the window by `1/w`.
    ///
    /// 记录一个已确认的包。
    pub(crate) fn record_ack(&self, delay_ms: f64, sent_window: i32) {
        self.release_in_flight();
        self.epoch_delays.lock().push(delay_ms);
        self.latest_delay.store(delay_ms);
        self.min_delay.update(|d| d.min(delay_ms));

        if self.is_loss_phase() {
            self.window.update(|w| w + 1.0 / w);
        } else {
            self.epoch_max_window.fetch_max(sent_window, Ordering::AcqRel);
        }
        self.stats.on_acked();
    }

    /// Resets the delay estimate to the baseline after total silence.
    pub(crate) fn reset_delay_to_baseline(&self) {
        let baseline = self.min_delay();
        if baseline.is_finite() {
            self.latest_delay.store(baseline);
        }
    }

    /// Drains the delay samples gathered since the last call.
    pub(crate) fn take_epoch_delays(&self) -> Vec<f64> {
        std::mem::take(&mut *self.epoch_delays.lock())
    }

    /// Drains the largest send-time window acknowledged since the last call.
    pub(crate) fn take_epoch_max_window(&self) -> i32 {
        self.epoch_max_window.swap(0, Ordering::AcqRel)
    }

    /// Milliseconds since the in-order baseline last moved.
    pub(crate) fn millis_since_last_ack(&self, now: Instant) -> f64 {
        let last = *self.last_ack_at.lock();
        now.saturating_duration_since(last).as_secs_f64() * 1000.0
    }

    pub(crate) fn restart_ack_clock(&self, now: Instant) {
        *self.last_ack_at.lock() = now;
    }

    // ---- collections and stats ------------------------------------------

    pub fn in_flight_table(&self) -> &InFlightTable {
        &self.in_flight_table
    }

    pub fn missing(&self) -> &MissingQueue {
        &self.missing
    }

    pub(crate) fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn summary(&self) -> FlowSummary {
        let s = &self.stats;
        FlowSummary {
            packets_sent: s.sent.load(Ordering::Relaxed),
            packets_acked: s.acked.load(Ordering::Relaxed),
            packets_lost: s.lost.load(Ordering::Relaxed),
            backpressure_events: s.backpressure.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            discarded: s.discarded.load(Ordering::Relaxed),
            final_window: self.window(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            window: self.window(),
            in_flight: self.in_flight(),
            send_budget: self.send_budget(),
            min_delay: self.min_delay(),
            latest_delay: self.latest_delay(),
            slow_start: self.is_slow_start(),
            loss_phase: self.is_loss_phase(),
            last_in_order: self.last_in_order(),
            last_sent: self.last_sent(),
            session_id: self.session_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ControllerState {
        ControllerState::new(&ControllerConfig::default(), 7)
    }

    #[test]
    fn test_atomic_f64_update_returns_old_and_new() {
        let value = AtomicF64::new(2.5);
        assert_eq!(value.update(|v| v * 2.0), (2.5, 5.0));
        assert_eq!(value.load(), 5.0);
    }

    #[tokio::test]
    async fn test_in_flight_never_goes_negative() {
        let state = state();
        state.release_in_flight();
        assert_eq!(state.in_flight(), 0);
        state.add_in_flight();
        state.release_in_flight();
        state.release_in_flight();
        assert_eq!(state.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_window_never_drops_below_one() {
        let state = state();
        state.set_window(3.0);
        assert_eq!(state.decrease_window(0.1), MIN_WINDOW);
        assert_eq!(state.decrease_window_for_loss(0, 0.7), MIN_WINDOW);
        assert_eq!(state.set_window(-4.0), MIN_WINDOW);
    }

    #[tokio::test]
    async fn test_loss_decrease_never_raises_window() {
        let state = state();
        state.set_window(5.0);
        assert_eq!(state.decrease_window_for_loss(100, 0.7), 5.0);
        assert!((state.decrease_window_for_loss(4, 0.7) - 2.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_min_delay_is_non_increasing() {
        let state = state();
        for delay in [30.0, 20.0, 25.0, 10.0, 40.0] {
            let before = state.min_delay();
            state.record_ack(delay, 1);
            assert!(state.min_delay() <= before);
        }
        assert_eq!(state.min_delay(), 10.0);
        assert_eq!(state.latest_delay(), 40.0);
    }

    #[tokio::test]
    async fn test_budget_accumulates_until_claimed() {
        let state = state();
        assert_eq!(state.add_budget(3), 0);
        assert_eq!(state.add_budget(2), 3);
        assert_eq!(state.claim_budget(), 5);
        assert_eq!(state.send_budget(), 0);
    }

    #[tokio::test]
    async fn test_loss_phase_ends_after_boundary_is_acknowledged() {
        let state = state();
        for _ in 0..5 {
            state.allocate_sequence();
        }
        assert!(state.enter_loss_phase());
        assert!(!state.enter_loss_phase());

        state.advance_in_order(5, 7, Instant::now());
        assert!(!state.try_exit_loss_phase());

        state.allocate_sequence();
        state.advance_in_order(6, 7, Instant::now());
        assert!(state.try_exit_loss_phase());
        assert!(!state.is_loss_phase());
    }

    #[tokio::test]
    async fn test_stale_session_does_not_advance_baseline() {
        let state = state();
        assert!(!state.advance_in_order(3, 8, Instant::now()));
        assert!(state.advance_in_order(3, 7, Instant::now()));
        assert!(!state.advance_in_order(2, 7, Instant::now()));
        assert_eq!(state.last_in_order(), 3);
    }

    #[tokio::test]
    async fn test_sequence_rollback() {
        let state = state();
        assert_eq!(state.allocate_sequence(), 1);
        assert_eq!(state.allocate_sequence(), 2);
        state.rollback_sequence();
        assert_eq!(state.last_sent(), 1);
        assert_eq!(state.allocate_sequence(), 2);
    }
}
