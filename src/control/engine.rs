//! 决策引擎
//! Decision engine
//!
//! Once per epoch the engine expires old gaps, condenses the epoch's delay
//! samples into one signal, derives three trend values from the signal and
//! window histories, picks the next window and hands the pacer a budget.

use super::{
    loss::{self, ExpiryReport},
    state::ControllerState,
};
use crate::{
    config::ControllerConfig,
    model::{ModelTable, TrendBuckets},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tracing::debug;

/// Relative change of `current` against `previous`, scaled by the magnitude
/// of `previous`: `((current / previous) · 100 − 100) · log10(previous)`.
///
/// Returns `0.0` when `previous` is not positive or the result is not finite.
///
/// 相对变化量，按 `previous` 的数量级缩放。
pub fn trend(current: f64, previous: f64) -> f64 {
    if !(previous > 0.0) {
        return 0.0;
    }
    let value = ((current / previous) * 100.0 - 100.0) * previous.log10();
    if value.is_finite() { value } else { 0.0 }
}

/// Packets the pacer may send this epoch.
///
/// With `n = ceil(latest_delay / epoch)`, packets already in flight are
/// discounted by `(n − 2) / (n − 1)` because most of them will be
/// acknowledged before this epoch's packets arrive. When `n ≤ 1` the whole
/// in-flight count is subtracted.
///
/// 本轮发送器可以发送的包数。
pub fn send_budget(window: f64, in_flight: u64, latest_delay_ms: f64, epoch: Duration) -> u64 {
    let epoch_ms = epoch.as_secs_f64() * 1000.0;
    let n = (latest_delay_ms / epoch_ms).ceil();
    let in_flight = in_flight as f64;
    let budget = if n > 1.0 {
        window - in_flight * (n - 2.0) / (n - 1.0)
    } else {
        window - in_flight
    };
    if budget.is_finite() && budget > 0.0 {
        budget.floor() as u64
    } else {
        0
    }
}

/// Which rule produced the epoch's window.
///
/// 本轮窗口由哪条规则产生。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The delay trend exceeded the table's upper bound.
    Decrease,
    /// The delay trend fell below the table's lower bound.
    Increase,
    /// The table chose the window.
    Model { buckets: TrendBuckets },
}

/// The outcome of one epoch.
///
/// 一轮决策的结果。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    /// Acknowledgments received during the epoch.
    pub acked: usize,
    /// The epoch's delay signal in milliseconds.
    pub delay_signal: f64,
    pub delay_accel: f64,
    pub window_accel: f64,
    pub delay_trend: f64,
    pub decision: Decision,
    /// The window after the decision.
    pub window: f64,
    /// Packets granted to the pacer this epoch.
    pub budget: u64,
    /// Budget still unclaimed from earlier epochs.
    pub carried_budget: u64,
    pub expiry: ExpiryReport,
}

/// The per-epoch decision loop. It owns the trend history; everything it
/// shares with the other loops lives in [`ControllerState`].
///
/// 每轮的决策循环。它独占趋势历史，其余共享数据位于 [`ControllerState`]。
pub struct DecisionEngine {
    state: Arc<ControllerState>,
    model: Arc<ModelTable>,
    config: ControllerConfig,
    rng: StdRng,
    delay_last: f64,
    delay_last_last: f64,
    window_last: f64,
    window_last_last: f64,
}

impl DecisionEngine {
    pub fn new(state: Arc<ControllerState>, model: Arc<ModelTable>, config: ControllerConfig) -> Self {
        Self {
            state,
            model,
            rng: StdRng::from_os_rng(),
            delay_last: config.initial_delay_history_ms,
            delay_last_last: config.initial_delay_history_ms,
            window_last: config.initial_window_history,
            window_last_last: config.initial_window_history,
            config,
        }
    }

    /// Replaces the random source, e.g. with a seeded one for reproducible runs.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Chooses the next window from the three trend values. Only the model
    /// branch consumes a random draw.
    ///
    /// 根据三个趋势值选择下一个窗口。只有模型分支会消耗随机数。
    pub fn decide(
        &mut self,
        delay_accel: f64,
        window_accel: f64,
        delay_trend: f64,
        window: f64,
    ) -> (Decision, f64) {
        if delay_trend > self.model.max_delay() {
            (Decision::Decrease, window * self.config.override_decrease)
        } else if delay_trend < self.model.min_delay() {
            (Decision::Increase, window + self.config.override_increase)
        } else {
            let buckets = self.model.bucketize(delay_accel, window_accel, delay_trend);
            let draw: f64 = self.rng.random();
            let next = self.model.next_window(buckets, self.window_last, draw);
            (Decision::Model { buckets }, next)
        }
    }

    /// Runs one epoch.
    ///
    /// 执行一轮决策。
    pub fn step(&mut self, now: Instant) -> EpochReport {
        let expiry = loss::expire_missing(&self.state, now, &self.config);

        let delays = self.state.take_epoch_delays();
        let acked = delays.len();
        // Without samples the silence itself is the signal, never smaller
        // than the previous epoch's.
        let delay_signal = if acked > 0 {
            delays.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        } else {
            self.state.millis_since_last_ack(now).max(self.delay_last)
        };

        let delay_accel = trend(self.delay_last, self.delay_last_last);
        let window_accel = trend(self.window_last, self.window_last_last);
        let delay_trend = trend(delay_signal, self.delay_last);

        let (decision, candidate) =
            self.decide(delay_accel, window_accel, delay_trend, self.state.window());
        let window = self.state.set_window(candidate);

        let budget = send_budget(
            window,
            self.state.in_flight(),
            self.state.latest_delay(),
            self.config.epoch,
        );
        let carried_budget = self.state.add_budget(budget);
        if carried_budget > 0 && !self.state.is_slow_start() {
            debug!(carried_budget, budget, "Pacer fell behind: budget carried into the next epoch");
        }

        if acked > 0 {
            self.delay_last_last = self.delay_last;
            self.delay_last = delay_signal;
            if self.state.try_exit_loss_phase() {
                debug!(window, "Loss phase ended");
            }
        }
        self.window_last_last = self.window_last;
        self.window_last = window;
        let max_acked_window = self.state.take_epoch_max_window();

        debug!(
            acked,
            delay_signal,
            delay_accel,
            window_accel,
            delay_trend,
            ?decision,
            window,
            budget,
            max_acked_window,
            in_flight = self.state.in_flight(),
            "Epoch decided"
        );

        EpochReport {
            acked,
            delay_signal,
            delay_accel,
            window_accel,
            delay_trend,
            decision,
            window,
            budget,
            carried_budget,
            expiry,
        }
    }

    /// Steps once per epoch until `run_for` elapses or `shutdown` is raised.
    /// Returns the number of epochs run.
    ///
    /// 每轮执行一次，直到 `run_for` 结束或 `shutdown` 被设置。返回执行的轮数。
    pub async fn run(mut self, run_for: Duration, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = interval(self.config.epoch);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep(run_for);
        tokio::pin!(deadline);

        let mut epochs = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => break,
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    self.step(Instant::now());
                    epochs += 1;
                }
            }
        }
        debug!(epochs, "Decision engine stopped");
        epochs
    }
}
