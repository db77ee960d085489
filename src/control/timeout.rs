//! 静默超时监督器
//! Silence-timeout supervisor
//!
//! A single resettable deadline. The receiver pushes a new deadline on every
//! decoded packet; when the deadline passes with no packet the supervisor
//! reacts according to how far the flow has progressed.

use super::state::ControllerState;
use crate::config::TimeoutConfig;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

/// The supervisor's deadline.
///
/// 监督器的截止时间。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed(Instant),
}

/// `clamp(multiplier · delay, min, max)`
///
/// 根据最近一次时延计算超时时长。
pub fn timeout_for(delay_ms: f64, config: &TimeoutConfig) -> Duration {
    let scaled = Duration::try_from_secs_f64(delay_ms * config.delay_multiplier / 1000.0)
        .unwrap_or(config.max);
    scaled.max(config.min).min(config.max)
}

/// A cloneable handle that moves the deadline.
///
/// 可克隆的句柄，用于移动截止时间。
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    tx: Arc<watch::Sender<TimerState>>,
    config: Arc<TimeoutConfig>,
}

impl TimeoutHandle {
    pub fn new(config: TimeoutConfig) -> Self {
        let (tx, _) = watch::channel(TimerState::Idle);
        Self {
            tx: Arc::new(tx),
            config: Arc::new(config),
        }
    }

    /// Sets an absolute deadline, replacing any previous one.
    pub fn arm_at(&self, deadline: Instant) {
        self.tx.send_replace(TimerState::Armed(deadline));
    }

    /// Sets the deadline from the most recent delay sample.
    ///
    /// 根据最近的时延样本设置截止时间。
    pub fn arm_for_delay(&self, delay_ms: f64, now: Instant) {
        self.arm_at(now + timeout_for(delay_ms, &self.config));
    }

    pub fn disarm(&self) {
        self.tx.send_replace(TimerState::Idle);
    }

    pub fn state(&self) -> TimerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerState> {
        self.tx.subscribe()
    }
}

/// What a silence timeout did.
///
/// 一次静默超时所采取的动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceAction {
    /// Nothing has been acknowledged yet; the flow keeps waiting.
    /// 尚未收到任何确认，继续等待。
    NothingAcknowledged,
    /// The first silence after data ends slow start and nothing else.
    /// 有数据后的第一次静默只结束慢启动。
    SlowStartExited,
    /// Every outstanding packet was written off.
    /// 所有未决的包都被注销。
    FullTimeout {
        /// The highest sequence that was in flight, now the in-order baseline.
        baseline: Option<u64>,
        cleared_missing: usize,
    },
}

/// Applies one silence timeout to the shared state.
///
/// 将一次静默超时应用到共享状态。
pub fn on_silence(state: &ControllerState) -> SilenceAction {
    if state.last_in_order() == 0 {
        return SilenceAction::NothingAcknowledged;
    }
    if state.exit_slow_start() {
        return SilenceAction::SlowStartExited;
    }

    state.enter_loss_phase();
    state.reset_in_flight();
    state.reset_delay_to_baseline();
    let baseline = state.in_flight_table().clear_returning_highest();
    if let Some(seq) = baseline {
        state.raise_in_order_baseline(seq);
    }
    let cleared_missing = state.missing().len();
    state.missing().clear();
    state.stats().on_timeout();

    SilenceAction::FullTimeout {
        baseline,
        cleared_missing,
    }
}

/// Waits on the deadline and fires [`on_silence`] when it passes.
///
/// 等待截止时间，到期时触发 [`on_silence`]。
pub struct TimeoutSupervisor {
    state: Arc<ControllerState>,
    handle: TimeoutHandle,
    timer: watch::Receiver<TimerState>,
}

impl TimeoutSupervisor {
    pub fn new(state: Arc<ControllerState>, handle: TimeoutHandle) -> Self {
        let timer = handle.subscribe();
        Self {
            state,
            handle,
            timer,
        }
    }

    /// Runs until `stop` is raised or its sender is dropped. Each expiry
    /// fires at most once and then re-arms from the latest delay.
    ///
    /// 运行直到 `stop` 被设置或其发送端被丢弃。
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            let current = *self.timer.borrow_and_update();
            match current {
                TimerState::Idle => {
                    tokio::select! {
                        biased;
                        _ = stop.wait_for(|stop| *stop) => break,
                        changed = self.timer.changed() => if changed.is_err() { break },
                    }
                }
                TimerState::Armed(deadline) => {
                    tokio::select! {
                        biased;
                        _ = stop.wait_for(|stop| *stop) => break,
                        changed = self.timer.changed() => if changed.is_err() { break },
                        _ = sleep_until(deadline) => self.fire(),
                    }
                }
            }
        }
        self.handle.disarm();
        debug!("Timeout supervisor stopped");
    }

    fn fire(&self) {
        let last_delay = self.state.latest_delay();
        let action = on_silence(&self.state);
        match action {
            SilenceAction::NothingAcknowledged => {
                debug!("Silence before the first acknowledgment")
            }
            SilenceAction::SlowStartExited => {
                info!(window = self.state.window(), "Silence ended slow start")
            }
            SilenceAction::FullTimeout {
                baseline,
                cleared_missing,
            } => warn!(
                ?baseline,
                cleared_missing,
                window = self.state.window(),
                "Timeout: no acknowledgment received, resetting outstanding packets"
            ),
        }
        self.handle.arm_for_delay(last_delay, Instant::now());
    }
}
