//! Missing-sequence expiry: turns old gaps into loss events.
//! 缺失序列号过期：将陈旧的缺口转换为丢包事件。
//!
//! This is the only place a specific packet is declared lost; the protocol
//! carries no negative acknowledgment.

use super::state::ControllerState;
use crate::config::ControllerConfig;
use tokio::time::Instant;
use tracing::debug;

/// What one expiry pass did.
///
/// 一次过期检查的结果。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExpiryReport {
    /// Records declared lost.
    pub lost: usize,
    /// The window after the decrease, when this pass started a loss phase.
    pub decreased_to: Option<f64>,
}

/// Declares every record older than the expiry threshold lost, oldest first.
/// The first expiry outside a loss phase starts one and scales the window
/// from the window the lost packet was sent with.
///
/// 将所有超过过期阈值的记录按从旧到新的顺序判定为丢失。
pub fn expire_missing(
    state: &ControllerState,
    now: Instant,
    config: &ControllerConfig,
) -> ExpiryReport {
    let mut report = ExpiryReport::default();

    while let Some((seq, entry)) = state.missing().pop_expired(now, config.missing_expiry) {
        if report.lost == 0 && state.enter_loss_phase() {
            let window =
                state.decrease_window_for_loss(entry.window, config.multiplicative_decrease);
            report.decreased_to = Some(window);
            debug!(
                seq,
                sent_window = entry.window,
                window,
                "Missing packet expired, entering loss phase"
            );
        }

        state.in_flight_table().resolve(seq);
        state.release_in_flight();
        state.stats().on_lost();
        report.lost += 1;
    }

    if report.lost > 0 {
        debug!(lost = report.lost, in_flight = state.in_flight(), "Expired missing packets");
    }
    report
}
