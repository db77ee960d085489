//! 缺失序列号队列
//! Missing-Sequence Queue
//!
//! Provisional record of sequence gaps that are not yet classified as lost.
//! Gaps are only ever opened above the current in-order baseline, which only
//! moves forward, so ascending sequence order is also insertion order and the
//! first entry is always the oldest.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// A sequence that was skipped by a later arrival.
///
/// 被后续到达的包跳过的序列号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingEntry {
    /// The window the packet was sent with.
    /// 该包发送时的窗口。
    pub window: i32,
    /// When the gap was observed.
    /// 观察到缺口的时间。
    pub since: Instant,
}

/// 缺失序列号队列
/// Missing-sequence queue
#[derive(Debug, Default)]
pub struct MissingQueue {
    entries: Mutex<BTreeMap<u64, MissingEntry>>,
}

impl MissingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a record for every `(seq, window)` pair, all stamped `now`.
    ///
    /// 为每个 `(seq, window)` 对创建记录，时间戳均为 `now`。
    pub fn record_gaps(&self, gaps: &[(u64, i32)], now: Instant) {
        if gaps.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for &(seq, window) in gaps {
            entries.insert(seq, MissingEntry { window, since: now });
        }
        trace!(opened = gaps.len(), pending = entries.len(), "Recorded sequence gaps");
    }

    /// Removes a record because its packet finally arrived.
    ///
    /// 因数据包最终到达而移除记录。
    pub fn remove(&self, seq: u64) -> Option<MissingEntry> {
        self.entries.lock().remove(&seq)
    }

    /// Pops the oldest record if it has been missing for at least `expiry`.
    ///
    /// 如果最旧的记录缺失时间不少于 `expiry`，则弹出它。
    pub fn pop_expired(&self, now: Instant, expiry: Duration) -> Option<(u64, MissingEntry)> {
        let mut entries = self.entries.lock();
        let (_, oldest) = entries.first_key_value()?;
        if now.saturating_duration_since(oldest.since) >= expiry {
            entries.pop_first()
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Pending sequence numbers in queue order.
    pub fn sequences(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
