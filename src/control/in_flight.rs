//! 在途数据包表
//! In-Flight Table
//!
//! Maps every sent, unresolved sequence number to the window estimate it was
//! sent with. All access goes through one lock and every method is a complete
//! operation, so callers never hold the lock across multi-step logic.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// 在途数据包表
/// In-flight table
#[derive(Debug, Default)]
pub struct InFlightTable {
    packets: Mutex<BTreeMap<u64, i32>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录已发送的数据包
    /// Records a sent packet.
    pub fn insert(&self, seq: u64, window: i32) {
        self.packets.lock().insert(seq, window);
    }

    /// 移除并返回发送时的窗口
    /// Removes a resolved packet, returning its window at send time.
    pub fn resolve(&self, seq: u64) -> Option<i32> {
        self.packets.lock().remove(&seq)
    }

    /// 查询发送时的窗口
    /// The window recorded for a sequence, if still in flight.
    pub fn window_of(&self, seq: u64) -> Option<i32> {
        self.packets.lock().get(&seq).copied()
    }

    /// 批量查询一段序列号的窗口
    /// Windows for every sequence in `[from, to)` that is still in flight.
    pub fn windows_in(&self, from: u64, to: u64) -> Vec<(u64, i32)> {
        if from >= to {
            return Vec::new();
        }
        self.packets
            .lock()
            .range(from..to)
            .map(|(&seq, &window)| (seq, window))
            .collect()
    }

    /// 清空表并返回最大的序列号
    /// Empties the table, returning the highest sequence it held.
    pub fn clear_returning_highest(&self) -> Option<u64> {
        let mut packets = self.packets.lock();
        let highest = packets.last_key_value().map(|(&seq, _)| seq);
        debug!(packet_count = packets.len(), "Clearing in-flight table");
        packets.clear();
        highest
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}
