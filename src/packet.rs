//! 定义数据包格式，服务器与对端共享。
//! Defines the fixed-size data packet shared by the server and the peer.

use bytes::{Buf, BufMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Encoded size of the packet header in bytes.
/// 包头编码后的字节数。
pub const HEADER_SIZE: usize = 32;

/// The session id carried by the last packets of a flow.
/// 流结束时携带的会话ID。
pub const END_OF_STREAM: i32 = -1;

/// A wall-clock send timestamp split the way it travels on the wire.
///
/// 以线上格式拆分的墙钟发送时间戳。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub micros: i64,
}

impl Timestamp {
    /// Reads the system clock.
    ///
    /// 读取系统时钟。
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from_duration)
            .unwrap_or_default()
    }

    /// Builds a timestamp from a duration since the Unix epoch.
    pub fn from_duration(since_epoch: Duration) -> Self {
        Self {
            seconds: since_epoch.as_secs() as i64,
            micros: i64::from(since_epoch.subsec_micros()),
        }
    }

    /// Milliseconds elapsed from `self` to `later`, floored at zero.
    ///
    /// 从 `self` 到 `later` 经过的毫秒数，下限为零。
    pub fn millis_until(&self, later: Timestamp) -> f64 {
        let ms = (later.seconds - self.seconds) as f64 * 1000.0
            + (later.micros - self.micros) as f64 / 1000.0;
        ms.max(0.0)
    }
}

/// A data packet. The server stamps it at send time and the peer echoes the
/// header back unchanged, so the same value doubles as the acknowledgment.
///
/// 数据包。服务器在发送时打上时间戳，对端原样回显包头，
/// 因此同一个值也充当确认。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Monotonic sequence number, starting at 1.
    /// 单调递增的序列号，从 1 开始。
    pub seq: u64,
    /// The sender's window estimate when this packet was sent.
    /// 发送此包时发送方的窗口估计。
    pub window: i32,
    /// The current flow instance. Negative marks the end of the stream.
    /// 当前流实例。负值表示流结束。
    pub session_id: i32,
    /// When the packet left the sender.
    /// 包离开发送方的时间。
    pub sent_at: Timestamp,
}

impl Packet {
    /// Creates a packet stamped with the current wall-clock time.
    pub fn new(seq: u64, window: i32, session_id: i32) -> Self {
        Self {
            seq,
            window,
            session_id,
            sent_at: Timestamp::now(),
        }
    }

    /// Whether this packet announces the end of the stream.
    ///
    /// 此包是否宣告流结束。
    pub fn is_end_of_stream(&self) -> bool {
        self.session_id < 0
    }

    /// 将包头编码到缓冲区。
    /// Encodes the header into a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.seq);
        buf.put_i32(self.window);
        buf.put_i32(self.session_id);
        buf.put_i64(self.sent_at.seconds);
        buf.put_i64(self.sent_at.micros);
    }

    /// Encodes the header followed by zero padding up to `mtu` bytes.
    /// Nothing is padded when `mtu` does not exceed the header size.
    ///
    /// 编码包头，并用零填充到 `mtu` 字节。
    pub fn encode_padded<B: BufMut>(&self, buf: &mut B, mtu: usize) {
        self.encode(buf);
        buf.put_bytes(0, mtu.saturating_sub(HEADER_SIZE));
    }

    /// 从缓冲区解码包头。多余的填充字节保留在缓冲区中。
    /// Decodes a header from a buffer. Trailing padding is left unread.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }
        Some(Packet {
            seq: buf.get_u64(),
            window: buf.get_i32(),
            session_id: buf.get_i32(),
            sent_at: Timestamp {
                seconds: buf.get_i64(),
                micros: buf.get_i64(),
            },
        })
    }
}
