//! 定义了控制器、超时、传输和对端的可配置参数。
//! Defines configurable parameters for the controller, timeouts, transport and peer.

use crate::{
    error::{Error, Result},
    packet::HEADER_SIZE,
};
use std::time::Duration;

/// A structure containing all configurable parameters for a flow.
///
/// 包含一条流所有可配置参数的结构体。
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Decision-engine and loss-reaction parameters.
    /// 决策引擎与丢包响应参数。
    pub controller: ControllerConfig,

    /// Silence-detection parameters.
    /// 静默检测参数。
    pub timeout: TimeoutConfig,

    /// Socket and packet sizing parameters.
    /// 套接字与包大小参数。
    pub transport: TransportConfig,

    /// Parameters of the echo responder.
    /// 回显对端参数。
    pub peer: PeerConfig,
}

/// Decision-engine and loss-reaction parameters.
///
/// 决策引擎与丢包响应参数。
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The fixed wall-clock interval between two decisions.
    /// 两次决策之间固定的时间间隔。
    pub epoch: Duration,
    /// The window estimate a new flow starts with.
    /// 新流的初始窗口估计。
    pub initial_window: f64,
    /// The value both window history registers start with.
    /// 两个窗口历史寄存器的初始值。
    pub initial_window_history: f64,
    /// The value both delay history registers start with, in milliseconds.
    /// 两个延迟历史寄存器的初始值（毫秒）。
    pub initial_delay_history_ms: f64,
    /// Factor applied on expiry-based loss and steady-state backpressure.
    /// 基于过期的丢包以及稳态背压时使用的乘性减小因子。
    pub multiplicative_decrease: f64,
    /// Factor applied to the failed packet's window when backpressure ends slow start.
    /// 背压结束慢启动时作用于失败包窗口的因子。
    pub slow_start_exit_factor: f64,
    /// Ratio applied when the delay trend exceeds the table's maximum.
    /// 延迟趋势超过模型表上限时的窗口缩减比例。
    pub override_decrease: f64,
    /// Packets added when the delay trend is below the table's minimum.
    /// 延迟趋势低于模型表下限时增加的包数。
    pub override_increase: f64,
    /// Age after which a missing sequence is declared lost.
    /// 缺失序列号被判定为丢失的时长。
    pub missing_expiry: Duration,
}

/// Silence-detection parameters.
///
/// 静默检测参数。
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// The deadline armed before any delay sample exists.
    /// 在没有任何延迟样本之前设置的截止时间。
    pub initial: Duration,
    /// Lower clamp of the adaptive deadline.
    /// 自适应截止时间的下限。
    pub min: Duration,
    /// Upper clamp of the adaptive deadline.
    /// 自适应截止时间的上限。
    pub max: Duration,
    /// Multiple of the latest delay sample used as the deadline.
    /// 截止时间取最新延迟样本的倍数。
    pub delay_multiplier: f64,
}

/// Socket and packet sizing parameters.
///
/// 套接字与包大小参数。
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Every data packet is padded to this many bytes.
    /// 每个数据包填充到的字节数。
    pub mtu: usize,
    /// Size of the receive buffer used by the ACK receiver.
    /// ACK 接收器使用的接收缓冲区大小。
    pub recv_buffer_size: usize,
    /// Time between publishing the end-of-stream session id and stopping the loops.
    /// 发布流结束会话ID与停止各循环之间的时间。
    pub shutdown_grace: Duration,
}

/// Parameters of the echo responder.
///
/// 回显对端参数。
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Artificial queueing delay added before each echo.
    /// 每次回显前附加的人为排队延迟。
    pub extra_delay: Duration,
    /// Interval at which the hello datagram is repeated until data arrives.
    /// 在数据到达前重复发送 hello 数据报的间隔。
    pub hello_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            epoch: Duration::from_millis(5),
            initial_window: 1.0,
            initial_window_history: 10.0,
            initial_delay_history_ms: 20.0,
            multiplicative_decrease: 0.7,
            slow_start_exit_factor: 0.49,
            override_decrease: 0.975,
            override_increase: 21.0,
            missing_expiry: Duration::from_millis(150),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            min: Duration::from_millis(200),
            max: Duration::from_millis(1000),
            delay_multiplier: 5.0,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            recv_buffer_size: 2048,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            extra_delay: Duration::ZERO,
            hello_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Checks the values that would otherwise break the control loops.
    ///
    /// 检查那些会破坏控制循环的配置值。
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.epoch.is_zero() {
            return Err(Error::InvalidConfig("epoch must be non-zero".into()));
        }
        if !(c.initial_window >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "initial window {} is below 1.0",
                c.initial_window
            )));
        }
        for (name, factor) in [
            ("multiplicative_decrease", c.multiplicative_decrease),
            ("slow_start_exit_factor", c.slow_start_exit_factor),
            ("override_decrease", c.override_decrease),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must lie in (0, 1], got {factor}"
                )));
            }
        }
        if self.timeout.min > self.timeout.max {
            return Err(Error::InvalidConfig(format!(
                "minimum timeout {:?} exceeds maximum {:?}",
                self.timeout.min, self.timeout.max
            )));
        }
        if self.transport.mtu < HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "transmission unit {} is smaller than the {HEADER_SIZE}-byte header",
                self.transport.mtu
            )));
        }
        if self.transport.recv_buffer_size < HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "receive buffer {} cannot hold a packet header",
                self.transport.recv_buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_mtu_smaller_than_header_is_rejected() {
        let mut config = Config::default();
        config.transport.mtu = HEADER_SIZE - 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_inverted_timeout_bounds_are_rejected() {
        let mut config = Config::default();
        config.timeout.min = Duration::from_secs(2);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_epoch_is_rejected() {
        let mut config = Config::default();
        config.controller.epoch = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
