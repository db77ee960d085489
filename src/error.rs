//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// The primary error type for the congestion controller.
/// 拥塞控制器的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred. Anything other than send-buffer
    /// exhaustion ends the flow.
    /// 发生了底层的I/O错误。除发送缓冲区耗尽外，均会终止该流。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value is out of range or inconsistent with another.
    /// 配置值超出范围或相互矛盾。
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The model table could not be read or parsed.
    /// 模型表无法读取或解析。
    #[error("model table line {line}: {reason}")]
    ModelTable {
        /// 1-based line number, 0 when the problem is not tied to a line.
        line: usize,
        reason: String,
    },

    /// The flow was started before any peer registered.
    /// 在任何对端注册之前启动了流。
    #[error("no peer has registered with the server")]
    NotConnected,

    /// A background loop ended abnormally.
    /// 后台循环异常结束。
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn model(line: usize, reason: impl Into<String>) -> Self {
        Error::ModelTable {
            line,
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskFailed(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => e,
            Error::InvalidConfig(reason) => std::io::Error::new(ErrorKind::InvalidInput, reason),
            e @ Error::ModelTable { .. } => std::io::Error::new(ErrorKind::InvalidData, e),
            Error::NotConnected => ErrorKind::NotConnected.into(),
            Error::TaskFailed(reason) => std::io::Error::other(reason),
        }
    }
}
