//! Traits for abstracting over datagram socket implementations.
//! 用于抽象数据报套接字实现的 trait。

use crate::error::Result;
use async_trait::async_trait;
use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

/// A datagram socket with an awaiting receive and a non-blocking send.
///
/// The receive side is the only place the control pipeline blocks; the send
/// side must report a full OS buffer immediately instead of waiting for room,
/// because buffer exhaustion is a congestion signal.
///
/// 一个接收可等待、发送不阻塞的数据报套接字。
///
/// 接收端是控制流水线中唯一阻塞的地方；发送端必须立即报告操作系统缓冲区已满，
/// 而不是等待空间，因为缓冲区耗尽本身就是拥塞信号。
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Receives a single datagram on the socket.
    /// 在套接字上接收单个数据报。
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Attempts to send without waiting. The raw `io::Error` is returned so
    /// the caller can tell backpressure from fatal failures.
    ///
    /// 尝试不等待地发送。返回原始的 `io::Error`，以便调用者区分背压与致命错误。
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Sends data, waiting for buffer space if needed.
    /// 发送数据，必要时等待缓冲区空间。
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;

    /// Returns the local address that this socket is bound to.
    /// 返回此套接字绑定的本地地址。
    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await.map_err(Into::into)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, target)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        UdpSocket::send_to(self, buf, target).await.map_err(Into::into)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        UdpSocket::local_addr(self).map_err(Into::into)
    }
}

/// Whether a send failure means the OS send buffer is exhausted.
///
/// 发送失败是否意味着操作系统发送缓冲区已耗尽。
pub fn is_backpressure(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || matches!(err.raw_os_error(), Some(code) if code == libc::ENOBUFS || code == libc::EAGAIN)
}
