//! 测试辅助工具模块
//! Test utilities module

#![cfg(test)]

use crate::{
    error::Result,
    model::{Axis, ModelTable},
    socket::DatagramSocket,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

pub const PEER_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345);
pub const SERVER_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 54321);

/// An in-memory socket. Inbound datagrams are injected by the test; sends
/// are recorded and can be scripted to fail.
pub struct MockSocket {
    local: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    /// Successful sends left before the scripted error is returned.
    failure: Mutex<Option<(usize, io::Error)>>,
    /// Called with every datagram that goes out, before `try_send_to` returns.
    observer: Mutex<Option<SendObserver>>,
}

type SendObserver = Box<dyn Fn(&[u8]) + Send + Sync>;

impl MockSocket {
    pub fn new(local: SocketAddr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            local,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    pub fn inject(&self, bytes: &[u8], from: SocketAddr) {
        let _ = self.inbound_tx.send((bytes.to_vec(), from));
    }

    /// Lets `successes` sends through, then fails the next one with `err`.
    pub fn fail_send_after(&self, successes: usize, err: io::Error) {
        *self.failure.lock() = Some((successes, err));
    }

    /// Runs `observer` on each successful send, as if the datagram were
    /// delivered while the sender is still inside the call.
    pub fn on_send(&self, observer: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Box::new(observer));
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DatagramSocket for MockSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe).into()),
        }
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut failure = self.failure.lock();
        match failure.take() {
            Some((0, err)) => return Err(err),
            Some((left, err)) => *failure = Some((left - 1, err)),
            None => {}
        }
        drop(failure);
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(buf);
        }
        self.sent.lock().push((buf.to_vec(), target));
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.try_send_to(buf, target).map_err(Into::into)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }
}

/// A one-bucket table whose delay-trend bounds are `[min, max]`. Its model
/// branch always keeps the previous window.
pub fn holding_model(min_delay: i64, max_delay: i64) -> ModelTable {
    let window = Axis {
        buckets: 1,
        min: 0,
        max: 0,
        step: 1,
    };
    let delay = Axis {
        buckets: 1,
        min: min_delay,
        max: max_delay,
        step: (max_delay - min_delay).max(1),
    };
    ModelTable::new(window, delay, vec![vec![1.0]]).unwrap()
}
