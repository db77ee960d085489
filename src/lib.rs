#![deny(clippy::expect_used, clippy::unwrap_used)]

//! A model-assisted congestion controller for a single unreliable datagram flow.
//! 面向单条不可靠数据报流的模型辅助拥塞控制器。
//!
//! The server side paces outbound packets against a target in-flight window
//! estimated every epoch from delay feedback and an offline-learned transition
//! table, and infers loss from sequence gaps and silence.

pub mod config;
pub mod control;
pub mod error;
pub mod model;
pub mod packet;
pub mod peer;
pub mod server;
pub mod socket;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use model::ModelTable;
pub use peer::{EchoPeer, PeerReport};
pub use server::{FlowSummary, Server};
