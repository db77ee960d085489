//! The concurrent control pipeline.
//! 并发控制流水线。
//!
//! Four loops share one [`ControllerState`]:
//!
//! - the [`engine`] recomputes the window every epoch and hands out a send budget,
//! - the [`receiver`] consumes echoed packets, measures delay and records gaps,
//! - the [`timeout`] supervisor reacts to total silence,
//! - the [`pacer`] turns the budget into non-blocking sends.
//!
//! Gap expiry ([`loss`]) runs once per epoch from inside the engine.

pub mod engine;
pub mod in_flight;
pub mod loss;
pub mod missing;
pub mod pacer;
pub mod receiver;
pub mod state;
pub mod timeout;

pub use engine::{Decision, DecisionEngine, EpochReport};
pub use in_flight::InFlightTable;
pub use loss::ExpiryReport;
pub use missing::{MissingEntry, MissingQueue};
pub use pacer::{BatchOutcome, Pacer};
pub use receiver::{AckClass, AckReceiver};
pub use state::{ControllerState, FlowStats, StateSnapshot};
pub use timeout::{SilenceAction, TimeoutHandle, TimeoutSupervisor, TimerState};
