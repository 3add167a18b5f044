//! amun_hub
//! Message hub for a robot-soccer autoref: vision and referee intake, a logical
//! clock, Command/Status fan-out between processor and strategy, tracked-frame
//! publishing and a built-in vision simulator.

pub mod core;
pub mod hub;
pub mod net;
pub mod utils;

pub use crate::core::{
    clock::LogicalClock,
    config::HubConfig,
    error::{HubError, Result},
    protocol::{CommandMsg, Interest, StatusMsg, StreamKind},
};
pub use crate::hub::{orchestrator::Orchestrator, worker::Origin};
