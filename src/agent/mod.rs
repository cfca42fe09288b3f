//! Monitoring agents: persisted state, the polling scheduler, and the hub
//! that runs one agent per (user, site).

pub mod hub;
pub mod scheduler;
pub mod state;

pub use hub::AgentHub;
pub use scheduler::{Agent, AgentDeps, AgentSettings, AgentSnapshot, CheckReport};
pub use state::{AgentState, HotState, MonitorMode, TickSummary};
