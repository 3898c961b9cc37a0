//! Flow Service - host-agnostic application layer for agent flows
//!
//! Wraps the synchronous `flow-engine` core with:
//!
//! - Async repository traits for flows, resources and system variables
//! - A service-owned traversal cache
//! - A turn driver with a step ceiling and cooperative cancellation
//! - JSON-file configuration

pub mod config;
pub mod error;
pub mod repository;
pub mod service;
pub mod turn;

pub use config::ServiceConfig;
pub use error::{FlowServiceError, Result};
pub use repository::{
    FlowRepository, InMemoryResourceRepository, LocalFlowRepository, ResourceRepository,
    StaticSystemVariables, SystemVariableProvider,
};
pub use service::FlowService;
pub use turn::{run_turn, AgentOutput, AgentRunner, CancelSignal, TurnInput, TurnOutcome};
