//! Resource providers for AgentStack.
//!
//! Provides provider implementations:
//! - Simulated (in-memory, deterministic identifiers)

pub mod simulated;

pub use agentstack_core::provider::{Materialized, Provider, attributes};
pub use simulated::{ProviderCalls, SimulatedProvider};
