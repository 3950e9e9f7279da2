//! Krill Agents - Swarm Runtime
//!
//! The orchestration layer: [`Commander`] owns a bounded population of
//! [`Agent`] workers, routes direct and broadcast messages between them, and
//! attaches each one to a permanent credential from the [`AccountPool`].
//! Context composition, storage, providers, and the event bus come from the
//! sibling crates; this crate wires them into running agents.

mod accounts;
mod agent;
mod commander;

pub use accounts::AccountPool;
pub use agent::{Agent, AgentRuntime, AgentSnapshot};
pub use commander::Commander;
