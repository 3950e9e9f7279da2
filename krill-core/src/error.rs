//! Error types for Krill operations

use crate::EntityId;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Agent log not found: {agent_id}")]
    AgentLogNotFound { agent_id: EntityId },

    #[error("Insert failed: {reason}")]
    InsertFailed { reason: String },

    #[error("Account not found: {username}")]
    AccountNotFound { username: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Chat provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("No provider registered under name: {name}")]
    NotConfigured { name: String },

    #[error("Request to {provider} failed: {message}")]
    RequestFailed { provider: String, message: String },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: i64,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Tool proxy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Tool {name} failed: {reason}")]
    CallFailed { name: String, reason: String },

    #[error("Registration with external service failed: {reason}")]
    RegistrationFailed { reason: String },
}

/// Agent lifecycle and routing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent not found: {agent_id}")]
    NotFound { agent_id: EntityId },

    #[error("Swarm population limit reached: {limit}")]
    PopulationLimit { limit: usize },

    #[error("Invalid transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: EntityId,
        from: String,
        to: String,
    },

    #[error("Agent {agent_id} is {state} and rejects messages until relaunched")]
    NotAccepting { agent_id: EntityId, state: String },

    #[error("Turn canceled")]
    Canceled,

    #[error("No account available and registration passthrough failed: {reason}")]
    ClaimFailed { reason: String },
}

/// Event bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Event bus is closed")]
    Closed,
}

/// Master error type for all Krill errors.
#[derive(Debug, Clone, Error)]
pub enum KrillError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type alias for Krill operations.
pub type KrillResult<T> = Result<T, KrillError>;

// =============================================================================
// TESTS
// =============================================================================
