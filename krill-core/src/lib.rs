//! Krill Core - Entity Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types - no orchestration logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

mod config;
mod error;
mod llm;

pub use config::{ComposerConfig, RetryConfig, SwarmConfig};
pub use error::{
    AgentError, BusError, KrillError, KrillResult, ProviderError, StorageError,
    ToolError,
};
pub use llm::{ChatMessage, ChatReply, ToolCallRequest, ToolDecl};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

// ============================================================================
// AGENT STATE
// ============================================================================

/// Lifecycle state of an agent.
///
/// Transitions are enforced by the agent runtime; this enum only encodes the
/// four legal values and the message-acceptance predicate shared by the
/// orchestrator and the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Accepts messages, not actively turning
    Idle,
    /// Actively looping, eligible for synthetic nudges
    Running,
    /// Rejects new messages until relaunched (user-initiated)
    Stopped,
    /// Rejects new messages until relaunched, carries last_error
    Errored,
}

impl AgentState {
    /// Whether an agent in this state accepts inbound messages.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Running)
    }

    /// Whether Start/Relaunch is valid from this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            AgentState::Idle | AgentState::Stopped | AgentState::Errored
        )
    }

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::Stopped => "stopped",
            AgentState::Errored => "errored",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StateParseError> {
        match s {
            "idle" => Ok(AgentState::Idle),
            "running" => Ok(AgentState::Running),
            "stopped" => Ok(AgentState::Stopped),
            "errored" => Ok(AgentState::Errored),
            _ => Err(StateParseError(s.to_string())),
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Error parsing AgentState from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateParseError(pub String);

impl fmt::Display for StateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent state: {}", self.0)
    }
}

impl std::error::Error for StateParseError {}

// ============================================================================
// MEMORY
// ============================================================================

/// Role of a memory entry in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MemoryRole {
    /// Wire-format string ("system", "user", "assistant", "tool").
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            MemoryRole::System => "system",
            MemoryRole::User => "user",
            MemoryRole::Assistant => "assistant",
            MemoryRole::Tool => "tool",
        }
    }
}

impl fmt::Display for MemoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

/// Origin of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySource {
    /// Point-to-point message from the operator or a tool
    Direct,
    /// Swarm-wide message relayed by the orchestrator
    Broadcast,
    /// Mission directive / system prompt
    System,
    /// Assistant output from the provider
    Llm,
    /// Tool call or tool result
    Tool,
}

/// One immutable conversation log entry.
///
/// Append-only: never mutated or deleted except by the whole-agent deletion
/// cascade. Creation order (UUIDv7 `memory_id`, mirrored by `created_at`) is
/// the sole basis for "most recent" queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier for this entry
    pub memory_id: EntityId,
    /// Agent whose log this entry belongs to
    pub agent_id: EntityId,
    /// Conversation role
    pub role: MemoryRole,
    /// Origin of the entry
    pub source: MemorySource,
    /// Originating agent for broadcasts; `None` for operator broadcasts
    /// and all non-broadcast entries
    pub sender_id: Option<EntityId>,
    /// Entry content
    pub content: String,
    /// Optional model reasoning attached to assistant entries
    pub reasoning: Option<String>,
    /// Tool calls requested by an assistant entry
    pub tool_calls: Vec<ToolCallRequest>,
    /// Identifier of the tool call a tool-result entry answers
    pub tool_call_id: Option<String>,
    /// When this entry was created
    pub created_at: Timestamp,
}

impl Memory {
    fn base(agent_id: EntityId, role: MemoryRole, source: MemorySource, content: &str) -> Self {
        Self {
            memory_id: new_entity_id(),
            agent_id,
            role,
            source,
            sender_id: None,
            content: content.to_string(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create a mission directive / system prompt entry.
    pub fn system(agent_id: EntityId, content: &str) -> Self {
        Self::base(agent_id, MemoryRole::System, MemorySource::System, content)
    }

    /// Create a direct operator message.
    pub fn direct(agent_id: EntityId, content: &str) -> Self {
        Self::base(agent_id, MemoryRole::User, MemorySource::Direct, content)
    }

    /// Create an inbound broadcast entry. `sender_id` is `None` when the
    /// broadcast originates from the operator rather than a peer agent.
    pub fn broadcast(agent_id: EntityId, sender_id: Option<EntityId>, content: &str) -> Self {
        let mut m = Self::base(agent_id, MemoryRole::User, MemorySource::Broadcast, content);
        m.sender_id = sender_id;
        m
    }

    /// Create an assistant reply entry.
    pub fn assistant(agent_id: EntityId, content: &str) -> Self {
        Self::base(agent_id, MemoryRole::Assistant, MemorySource::Llm, content)
    }

    /// Create an assistant entry carrying tool-call requests.
    pub fn tool_call(agent_id: EntityId, content: &str, calls: Vec<ToolCallRequest>) -> Self {
        let mut m = Self::base(agent_id, MemoryRole::Assistant, MemorySource::Llm, content);
        m.tool_calls = calls;
        m
    }

    /// Create a tool-result entry answering `call_id`.
    pub fn tool_result(agent_id: EntityId, call_id: &str, content: &str) -> Self {
        let mut m = Self::base(agent_id, MemoryRole::Tool, MemorySource::Tool, content);
        m.tool_call_id = Some(call_id.to_string());
        m
    }

    /// Attach model reasoning.
    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = Some(reasoning.to_string());
        self
    }

    /// Whether this entry is an assistant message requesting tool calls.
    pub fn is_tool_call(&self) -> bool {
        self.role == MemoryRole::Assistant && !self.tool_calls.is_empty()
    }

    /// Whether this entry is a tool result.
    pub fn is_tool_result(&self) -> bool {
        self.role == MemoryRole::Tool
    }
}

// ============================================================================
// AGENT BINDING
// ============================================================================

/// Immutable provider binding fixed at agent creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBinding {
    /// Name of the registered chat provider to use
    pub provider_name: String,
    /// Model identifier passed through to the provider
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
}

impl AgentBinding {
    /// Create a new binding.
    pub fn new(provider_name: &str, model: &str, temperature: f32) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            model: model.to_string(),
            temperature,
        }
    }
}

// ============================================================================
// ACCOUNT
// ============================================================================

/// An external credential, permanently bound to at most one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// External username
    pub username: String,
    /// Credential secret
    pub secret: String,
    /// Agent holding the permanent assignment, if any
    pub assigned_to: Option<EntityId>,
    /// Whether the assignment is currently in active use by a running agent
    pub in_use: bool,
    /// Captured first successful external registration response, replayed on
    /// re-claim so the external service is never re-contacted
    pub registration_response: Option<serde_json::Value>,
}

impl Account {
    /// Create an unassigned pool account.
    pub fn new(username: &str, secret: &str) -> Self {
        Self {
            username: username.to_string(),
            secret: secret.to_string(),
            assigned_to: None,
            in_use: false,
            registration_response: None,
        }
    }

    /// Whether the account is available for claim.
    pub fn is_available(&self) -> bool {
        self.assigned_to.is_none()
    }
}

// ============================================================================
// SWARM EVENTS
// ============================================================================

/// Kind of notification published on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwarmEventKind {
    /// An agent's lifecycle state changed
    StateChanged,
    /// A memory entry was appended to an agent's log
    MemoryAppended,
    /// A provider or tool call started or finished
    NetworkActivity,
    /// An agent recorded an error
    Error,
    /// A broadcast was routed through the swarm
    Broadcast,
}

/// Ephemeral notification for observers. Never persisted; exists only on
/// the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmEvent {
    /// Kind of event
    pub kind: SwarmEventKind,
    /// Agent the event concerns
    pub agent_id: EntityId,
    /// Structured payload
    pub payload: serde_json::Value,
    /// When the event was published
    pub timestamp: Timestamp,
}

impl SwarmEvent {
    /// Create a new event with the current timestamp.
    pub fn new(kind: SwarmEventKind, agent_id: EntityId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            agent_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Create a state-changed event.
    pub fn state_changed(agent_id: EntityId, state: AgentState) -> Self {
        Self::new(
            SwarmEventKind::StateChanged,
            agent_id,
            serde_json::json!({ "state": state.as_db_str() }),
        )
    }

    /// Create an error event.
    pub fn error(agent_id: EntityId, message: &str) -> Self {
        Self::new(
            SwarmEventKind::Error,
            agent_id,
            serde_json::json!({ "message": message }),
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_sort_by_creation() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert!(a <= b);
    }

    #[test]
    fn test_agent_state_accepts_messages() {
        assert!(AgentState::Idle.accepts_messages());
        assert!(AgentState::Running.accepts_messages());
        assert!(!AgentState::Stopped.accepts_messages());
        assert!(!AgentState::Errored.accepts_messages());
    }

    #[test]
    fn test_agent_state_can_start() {
        assert!(AgentState::Idle.can_start());
        assert!(AgentState::Stopped.can_start());
        assert!(AgentState::Errored.can_start());
        assert!(!AgentState::Running.can_start());
    }

    #[test]
    fn test_agent_state_round_trip() {
        for state in [
            AgentState::Idle,
            AgentState::Running,
            AgentState::Stopped,
            AgentState::Errored,
        ] {
            assert_eq!(AgentState::from_db_str(state.as_db_str()), Ok(state));
        }
        assert!(AgentState::from_db_str("paused").is_err());
    }

    #[test]
    fn test_memory_broadcast_sender() {
        let agent = new_entity_id();
        let sender = new_entity_id();

        let from_peer = Memory::broadcast(agent, Some(sender), "mine iron");
        assert_eq!(from_peer.sender_id, Some(sender));
        assert_eq!(from_peer.source, MemorySource::Broadcast);

        let from_operator = Memory::broadcast(agent, None, "regroup");
        assert!(from_operator.sender_id.is_none());
    }

    #[test]
    fn test_memory_direct_has_no_sender() {
        let m = Memory::direct(new_entity_id(), "hello");
        assert!(m.sender_id.is_none());
        assert_eq!(m.role, MemoryRole::User);
        assert_eq!(m.source, MemorySource::Direct);
    }

    #[test]
    fn test_memory_tool_shapes() {
        let agent = new_entity_id();
        let call = ToolCallRequest::new("call-1", "dig", serde_json::json!({"depth": 3}));
        let request = Memory::tool_call(agent, "", vec![call]);
        assert!(request.is_tool_call());
        assert!(!request.is_tool_result());

        let result = Memory::tool_result(agent, "call-1", "done");
        assert!(result.is_tool_result());
        assert_eq!(result.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_account_availability() {
        let mut account = Account::new("mysis-01", "s3cret");
        assert!(account.is_available());
        account.assigned_to = Some(new_entity_id());
        assert!(!account.is_available());
    }

    #[test]
    fn test_swarm_event_state_changed_payload() {
        let agent = new_entity_id();
        let event = SwarmEvent::state_changed(agent, AgentState::Running);
        assert_eq!(event.kind, SwarmEventKind::StateChanged);
        assert_eq!(event.payload["state"], "running");
    }
}
