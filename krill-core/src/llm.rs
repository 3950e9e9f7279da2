//! LLM-related primitive types.
//!
//! Pure data types for provider calls. Traits and orchestration live in krill-llm.

use crate::MemoryRole;
use serde::{Deserialize, Serialize};

// ============================================================================
// CHAT MESSAGE
// ============================================================================

/// One role-tagged message in a provider request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Conversation role
    pub role: MemoryRole,
    /// Message content
    pub content: String,
    /// Identifier of the tool call this message answers (tool role only)
    pub tool_call_id: Option<String>,
    /// Tool calls requested by an assistant message
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    /// Create a plain message with no tool linkage.
    pub fn new(role: MemoryRole, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Create a tool-result message answering `call_id`.
    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            role: MemoryRole::Tool,
            content: content.to_string(),
            tool_call_id: Some(call_id.to_string()),
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message carrying tool-call requests.
    pub fn tool_call(content: &str, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: MemoryRole::Assistant,
            content: content.to_string(),
            tool_call_id: None,
            tool_calls: calls,
        }
    }
}

// ============================================================================
// TOOL SHAPES
// ============================================================================

/// Declaration of a tool offered to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecl {
    /// Tool name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON schema of the tool arguments
    pub parameters: serde_json::Value,
}

impl ToolDecl {
    /// Create a new tool declaration.
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// A tool invocation requested by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call identifier, echoed in the result message
    pub call_id: String,
    /// Tool name
    pub name: String,
    /// Tool arguments
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    /// Create a new tool-call request.
    pub fn new(call_id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }
}

// ============================================================================
// CHAT REPLY
// ============================================================================

/// A provider reply, optionally requesting tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    /// Assistant text content
    pub content: String,
    /// Optional model reasoning
    pub reasoning: Option<String>,
    /// Requested tool calls; empty when the reply is final
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatReply {
    /// Create a final reply with no tool calls.
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            reasoning: None,
            tool_calls: Vec::new(),
        }
    }

    /// Create a reply requesting tool calls.
    pub fn with_tool_calls(content: &str, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: content.to_string(),
            reasoning: None,
            tool_calls: calls,
        }
    }

    /// Attach model reasoning.
    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.reasoning = Some(reasoning.to_string());
        self
    }

    /// Whether the reply requests tool calls.
    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
