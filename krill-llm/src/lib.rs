//! Krill LLM - Provider and Tool Proxy Traits
//!
//! Provider-agnostic interfaces consumed by the agent turn loop.
//! Implementations are user-supplied; they are expected to apply their own
//! bounded retry with backoff and to normalize the message shape to whatever
//! wire contract they require. The core treats both traits as black boxes.

use async_trait::async_trait;
use krill_core::{
    ChatMessage, ChatReply, EntityId, KrillError, KrillResult, ProviderError, ToolDecl, ToolError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// CHAT PROVIDER TRAIT
// ============================================================================

/// Trait for chat providers.
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Produce a reply to a role-tagged message list.
    async fn chat(&self, messages: &[ChatMessage]) -> KrillResult<ChatReply>;

    /// Produce a reply with tool declarations offered; the reply may contain
    /// tool-call requests.
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> KrillResult<ChatReply>;

    /// Identifier reported in errors and events.
    fn provider_name(&self) -> &str;
}

// ============================================================================
// TOOL PROXY TRAIT
// ============================================================================

/// Trait for the external tool-invocation service.
#[async_trait]
pub trait ToolProxy: Send + Sync {
    /// Execute a named tool call on behalf of an agent.
    async fn call_tool(
        &self,
        caller: EntityId,
        name: &str,
        arguments: serde_json::Value,
    ) -> KrillResult<serde_json::Value>;

    /// Register a fresh credential with the external service. Used by the
    /// account pool only when its pool is exhausted; the response is
    /// captured for replay and the service is never re-contacted for the
    /// same agent.
    async fn register(
        &self,
        agent_id: EntityId,
        username: &str,
        secret: &str,
    ) -> KrillResult<serde_json::Value>;
}

// ============================================================================
// PROVIDER REGISTRY
// ============================================================================

/// Registry for chat providers.
/// Providers must be explicitly registered under a name - no auto-discovery.
pub struct ProviderRegistry {
    providers: Mutex<HashMap<String, Arc<dyn ChatProvider>>>,
}

impl ProviderRegistry {
    /// Create a new empty provider registry.
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a provider under a name.
    /// Replaces any previously registered provider of the same name.
    pub fn register(&self, name: &str, provider: Arc<dyn ChatProvider>) {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .insert(name.to_string(), provider);
    }

    /// Get a registered provider by name.
    ///
    /// # Returns
    /// * `Err(ProviderError::NotConfigured)` - If no provider is registered
    ///   under `name`
    pub fn get(&self, name: &str) -> KrillResult<Arc<dyn ChatProvider>> {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                KrillError::Provider(ProviderError::NotConfigured {
                    name: name.to_string(),
                })
            })
    }

    /// Check whether a provider is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.providers
            .lock()
            .expect("provider registry poisoned")
            .contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .providers
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

// ============================================================================
// MOCK PROVIDERS FOR TESTING
// ============================================================================

/// Mock chat provider for testing.
/// Replies are scripted in FIFO order; an empty script yields a fixed text
/// reply. Every request is recorded for assertions.
pub struct MockChatProvider {
    name: String,
    script: Mutex<std::collections::VecDeque<KrillResult<ChatReply>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockChatProvider {
    /// Create a mock provider with an empty script.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(std::collections::VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a scripted reply.
    pub fn push_reply(&self, reply: ChatReply) {
        self.script
            .lock()
            .expect("mock script poisoned")
            .push_back(Ok(reply));
    }

    /// Queue a scripted failure.
    pub fn push_failure(&self, error: ProviderError) {
        self.script
            .lock()
            .expect("mock script poisoned")
            .push_back(Err(KrillError::Provider(error)));
    }

    /// Message lists received so far, in call order.
    pub fn recorded_requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().expect("mock requests poisoned").clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().expect("mock requests poisoned").len()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> KrillResult<ChatReply> {
        self.requests
            .lock()
            .expect("mock requests poisoned")
            .push(messages.to_vec());
        self.script
            .lock()
            .expect("mock script poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(ChatReply::text("ack")))
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> KrillResult<ChatReply> {
        self.next_reply(messages)
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDecl],
    ) -> KrillResult<ChatReply> {
        self.next_reply(messages)
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for MockChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChatProvider")
            .field("name", &self.name)
            .field("calls", &self.call_count())
            .finish()
    }
}

/// Recorded tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub caller: EntityId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Mock tool proxy for testing.
/// Tool results are keyed by tool name; unknown tools fail. Registrations
/// return a canned response and are recorded; `fail_next("register", n)`
/// scripts registration failures.
pub struct MockToolProxy {
    results: Mutex<HashMap<String, serde_json::Value>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<RecordedCall>>,
    registrations: Mutex<Vec<String>>,
}

impl MockToolProxy {
    /// Create an empty mock proxy.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Script a result for a tool name.
    pub fn set_result(&self, name: &str, result: serde_json::Value) {
        self.results
            .lock()
            .expect("mock results poisoned")
            .insert(name.to_string(), result);
    }

    /// Make the next `count` calls to `name` fail before succeeding.
    pub fn fail_next(&self, name: &str, count: u32) {
        self.failures
            .lock()
            .expect("mock failures poisoned")
            .insert(name.to_string(), count);
    }

    /// Calls received so far, in order.
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("mock calls poisoned").clone()
    }

    /// Usernames registered so far, in order.
    pub fn recorded_registrations(&self) -> Vec<String> {
        self.registrations
            .lock()
            .expect("mock registrations poisoned")
            .clone()
    }
}

impl Default for MockToolProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProxy for MockToolProxy {
    async fn call_tool(
        &self,
        caller: EntityId,
        name: &str,
        arguments: serde_json::Value,
    ) -> KrillResult<serde_json::Value> {
        self.calls
            .lock()
            .expect("mock calls poisoned")
            .push(RecordedCall {
                caller,
                name: name.to_string(),
                arguments,
            });

        {
            let mut failures = self.failures.lock().expect("mock failures poisoned");
            if let Some(remaining) = failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(KrillError::Tool(ToolError::CallFailed {
                        name: name.to_string(),
                        reason: "scripted failure".to_string(),
                    }));
                }
            }
        }

        self.results
            .lock()
            .expect("mock results poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                KrillError::Tool(ToolError::UnknownTool {
                    name: name.to_string(),
                })
            })
    }

    async fn register(
        &self,
        _agent_id: EntityId,
        username: &str,
        _secret: &str,
    ) -> KrillResult<serde_json::Value> {
        {
            let mut failures = self.failures.lock().expect("mock failures poisoned");
            if let Some(remaining) = failures.get_mut("register") {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(KrillError::Tool(ToolError::RegistrationFailed {
                        reason: "scripted failure".to_string(),
                    }));
                }
            }
        }
        self.registrations
            .lock()
            .expect("mock registrations poisoned")
            .push(username.to_string());
        Ok(serde_json::json!({ "registered": username }))
    }
}

impl std::fmt::Debug for MockToolProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockToolProxy")
            .field("calls", &self.recorded_calls().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
