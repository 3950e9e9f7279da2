//! Agent state machine and turn loop.
//!
//! Each agent owns an append-only conversation log and a four-state
//! lifecycle: idle, running, stopped, errored. A running agent loops turns:
//! compose the context, call the bound provider, execute any requested tool
//! calls, persist everything, repeat. The loop ends when the agent runs out
//! of nudges (back to idle), is stopped or canceled (stopped), or a turn
//! fails terminally (errored).
//!
//! # Stop/failure race
//!
//! Stop and turn failure can land concurrently: the operator stops the agent
//! while an in-flight provider call is about to fail. The resolution is a
//! single check under the cell mutex - a stop that has already moved the
//! agent to stopped is never overwritten by a later failure, so the operator
//! always observes the state they asked for.

use krill_context::{nudge_text, ContextComposer, PromptSource};
use krill_core::{
    AgentBinding, AgentError, AgentState, ChatMessage, ChatReply, EntityId, KrillError,
    KrillResult, Memory, MemoryRole, ProviderError, SwarmConfig, SwarmEvent, SwarmEventKind,
    ToolCallRequest, ToolDecl, ToolError,
};
use krill_events::EventBus;
use krill_llm::{ChatProvider, ProviderRegistry, ToolProxy};
use krill_storage::MemoryStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

// ============================================================================
// RUNTIME
// ============================================================================

/// Shared services every agent worker runs against.
pub struct AgentRuntime {
    pub store: Arc<dyn MemoryStore>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<dyn ToolProxy>,
    pub bus: Arc<EventBus>,
    pub config: SwarmConfig,
    /// Tool declarations offered to the provider on every call
    pub tools_offered: Vec<ToolDecl>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", &self.config)
            .field("tools_offered", &self.tools_offered.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Point-in-time view of an agent for listings and UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: EntityId,
    pub name: String,
    pub state: AgentState,
    /// What the agent is doing right now, readable mid-turn
    pub activity: Option<String>,
    pub last_error: Option<String>,
    pub binding: AgentBinding,
}

// ============================================================================
// AGENT
// ============================================================================

/// Mutable lifecycle cell, guarded by one mutex so every state decision is
/// a single atomic check-and-act.
struct AgentCell {
    state: AgentState,
    last_error: Option<String>,
    /// Free-form tag describing the current turn phase; guarded by the
    /// state lock so it stays readable while a turn holds the turn gate
    activity: Option<String>,
    /// Consecutive synthetic nudges issued without a fresh prompt source
    encouragements: u32,
    /// Memory id of the last prompt source a turn consumed
    last_prompt_id: Option<EntityId>,
    /// Cancellation token for the current run; replaced on each start
    cancel: CancellationToken,
}

/// One autonomous swarm member.
pub struct Agent {
    id: EntityId,
    name: String,
    binding: AgentBinding,
    cell: Mutex<AgentCell>,
    /// Serializes turns; stop waits on this to bound an in-flight turn
    turn_gate: tokio::sync::Mutex<()>,
}

impl Agent {
    /// Create a new idle agent with an immutable provider binding.
    pub fn new(name: &str, binding: AgentBinding) -> Self {
        Self {
            id: krill_core::new_entity_id(),
            name: name.to_string(),
            binding,
            cell: Mutex::new(AgentCell {
                state: AgentState::Idle,
                last_error: None,
                activity: None,
                encouragements: 0,
                last_prompt_id: None,
                cancel: CancellationToken::new(),
            }),
            turn_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> &AgentBinding {
        &self.binding
    }

    pub fn state(&self) -> AgentState {
        self.cell().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.cell().last_error.clone()
    }

    pub fn activity(&self) -> Option<String> {
        self.cell().activity.clone()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let cell = self.cell();
        AgentSnapshot {
            agent_id: self.id,
            name: self.name.clone(),
            state: cell.state,
            activity: cell.activity.clone(),
            last_error: cell.last_error.clone(),
            binding: self.binding.clone(),
        }
    }

    fn set_activity(&self, activity: &str) {
        self.cell().activity = Some(activity.to_string());
    }

    fn cell(&self) -> MutexGuard<'_, AgentCell> {
        self.cell.lock().expect("agent cell poisoned")
    }

    // === Lifecycle transitions ===

    /// Move to running and hand out the cancellation token for the new run.
    /// Clears any previous error and nudge count.
    pub fn begin_run(&self) -> KrillResult<CancellationToken> {
        let mut cell = self.cell();
        if !cell.state.can_start() {
            return Err(KrillError::Agent(AgentError::InvalidTransition {
                agent_id: self.id,
                from: cell.state.to_string(),
                to: AgentState::Running.to_string(),
            }));
        }
        cell.state = AgentState::Running;
        cell.last_error = None;
        cell.activity = None;
        cell.encouragements = 0;
        cell.cancel = CancellationToken::new();
        Ok(cell.cancel.clone())
    }

    /// Stop a running agent: the state flips to stopped immediately and the
    /// in-flight turn is canceled at its next await point.
    pub fn request_stop(&self) -> KrillResult<()> {
        let mut cell = self.cell();
        if cell.state != AgentState::Running {
            return Err(KrillError::Agent(AgentError::InvalidTransition {
                agent_id: self.id,
                from: cell.state.to_string(),
                to: AgentState::Stopped.to_string(),
            }));
        }
        cell.state = AgentState::Stopped;
        cell.cancel.cancel();
        Ok(())
    }

    /// Cancel unconditionally; used by deletion and process shutdown.
    pub(crate) fn force_cancel(&self) {
        let mut cell = self.cell();
        cell.cancel.cancel();
        if cell.state == AgentState::Running {
            cell.state = AgentState::Stopped;
        }
    }

    /// Natural end of a run: running settles back to idle. A concurrent
    /// stop keeps its stopped state.
    fn finish_idle(&self) {
        let mut cell = self.cell();
        if cell.state == AgentState::Running {
            cell.state = AgentState::Idle;
        }
        cell.encouragements = 0;
    }

    /// Record a terminal turn failure. Returns `false` when a concurrent
    /// stop already won the race, in which case nothing is recorded.
    fn record_failure(&self, message: &str) -> bool {
        let mut cell = self.cell();
        if cell.state == AgentState::Stopped {
            return false;
        }
        cell.state = AgentState::Errored;
        cell.last_error = Some(message.to_string());
        true
    }

    // === Turn loop ===

    /// Drive the agent until it idles, is canceled, or fails. Mirrors the
    /// final state to the store and announces it on the bus before returning.
    pub async fn run(&self, rt: &AgentRuntime, cancel: CancellationToken) {
        let result = self.turn_loop(rt, &cancel).await;
        match result {
            Ok(()) => {
                self.finish_idle();
                tracing::debug!(agent_id = %self.id, "agent settled idle");
            }
            Err(KrillError::Agent(AgentError::Canceled)) => {
                // Stop or shutdown already set the state.
                self.force_cancel();
                tracing::debug!(agent_id = %self.id, "agent run canceled");
            }
            Err(err) => {
                let message = err.to_string();
                if self.record_failure(&message) {
                    tracing::warn!(agent_id = %self.id, error = %message, "agent turn failed");
                    self.emit(rt, SwarmEvent::error(self.id, &message));
                }
            }
        }

        self.cell().activity = None;
        let final_state = self.state();
        if let Err(err) = rt
            .store
            .agent_state_update(self.id, final_state, self.last_error())
            .await
        {
            tracing::warn!(agent_id = %self.id, error = %err, "state mirror update failed");
        }
        // Park the credential; the permanent assignment survives.
        let _ = rt.store.account_mark_in_use(self.id, false).await;
        self.emit(rt, SwarmEvent::state_changed(self.id, final_state));
    }

    async fn turn_loop(&self, rt: &AgentRuntime, cancel: &CancellationToken) -> KrillResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(KrillError::Agent(AgentError::Canceled));
            }
            let _turn = self.turn_gate.lock().await;
            if self.take_turn(rt, cancel).await? {
                return Ok(());
            }
        }
    }

    /// One complete turn. Returns `Ok(true)` when the agent should settle
    /// back to idle.
    async fn take_turn(&self, rt: &AgentRuntime, cancel: &CancellationToken) -> KrillResult<bool> {
        self.set_activity("composing");
        let mut log = rt
            .store
            .memory_recent(self.id, rt.config.composer.fallback_scan_limit)
            .await?;
        log.reverse();

        let encouragements = self.cell().encouragements;
        let composition = ContextComposer::compose(&log, encouragements, &rt.config.composer);
        let mut messages = composition.messages;

        match composition.prompt_source {
            PromptSource::Exhausted => return Ok(true),
            PromptSource::Nudge(_) => {
                self.cell().encouragements += 1;
            }
            source => {
                let source_id = source.index().and_then(|i| log.get(i)).map(|m| m.memory_id);
                let mut cell = self.cell();
                if source_id.is_some() && cell.last_prompt_id == source_id {
                    // No new instruction since the last turn; escalate a
                    // nudge instead of replaying the consumed source.
                    if cell.encouragements >= rt.config.composer.nudge_limit {
                        return Ok(true);
                    }
                    cell.encouragements += 1;
                    let attempt = cell.encouragements;
                    drop(cell);
                    messages.push(ChatMessage::new(MemoryRole::User, nudge_text(attempt)));
                } else {
                    cell.last_prompt_id = source_id;
                    cell.encouragements = 0;
                }
            }
        }

        let provider = rt.providers.get(&self.binding.provider_name)?;
        let mut reply = self
            .call_provider(rt, provider.as_ref(), &messages, cancel)
            .await?;

        let mut iterations = 0u32;
        while reply.wants_tools() && iterations < rt.config.max_tool_iterations {
            iterations += 1;

            let request = Memory::tool_call(self.id, &reply.content, reply.tool_calls.clone());
            rt.store.memory_insert(&request).await?;
            self.emit_appended(rt, "tool_call");
            messages.push(ChatMessage::tool_call(&reply.content, reply.tool_calls.clone()));

            for call in &reply.tool_calls {
                let output = self.call_tool(rt, call, cancel).await?;
                let content = output.to_string();
                rt.store
                    .memory_insert(&Memory::tool_result(self.id, &call.call_id, &content))
                    .await?;
                self.emit_appended(rt, "tool_result");
                messages.push(ChatMessage::tool_result(&call.call_id, &content));
            }

            reply = self
                .call_provider(rt, provider.as_ref(), &messages, cancel)
                .await?;
        }
        if reply.wants_tools() {
            tracing::warn!(
                agent_id = %self.id,
                limit = rt.config.max_tool_iterations,
                "tool iteration limit reached, dropping pending calls"
            );
        }

        let mut memory = Memory::assistant(self.id, &reply.content);
        if let Some(reasoning) = &reply.reasoning {
            memory = memory.with_reasoning(reasoning);
        }
        rt.store.memory_insert(&memory).await?;
        self.emit_appended(rt, "assistant");
        Ok(false)
    }

    /// Bounded-retry provider call, raced against cancellation.
    async fn call_provider(
        &self,
        rt: &AgentRuntime,
        provider: &dyn ChatProvider,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> KrillResult<ChatReply> {
        self.set_activity("awaiting provider");
        let retry = &rt.config.provider_retry;
        let mut last_error = String::new();
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = retry.backoff_for(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(KrillError::Agent(AgentError::Canceled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(KrillError::Agent(AgentError::Canceled)),
                outcome = provider.chat_with_tools(messages, &rt.tools_offered) => outcome,
            };
            match outcome {
                Ok(reply) => {
                    self.emit(
                        rt,
                        SwarmEvent::new(
                            SwarmEventKind::NetworkActivity,
                            self.id,
                            serde_json::json!({
                                "call": "provider",
                                "provider": provider.provider_name(),
                                "attempt": attempt + 1,
                            }),
                        ),
                    );
                    return Ok(reply);
                }
                Err(err) => {
                    tracing::debug!(agent_id = %self.id, attempt, error = %err, "provider call failed");
                    last_error = err.to_string();
                }
            }
        }
        Err(KrillError::Provider(ProviderError::RetriesExhausted {
            attempts: retry.max_retries + 1,
            last_error,
        }))
    }

    /// Bounded-retry tool call, raced against cancellation.
    async fn call_tool(
        &self,
        rt: &AgentRuntime,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> KrillResult<serde_json::Value> {
        self.set_activity(&format!("running tool {}", call.name));
        let retry = &rt.config.tool_retry;
        let mut last_error: Option<KrillError> = None;
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = retry.backoff_for(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(KrillError::Agent(AgentError::Canceled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(KrillError::Agent(AgentError::Canceled)),
                outcome = rt.tools.call_tool(self.id, &call.name, call.arguments.clone()) => outcome,
            };
            match outcome {
                Ok(value) => {
                    self.emit(
                        rt,
                        SwarmEvent::new(
                            SwarmEventKind::NetworkActivity,
                            self.id,
                            serde_json::json!({ "call": "tool", "name": call.name }),
                        ),
                    );
                    return Ok(value);
                }
                Err(err) => {
                    tracing::debug!(agent_id = %self.id, attempt, tool = %call.name, error = %err, "tool call failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            KrillError::Tool(ToolError::CallFailed {
                name: call.name.clone(),
                reason: "no attempts were made".to_string(),
            })
        }))
    }

    fn emit_appended(&self, rt: &AgentRuntime, shape: &str) {
        self.emit(
            rt,
            SwarmEvent::new(
                SwarmEventKind::MemoryAppended,
                self.id,
                serde_json::json!({ "shape": shape }),
            ),
        );
    }

    /// Publish best-effort: the bus may already be closed during shutdown.
    fn emit(&self, rt: &AgentRuntime, event: SwarmEvent) {
        let _ = rt.bus.publish(&event);
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new("tester", AgentBinding::new("mock", "mock-1", 0.0))
    }

    #[test]
    fn test_new_agent_starts_idle() {
        let a = agent();
        assert_eq!(a.state(), AgentState::Idle);
        assert!(a.last_error().is_none());
    }

    #[test]
    fn test_begin_run_requires_startable_state() {
        let a = agent();
        a.begin_run().expect("idle agent starts");
        assert_eq!(a.state(), AgentState::Running);

        let double = a.begin_run();
        assert!(matches!(
            double,
            Err(KrillError::Agent(AgentError::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn test_request_stop_only_from_running() {
        let a = agent();
        assert!(a.request_stop().is_err());

        a.begin_run().expect("start");
        a.request_stop().expect("stop running agent");
        assert_eq!(a.state(), AgentState::Stopped);

        // Already stopped.
        assert!(a.request_stop().is_err());
    }

    #[test]
    fn test_stop_then_failure_keeps_stopped() {
        let a = agent();
        a.begin_run().expect("start");
        a.request_stop().expect("stop");

        // A failure landing after the stop must not flip the state.
        assert!(!a.record_failure("provider exploded"));
        assert_eq!(a.state(), AgentState::Stopped);
        assert!(a.last_error().is_none());
    }

    #[test]
    fn test_failure_then_stop_is_rejected() {
        let a = agent();
        a.begin_run().expect("start");

        assert!(a.record_failure("provider exploded"));
        assert_eq!(a.state(), AgentState::Errored);
        assert_eq!(a.last_error().as_deref(), Some("provider exploded"));

        // The agent is no longer running, so stop has nothing to do.
        assert!(a.request_stop().is_err());
    }

    #[test]
    fn test_relaunch_clears_last_error() {
        let a = agent();
        a.begin_run().expect("start");
        a.record_failure("boom");
        assert_eq!(a.state(), AgentState::Errored);

        a.begin_run().expect("relaunch from errored");
        assert_eq!(a.state(), AgentState::Running);
        assert!(a.last_error().is_none());
    }

    #[test]
    fn test_stop_cancels_the_run_token() {
        let a = agent();
        let token = a.begin_run().expect("start");
        assert!(!token.is_cancelled());
        a.request_stop().expect("stop");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_relaunch_issues_fresh_token() {
        let a = agent();
        let first = a.begin_run().expect("start");
        a.request_stop().expect("stop");
        let second = a.begin_run().expect("relaunch");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_finish_idle_preserves_concurrent_stop() {
        let a = agent();
        a.begin_run().expect("start");
        a.request_stop().expect("stop");
        a.finish_idle();
        assert_eq!(a.state(), AgentState::Stopped);
    }

    #[test]
    fn test_snapshot_reflects_cell() {
        let a = agent();
        a.begin_run().expect("start");
        a.record_failure("boom");

        let snapshot = a.snapshot();
        assert_eq!(snapshot.agent_id, a.id());
        assert_eq!(snapshot.name, "tester");
        assert_eq!(snapshot.state, AgentState::Errored);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
        assert_eq!(snapshot.binding.provider_name, "mock");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_race_discards_cancellation_failures() {
        // The narrow window: a turn observes the cancellation and reports a
        // failure while the stop is still settling. Many rounds with varied
        // pauses so the interleaving shifts across scheduler timings.
        for round in 0..200u64 {
            let a = Arc::new(agent());
            let token = a.begin_run().expect("start");

            let racer = {
                let a = a.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    a.record_failure("canceled artifact")
                })
            };

            if round % 3 > 0 {
                tokio::time::sleep(std::time::Duration::from_micros(round % 7)).await;
            }
            a.request_stop().expect("stop");

            let recorded = racer.await.expect("racer task");
            assert!(!recorded, "round {round}: failure overwrote a stop");
            assert_eq!(a.state(), AgentState::Stopped, "round {round}");
            assert!(a.last_error().is_none(), "round {round}");
        }
    }

    #[test]
    fn test_activity_readable_and_reset_on_relaunch() {
        let a = agent();
        a.begin_run().expect("start");
        a.set_activity("awaiting provider");
        assert_eq!(a.activity().as_deref(), Some("awaiting provider"));
        assert_eq!(a.snapshot().activity.as_deref(), Some("awaiting provider"));

        a.request_stop().expect("stop");
        a.begin_run().expect("relaunch");
        assert!(a.activity().is_none());
    }
}
