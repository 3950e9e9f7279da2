//! Krill Context - Per-Turn Context Composition
//!
//! Builds the exact, size-bounded message list for one provider call from an
//! unbounded append-only conversation log. Pure and deterministic: the same
//! log state, encouragement count, and config always produce the same
//! composition. No IO, no clocks, no side effects.
//!
//! # Algorithm
//!
//! 1. The most recent system/system memory is placed first, if present.
//! 2. The prompt source - the start of the "current turn" - is the first log
//!    entry matching, in strict priority order: a direct message, an
//!    operator broadcast (empty sender), any other broadcast. The scan
//!    covers the most recent `scan_window` entries, then falls back to a
//!    bounded full-log lookup so a long-lived mission directive cannot be
//!    evicted by scroll.
//! 3. Everything strictly before the prompt source is compressed to at most
//!    the single most recent tool loop in that span.
//! 4. Everything from the prompt source to the end of the log is included
//!    uncompressed, preserving multi-step tool sequences.
//!
//! When no prompt source exists at all, a synthetic nudge with escalating
//! urgency is injected in the composed list only - it is never persisted.

use krill_core::{ChatMessage, ComposerConfig, Memory, MemoryRole, MemorySource};
use serde::{Deserialize, Serialize};

// ============================================================================
// PROMPT SOURCE
// ============================================================================

/// What started the current turn. Index variants refer to positions in the
/// log slice passed to [`compose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptSource {
    /// A direct operator message at this log index
    Direct(usize),
    /// A broadcast from the operator (empty sender) at this log index
    OperatorBroadcast(usize),
    /// A broadcast from a peer agent at this log index
    PeerBroadcast(usize),
    /// No real source exists; a synthetic nudge with this 1-based attempt
    /// number was injected
    Nudge(u32),
    /// No real source exists and the nudge limit is reached; the caller
    /// must transition the agent to idle
    Exhausted,
}

impl PromptSource {
    /// Log index of a real prompt source, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            PromptSource::Direct(i)
            | PromptSource::OperatorBroadcast(i)
            | PromptSource::PeerBroadcast(i) => Some(*i),
            PromptSource::Nudge(_) | PromptSource::Exhausted => None,
        }
    }

    /// Whether a real inbound message starts this turn.
    pub fn is_real(&self) -> bool {
        self.index().is_some()
    }
}

/// One composed provider request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Messages in final order: system prompt, historical loop, current turn
    pub messages: Vec<ChatMessage>,
    /// What started the turn
    pub prompt_source: PromptSource,
}

// ============================================================================
// SYNTHETIC NUDGES
// ============================================================================

/// Escalating nudge content keyed by 1-based attempt number.
/// Pure function of the attempt; attempts past the known ladder reuse the
/// most urgent wording.
pub fn nudge_text(attempt: u32) -> &'static str {
    match attempt {
        0 | 1 => "Friendly reminder: review your mission and continue making progress.",
        2 => "You appear stalled. Choose a concrete next step toward your mission and execute it now.",
        _ => "URGENT: no progress recorded. Take an action immediately; further silence will idle you.",
    }
}

// ============================================================================
// COMPOSER
// ============================================================================

/// Stateless composer over an agent's conversation log.
#[derive(Debug, Clone, Default)]
pub struct ContextComposer;

impl ContextComposer {
    /// Compose the message list for one turn.
    ///
    /// `log` is the agent's full conversation log in chronological order.
    /// `encouragements` is the agent's current consecutive-nudge counter;
    /// the composer does not mutate it - the caller resets it on a real
    /// prompt source and increments it on a `Nudge` outcome.
    pub fn compose(log: &[Memory], encouragements: u32, config: &ComposerConfig) -> Composition {
        let source = select_prompt_source(log, config);

        let (prompt_source, current_start) = match source {
            Some(found) => (found, found.index().unwrap_or(log.len())),
            None => {
                if encouragements >= config.nudge_limit {
                    (PromptSource::Exhausted, log.len())
                } else {
                    (PromptSource::Nudge(encouragements + 1), log.len())
                }
            }
        };

        let mut messages = Vec::new();

        // 1. System prompt, always first if present.
        if let Some(system) = log
            .iter()
            .rev()
            .find(|m| m.role == MemoryRole::System && m.source == MemorySource::System)
        {
            messages.push(to_chat_message(system));
        }

        // 2. Historical span compressed to the most recent tool loop.
        if let Some((start, end)) = last_tool_loop(&log[..current_start]) {
            for memory in &log[start..end] {
                messages.push(to_chat_message(memory));
            }
        }

        // 3. Current turn, uncompressed.
        for memory in &log[current_start..] {
            // The system prompt already leads the list; do not repeat it.
            if memory.role == MemoryRole::System && memory.source == MemorySource::System {
                continue;
            }
            messages.push(to_chat_message(memory));
        }

        // 4. Synthetic nudge stands in for the missing prompt source.
        if let PromptSource::Nudge(attempt) = prompt_source {
            messages.push(ChatMessage::new(MemoryRole::User, nudge_text(attempt)));
        }

        drop_orphan_tool_results(&mut messages);

        Composition {
            messages,
            prompt_source,
        }
    }
}

/// Priority scan for the prompt source: direct beats operator broadcast
/// beats peer broadcast, regardless of recency across kinds. The bounded
/// window is searched first; a bounded full-log fallback keeps an old
/// mission directive reachable on long logs.
fn select_prompt_source(log: &[Memory], config: &ComposerConfig) -> Option<PromptSource> {
    let window_start = log.len().saturating_sub(config.scan_window);
    if let Some(found) = scan_span(log, window_start) {
        return Some(found);
    }
    let fallback_start = log.len().saturating_sub(config.fallback_scan_limit);
    if fallback_start < window_start {
        return scan_span(log, fallback_start);
    }
    None
}

fn scan_span(log: &[Memory], start: usize) -> Option<PromptSource> {
    let mut operator_broadcast = None;
    let mut peer_broadcast = None;

    for (idx, memory) in log.iter().enumerate().skip(start).rev() {
        match memory.source {
            MemorySource::Direct => return Some(PromptSource::Direct(idx)),
            MemorySource::Broadcast if memory.sender_id.is_none() => {
                if operator_broadcast.is_none() {
                    operator_broadcast = Some(PromptSource::OperatorBroadcast(idx));
                }
            }
            MemorySource::Broadcast => {
                if peer_broadcast.is_none() {
                    peer_broadcast = Some(PromptSource::PeerBroadcast(idx));
                }
            }
            _ => {}
        }
    }

    operator_broadcast.or(peer_broadcast)
}

/// The most recent tool loop in a span: the last assistant message carrying
/// tool-call requests plus every immediately following tool-result message,
/// up to the next non-tool message. Returns a half-open index range.
fn last_tool_loop(span: &[Memory]) -> Option<(usize, usize)> {
    let call_idx = span.iter().rposition(|m| m.is_tool_call())?;
    let mut end = call_idx + 1;
    while end < span.len() && span[end].is_tool_result() {
        end += 1;
    }
    Some((call_idx, end))
}

fn to_chat_message(memory: &Memory) -> ChatMessage {
    if memory.is_tool_call() {
        ChatMessage::tool_call(&memory.content, memory.tool_calls.clone())
    } else if let Some(call_id) = &memory.tool_call_id {
        ChatMessage::tool_result(call_id, &memory.content)
    } else {
        ChatMessage::new(memory.role, &memory.content)
    }
}

/// Remove any tool-result message whose originating tool-call request does
/// not appear earlier in the composed list. A prompt source landing in the
/// middle of a tool loop would otherwise emit results the provider cannot
/// attribute.
fn drop_orphan_tool_results(messages: &mut Vec<ChatMessage>) {
    let mut seen_calls: std::collections::HashSet<String> = std::collections::HashSet::new();
    messages.retain(|message| {
        for call in &message.tool_calls {
            seen_calls.insert(call.call_id.clone());
        }
        match &message.tool_call_id {
            Some(call_id) => seen_calls.contains(call_id),
            None => true,
        }
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use krill_core::{new_entity_id, EntityId, ToolCallRequest};

    fn config() -> ComposerConfig {
        ComposerConfig {
            scan_window: 10,
            fallback_scan_limit: 1000,
            nudge_limit: 3,
        }
    }

    fn agent() -> EntityId {
        new_entity_id()
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "dig", serde_json::json!({}))
    }

    #[test]
    fn test_system_prompt_always_first() {
        let a = agent();
        let log = vec![
            Memory::direct(a, "do the thing"),
            Memory::system(a, "you are a miner"),
        ];
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.messages[0].role, MemoryRole::System);
        assert_eq!(composition.messages[0].content, "you are a miner");
        // System prompt is not repeated inside the current-turn span.
        let system_count = composition
            .messages
            .iter()
            .filter(|m| m.role == MemoryRole::System)
            .count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn test_direct_beats_newer_broadcast() {
        let a = agent();
        let log = vec![
            Memory::direct(a, "older direct"),
            Memory::broadcast(a, Some(agent()), "newer broadcast"),
        ];
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::Direct(0));
    }

    #[test]
    fn test_operator_broadcast_beats_newer_peer_broadcast() {
        let a = agent();
        let log = vec![
            Memory::broadcast(a, None, "from operator"),
            Memory::broadcast(a, Some(agent()), "from peer, newer"),
        ];
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::OperatorBroadcast(0));
    }

    #[test]
    fn test_most_recent_of_same_kind_wins() {
        let a = agent();
        let log = vec![Memory::direct(a, "first"), Memory::direct(a, "second")];
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::Direct(1));
    }

    #[test]
    fn test_fallback_rescues_directive_beyond_window() {
        let a = agent();
        let mut log = vec![Memory::broadcast(a, None, "mission directive")];
        // Scroll the directive far past the scan window.
        for i in 0..30 {
            log.push(Memory::assistant(a, &format!("log {}", i)));
        }
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::OperatorBroadcast(0));
        // The directive starts the current turn, so the whole scroll is in.
        assert!(composition
            .messages
            .iter()
            .any(|m| m.content == "mission directive"));
    }

    #[test]
    fn test_fallback_respects_its_own_bound() {
        let a = agent();
        let tight = ComposerConfig {
            scan_window: 5,
            fallback_scan_limit: 10,
            nudge_limit: 3,
        };
        let mut log = vec![Memory::broadcast(a, None, "ancient directive")];
        for i in 0..20 {
            log.push(Memory::assistant(a, &format!("log {}", i)));
        }
        let composition = ContextComposer::compose(&log, 0, &tight);
        // Directive is older than the fallback bound: a nudge is issued.
        assert_eq!(composition.prompt_source, PromptSource::Nudge(1));
    }

    #[test]
    fn test_nudge_escalation_ladder() {
        let a = agent();
        let log = vec![Memory::assistant(a, "idle chatter")];

        let first = ContextComposer::compose(&log, 0, &config());
        assert_eq!(first.prompt_source, PromptSource::Nudge(1));
        let second = ContextComposer::compose(&log, 1, &config());
        assert_eq!(second.prompt_source, PromptSource::Nudge(2));
        let third = ContextComposer::compose(&log, 2, &config());
        assert_eq!(third.prompt_source, PromptSource::Nudge(3));

        // Each rung uses distinct, escalating wording.
        let texts: Vec<&str> = [&first, &second, &third]
            .iter()
            .map(|c| c.messages.last().expect("nudge").content.as_str())
            .collect();
        assert_ne!(texts[0], texts[1]);
        assert_ne!(texts[1], texts[2]);

        // The limit ends the ladder instead of issuing a fourth nudge.
        let fourth = ContextComposer::compose(&log, 3, &config());
        assert_eq!(fourth.prompt_source, PromptSource::Exhausted);
    }

    #[test]
    fn test_nudge_is_never_a_memory() {
        let log: Vec<Memory> = Vec::new();
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::Nudge(1));
        // The log is untouched by composition; the nudge exists only in the
        // composed message list.
        assert_eq!(composition.messages.len(), 1);
        assert_eq!(composition.messages[0].content, nudge_text(1));
    }

    #[test]
    fn test_history_compressed_to_single_most_recent_loop() {
        let a = agent();
        let log = vec![
            Memory::direct(a, "old order"),
            Memory::tool_call(a, "", vec![call("c1")]),
            Memory::tool_result(a, "c1", "first loop result"),
            Memory::assistant(a, "summary one"),
            Memory::tool_call(a, "", vec![call("c2")]),
            Memory::tool_result(a, "c2", "second loop result"),
            Memory::assistant(a, "summary two"),
            Memory::direct(a, "new order"),
        ];
        let composition = ContextComposer::compose(&log, 0, &config());
        assert_eq!(composition.prompt_source, PromptSource::Direct(7));

        let contents: Vec<&str> = composition
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        // Only the second (most recent) historical loop survives.
        assert!(contents.contains(&"second loop result"));
        assert!(!contents.contains(&"first loop result"));
        // Plain historical chatter is dropped.
        assert!(!contents.contains(&"old order"));
        assert!(!contents.contains(&"summary one"));
        assert!(!contents.contains(&"summary two"));
        // The current turn is present.
        assert!(contents.contains(&"new order"));
    }

    #[test]
    fn test_current_turn_never_compressed() {
        let a = agent();
        let mut log = vec![Memory::direct(a, "login then mine")];
        // A long multi-step tool sequence inside the active turn.
        for i in 0..6 {
            let id = format!("c{}", i);
            log.push(Memory::tool_call(a, "", vec![call(&id)]));
            log.push(Memory::tool_result(a, &id, &format!("step {}", i)));
        }
        log.push(Memory::assistant(a, "done"));

        let composition = ContextComposer::compose(&log, 0, &config());
        let contents: Vec<&str> = composition
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        for i in 0..6 {
            assert!(contents.contains(&format!("step {}", i).as_str()));
        }
        assert!(contents.contains(&"done"));
    }

    #[test]
    fn test_no_orphan_results_when_source_lands_mid_loop() {
        let a = agent();
        let log = vec![
            Memory::tool_call(a, "", vec![call("c1")]),
            // A broadcast arrives between the call and its result.
            Memory::broadcast(a, Some(agent()), "interrupting broadcast"),
            Memory::tool_result(a, "c1", "late result"),
        ];
        let composition = ContextComposer::compose(&log, 0, &config());

        // The historical loop (the call plus any immediate results before
        // the source) plus the current turn must not yield a result whose
        // call is absent.
        let mut seen = std::collections::HashSet::new();
        for message in &composition.messages {
            for c in &message.tool_calls {
                seen.insert(c.call_id.clone());
            }
            if let Some(id) = &message.tool_call_id {
                assert!(seen.contains(id), "orphan tool result: {}", id);
            }
        }
    }

    #[test]
    fn test_compose_is_deterministic() {
        let a = agent();
        let log = vec![
            Memory::system(a, "mission"),
            Memory::direct(a, "go"),
            Memory::tool_call(a, "", vec![call("c1")]),
            Memory::tool_result(a, "c1", "ok"),
        ];
        let one = ContextComposer::compose(&log, 0, &config());
        let two = ContextComposer::compose(&log, 0, &config());
        assert_eq!(one, two);
    }

    #[test]
    fn test_ordering_system_then_history_then_current() {
        let a = agent();
        let log = vec![
            Memory::tool_call(a, "", vec![call("h1")]),
            Memory::tool_result(a, "h1", "historic"),
            Memory::direct(a, "current order"),
            Memory::assistant(a, "working on it"),
            Memory::system(a, "mission"),
        ];
        // System prompt written late in the log must still lead.
        let composition = ContextComposer::compose(&log, 0, &config());
        let contents: Vec<&str> = composition
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents[0], "mission");
        let historic = contents.iter().position(|c| *c == "historic").expect("historic");
        let current = contents.iter().position(|c| *c == "current order").expect("current");
        let reply = contents.iter().position(|c| *c == "working on it").expect("reply");
        assert!(historic < current);
        assert!(current < reply);
    }

    #[test]
    fn test_nudge_text_ladder_is_pure() {
        assert_eq!(nudge_text(1), nudge_text(1));
        assert_ne!(nudge_text(1), nudge_text(2));
        assert_ne!(nudge_text(2), nudge_text(3));
        // Past the ladder, the most urgent wording repeats.
        assert_eq!(nudge_text(3), nudge_text(7));
    }
}
