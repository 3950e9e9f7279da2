//! Krill Storage - Store Trait and In-Memory Implementation
//!
//! Defines the durable log abstraction consumed by the agent runtime:
//! append-only conversation memories, an agent-state mirror, and the account
//! assignment table. `InMemoryStore` is the reference implementation used by
//! all tests; durable backends implement the same trait.

use async_trait::async_trait;
use krill_core::{
    Account, AgentState, EntityId, KrillError, KrillResult, Memory, MemorySource, StorageError,
};
use std::collections::HashMap;
use std::sync::RwLock;

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Async storage trait for agent conversation logs and accounts.
///
/// Memories are append-only: nothing mutates or deletes an entry except the
/// whole-agent deletion cascade. All "most recent" semantics follow creation
/// order.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // === Memory Operations ===

    /// Append a memory to its agent's log.
    async fn memory_insert(&self, memory: &Memory) -> KrillResult<()>;

    /// Most recent memories for an agent, newest first, at most `limit`.
    async fn memory_recent(&self, agent_id: EntityId, limit: usize) -> KrillResult<Vec<Memory>>;

    /// Two-tier broadcast lookup: the latest broadcast in this agent's own
    /// log, else the latest broadcast anywhere in the store.
    async fn broadcast_most_recent(&self, agent_id: EntityId) -> KrillResult<Option<Memory>>;

    /// Substring search over memory content, newest first.
    async fn memory_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>>;

    /// Substring search over attached reasoning, newest first.
    async fn reasoning_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>>;

    /// Substring search over broadcast content, newest first.
    async fn broadcast_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>>;

    /// Delete an agent's entire log (agent deletion cascade).
    async fn memory_delete_for_agent(&self, agent_id: EntityId) -> KrillResult<()>;

    // === Agent State Mirror ===

    /// Record an agent's lifecycle state and last error.
    async fn agent_state_update(
        &self,
        agent_id: EntityId,
        state: AgentState,
        last_error: Option<String>,
    ) -> KrillResult<()>;

    // === Account Operations ===

    /// Add an account to the pool.
    async fn account_insert(&self, account: &Account) -> KrillResult<()>;

    /// Two-phase claim: atomically select the first available account, bind
    /// it to `agent_id` and mark it in use. Returns the existing assignment
    /// unchanged if the agent already holds one; `None` if the pool has no
    /// available account.
    async fn account_claim(&self, agent_id: EntityId) -> KrillResult<Option<Account>>;

    /// The account permanently assigned to `agent_id`, if any.
    async fn account_get_assigned(&self, agent_id: EntityId) -> KrillResult<Option<Account>>;

    /// Mark an agent's assigned account as in active use.
    async fn account_mark_in_use(&self, agent_id: EntityId, in_use: bool) -> KrillResult<()>;

    /// Capture an externally registered credential as `agent_id`'s permanent
    /// assignment, including the registration response for replay.
    async fn account_capture_registration(
        &self,
        agent_id: EntityId,
        username: &str,
        secret: &str,
        response: serde_json::Value,
    ) -> KrillResult<Account>;

    /// Permanently release an agent's assignment back to the available pool.
    /// Only the agent deletion path calls this.
    async fn account_release(&self, agent_id: EntityId) -> KrillResult<()>;

    /// Return every merely in-use account to "assigned but not in use".
    /// Permanent assignments survive; used during process shutdown.
    async fn account_release_in_use(&self) -> KrillResult<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct StoreInner {
    /// Per-agent append-only logs, in insertion order
    logs: HashMap<EntityId, Vec<Memory>>,
    /// Agent state mirror
    states: HashMap<EntityId, (AgentState, Option<String>)>,
    /// Account pool, in insertion order
    accounts: Vec<Account>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> KrillResult<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| KrillError::Storage(StorageError::LockPoisoned))
    }

    fn write(&self) -> KrillResult<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| KrillError::Storage(StorageError::LockPoisoned))
    }

    /// Recorded state for an agent, for assertions and UI snapshots.
    pub fn recorded_state(&self, agent_id: EntityId) -> Option<(AgentState, Option<String>)> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.states.get(&agent_id).cloned())
    }

    /// Number of accounts with no permanent assignment.
    pub fn available_accounts(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.accounts.iter().filter(|a| a.is_available()).count())
            .unwrap_or(0)
    }

    fn search_logs<F>(inner: &StoreInner, limit: usize, matches: F) -> Vec<Memory>
    where
        F: Fn(&Memory) -> bool,
    {
        let mut hits: Vec<Memory> = inner
            .logs
            .values()
            .flatten()
            .filter(|m| matches(m))
            .cloned()
            .collect();
        // Newest first; UUIDv7 ids sort by creation time
        hits.sort_by(|a, b| b.memory_id.cmp(&a.memory_id));
        hits.truncate(limit);
        hits
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn memory_insert(&self, memory: &Memory) -> KrillResult<()> {
        let mut inner = self.write()?;
        inner
            .logs
            .entry(memory.agent_id)
            .or_default()
            .push(memory.clone());
        Ok(())
    }

    async fn memory_recent(&self, agent_id: EntityId, limit: usize) -> KrillResult<Vec<Memory>> {
        let inner = self.read()?;
        let log = inner.logs.get(&agent_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(log.iter().rev().take(limit).cloned().collect())
    }

    async fn broadcast_most_recent(&self, agent_id: EntityId) -> KrillResult<Option<Memory>> {
        let inner = self.read()?;

        // Tier 1: broadcasts delivered to this agent.
        if let Some(log) = inner.logs.get(&agent_id) {
            if let Some(hit) = log
                .iter()
                .rev()
                .find(|m| m.source == MemorySource::Broadcast)
            {
                return Ok(Some(hit.clone()));
            }
        }

        // Tier 2: the most recent broadcast anywhere in the swarm.
        Ok(inner
            .logs
            .values()
            .flatten()
            .filter(|m| m.source == MemorySource::Broadcast)
            .max_by(|a, b| a.memory_id.cmp(&b.memory_id))
            .cloned())
    }

    async fn memory_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>> {
        let inner = self.read()?;
        Ok(Self::search_logs(&inner, limit, |m| {
            m.content.contains(query)
        }))
    }

    async fn reasoning_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>> {
        let inner = self.read()?;
        Ok(Self::search_logs(&inner, limit, |m| {
            m.reasoning.as_deref().is_some_and(|r| r.contains(query))
        }))
    }

    async fn broadcast_search(&self, query: &str, limit: usize) -> KrillResult<Vec<Memory>> {
        let inner = self.read()?;
        Ok(Self::search_logs(&inner, limit, |m| {
            m.source == MemorySource::Broadcast && m.content.contains(query)
        }))
    }

    async fn memory_delete_for_agent(&self, agent_id: EntityId) -> KrillResult<()> {
        let mut inner = self.write()?;
        inner.logs.remove(&agent_id);
        inner.states.remove(&agent_id);
        Ok(())
    }

    async fn agent_state_update(
        &self,
        agent_id: EntityId,
        state: AgentState,
        last_error: Option<String>,
    ) -> KrillResult<()> {
        let mut inner = self.write()?;
        inner.states.insert(agent_id, (state, last_error));
        Ok(())
    }

    async fn account_insert(&self, account: &Account) -> KrillResult<()> {
        let mut inner = self.write()?;
        if inner.accounts.iter().any(|a| a.username == account.username) {
            return Err(KrillError::Storage(StorageError::InsertFailed {
                reason: format!("duplicate account username: {}", account.username),
            }));
        }
        inner.accounts.push(account.clone());
        Ok(())
    }

    async fn account_claim(&self, agent_id: EntityId) -> KrillResult<Option<Account>> {
        // Single write lock covers observe-available and commit, so two
        // concurrent claims cannot both take the same account.
        let mut inner = self.write()?;

        if let Some(existing) = inner
            .accounts
            .iter()
            .find(|a| a.assigned_to == Some(agent_id))
        {
            return Ok(Some(existing.clone()));
        }

        if let Some(account) = inner.accounts.iter_mut().find(|a| a.is_available()) {
            account.assigned_to = Some(agent_id);
            account.in_use = true;
            return Ok(Some(account.clone()));
        }

        Ok(None)
    }

    async fn account_get_assigned(&self, agent_id: EntityId) -> KrillResult<Option<Account>> {
        let inner = self.read()?;
        Ok(inner
            .accounts
            .iter()
            .find(|a| a.assigned_to == Some(agent_id))
            .cloned())
    }

    async fn account_mark_in_use(&self, agent_id: EntityId, in_use: bool) -> KrillResult<()> {
        let mut inner = self.write()?;
        if let Some(account) = inner
            .accounts
            .iter_mut()
            .find(|a| a.assigned_to == Some(agent_id))
        {
            account.in_use = in_use;
        }
        Ok(())
    }

    async fn account_capture_registration(
        &self,
        agent_id: EntityId,
        username: &str,
        secret: &str,
        response: serde_json::Value,
    ) -> KrillResult<Account> {
        let mut inner = self.write()?;
        let mut account = Account::new(username, secret);
        account.assigned_to = Some(agent_id);
        account.in_use = true;
        account.registration_response = Some(response);
        inner.accounts.push(account.clone());
        Ok(account)
    }

    async fn account_release(&self, agent_id: EntityId) -> KrillResult<()> {
        let mut inner = self.write()?;
        if let Some(account) = inner
            .accounts
            .iter_mut()
            .find(|a| a.assigned_to == Some(agent_id))
        {
            account.assigned_to = None;
            account.in_use = false;
            account.registration_response = None;
        }
        Ok(())
    }

    async fn account_release_in_use(&self) -> KrillResult<()> {
        let mut inner = self.write()?;
        for account in inner.accounts.iter_mut() {
            account.in_use = false;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
