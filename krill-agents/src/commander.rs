//! Swarm orchestrator: lifecycle, routing, shutdown.

use crate::accounts::AccountPool;
use crate::agent::{Agent, AgentRuntime, AgentSnapshot};
use krill_core::{
    AgentBinding, AgentError, AgentState, EntityId, KrillError, KrillResult, Memory, SwarmEvent,
    SwarmEventKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// COMMANDER
// ============================================================================

struct AgentEntry {
    agent: Arc<Agent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Owner of the swarm: creates, starts, stops, and deletes agents, routes
/// direct and broadcast messages, and tears everything down in order.
///
/// Population is bounded by `SwarmConfig::max_agents`. Every start claims a
/// credential from the [`AccountPool`]; the assignment is permanent and only
/// deletion releases it.
pub struct Commander {
    runtime: Arc<AgentRuntime>,
    accounts: AccountPool,
    agents: RwLock<HashMap<EntityId, AgentEntry>>,
}

impl Commander {
    /// Create a commander over the given runtime services.
    pub fn new(runtime: AgentRuntime) -> Self {
        let runtime = Arc::new(runtime);
        let accounts = AccountPool::new(Arc::clone(&runtime.store), Arc::clone(&runtime.tools));
        Self {
            runtime,
            accounts,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// The credential pool backing this swarm.
    pub fn accounts(&self) -> &AccountPool {
        &self.accounts
    }

    fn agents_read(&self) -> RwLockReadGuard<'_, HashMap<EntityId, AgentEntry>> {
        self.agents.read().expect("agent registry poisoned")
    }

    fn agents_write(&self) -> RwLockWriteGuard<'_, HashMap<EntityId, AgentEntry>> {
        self.agents.write().expect("agent registry poisoned")
    }

    fn agent(&self, agent_id: EntityId) -> KrillResult<Arc<Agent>> {
        self.agents_read()
            .get(&agent_id)
            .map(|entry| Arc::clone(&entry.agent))
            .ok_or(KrillError::Agent(AgentError::NotFound { agent_id }))
    }

    // === Lifecycle ===

    /// Create an idle agent with a mission directive as its first memory.
    pub async fn create_agent(
        &self,
        name: &str,
        binding: AgentBinding,
        mission: &str,
    ) -> KrillResult<EntityId> {
        let agent = {
            let mut agents = self.agents_write();
            if agents.len() >= self.runtime.config.max_agents {
                return Err(KrillError::Agent(AgentError::PopulationLimit {
                    limit: self.runtime.config.max_agents,
                }));
            }
            let agent = Arc::new(Agent::new(name, binding));
            agents.insert(
                agent.id(),
                AgentEntry {
                    agent: Arc::clone(&agent),
                    worker: Mutex::new(None),
                },
            );
            agent
        };

        let agent_id = agent.id();
        self.runtime
            .store
            .memory_insert(&Memory::system(agent_id, mission))
            .await?;
        self.runtime
            .store
            .agent_state_update(agent_id, AgentState::Idle, None)
            .await?;
        let _ = self
            .runtime
            .bus
            .publish(&SwarmEvent::state_changed(agent_id, AgentState::Idle));
        tracing::info!(agent_id = %agent_id, name, "agent created");
        Ok(agent_id)
    }

    /// Start an agent's turn loop. Claims the agent's credential first, so
    /// a failed claim leaves the agent in its previous state.
    pub async fn start_agent(&self, agent_id: EntityId) -> KrillResult<()> {
        let agent = self.agent(agent_id)?;

        let account = self.accounts.claim(agent_id).await?;
        tracing::debug!(agent_id = %agent_id, username = %account.username, "credential attached");

        let cancel = agent.begin_run()?;
        self.runtime
            .store
            .agent_state_update(agent_id, AgentState::Running, None)
            .await?;
        let _ = self
            .runtime
            .bus
            .publish(&SwarmEvent::state_changed(agent_id, AgentState::Running));

        let worker_agent = Arc::clone(&agent);
        let runtime = Arc::clone(&self.runtime);
        let handle = tokio::spawn(async move {
            worker_agent.run(&runtime, cancel).await;
        });
        if let Some(entry) = self.agents_read().get(&agent_id) {
            let mut worker = entry.worker.lock().expect("worker handle poisoned");
            if let Some(previous) = worker.replace(handle) {
                // begin_run guarantees the previous run has ended.
                previous.abort();
            }
        }
        tracing::info!(agent_id = %agent_id, "agent started");
        Ok(())
    }

    /// Relaunch a stopped or errored agent. The previous error is cleared.
    pub async fn relaunch_agent(&self, agent_id: EntityId) -> KrillResult<()> {
        self.start_agent(agent_id).await
    }

    /// Stop a running agent and wait, bounded, for its in-flight turn.
    pub async fn stop_agent(&self, agent_id: EntityId) -> KrillResult<()> {
        let agent = self.agent(agent_id)?;
        agent.request_stop()?;
        self.join_worker(agent_id, self.runtime.config.stop_wait_timeout)
            .await;

        self.runtime
            .store
            .agent_state_update(agent_id, AgentState::Stopped, agent.last_error())
            .await?;
        self.runtime.store.account_mark_in_use(agent_id, false).await?;
        let _ = self
            .runtime
            .bus
            .publish(&SwarmEvent::state_changed(agent_id, AgentState::Stopped));
        tracing::info!(agent_id = %agent_id, "agent stopped");
        Ok(())
    }

    /// Delete an agent: cancel its worker, permanently release its
    /// credential, and cascade-delete its conversation log.
    pub async fn delete_agent(&self, agent_id: EntityId) -> KrillResult<()> {
        let agent = self.agent(agent_id)?;
        agent.force_cancel();
        self.join_worker(agent_id, self.runtime.config.stop_wait_timeout)
            .await;

        self.accounts.release(agent_id).await?;
        self.runtime.store.memory_delete_for_agent(agent_id).await?;
        self.agents_write().remove(&agent_id);
        let _ = self.runtime.bus.publish(&SwarmEvent::new(
            SwarmEventKind::StateChanged,
            agent_id,
            serde_json::json!({ "state": "deleted" }),
        ));
        tracing::info!(agent_id = %agent_id, "agent deleted");
        Ok(())
    }

    async fn join_worker(&self, agent_id: EntityId, wait: Duration) {
        let handle = self.agents_read().get(&agent_id).and_then(|entry| {
            entry
                .worker
                .lock()
                .expect("worker handle poisoned")
                .take()
        });
        if let Some(mut handle) = handle {
            if tokio::time::timeout(wait, &mut handle).await.is_err() {
                tracing::warn!(agent_id = %agent_id, "worker did not finish in time, aborting");
                handle.abort();
            }
        }
    }

    // === Routing ===

    /// Deliver a direct operator message. Stopped and errored agents reject
    /// messages until relaunched.
    pub async fn send_direct(&self, agent_id: EntityId, content: &str) -> KrillResult<()> {
        let agent = self.agent(agent_id)?;
        let state = agent.state();
        if !state.accepts_messages() {
            return Err(KrillError::Agent(AgentError::NotAccepting {
                agent_id,
                state: state.to_string(),
            }));
        }
        self.runtime
            .store
            .memory_insert(&Memory::direct(agent_id, content))
            .await?;
        let _ = self.runtime.bus.publish(&SwarmEvent::new(
            SwarmEventKind::MemoryAppended,
            agent_id,
            serde_json::json!({ "shape": "direct" }),
        ));
        Ok(())
    }

    /// Route a broadcast to every accepting agent except the sender.
    ///
    /// `sender_id` is `None` for operator broadcasts. Idle recipients are
    /// started so the message is acted on. Per-recipient failures are
    /// reported on the bus and do not abort delivery to the rest. Returns
    /// the number of agents reached.
    pub async fn broadcast(&self, sender_id: Option<EntityId>, content: &str) -> KrillResult<usize> {
        let recipients: Vec<Arc<Agent>> = self
            .agents_read()
            .values()
            .map(|entry| Arc::clone(&entry.agent))
            .collect();

        let mut delivered = 0usize;
        for agent in recipients {
            let agent_id = agent.id();
            if Some(agent_id) == sender_id {
                continue;
            }
            if !agent.state().accepts_messages() {
                continue;
            }
            if let Err(err) = self
                .runtime
                .store
                .memory_insert(&Memory::broadcast(agent_id, sender_id, content))
                .await
            {
                tracing::warn!(agent_id = %agent_id, error = %err, "broadcast delivery failed");
                let _ = self
                    .runtime
                    .bus
                    .publish(&SwarmEvent::error(agent_id, &err.to_string()));
                continue;
            }
            delivered += 1;
            if agent.state() == AgentState::Idle {
                if let Err(err) = self.start_agent(agent_id).await {
                    tracing::warn!(agent_id = %agent_id, error = %err, "broadcast auto-start failed");
                    let _ = self
                        .runtime
                        .bus
                        .publish(&SwarmEvent::error(agent_id, &err.to_string()));
                }
            }
        }

        let _ = self.runtime.bus.publish(&SwarmEvent::new(
            SwarmEventKind::Broadcast,
            sender_id.unwrap_or_else(EntityId::nil),
            serde_json::json!({
                "from": sender_id.map(|id| id.to_string()),
                "delivered": delivered,
            }),
        ));
        tracing::debug!(delivered, "broadcast routed");
        Ok(delivered)
    }

    // === Introspection ===

    /// Snapshots of every agent, ordered by creation.
    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        let mut snapshots: Vec<AgentSnapshot> = self
            .agents_read()
            .values()
            .map(|entry| entry.agent.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.agent_id);
        snapshots
    }

    pub fn agent_snapshot(&self, agent_id: EntityId) -> KrillResult<AgentSnapshot> {
        self.agent(agent_id).map(|agent| agent.snapshot())
    }

    pub fn agent_count(&self) -> usize {
        self.agents_read().len()
    }

    // === Shutdown ===

    /// Shut the swarm down: cancel every worker, wait for each within the
    /// configured bound, park in-use credentials, and close the bus last so
    /// workers can still publish while winding down and blocked observers
    /// wake only once the swarm is quiet.
    pub async fn shutdown(&self) -> KrillResult<()> {
        let ids: Vec<EntityId> = self.agents_read().keys().copied().collect();
        for agent_id in &ids {
            if let Ok(agent) = self.agent(*agent_id) {
                agent.force_cancel();
            }
        }
        for agent_id in &ids {
            self.join_worker(*agent_id, self.runtime.config.shutdown_wait_timeout)
                .await;
        }
        for agent_id in &ids {
            if let Ok(agent) = self.agent(*agent_id) {
                let _ = self
                    .runtime
                    .store
                    .agent_state_update(*agent_id, agent.state(), agent.last_error())
                    .await;
            }
        }
        self.runtime.store.account_release_in_use().await?;
        self.runtime.bus.close();
        tracing::info!(agents = ids.len(), "swarm shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("agents", &self.agent_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
