//! Permanent credential pool.
//!
//! The pool manages assignments; enforcement happens at the `ToolProxy`
//! boundary. A proxy fronting a real external service routes any credential
//! an agent presents through `AccountPool::substitute`, so outbound calls
//! always run under the permanent assignment.

use krill_core::{new_entity_id, Account, AgentError, EntityId, KrillError, KrillResult};
use krill_llm::ToolProxy;
use krill_storage::MemoryStore;
use std::sync::Arc;

// ============================================================================
// ACCOUNT POOL
// ============================================================================

/// Pool of external credentials with exactly-once permanent assignment.
///
/// A claim is idempotent: an agent that already holds an assignment gets the
/// same account back, including the captured registration response, so the
/// external service is contacted at most once per credential. When the pool
/// is exhausted, a fresh credential is registered through the tool proxy and
/// captured as the agent's permanent assignment.
///
/// Assignments survive stop and relaunch; only agent deletion releases them.
pub struct AccountPool {
    store: Arc<dyn MemoryStore>,
    proxy: Arc<dyn ToolProxy>,
}

impl AccountPool {
    /// Create a pool over the given store and external registration proxy.
    pub fn new(store: Arc<dyn MemoryStore>, proxy: Arc<dyn ToolProxy>) -> Self {
        Self { store, proxy }
    }

    /// Add a pre-provisioned account to the pool.
    pub async fn add_account(&self, account: &Account) -> KrillResult<()> {
        self.store.account_insert(account).await
    }

    /// Claim a credential for an agent and mark it in active use.
    ///
    /// Idempotent: a repeat claim returns the existing assignment, captured
    /// registration response included, without contacting the external
    /// service again.
    pub async fn claim(&self, agent_id: EntityId) -> KrillResult<Account> {
        if let Some(account) = self.store.account_claim(agent_id).await? {
            // Re-claim after a stop or process restart: the assignment may
            // be parked as not-in-use.
            self.store.account_mark_in_use(agent_id, true).await?;
            return Ok(account);
        }
        tracing::info!(agent_id = %agent_id, "account pool exhausted, registering fresh credential");
        self.register_fresh(agent_id).await
    }

    /// Silently substitute the permanent assignment for whatever credential
    /// the agent presented. The presented username is ignored beyond
    /// logging; the agent always operates under its assigned account.
    pub async fn substitute(
        &self,
        agent_id: EntityId,
        presented_username: &str,
    ) -> KrillResult<Account> {
        let account = self.claim(agent_id).await?;
        if account.username != presented_username {
            tracing::debug!(
                agent_id = %agent_id,
                presented = presented_username,
                assigned = %account.username,
                "substituted permanent credential"
            );
        }
        Ok(account)
    }

    /// The assignment held by an agent, if any.
    pub async fn assigned(&self, agent_id: EntityId) -> KrillResult<Option<Account>> {
        self.store.account_get_assigned(agent_id).await
    }

    /// Permanently return an agent's credential to the pool. Only the agent
    /// deletion path releases assignments.
    pub async fn release(&self, agent_id: EntityId) -> KrillResult<()> {
        self.store.account_release(agent_id).await
    }

    async fn register_fresh(&self, agent_id: EntityId) -> KrillResult<Account> {
        let username = format!("krill-{}", agent_id.simple());
        let secret = new_entity_id().simple().to_string();
        let response = self
            .proxy
            .register(agent_id, &username, &secret)
            .await
            .map_err(|err| {
                KrillError::Agent(AgentError::ClaimFailed {
                    reason: err.to_string(),
                })
            })?;
        self.store
            .account_capture_registration(agent_id, &username, &secret, response)
            .await
    }
}

impl std::fmt::Debug for AccountPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPool").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use krill_llm::MockToolProxy;
    use krill_storage::InMemoryStore;

    fn pool() -> (AccountPool, Arc<InMemoryStore>, Arc<MockToolProxy>) {
        let store = Arc::new(InMemoryStore::new());
        let proxy = Arc::new(MockToolProxy::new());
        let pool = AccountPool::new(store.clone(), proxy.clone());
        (pool, store, proxy)
    }

    #[tokio::test]
    async fn test_claim_assigns_from_pool_and_marks_in_use() {
        let (pool, store, proxy) = pool();
        pool.add_account(&Account::new("mysis-01", "s1")).await.expect("add");

        let agent = new_entity_id();
        let account = pool.claim(agent).await.expect("claim");
        assert_eq!(account.username, "mysis-01");
        assert_eq!(store.available_accounts(), 0);
        assert!(proxy.recorded_registrations().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_across_restarts() {
        let (pool, store, _proxy) = pool();
        pool.add_account(&Account::new("mysis-01", "s1")).await.expect("add");
        pool.add_account(&Account::new("mysis-02", "s2")).await.expect("add");

        let agent = new_entity_id();
        let first = pool.claim(agent).await.expect("claim");

        // Stop parks the credential; the relaunch claim reactivates it.
        store.account_mark_in_use(agent, false).await.expect("park");
        let second = pool.claim(agent).await.expect("reclaim");

        assert_eq!(first.username, second.username);
        let held = pool.assigned(agent).await.expect("lookup").expect("assigned");
        assert!(held.in_use);
        assert_eq!(store.available_accounts(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_registers_fresh_credential() {
        let (pool, _store, proxy) = pool();
        let agent = new_entity_id();

        let account = pool.claim(agent).await.expect("claim");
        assert_eq!(account.assigned_to, Some(agent));
        assert!(account.registration_response.is_some());
        assert_eq!(proxy.recorded_registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_replays_captured_registration() {
        let (pool, _store, proxy) = pool();
        let agent = new_entity_id();

        let first = pool.claim(agent).await.expect("claim");
        let second = pool.claim(agent).await.expect("reclaim");

        // The external service was contacted exactly once; the captured
        // response is replayed on the second claim.
        assert_eq!(proxy.recorded_registrations().len(), 1);
        assert_eq!(first.username, second.username);
        assert_eq!(first.registration_response, second.registration_response);
    }

    #[tokio::test]
    async fn test_substitute_enforces_permanent_assignment() {
        let (pool, store, proxy) = pool();
        pool.add_account(&Account::new("mysis-01", "s1")).await.expect("add");

        let agent = new_entity_id();
        let original = pool.claim(agent).await.expect("claim");
        assert_eq!(original.username, "mysis-01");

        // A foreign credential presented by the agent is ignored; the
        // permanent assignment comes back and nothing new is registered.
        let substituted = pool.substitute(agent, "stolen-account").await.expect("substitute");
        assert_eq!(substituted.username, original.username);
        assert!(proxy.recorded_registrations().is_empty());
        assert_eq!(store.available_accounts(), 0);
    }

    #[tokio::test]
    async fn test_registration_failure_surfaces_as_claim_failure() {
        let (pool, _store, proxy) = pool();
        proxy.fail_next("register", 1);

        // Empty pool, so the claim falls through to registration, which is
        // scripted to fail; nothing is assigned.
        let agent = new_entity_id();
        let failed = pool.claim(agent).await;
        assert!(matches!(
            failed,
            Err(KrillError::Agent(AgentError::ClaimFailed { .. }))
        ));
        assert!(pool.assigned(agent).await.expect("lookup").is_none());

        // A later claim retries registration from scratch.
        let account = pool.claim(agent).await.expect("claim");
        assert_eq!(account.assigned_to, Some(agent));
        assert_eq!(proxy.recorded_registrations().len(), 1);
    }

    #[tokio::test]
    async fn test_release_returns_to_pool() {
        let (pool, store, _proxy) = pool();
        pool.add_account(&Account::new("mysis-01", "s1")).await.expect("add");

        let agent = new_entity_id();
        pool.claim(agent).await.expect("claim");
        pool.release(agent).await.expect("release");

        assert!(pool.assigned(agent).await.expect("lookup").is_none());
        assert_eq!(store.available_accounts(), 1);
    }
}
