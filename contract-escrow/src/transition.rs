//! Transition runner
//!
//! Every state-changing operation is staged against a fresh snapshot and
//! committed as one [`ChangeSet`]. A stale snapshot is re-staged up to
//! `concurrency.max_commit_retries` times; after that the caller gets a
//! `ConflictError`. Denied transitions are written to the activity log
//! before the error is returned.

use crate::{
    activity::record_denial,
    config::EngineConfig,
    error::EscrowError,
    models::{ChangeRequest, Contract, Dispute, EscrowAccount, Milestone},
    policy::{Actor, Authority},
    store::{ChangeSet, ContractStore},
    EscrowResult,
};
use std::{future::Future, sync::Arc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of staging a transition: the writes and the value to return
#[derive(Debug)]
pub struct Staged<T> {
    pub changes: ChangeSet,
    pub value: T,
}

impl<T> Staged<T> {
    pub fn new(changes: ChangeSet, value: T) -> Self {
        Self { changes, value }
    }
}

/// Entity a transition targets, used to attribute denials to a contract
#[derive(Debug, Clone)]
pub enum Scope {
    Contract(Uuid),
    Milestone(Uuid),
    ChangeRequest(Uuid),
    Dispute(Uuid),
    Payment(String),
    /// Nothing persisted yet, e.g. contract creation
    Unscoped,
}

/// Stages, commits and audits transitions against one store
pub struct TransitionRunner {
    store: Arc<dyn ContractStore>,
    config: Arc<EngineConfig>,
}

impl TransitionRunner {
    pub fn new(store: Arc<dyn ContractStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &dyn ContractStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `stage` until its change set commits, a domain error occurs or
    /// retries are exhausted
    pub async fn run<T, F, Fut>(
        &self,
        event: &'static str,
        actor: &Actor,
        authority: Authority,
        scope: Scope,
        mut stage: F,
    ) -> EscrowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EscrowResult<Staged<T>>>,
    {
        let max_retries = self.config.concurrency.max_commit_retries;
        let mut attempt = 0;

        loop {
            let result = match stage().await {
                Ok(staged) if staged.changes.is_empty() => {
                    debug!("Nothing to apply for {} on {:?}", event, scope);
                    return Ok(staged.value);
                }
                Ok(staged) => self.store.commit(staged.changes).await.map(|()| staged.value),
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(value) => {
                    info!("Applied {} by {} on {:?}", event, actor.id, scope);
                    return Ok(value);
                }
                Err(EscrowError::StaleWrite { entity, id }) if attempt < max_retries => {
                    attempt += 1;
                    debug!(
                        "Stale {} {} during {}, retrying (attempt {})",
                        entity, id, event, attempt
                    );
                    continue;
                }
                Err(EscrowError::StaleWrite { entity, id }) => EscrowError::conflict(format!(
                    "{} {} was modified concurrently; {} not applied",
                    entity, id, event
                )),
                Err(err) => err,
            };

            if err.is_audited() {
                warn!("Rejected {} by {} on {:?}: {}", event, actor.id, scope, err);
                let contract_id = self.resolve_contract(&scope).await;
                let mut changes = ChangeSet::new();
                changes.log(crate::models::ActivityLogEntry::rejected(
                    contract_id,
                    actor,
                    event,
                    authority,
                    &err,
                ));
                if let Err(store_err) = self.store.commit(changes).await {
                    error!("Failed to record rejection of {}: {}", event, store_err);
                }
            } else if matches!(err, EscrowError::Storage(_)) {
                error!("Storage failure during {}: {}", event, err);
            }

            return Err(err);
        }
    }

    /// Audit a denial that happened outside `run`
    pub async fn deny(&self, event: &str, actor: &Actor, contract_id: Option<Uuid>, err: &EscrowError) {
        record_denial(self.store.as_ref(), contract_id, actor, event, err).await;
    }

    async fn resolve_contract(&self, scope: &Scope) -> Option<Uuid> {
        let lookup = match scope {
            Scope::Contract(id) => return Some(*id),
            Scope::Unscoped => return None,
            Scope::Milestone(id) => self.store.milestone(*id).await.map(|m| m.map(|m| m.contract_id)),
            Scope::ChangeRequest(id) => self
                .store
                .change_request(*id)
                .await
                .map(|r| r.map(|r| r.contract_id)),
            Scope::Dispute(id) => self.store.dispute(*id).await.map(|d| d.map(|d| d.contract_id)),
            Scope::Payment(transaction_id) => self
                .store
                .payment_transaction(transaction_id)
                .await
                .map(|p| p.map(|p| p.contract_id)),
        };
        lookup.ok().flatten()
    }

    // Snapshot loaders

    pub async fn load_contract(&self, id: Uuid) -> EscrowResult<Contract> {
        self.store
            .contract(id)
            .await?
            .ok_or_else(|| EscrowError::not_found("contract", id))
    }

    pub async fn load_milestone(&self, id: Uuid) -> EscrowResult<Milestone> {
        self.store
            .milestone(id)
            .await?
            .ok_or_else(|| EscrowError::not_found("milestone", id))
    }

    pub async fn load_escrow(&self, milestone_id: Uuid) -> EscrowResult<EscrowAccount> {
        self.store
            .escrow_for_milestone(milestone_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("escrow", milestone_id))
    }

    pub async fn load_change_request(&self, id: Uuid) -> EscrowResult<ChangeRequest> {
        self.store
            .change_request(id)
            .await?
            .ok_or_else(|| EscrowError::not_found("change request", id))
    }

    pub async fn load_dispute(&self, id: Uuid) -> EscrowResult<Dispute> {
        self.store
            .dispute(id)
            .await?
            .ok_or_else(|| EscrowError::not_found("dispute", id))
    }

    /// Milestones and their escrow accounts in position order
    pub async fn load_work(&self, contract_id: Uuid) -> EscrowResult<Vec<(Milestone, EscrowAccount)>> {
        let milestones = self.store.milestones_for_contract(contract_id).await?;
        let mut work = Vec::with_capacity(milestones.len());
        for milestone in milestones {
            let escrow = self.load_escrow(milestone.id).await?;
            work.push((milestone, escrow));
        }
        Ok(work)
    }
}
