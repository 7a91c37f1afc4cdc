//! Change Request Manager - two-party consent for changing contract terms
//!
//! A party proposes a [`ChangeDiff`] on an active contract; only the
//! counterparty can accept or reject it. At most one request is pending per
//! contract. Amounts can only change, and milestones only be removed, while
//! the milestone is pending and its escrow is still unfunded.

use crate::{
    activity::events,
    contracts::{push_milestone, validate_amount, validate_terms},
    disputes::ensure_contract_unfrozen,
    error::EscrowError,
    lifecycle::{ChangeRequestState, ContractState, EscrowState, Lifecycle, MilestoneState},
    models::{ActivityLogEntry, ChangeDiff, ChangeRequest, Contract, Milestone, MilestoneTerms},
    policy::{ensure_can_view, Actor, Authority},
    store::ChangeSet,
    transition::{Scope, Staged, TransitionRunner},
    EscrowResult,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

fn ensure_active(contract: &Contract) -> EscrowResult<()> {
    if contract.state != ContractState::Active {
        return Err(EscrowError::invalid_state(
            ContractState::ENTITY,
            contract.state.as_str(),
            contract.state.as_str(),
            "terms can only change while the contract is active",
        ));
    }
    Ok(())
}

fn ensure_pending(request: &ChangeRequest, to: ChangeRequestState) -> EscrowResult<()> {
    if request.state != ChangeRequestState::Pending {
        return Err(EscrowError::invalid_state(
            ChangeRequestState::ENTITY,
            request.state.as_str(),
            to.as_str(),
            "change request is already closed",
        ));
    }
    Ok(())
}

fn non_empty_title(title: &Option<String>) -> EscrowResult<()> {
    match title {
        Some(title) if title.trim().is_empty() => Err(EscrowError::validation("Title cannot be empty")),
        _ => Ok(()),
    }
}

/// Proposes, answers and lists change requests
pub struct ChangeRequestManager {
    runner: Arc<TransitionRunner>,
}

impl ChangeRequestManager {
    pub fn new(runner: Arc<TransitionRunner>) -> Self {
        Self { runner }
    }

    /// Propose a change; fails with `ConflictError` while another is pending
    pub async fn create(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        diff: ChangeDiff,
        reason: Option<String>,
    ) -> EscrowResult<ChangeRequest> {
        self.runner
            .run(
                events::CHANGE_REQUEST_CREATED,
                actor,
                Authority::Participant,
                Scope::Contract(contract_id),
                || async {
                    let mut contract = self.runner.load_contract(contract_id).await?;
                    Authority::Participant.authorize(
                        actor,
                        &[&contract.client_id, &contract.provider_id],
                        "propose changes to this contract",
                    )?;
                    ensure_contract_unfrozen(&contract)?;
                    ensure_active(&contract)?;

                    let requests = self.runner.store().change_requests_for_contract(contract_id).await?;
                    if let Some(pending) = requests.iter().find(|r| r.state == ChangeRequestState::Pending) {
                        return Err(EscrowError::conflict(format!(
                            "Change request {} is already pending on contract {}",
                            pending.id, contract_id
                        )));
                    }

                    // dry run against the current terms
                    self.apply_diff(&mut contract.clone(), &diff, &mut ChangeSet::new())
                        .await?;

                    let request = ChangeRequest::new(contract_id, actor.id.clone(), diff.clone(), reason.clone());

                    // bumping the contract version serialises concurrent proposals
                    contract.touch();
                    let mut changes = ChangeSet::new();
                    changes
                        .put_contract(contract)
                        .put_change_request(request.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract_id),
                            actor,
                            events::CHANGE_REQUEST_CREATED,
                            Authority::Participant,
                            serde_json::json!({
                                "change_request_id": request.id,
                                "diff": request.diff,
                                "reason": request.reason,
                            }),
                        ));

                    Ok(Staged::new(changes, request))
                },
            )
            .await
    }

    /// Counterparty accepts; the diff is re-validated and applied
    pub async fn accept(&self, change_request_id: Uuid, actor: &Actor) -> EscrowResult<ChangeRequest> {
        self.runner
            .run(
                events::CHANGE_REQUEST_ACCEPTED,
                actor,
                Authority::Participant,
                Scope::ChangeRequest(change_request_id),
                || async {
                    let mut request = self.runner.load_change_request(change_request_id).await?;
                    let mut contract = self.runner.load_contract(request.contract_id).await?;
                    self.authorize_counterparty(&contract, &request, actor)?;
                    ensure_pending(&request, ChangeRequestState::Accepted)?;
                    ensure_contract_unfrozen(&contract)?;
                    ensure_active(&contract)?;

                    let mut changes = ChangeSet::new();
                    self.apply_diff(&mut contract, &request.diff, &mut changes).await?;
                    contract.touch();

                    request.state.transition_to(ChangeRequestState::Accepted)?;
                    request.responder_id = Some(actor.id.clone());
                    request.resolved_at = Some(Utc::now());
                    request.updated_at = Utc::now();

                    changes
                        .put_contract(contract)
                        .put_change_request(request.clone())
                        .log(ActivityLogEntry::applied(
                            Some(request.contract_id),
                            actor,
                            events::CHANGE_REQUEST_ACCEPTED,
                            Authority::Participant,
                            serde_json::json!({
                                "change_request_id": request.id,
                                "diff": request.diff,
                            }),
                        ));

                    Ok(Staged::new(changes, request))
                },
            )
            .await
    }

    /// Counterparty rejects; nothing is applied
    pub async fn reject(&self, change_request_id: Uuid, actor: &Actor) -> EscrowResult<ChangeRequest> {
        self.close(
            change_request_id,
            actor,
            ChangeRequestState::Rejected,
            events::CHANGE_REQUEST_REJECTED,
        )
        .await
    }

    /// Proposer withdraws a pending request
    pub async fn cancel(&self, change_request_id: Uuid, actor: &Actor) -> EscrowResult<ChangeRequest> {
        self.close(
            change_request_id,
            actor,
            ChangeRequestState::Cancelled,
            events::CHANGE_REQUEST_CANCELLED,
        )
        .await
    }

    async fn close(
        &self,
        change_request_id: Uuid,
        actor: &Actor,
        to: ChangeRequestState,
        event: &'static str,
    ) -> EscrowResult<ChangeRequest> {
        self.runner
            .run(event, actor, Authority::Participant, Scope::ChangeRequest(change_request_id), || async {
                let mut request = self.runner.load_change_request(change_request_id).await?;
                let contract = self.runner.load_contract(request.contract_id).await?;

                if to == ChangeRequestState::Cancelled {
                    Authority::Participant.authorize(actor, &[&request.proposer_id], "withdraw this change request")?;
                } else {
                    self.authorize_counterparty(&contract, &request, actor)?;
                }
                ensure_pending(&request, to)?;

                request.state.transition_to(to)?;
                request.responder_id = Some(actor.id.clone());
                request.resolved_at = Some(Utc::now());
                request.updated_at = Utc::now();

                let mut changes = ChangeSet::new();
                changes
                    .guard_contract(&contract)
                    .put_change_request(request.clone())
                    .log(ActivityLogEntry::applied(
                        Some(request.contract_id),
                        actor,
                        event,
                        Authority::Participant,
                        serde_json::json!({ "change_request_id": request.id }),
                    ));

                Ok(Staged::new(changes, request))
            })
            .await
    }

    /// Change requests of a contract, oldest first
    pub async fn change_requests(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Vec<ChangeRequest>> {
        let contract = self.runner.load_contract(contract_id).await?;
        if let Err(err) = ensure_can_view(&contract, actor) {
            self.runner
                .deny(events::CONTRACT_VIEWED, actor, Some(contract_id), &err)
                .await;
            return Err(err);
        }
        self.runner.store().change_requests_for_contract(contract_id).await
    }

    fn authorize_counterparty(&self, contract: &Contract, request: &ChangeRequest, actor: &Actor) -> EscrowResult<()> {
        let counterparty = contract.counterparty(&request.proposer_id).unwrap_or_default();
        Authority::Participant.authorize(actor, &[counterparty], "answer this change request")
    }

    /// Validate `diff` against the contract's current terms and stage its writes
    async fn apply_diff(&self, contract: &mut Contract, diff: &ChangeDiff, changes: &mut ChangeSet) -> EscrowResult<()> {
        let limits = &self.runner.config().limits;

        match diff {
            ChangeDiff::UpdateTerms { title, description } => {
                if title.is_none() && description.is_none() {
                    return Err(EscrowError::validation("Change request changes nothing"));
                }
                non_empty_title(title)?;
                if let Some(title) = title {
                    contract.title = title.trim().to_string();
                }
                if let Some(description) = description {
                    contract.description = Some(description.clone());
                }
            }
            ChangeDiff::UpdateMilestone {
                milestone_id,
                title,
                description,
                amount,
            } => {
                if title.is_none() && description.is_none() && amount.is_none() {
                    return Err(EscrowError::validation("Change request changes nothing"));
                }
                non_empty_title(title)?;
                let mut milestone = self.contract_milestone(contract, *milestone_id).await?;
                if milestone.state.is_terminal() {
                    return Err(EscrowError::invalid_state(
                        MilestoneState::ENTITY,
                        milestone.state.as_str(),
                        milestone.state.as_str(),
                        "closed milestones cannot change",
                    ));
                }

                if let Some(title) = title {
                    milestone.title = title.trim().to_string();
                }
                if let Some(description) = description {
                    milestone.description = Some(description.clone());
                }
                if let Some(amount) = amount {
                    validate_amount(limits, *amount)?;
                    let mut escrow = self.runner.load_escrow(milestone.id).await?;
                    self.ensure_unfunded_pending(milestone.state, escrow.state)?;
                    escrow.reprice(*amount)?;
                    milestone.amount = *amount;
                    changes.put_escrow(escrow);
                }
                milestone.touch();
                changes.put_milestone(milestone);
            }
            ChangeDiff::AddMilestone {
                title,
                description,
                amount,
            } => {
                let terms = MilestoneTerms {
                    title: title.trim().to_string(),
                    description: description.clone(),
                    amount: *amount,
                };
                validate_terms(limits, &terms)?;
                if contract.milestone_ids.len() >= limits.max_milestones_per_contract {
                    return Err(EscrowError::validation(format!(
                        "Contract already has the maximum of {} milestones",
                        limits.max_milestones_per_contract
                    )));
                }

                let existing = self.runner.store().milestones_for_contract(contract.id).await?;
                let (milestone, escrow) = push_milestone(contract, &existing, terms);
                changes.put_milestone(milestone).put_escrow(escrow);
            }
            ChangeDiff::RemoveMilestone { milestone_id } => {
                let mut milestone = self.contract_milestone(contract, *milestone_id).await?;
                let escrow = self.runner.load_escrow(milestone.id).await?;
                self.ensure_unfunded_pending(milestone.state, escrow.state)?;
                if contract.milestone_ids.len() <= 1 {
                    return Err(EscrowError::validation("A contract must keep at least one milestone"));
                }

                milestone.state.transition_to(MilestoneState::Closed)?;
                milestone.touch();
                contract.milestone_ids.retain(|id| *id != milestone.id);
                changes.put_milestone(milestone);
            }
        }

        Ok(())
    }

    async fn contract_milestone(&self, contract: &Contract, milestone_id: Uuid) -> EscrowResult<Milestone> {
        if !contract.milestone_ids.contains(&milestone_id) {
            return Err(EscrowError::validation(format!(
                "Milestone {} is not part of contract {}",
                milestone_id, contract.id
            )));
        }
        self.runner.load_milestone(milestone_id).await
    }

    fn ensure_unfunded_pending(&self, milestone: MilestoneState, escrow: EscrowState) -> EscrowResult<()> {
        if milestone != MilestoneState::Pending || escrow != EscrowState::Unfunded {
            return Err(EscrowError::invalid_state(
                MilestoneState::ENTITY,
                milestone.as_str(),
                milestone.as_str(),
                format!("milestone work has begun or escrow is {}", escrow),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        models::EscrowAccount,
        store::{ContractStore, MemoryStore},
    };
    use rust_decimal::Decimal;

    async fn active_contract() -> (Arc<MemoryStore>, ChangeRequestManager, Contract, Vec<Uuid>) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(TransitionRunner::new(store.clone(), Arc::new(EngineConfig::default())));

        let mut contract = Contract::new("client".into(), "provider".into(), "Backend".into(), None);
        contract.state = ContractState::Active;
        let mut changes = ChangeSet::new();
        let mut ids = Vec::new();
        for position in 0..2u32 {
            let milestone = Milestone::new(
                contract.id,
                position,
                MilestoneTerms {
                    title: format!("Step {}", position),
                    description: None,
                    amount: Decimal::from(100),
                },
            );
            let mut escrow = EscrowAccount::new(contract.id, milestone.id, milestone.amount);
            if position == 0 {
                escrow.fund(milestone.amount, None).unwrap();
            }
            contract.milestone_ids.push(milestone.id);
            ids.push(milestone.id);
            changes.put_milestone(milestone).put_escrow(escrow);
        }
        changes.put_contract(contract.clone());
        store.commit(changes).await.unwrap();

        (store, ChangeRequestManager::new(runner), contract, ids)
    }

    fn reprice(milestone_id: Uuid, amount: i64) -> ChangeDiff {
        ChangeDiff::UpdateMilestone {
            milestone_id,
            title: None,
            description: None,
            amount: Some(Decimal::from(amount)),
        }
    }

    #[tokio::test]
    async fn test_one_pending_request_per_contract() {
        let (_store, manager, contract, ids) = active_contract().await;
        let client = Actor::user("client");

        manager.create(contract.id, &client, reprice(ids[1], 150), None).await.unwrap();
        let err = manager
            .create(contract.id, &Actor::user("provider"), reprice(ids[1], 90), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConflictError");
    }

    #[tokio::test]
    async fn test_counterparty_accepts_and_diff_applies() {
        let (store, manager, contract, ids) = active_contract().await;
        let request = manager
            .create(contract.id, &Actor::user("client"), reprice(ids[1], 150), Some("scope grew".into()))
            .await
            .unwrap();

        let err = manager.accept(request.id, &Actor::user("client")).await.unwrap_err();
        assert_eq!(err.kind(), "PermissionError");

        let accepted = manager.accept(request.id, &Actor::user("provider")).await.unwrap();
        assert_eq!(accepted.state, ChangeRequestState::Accepted);

        let milestone = store.milestone(ids[1]).await.unwrap().unwrap();
        assert_eq!(milestone.amount, Decimal::from(150));
        let escrow = store.escrow_for_milestone(ids[1]).await.unwrap().unwrap();
        assert_eq!(escrow.required_amount, Decimal::from(150));
    }

    #[tokio::test]
    async fn test_funded_milestone_amount_is_fixed() {
        let (_store, manager, contract, ids) = active_contract().await;
        let err = manager
            .create(contract.id, &Actor::user("provider"), reprice(ids[0], 200), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");
    }

    #[tokio::test]
    async fn test_add_and_remove_milestones() {
        let (store, manager, contract, ids) = active_contract().await;
        let client = Actor::user("client");
        let provider = Actor::user("provider");

        let add = ChangeDiff::AddMilestone {
            title: "Docs".into(),
            description: None,
            amount: Decimal::new(4050, 2),
        };
        let request = manager.create(contract.id, &provider, add, None).await.unwrap();
        manager.accept(request.id, &client).await.unwrap();
        let stored = store.contract(contract.id).await.unwrap().unwrap();
        assert_eq!(stored.milestone_ids.len(), 3);

        let remove = ChangeDiff::RemoveMilestone { milestone_id: ids[1] };
        let request = manager.create(contract.id, &client, remove, None).await.unwrap();
        manager.accept(request.id, &provider).await.unwrap();

        let stored = store.contract(contract.id).await.unwrap().unwrap();
        assert!(!stored.milestone_ids.contains(&ids[1]));
        let removed = store.milestone(ids[1]).await.unwrap().unwrap();
        assert_eq!(removed.state, MilestoneState::Closed);
    }

    #[tokio::test]
    async fn test_reject_and_cancel() {
        let (_store, manager, contract, ids) = active_contract().await;
        let client = Actor::user("client");
        let provider = Actor::user("provider");

        let request = manager.create(contract.id, &client, reprice(ids[1], 120), None).await.unwrap();
        let err = manager.cancel(request.id, &provider).await.unwrap_err();
        assert_eq!(err.kind(), "PermissionError");
        let rejected = manager.reject(request.id, &provider).await.unwrap();
        assert_eq!(rejected.state, ChangeRequestState::Rejected);

        let request = manager.create(contract.id, &client, reprice(ids[1], 130), None).await.unwrap();
        let cancelled = manager.cancel(request.id, &client).await.unwrap();
        assert_eq!(cancelled.state, ChangeRequestState::Cancelled);
        let err = manager.accept(request.id, &provider).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");

        assert_eq!(manager.change_requests(contract.id, &client).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_diff_is_invalid() {
        let (_store, manager, contract, _ids) = active_contract().await;
        let diff = ChangeDiff::UpdateTerms {
            title: None,
            description: None,
        };
        let err = manager.create(contract.id, &Actor::user("client"), diff, None).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }
}
