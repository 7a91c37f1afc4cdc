//! Contract Manager - contract-level lifecycle
//!
//! `draft → sent → accepted/declined`, `accepted → active` once escrow is
//! funded, `active ⇄ paused`, `completed` once every milestone is
//! released, and policy-gated cancellation. Admin overrides reach the same
//! transition functions with [`Authority::Override`].

use crate::{
    activity::events,
    config::LimitsConfig,
    disputes::{ensure_contract_unfrozen, ensure_no_open_disputes},
    error::EscrowError,
    lifecycle::{ChangeRequestState, ContractState, Lifecycle, MilestoneState},
    models::{ActivityLogEntry, Contract, EscrowAccount, Milestone, MilestoneTerms, Settlement},
    policy::{authorize_user_data, ensure_can_view, Actor, Authority},
    store::ChangeSet,
    transition::{Scope, Staged, TransitionRunner},
    EscrowResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Contract creation request; the calling actor becomes the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContractRequest {
    pub provider_id: String,
    pub title: String,
    pub description: Option<String>,
    pub milestones: Vec<MilestoneTerms>,
}

/// Partial update of a draft milestone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestoneUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub amount: Option<Decimal>,
}

/// What happens to still-funded escrow when a contract is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowDisposition {
    /// Return held funds to the client
    Refund,
    /// Pay held funds to the provider
    Release,
}

/// Validate a milestone amount against the configured limits
pub(crate) fn validate_amount(limits: &LimitsConfig, amount: Decimal) -> EscrowResult<()> {
    if amount <= Decimal::ZERO {
        return Err(EscrowError::validation("Milestone amount must be greater than 0"));
    }

    if amount > limits.max_milestone_amount {
        return Err(EscrowError::validation(format!(
            "Milestone amount {} exceeds maximum {}",
            amount, limits.max_milestone_amount
        )));
    }

    if amount.normalize().scale() > limits.currency_scale {
        return Err(EscrowError::validation(format!(
            "Milestone amount {} has more than {} decimal places",
            amount, limits.currency_scale
        )));
    }

    Ok(())
}

/// Validate milestone terms
pub(crate) fn validate_terms(limits: &LimitsConfig, terms: &MilestoneTerms) -> EscrowResult<()> {
    if terms.title.trim().is_empty() {
        return Err(EscrowError::validation("Milestone title cannot be empty"));
    }
    validate_amount(limits, terms.amount)
}

/// Append a new milestone and its escrow account to a contract
pub(crate) fn push_milestone(
    contract: &mut Contract,
    existing: &[Milestone],
    terms: MilestoneTerms,
) -> (Milestone, EscrowAccount) {
    let position = existing.iter().map(|m| m.position + 1).max().unwrap_or(0);
    let milestone = Milestone::new(contract.id, position, terms);
    let escrow = EscrowAccount::new(contract.id, milestone.id, milestone.amount);
    contract.milestone_ids.push(milestone.id);
    contract.touch();
    (milestone, escrow)
}

/// Whether the contract should move to `completed`.
///
/// Milestones dropped by a change request no longer count.
pub(crate) fn completion_due(contract: &Contract, milestones: &[Milestone]) -> bool {
    let mut current = milestones
        .iter()
        .filter(|m| contract.milestone_ids.contains(&m.id))
        .peekable();

    matches!(contract.state, ContractState::Active | ContractState::Paused)
        && current.peek().is_some()
        && current.all(|m| m.state == MilestoneState::Released)
}

/// Close every non-terminal milestone and settle still-funded escrow.
///
/// Milestones end in `closed`; the escrow state records where the money went.
pub(crate) fn close_open_work(
    work: Vec<(Milestone, EscrowAccount)>,
    disposition: EscrowDisposition,
    changes: &mut ChangeSet,
) -> EscrowResult<Vec<Settlement>> {
    let mut settlements = Vec::new();

    for (mut milestone, mut escrow) in work {
        if milestone.state.is_terminal() {
            continue;
        }

        if escrow.is_funded() {
            let settlement = match disposition {
                EscrowDisposition::Refund => escrow.refund()?,
                EscrowDisposition::Release => escrow.release()?,
            };
            settlements.push(settlement);
            changes.put_escrow(escrow);
        }

        milestone.state.transition_to(MilestoneState::Closed)?;
        milestone.open_dispute_id = None;
        milestone.frozen_state = None;
        milestone.touch();
        changes.put_milestone(milestone);
    }

    Ok(settlements)
}

/// Stage the move to `completed` when the writes in `changes` leave every
/// current milestone released.
///
/// Staged milestones and contract take precedence over `stored`, so a
/// release and the completion it causes commit together.
pub(crate) fn stage_completion(
    contract: &Contract,
    stored: Vec<Milestone>,
    changes: &mut ChangeSet,
) -> EscrowResult<Option<Contract>> {
    let mut contract = changes
        .contracts
        .iter()
        .find(|c| c.id == contract.id)
        .cloned()
        .unwrap_or_else(|| contract.clone());
    let milestones: Vec<Milestone> = stored
        .into_iter()
        .map(|m| {
            changes
                .milestones
                .iter()
                .find(|staged| staged.id == m.id)
                .cloned()
                .unwrap_or(m)
        })
        .collect();

    if !completion_due(&contract, &milestones) {
        return Ok(None);
    }

    contract.state.transition_to(ContractState::Completed)?;
    contract.closed_at = Some(Utc::now());
    contract.touch();

    let current: Vec<&Milestone> = milestones
        .iter()
        .filter(|m| contract.milestone_ids.contains(&m.id))
        .collect();
    let total: Decimal = current.iter().map(|m| m.amount).sum();

    changes
        .put_contract(contract.clone())
        .log(ActivityLogEntry::applied(
            Some(contract.id),
            &Actor::system(),
            events::CONTRACT_COMPLETED,
            Authority::Participant,
            serde_json::json!({
                "milestones": current.len(),
                "total_released": total,
            }),
        ));

    Ok(Some(contract))
}

/// Move the contract to `completed` if every milestone is released.
///
/// Idempotent: safe to call at any time, concurrently or on retry.
pub(crate) async fn reconcile_completion(
    runner: &TransitionRunner,
    contract_id: Uuid,
) -> EscrowResult<Contract> {
    runner
        .run(
            events::CONTRACT_COMPLETED,
            &Actor::system(),
            Authority::Participant,
            Scope::Contract(contract_id),
            || async {
                let contract = runner.load_contract(contract_id).await?;
                let milestones = runner.store().milestones_for_contract(contract_id).await?;
                let mut changes = ChangeSet::new();

                let completed = stage_completion(&contract, milestones, &mut changes)?;
                Ok(Staged::new(changes, completed.unwrap_or(contract)))
            },
        )
        .await
}

/// Manages contract lifecycle transitions
pub struct ContractManager {
    runner: Arc<TransitionRunner>,
}

impl ContractManager {
    pub fn new(runner: Arc<TransitionRunner>) -> Self {
        Self { runner }
    }

    /// Create a contract in `draft` with the actor as client
    pub async fn create_contract(
        &self,
        actor: &Actor,
        request: CreateContractRequest,
    ) -> EscrowResult<Contract> {
        self.runner
            .run(
                events::CONTRACT_CREATED,
                actor,
                Authority::Participant,
                Scope::Unscoped,
                || async {
                    self.validate_create_request(actor, &request)?;

                    let mut contract = Contract::new(
                        actor.id.clone(),
                        request.provider_id.clone(),
                        request.title.trim().to_string(),
                        request.description.clone(),
                    );

                    let mut changes = ChangeSet::new();
                    let mut milestones = Vec::new();
                    for terms in &request.milestones {
                        let (milestone, escrow) = push_milestone(&mut contract, &milestones, terms.clone());
                        changes.put_escrow(escrow);
                        milestones.push(milestone);
                    }

                    let total: Decimal = milestones.iter().map(|m| m.amount).sum();
                    changes.log(ActivityLogEntry::applied(
                        Some(contract.id),
                        actor,
                        events::CONTRACT_CREATED,
                        Authority::Participant,
                        serde_json::json!({
                            "title": contract.title,
                            "provider_id": contract.provider_id,
                            "milestones": milestones.len(),
                            "total_amount": total,
                        }),
                    ));
                    for milestone in milestones {
                        changes.put_milestone(milestone);
                    }
                    changes.put_contract(contract.clone());

                    Ok(Staged::new(changes, contract))
                },
            )
            .await
    }

    /// Add a milestone to a draft contract
    pub async fn add_milestone(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        terms: MilestoneTerms,
    ) -> EscrowResult<Milestone> {
        self.runner
            .run(
                events::MILESTONE_CREATED,
                actor,
                Authority::Participant,
                Scope::Contract(contract_id),
                || async {
                    let mut contract = self.runner.load_contract(contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.client_id], "add milestones")?;
                    ensure_draft(&contract, events::MILESTONE_CREATED, "milestones can only be added while the contract is a draft")?;

                    let limits = &self.runner.config().limits;
                    validate_terms(limits, &terms)?;
                    let existing = self.runner.store().milestones_for_contract(contract_id).await?;
                    if existing.len() >= limits.max_milestones_per_contract {
                        return Err(EscrowError::validation(format!(
                            "Contract already has the maximum of {} milestones",
                            limits.max_milestones_per_contract
                        )));
                    }

                    let (milestone, escrow) = push_milestone(&mut contract, &existing, terms.clone());
                    let mut changes = ChangeSet::new();
                    changes
                        .put_contract(contract)
                        .put_milestone(milestone.clone())
                        .put_escrow(escrow)
                        .log(ActivityLogEntry::applied(
                            Some(contract_id),
                            actor,
                            events::MILESTONE_CREATED,
                            Authority::Participant,
                            serde_json::json!({
                                "milestone_id": milestone.id,
                                "title": milestone.title,
                                "amount": milestone.amount,
                            }),
                        ));

                    Ok(Staged::new(changes, milestone))
                },
            )
            .await
    }

    /// Edit a milestone of a draft contract
    pub async fn update_milestone(
        &self,
        milestone_id: Uuid,
        actor: &Actor,
        update: MilestoneUpdate,
    ) -> EscrowResult<Milestone> {
        self.runner
            .run(
                events::MILESTONE_UPDATED,
                actor,
                Authority::Participant,
                Scope::Milestone(milestone_id),
                || async {
                    let mut milestone = self.runner.load_milestone(milestone_id).await?;
                    let contract = self.runner.load_contract(milestone.contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.client_id], "edit milestones")?;
                    ensure_draft(&contract, events::MILESTONE_UPDATED, "milestones can only be edited while the contract is a draft")?;

                    let mut changes = ChangeSet::new();
                    if let Some(title) = &update.title {
                        if title.trim().is_empty() {
                            return Err(EscrowError::validation("Milestone title cannot be empty"));
                        }
                        milestone.title = title.trim().to_string();
                    }
                    if let Some(description) = &update.description {
                        milestone.description = Some(description.clone());
                    }
                    if let Some(amount) = update.amount {
                        validate_amount(&self.runner.config().limits, amount)?;
                        let mut escrow = self.runner.load_escrow(milestone_id).await?;
                        escrow.reprice(amount)?;
                        milestone.amount = amount;
                        changes.put_escrow(escrow);
                    }
                    milestone.touch();

                    changes
                        .guard_contract(&contract)
                        .put_milestone(milestone.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract.id),
                            actor,
                            events::MILESTONE_UPDATED,
                            Authority::Participant,
                            serde_json::to_value(&update)?,
                        ));

                    Ok(Staged::new(changes, milestone))
                },
            )
            .await
    }

    /// Offer a draft contract to the provider
    pub async fn send(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.runner
            .run(
                events::CONTRACT_SENT,
                actor,
                Authority::Participant,
                Scope::Contract(contract_id),
                || async {
                    let mut contract = self.runner.load_contract(contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.client_id], "send this contract")?;
                    ensure_draft(&contract, ContractState::Sent.as_str(), "only draft contracts can be sent")?;

                    if contract.milestone_ids.is_empty() {
                        return Err(EscrowError::validation(
                            "A contract needs at least one milestone before it is sent",
                        ));
                    }

                    contract.state.transition_to(ContractState::Sent)?;
                    contract.touch();
                    Ok(self.stage_contract(contract, actor, Authority::Participant, events::CONTRACT_SENT, serde_json::json!({})))
                },
            )
            .await
    }

    /// Provider accepts the offer
    pub async fn accept(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.respond(contract_id, actor, ContractState::Accepted, events::CONTRACT_ACCEPTED)
            .await
    }

    /// Provider declines the offer
    pub async fn decline(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.respond(contract_id, actor, ContractState::Declined, events::CONTRACT_DECLINED)
            .await
    }

    async fn respond(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        to: ContractState,
        event: &'static str,
    ) -> EscrowResult<Contract> {
        self.runner
            .run(event, actor, Authority::Participant, Scope::Contract(contract_id), || async {
                let mut contract = self.runner.load_contract(contract_id).await?;
                Authority::Participant.authorize(actor, &[&contract.provider_id], "respond to this contract")?;

                if contract.state != ContractState::Sent {
                    return Err(EscrowError::invalid_state(
                        ContractState::ENTITY,
                        contract.state.as_str(),
                        to.as_str(),
                        "only sent contracts can be answered",
                    ));
                }

                contract.state.transition_to(to)?;
                contract.touch();

                let mut changes = ChangeSet::new();
                if to == ContractState::Accepted {
                    contract.accepted_at = Some(Utc::now());
                } else {
                    contract.closed_at = Some(Utc::now());
                    // nothing was funded yet; declined offers close their milestones
                    let work = self.runner.load_work(contract_id).await?;
                    close_open_work(work, EscrowDisposition::Refund, &mut changes)?;
                }

                changes.put_contract(contract.clone()).log(ActivityLogEntry::applied(
                    Some(contract_id),
                    actor,
                    event,
                    Authority::Participant,
                    serde_json::json!({ "state": contract.state }),
                ));
                Ok(Staged::new(changes, contract))
            })
            .await
    }

    /// Pause an active contract
    pub async fn pause(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.set_paused(contract_id, actor, Authority::Participant, true).await
    }

    /// Resume a paused contract
    pub async fn resume(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.set_paused(contract_id, actor, Authority::Participant, false).await
    }

    pub(crate) async fn set_paused(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        authority: Authority,
        paused: bool,
    ) -> EscrowResult<Contract> {
        let (event, from, to) = if paused {
            (events::CONTRACT_PAUSED, ContractState::Active, ContractState::Paused)
        } else {
            (events::CONTRACT_RESUMED, ContractState::Paused, ContractState::Active)
        };

        self.runner
            .run(event, actor, authority, Scope::Contract(contract_id), || async {
                let mut contract = self.runner.load_contract(contract_id).await?;
                let action = if paused { "pause this contract" } else { "resume this contract" };
                authority.authorize(actor, &[&contract.client_id, &contract.provider_id], action)?;
                if !authority.is_override() {
                    ensure_contract_unfrozen(&contract)?;
                }

                if contract.state != from {
                    return Err(EscrowError::invalid_state(
                        ContractState::ENTITY,
                        contract.state.as_str(),
                        to.as_str(),
                        format!("contract must be {}", from),
                    ));
                }

                contract.state.transition_to(to)?;
                contract.touch();
                Ok(self.stage_contract(contract, actor, authority, event, serde_json::json!({})))
            })
            .await
    }

    /// Cancel a contract on behalf of a party.
    ///
    /// Before acceptance the client may withdraw alone. Afterwards both
    /// parties must ask: the first call records the request, the
    /// counterparty's call completes it and refunds held escrow.
    pub async fn cancel(&self, contract_id: Uuid, actor: &Actor, reason: &str) -> EscrowResult<Contract> {
        self.cancel_with(contract_id, actor, Authority::Participant, reason, EscrowDisposition::Refund)
            .await
    }

    pub(crate) async fn cancel_with(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        authority: Authority,
        reason: &str,
        disposition: EscrowDisposition,
    ) -> EscrowResult<Contract> {
        self.runner
            .run(events::CONTRACT_CANCELLED, actor, authority, Scope::Contract(contract_id), || async {
                if reason.trim().is_empty() {
                    return Err(EscrowError::validation("A cancellation reason is required"));
                }

                let mut contract = self.runner.load_contract(contract_id).await?;
                authority.authorize(actor, &[&contract.client_id, &contract.provider_id], "cancel this contract")?;

                if contract.state.is_terminal() {
                    return Err(EscrowError::invalid_state(
                        ContractState::ENTITY,
                        contract.state.as_str(),
                        ContractState::Cancelled.as_str(),
                        "contract is already closed",
                    ));
                }

                let work = self.runner.load_work(contract_id).await?;
                let milestones: Vec<Milestone> = work.iter().map(|(m, _)| m.clone()).collect();
                ensure_no_open_disputes(&contract, &milestones)?;

                let mut changes = ChangeSet::new();
                if !authority.is_override() {
                    if milestones.iter().any(|m| m.state == MilestoneState::Released) {
                        return Err(EscrowError::invalid_state(
                            ContractState::ENTITY,
                            contract.state.as_str(),
                            ContractState::Cancelled.as_str(),
                            "a milestone has been released; only an admin override can cancel",
                        ));
                    }

                    match contract.state {
                        ContractState::Draft | ContractState::Sent => {
                            Authority::Participant.authorize(
                                actor,
                                &[&contract.client_id],
                                "withdraw this offer",
                            )?;
                        }
                        _ => match contract.cancellation_requested_by.clone() {
                            None => {
                                contract.cancellation_requested_by = Some(actor.id.clone());
                                contract.cancellation_reason = Some(reason.to_string());
                                contract.touch();
                                changes.put_contract(contract.clone()).log(ActivityLogEntry::applied(
                                    Some(contract_id),
                                    actor,
                                    events::CONTRACT_CANCELLATION_REQUESTED,
                                    authority,
                                    serde_json::json!({ "reason": reason }),
                                ));
                                return Ok(Staged::new(changes, contract));
                            }
                            Some(requester) if requester == actor.id => {
                                return Err(EscrowError::conflict(format!(
                                    "Cancellation already requested by {}; awaiting counterparty",
                                    requester
                                )));
                            }
                            Some(_) => {}
                        },
                    }
                }

                contract.state.transition_to(ContractState::Cancelled)?;
                contract.cancellation_reason = Some(reason.to_string());
                contract.closed_at = Some(Utc::now());
                contract.touch();

                let settlements = close_open_work(work, disposition, &mut changes)?;
                for mut request in self.runner.store().change_requests_for_contract(contract_id).await? {
                    if request.state == ChangeRequestState::Pending {
                        request.state.transition_to(ChangeRequestState::Cancelled)?;
                        request.resolved_at = Some(Utc::now());
                        request.updated_at = Utc::now();
                        changes.put_change_request(request);
                    }
                }

                changes.put_contract(contract.clone()).log(ActivityLogEntry::applied(
                    Some(contract_id),
                    actor,
                    events::CONTRACT_CANCELLED,
                    authority,
                    serde_json::json!({
                        "reason": reason,
                        "disposition": disposition,
                        "settlements": settlements,
                    }),
                ));
                Ok(Staged::new(changes, contract))
            })
            .await
    }

    /// Re-check whether every milestone is released and complete the contract
    pub async fn reconcile_completion(&self, contract_id: Uuid) -> EscrowResult<Contract> {
        reconcile_completion(&self.runner, contract_id).await
    }

    /// Read a contract as a party or admin
    pub async fn get_contract(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        let contract = self.runner.load_contract(contract_id).await?;
        if let Err(err) = ensure_can_view(&contract, actor) {
            self.runner
                .deny(events::CONTRACT_VIEWED, actor, Some(contract_id), &err)
                .await;
            return Err(err);
        }
        Ok(contract)
    }

    /// Milestones of a contract in execution order
    pub async fn milestones(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Vec<Milestone>> {
        self.get_contract(contract_id, actor).await?;
        self.runner.store().milestones_for_contract(contract_id).await
    }

    /// Contracts where `user_id` is a party; other users' data needs admin rights
    pub async fn contracts_for_user(&self, actor: &Actor, user_id: &str) -> EscrowResult<Vec<Contract>> {
        if let Err(err) = authorize_user_data(actor, user_id) {
            self.runner
                .deny(events::USER_DATA_ACCESS, actor, None, &err)
                .await;
            return Err(err);
        }
        self.runner.store().contracts_for_party(user_id).await
    }

    fn validate_create_request(&self, actor: &Actor, request: &CreateContractRequest) -> EscrowResult<()> {
        let limits = &self.runner.config().limits;

        if request.title.trim().is_empty() {
            return Err(EscrowError::validation("Title cannot be empty"));
        }

        if request.provider_id.trim().is_empty() {
            return Err(EscrowError::validation("Provider id cannot be empty"));
        }

        if request.provider_id == actor.id {
            return Err(EscrowError::validation(
                "Client and provider must be different users",
            ));
        }

        if request.milestones.len() > limits.max_milestones_per_contract {
            return Err(EscrowError::validation(format!(
                "{} milestones exceed maximum {}",
                request.milestones.len(),
                limits.max_milestones_per_contract
            )));
        }

        for terms in &request.milestones {
            validate_terms(limits, terms)?;
        }

        Ok(())
    }

    fn stage_contract(
        &self,
        contract: Contract,
        actor: &Actor,
        authority: Authority,
        event: &'static str,
        payload: serde_json::Value,
    ) -> Staged<Contract> {
        let mut changes = ChangeSet::new();
        changes.put_contract(contract.clone()).log(ActivityLogEntry::applied(
            Some(contract.id),
            actor,
            event,
            authority,
            payload,
        ));
        Staged::new(changes, contract)
    }
}

/// `attempted` names the target state or the draft edit being made
fn ensure_draft(contract: &Contract, attempted: &str, reason: &str) -> EscrowResult<()> {
    if contract.state != ContractState::Draft {
        return Err(EscrowError::invalid_state(
            ContractState::ENTITY,
            contract.state.as_str(),
            attempted,
            reason,
        ));
    }
    Ok(())
}
