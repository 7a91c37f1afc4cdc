//! Dispute Manager - freezes and arbitrates contracts or milestones
//!
//! Opening a dispute on a milestone moves it to `disputed` and remembers
//! the state it was frozen in. A contract-level dispute additionally
//! blocks contract-level participant transitions. Only admins and
//! arbitrators resolve disputes; resolution settles escrow through the
//! crate-private escrow primitive.

use crate::{
    activity::events,
    contracts::stage_completion,
    error::EscrowError,
    escrow::check_share,
    lifecycle::{ChangeRequestState, ContractState, DisputeState, Lifecycle, MilestoneState},
    models::{ActivityLogEntry, Contract, Dispute, DisputeResolution, EscrowAccount, Milestone, Settlement},
    policy::{ensure_can_view, Actor, Authority},
    store::ChangeSet,
    transition::{Scope, Staged, TransitionRunner},
    EscrowResult,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// What a dispute is opened against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum DisputeTarget {
    Contract(Uuid),
    Milestone(Uuid),
}

/// Fail if a contract-level dispute is open
pub(crate) fn ensure_contract_unfrozen(contract: &Contract) -> EscrowResult<()> {
    match contract.open_dispute_id {
        Some(dispute_id) => Err(EscrowError::DisputeActive {
            dispute_id,
            target: format!("contract {}", contract.id),
        }),
        None => Ok(()),
    }
}

/// Fail if the milestone or its contract is frozen
pub(crate) fn ensure_milestone_unfrozen(contract: &Contract, milestone: &Milestone) -> EscrowResult<()> {
    ensure_contract_unfrozen(contract)?;
    match milestone.open_dispute_id {
        Some(dispute_id) => Err(EscrowError::DisputeActive {
            dispute_id,
            target: format!("milestone {}", milestone.id),
        }),
        None => Ok(()),
    }
}

/// Fail if any dispute on the contract or its milestones is open
pub(crate) fn ensure_no_open_disputes(contract: &Contract, milestones: &[Milestone]) -> EscrowResult<()> {
    ensure_contract_unfrozen(contract)?;
    milestones
        .iter()
        .try_for_each(|milestone| ensure_milestone_unfrozen(contract, milestone))
}

fn freeze(milestone: &mut Milestone, dispute_id: Uuid) -> EscrowResult<()> {
    let frozen = milestone.state;
    milestone.state.transition_to(MilestoneState::Disputed)?;
    milestone.frozen_state = Some(frozen);
    milestone.open_dispute_id = Some(dispute_id);
    milestone.touch();
    Ok(())
}

fn unfreeze(milestone: &mut Milestone) -> EscrowResult<()> {
    let restored = milestone.frozen_state.take().unwrap_or(MilestoneState::Pending);
    milestone.state.transition_to(restored)?;
    milestone.open_dispute_id = None;
    milestone.touch();
    Ok(())
}

fn settle_frozen(
    milestone: &mut Milestone,
    escrow: &mut EscrowAccount,
    resolution: DisputeResolution,
    currency_scale: u32,
) -> EscrowResult<Option<Settlement>> {
    let settlement = match resolution {
        DisputeResolution::Dismiss => {
            unfreeze(milestone)?;
            return Ok(None);
        }
        DisputeResolution::ReleaseToProvider => {
            let settlement = escrow.release()?;
            milestone.state.transition_to(MilestoneState::Released)?;
            milestone.released_at = Some(Utc::now());
            Some(settlement)
        }
        DisputeResolution::RefundToClient => {
            let settlement = if escrow.is_funded() { Some(escrow.refund()?) } else { None };
            milestone.state.transition_to(MilestoneState::Closed)?;
            settlement
        }
        DisputeResolution::Split { provider_share_bps } => {
            let settlement = escrow.split(provider_share_bps, currency_scale)?;
            milestone.state.transition_to(MilestoneState::Closed)?;
            Some(settlement)
        }
    };

    milestone.frozen_state = None;
    milestone.open_dispute_id = None;
    milestone.touch();
    Ok(settlement)
}

/// Opens, resolves and lists disputes
pub struct DisputeManager {
    runner: Arc<TransitionRunner>,
}

impl DisputeManager {
    pub fn new(runner: Arc<TransitionRunner>) -> Self {
        Self { runner }
    }

    /// Open a dispute as either party of an active or paused contract
    pub async fn create(&self, target: DisputeTarget, actor: &Actor, reason: &str) -> EscrowResult<Dispute> {
        let scope = match target {
            DisputeTarget::Contract(id) => Scope::Contract(id),
            DisputeTarget::Milestone(id) => Scope::Milestone(id),
        };

        self.runner
            .run(events::DISPUTE_OPENED, actor, Authority::Participant, scope, || async {
                if reason.trim().is_empty() {
                    return Err(EscrowError::validation("A dispute reason is required"));
                }

                let (mut contract, milestone) = match target {
                    DisputeTarget::Contract(id) => (self.runner.load_contract(id).await?, None),
                    DisputeTarget::Milestone(id) => {
                        let milestone = self.runner.load_milestone(id).await?;
                        (self.runner.load_contract(milestone.contract_id).await?, Some(milestone))
                    }
                };

                Authority::Participant.authorize(
                    actor,
                    &[&contract.client_id, &contract.provider_id],
                    "open a dispute on this contract",
                )?;

                if !matches!(contract.state, ContractState::Active | ContractState::Paused) {
                    return Err(EscrowError::invalid_state(
                        ContractState::ENTITY,
                        contract.state.as_str(),
                        contract.state.as_str(),
                        "disputes can only be opened on active or paused contracts",
                    ));
                }

                let dispute = Dispute::new(
                    contract.id,
                    milestone.as_ref().map(|m| m.id),
                    actor.id.clone(),
                    reason.trim().to_string(),
                );
                let mut changes = ChangeSet::new();

                match milestone {
                    Some(mut milestone) => {
                        ensure_contract_unfrozen(&contract)?;
                        if let Some(open) = milestone.open_dispute_id {
                            return Err(EscrowError::conflict(format!(
                                "Dispute {} is already open on milestone {}",
                                open, milestone.id
                            )));
                        }
                        if milestone.state.is_terminal() {
                            return Err(EscrowError::invalid_state(
                                MilestoneState::ENTITY,
                                milestone.state.as_str(),
                                MilestoneState::Disputed.as_str(),
                                "milestone is already closed",
                            ));
                        }

                        freeze(&mut milestone, dispute.id)?;
                        changes.guard_contract(&contract).put_milestone(milestone);
                    }
                    None => {
                        if let Some(open) = contract.open_dispute_id {
                            return Err(EscrowError::conflict(format!(
                                "Dispute {} is already open on contract {}",
                                open, contract.id
                            )));
                        }

                        let milestones = self.runner.store().milestones_for_contract(contract.id).await?;
                        if let Some(open) = milestones.iter().find_map(|m| m.open_dispute_id) {
                            return Err(EscrowError::conflict(format!(
                                "Milestone dispute {} must be resolved before disputing the whole contract",
                                open
                            )));
                        }

                        for mut milestone in milestones {
                            if !milestone.state.is_terminal() {
                                freeze(&mut milestone, dispute.id)?;
                                changes.put_milestone(milestone);
                            }
                        }
                        contract.open_dispute_id = Some(dispute.id);
                        contract.cancellation_requested_by = None;
                        contract.touch();
                        changes.put_contract(contract.clone());
                    }
                }

                changes.put_dispute(dispute.clone()).log(ActivityLogEntry::applied(
                    Some(contract.id),
                    actor,
                    events::DISPUTE_OPENED,
                    Authority::Participant,
                    serde_json::json!({
                        "dispute_id": dispute.id,
                        "milestone_id": dispute.milestone_id,
                        "reason": dispute.reason,
                    }),
                ));

                Ok(Staged::new(changes, dispute))
            })
            .await
    }

    /// Resolve an open dispute as admin or arbitrator
    pub async fn resolve(
        &self,
        dispute_id: Uuid,
        actor: &Actor,
        resolution: DisputeResolution,
        note: Option<String>,
    ) -> EscrowResult<Dispute> {
        let dispute = self
            .runner
            .run(events::DISPUTE_RESOLVED, actor, Authority::Participant, Scope::Dispute(dispute_id), || async {
                if !actor.can_arbitrate() {
                    return Err(EscrowError::permission(format!(
                        "Actor {} may not resolve disputes",
                        actor.id
                    )));
                }
                if let DisputeResolution::Split { provider_share_bps } = resolution {
                    check_share(provider_share_bps)?;
                }

                let mut dispute = self.runner.load_dispute(dispute_id).await?;
                dispute.state.transition_to(DisputeState::Resolved)?;

                let scale = self.runner.config().limits.currency_scale;
                let mut changes = ChangeSet::new();

                let mut contract = self.runner.load_contract(dispute.contract_id).await?;
                let settlements = match dispute.milestone_id {
                    Some(milestone_id) => {
                        let mut milestone = self.runner.load_milestone(milestone_id).await?;
                        let mut escrow = self.runner.load_escrow(milestone_id).await?;

                        let settlement = settle_frozen(&mut milestone, &mut escrow, resolution, scale)?;
                        contract.touch();
                        changes.put_contract(contract.clone()).put_milestone(milestone).put_escrow(escrow);
                        settlement.into_iter().collect()
                    }
                    None => {
                        self.resolve_contract_dispute(contract.clone(), &dispute, resolution, &mut changes)
                            .await?
                    }
                };

                dispute.resolution = Some(resolution);
                dispute.resolver_id = Some(actor.id.clone());
                dispute.resolution_note = note.clone();
                dispute.settlements = settlements;
                dispute.resolved_at = Some(Utc::now());

                changes.put_dispute(dispute.clone()).log(ActivityLogEntry::applied(
                    Some(dispute.contract_id),
                    actor,
                    events::DISPUTE_RESOLVED,
                    Authority::Participant,
                    serde_json::json!({
                        "dispute_id": dispute.id,
                        "milestone_id": dispute.milestone_id,
                        "resolution": resolution,
                        "note": dispute.resolution_note,
                        "settlements": dispute.settlements,
                    }),
                ));

                let milestones = self.runner.store().milestones_for_contract(contract.id).await?;
                stage_completion(&contract, milestones, &mut changes)?;
                Ok(Staged::new(changes, dispute))
            })
            .await?;

        info!(
            "Dispute {} resolved with {:?} by {}",
            dispute.id, resolution, actor.id
        );

        Ok(dispute)
    }

    async fn resolve_contract_dispute(
        &self,
        mut contract: Contract,
        dispute: &Dispute,
        resolution: DisputeResolution,
        changes: &mut ChangeSet,
    ) -> EscrowResult<Vec<Settlement>> {
        let scale = self.runner.config().limits.currency_scale;
        let mut settlements = Vec::new();

        for (mut milestone, mut escrow) in self.runner.load_work(contract.id).await? {
            if milestone.open_dispute_id != Some(dispute.id) {
                continue;
            }

            let settlement = match resolution {
                DisputeResolution::ReleaseToProvider if !escrow.is_funded() => {
                    unfreeze(&mut milestone)?;
                    None
                }
                DisputeResolution::Split { .. } if !escrow.is_funded() => {
                    milestone.state.transition_to(MilestoneState::Closed)?;
                    milestone.frozen_state = None;
                    milestone.open_dispute_id = None;
                    milestone.touch();
                    None
                }
                _ => settle_frozen(&mut milestone, &mut escrow, resolution, scale)?,
            };

            if let Some(settlement) = settlement {
                settlements.push(settlement);
                changes.put_escrow(escrow);
            }
            changes.put_milestone(milestone);
        }

        contract.open_dispute_id = None;
        if matches!(
            resolution,
            DisputeResolution::RefundToClient | DisputeResolution::Split { .. }
        ) {
            contract.state.transition_to(ContractState::Cancelled)?;
            contract.cancellation_reason = Some(format!("Dispute {} resolved", dispute.id));
            contract.closed_at = Some(Utc::now());

            for mut request in self.runner.store().change_requests_for_contract(contract.id).await? {
                if request.state == ChangeRequestState::Pending {
                    request.state.transition_to(ChangeRequestState::Cancelled)?;
                    request.resolved_at = Some(Utc::now());
                    request.updated_at = Utc::now();
                    changes.put_change_request(request);
                }
            }
        }
        contract.touch();
        changes.put_contract(contract);

        Ok(settlements)
    }

    /// Disputes of a contract, visible to parties, admins and arbitrators
    pub async fn disputes(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Vec<Dispute>> {
        let contract = self.runner.load_contract(contract_id).await?;
        self.ensure_can_see(&contract, actor).await?;
        self.runner.store().disputes_for_contract(contract_id).await
    }

    pub async fn dispute(&self, dispute_id: Uuid, actor: &Actor) -> EscrowResult<Dispute> {
        let dispute = self.runner.load_dispute(dispute_id).await?;
        let contract = self.runner.load_contract(dispute.contract_id).await?;
        self.ensure_can_see(&contract, actor).await?;
        Ok(dispute)
    }

    async fn ensure_can_see(&self, contract: &Contract, actor: &Actor) -> EscrowResult<()> {
        if actor.can_arbitrate() {
            return Ok(());
        }
        if let Err(err) = ensure_can_view(contract, actor) {
            self.runner
                .deny(events::CONTRACT_VIEWED, actor, Some(contract.id), &err)
                .await;
            return Err(err);
        }
        Ok(())
    }
}
