//! Admin Override - elevated paths into the regular transitions
//!
//! Each override runs the same transition function as the participant
//! path with [`Authority::Override`]: the party check becomes an admin role
//! check and every activity entry is tagged `admin_override`.

use crate::{
    activity::events,
    contracts::{ContractManager, EscrowDisposition},
    error::EscrowError,
    funding::{EscrowService, FundingTarget},
    milestones::MilestoneManager,
    models::{Contract, EscrowAccount, Milestone},
    policy::{Actor, Authority},
    transition::TransitionRunner,
    EscrowResult,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Admin override operations
pub struct AdminOverride {
    runner: Arc<TransitionRunner>,
    contracts: Arc<ContractManager>,
    milestones: Arc<MilestoneManager>,
    funding: Arc<EscrowService>,
}

impl AdminOverride {
    pub fn new(
        runner: Arc<TransitionRunner>,
        contracts: Arc<ContractManager>,
        milestones: Arc<MilestoneManager>,
        funding: Arc<EscrowService>,
    ) -> Self {
        Self {
            runner,
            contracts,
            milestones,
            funding,
        }
    }

    /// Release a milestone's escrow without an approving review
    pub async fn admin_release_funds(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Milestone> {
        warn!("Admin {} releasing milestone {}", actor.id, milestone_id);
        self.milestones
            .release_with(milestone_id, actor, Authority::Override)
            .await
    }

    /// Record funds received outside the payment provider
    pub async fn admin_accept_funds(
        &self,
        target: FundingTarget,
        actor: &Actor,
        amount: Decimal,
        payment_ref: Option<String>,
    ) -> EscrowResult<EscrowAccount> {
        warn!("Admin {} accepting {} for {:?}", actor.id, amount, target);
        self.funding
            .fund_with(target, actor, Authority::Override, amount, payment_ref)
            .await
    }

    pub async fn admin_pause_contract(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.contracts
            .set_paused(contract_id, actor, Authority::Override, true)
            .await
    }

    pub async fn admin_resume_contract(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<Contract> {
        self.contracts
            .set_paused(contract_id, actor, Authority::Override, false)
            .await
    }

    /// Cancel without counterparty consent, settling held escrow per `disposition`
    pub async fn admin_cancel_contract(
        &self,
        contract_id: Uuid,
        actor: &Actor,
        reason: &str,
        disposition: EscrowDisposition,
    ) -> EscrowResult<Contract> {
        warn!(
            "Admin {} cancelling contract {} ({:?})",
            actor.id, contract_id, disposition
        );
        self.contracts
            .cancel_with(contract_id, actor, Authority::Override, reason, disposition)
            .await
    }

    /// Every contract on the platform
    pub async fn admin_contracts(&self, actor: &Actor) -> EscrowResult<Vec<Contract>> {
        if !actor.is_admin() {
            let err = EscrowError::permission(format!("Actor {} may not list all contracts", actor.id));
            self.runner.deny(events::USER_DATA_ACCESS, actor, None, &err).await;
            return Err(err);
        }
        self.runner.store().contracts().await
    }
}
