//! Escrow Service - funding, payment callbacks and escrow status
//!
//! Funds enter escrow either directly (`fund`) or through the payment
//! provider: `initiate_funding` records a pending [`PaymentTransaction`]
//! and `fund_callback` confirms or fails it. Callbacks are idempotent on
//! the transaction id. The first successful funding activates an
//! accepted contract.

use crate::{
    activity::events,
    disputes::ensure_milestone_unfrozen,
    error::EscrowError,
    escrow::{check_amount, EscrowStatus},
    lifecycle::{ContractState, EscrowState, Lifecycle, PaymentStatus},
    models::{ActivityLogEntry, Contract, EscrowAccount, Milestone, PaymentOutcome, PaymentTransaction},
    policy::{ensure_can_view, Actor, Authority},
    store::ChangeSet,
    transition::{Scope, Staged, TransitionRunner},
    EscrowResult,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Where funds are directed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum FundingTarget {
    /// The first milestone, by position, still awaiting funds
    Contract(Uuid),
    Milestone(Uuid),
}

impl FundingTarget {
    fn scope(&self) -> Scope {
        match self {
            Self::Contract(id) => Scope::Contract(*id),
            Self::Milestone(id) => Scope::Milestone(*id),
        }
    }
}

/// Move an accepted contract to `active`; returns whether it moved
fn activate(contract: &mut Contract) -> EscrowResult<bool> {
    if contract.state != ContractState::Accepted {
        return Ok(false);
    }
    contract.state.transition_to(ContractState::Active)?;
    contract.activated_at = Some(Utc::now());
    contract.touch();
    Ok(true)
}

/// Stage the contract write for a funding: activation or a version guard
fn stage_contract(changes: &mut ChangeSet, mut contract: Contract, actor: &Actor, authority: Authority) -> EscrowResult<()> {
    if activate(&mut contract)? {
        changes.log(ActivityLogEntry::applied(
            Some(contract.id),
            actor,
            events::CONTRACT_ACTIVATED,
            authority,
            serde_json::json!({ "state": contract.state }),
        ));
        changes.put_contract(contract);
    } else {
        changes.guard_contract(&contract);
    }
    Ok(())
}

/// Why a confirmed payment can no longer be applied, if it cannot.
///
/// A dispute freeze does not stop money from being recorded; it only
/// blocks the release.
fn supersede_reason(
    contract: &Contract,
    milestone: &Milestone,
    escrow: &EscrowAccount,
    amount: Decimal,
) -> Option<String> {
    if escrow.state != EscrowState::Unfunded {
        return Some(format!("escrow is already {}", escrow.state));
    }
    if !contract.state.is_fundable() {
        return Some(format!("contract is {}", contract.state));
    }
    if milestone.state.is_terminal() {
        return Some(format!("milestone is {}", milestone.state));
    }
    check_amount(escrow.required_amount, amount).err().map(|err| err.to_string())
}

/// Funds escrow accounts and reports their status
pub struct EscrowService {
    runner: Arc<TransitionRunner>,
}

impl EscrowService {
    pub fn new(runner: Arc<TransitionRunner>) -> Self {
        Self { runner }
    }

    /// Client funds a milestone's escrow with exactly its amount
    pub async fn fund(
        &self,
        target: FundingTarget,
        actor: &Actor,
        amount: Decimal,
        payment_ref: Option<String>,
    ) -> EscrowResult<EscrowAccount> {
        self.fund_with(target, actor, Authority::Participant, amount, payment_ref)
            .await
    }

    pub(crate) async fn fund_with(
        &self,
        target: FundingTarget,
        actor: &Actor,
        authority: Authority,
        amount: Decimal,
        payment_ref: Option<String>,
    ) -> EscrowResult<EscrowAccount> {
        self.runner
            .run(events::ESCROW_FUNDED, actor, authority, target.scope(), || async {
                let (contract, milestone, mut escrow) = self.resolve_target(target).await?;
                authority.authorize(actor, &[&contract.client_id], "fund this contract")?;
                self.ensure_fundable(&contract, &milestone, authority)?;

                escrow.fund(amount, payment_ref.clone())?;

                let mut changes = ChangeSet::new();
                changes.put_escrow(escrow.clone()).log(ActivityLogEntry::applied(
                    Some(contract.id),
                    actor,
                    events::ESCROW_FUNDED,
                    authority,
                    serde_json::json!({
                        "milestone_id": milestone.id,
                        "amount": amount,
                        "payment_ref": payment_ref,
                    }),
                ));
                stage_contract(&mut changes, contract, actor, authority)?;

                Ok(Staged::new(changes, escrow))
            })
            .await
    }

    /// Record a pending payment for the provider to confirm via `fund_callback`
    pub async fn initiate_funding(
        &self,
        target: FundingTarget,
        actor: &Actor,
        amount: Decimal,
    ) -> EscrowResult<PaymentTransaction> {
        self.runner
            .run(
                events::ESCROW_FUNDING_INITIATED,
                actor,
                Authority::Participant,
                target.scope(),
                || async {
                    let (contract, milestone, escrow) = self.resolve_target(target).await?;
                    Authority::Participant.authorize(actor, &[&contract.client_id], "fund this contract")?;
                    self.ensure_fundable(&contract, &milestone, Authority::Participant)?;

                    if escrow.state != EscrowState::Unfunded {
                        return Err(EscrowError::invalid_state(
                            EscrowState::ENTITY,
                            escrow.state.as_str(),
                            EscrowState::Funded.as_str(),
                            "escrow has already been funded",
                        ));
                    }
                    check_amount(escrow.required_amount, amount)?;

                    let payment = PaymentTransaction::new(contract.id, milestone.id, amount, actor.id.clone());
                    let mut changes = ChangeSet::new();
                    changes
                        .guard_contract(&contract)
                        .put_payment(payment.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract.id),
                            actor,
                            events::ESCROW_FUNDING_INITIATED,
                            Authority::Participant,
                            serde_json::json!({
                                "transaction_id": payment.transaction_id,
                                "milestone_id": milestone.id,
                                "amount": amount,
                            }),
                        ));

                    Ok(Staged::new(changes, payment))
                },
            )
            .await
    }

    /// Apply the payment provider's verdict on a pending transaction.
    ///
    /// Redelivery of an already settled transaction returns it unchanged.
    pub async fn fund_callback(
        &self,
        transaction_id: &str,
        outcome: PaymentOutcome,
    ) -> EscrowResult<PaymentTransaction> {
        let provider = Actor::payment_provider();

        self.runner
            .run(
                events::ESCROW_FUNDED,
                &provider,
                Authority::Participant,
                Scope::Payment(transaction_id.to_string()),
                || async {
                    let mut payment = self
                        .runner
                        .store()
                        .payment_transaction(transaction_id)
                        .await?
                        .ok_or_else(|| EscrowError::not_found("payment transaction", transaction_id))?;

                    if payment.status != PaymentStatus::Pending {
                        debug!(
                            "Duplicate callback for {} ignored (status: {})",
                            transaction_id, payment.status
                        );
                        return Ok(Staged::new(ChangeSet::new(), payment));
                    }

                    let mut changes = ChangeSet::new();
                    payment.updated_at = Utc::now();

                    match &outcome {
                        PaymentOutcome::Failed { reason } => {
                            payment.status.transition_to(PaymentStatus::Failed)?;
                            payment.failure_reason = Some(reason.clone());
                            changes.log(ActivityLogEntry::applied(
                                Some(payment.contract_id),
                                &provider,
                                events::ESCROW_FUNDING_FAILED,
                                Authority::Participant,
                                serde_json::json!({
                                    "transaction_id": payment.transaction_id,
                                    "milestone_id": payment.milestone_id,
                                    "reason": reason,
                                }),
                            ));
                        }
                        PaymentOutcome::Succeeded { payment_ref } => {
                            let contract = self.runner.load_contract(payment.contract_id).await?;
                            let milestone = self.runner.load_milestone(payment.milestone_id).await?;
                            let mut escrow = self.runner.load_escrow(payment.milestone_id).await?;
                            payment.payment_ref = payment_ref.clone();

                            match supersede_reason(&contract, &milestone, &escrow, payment.amount) {
                                Some(reason) => {
                                    payment.status.transition_to(PaymentStatus::Superseded)?;
                                    payment.failure_reason = Some(reason.clone());
                                    changes.guard_contract(&contract).log(ActivityLogEntry::applied(
                                        Some(contract.id),
                                        &provider,
                                        events::ESCROW_FUNDING_SUPERSEDED,
                                        Authority::Participant,
                                        serde_json::json!({
                                            "transaction_id": payment.transaction_id,
                                            "milestone_id": milestone.id,
                                            "reason": reason,
                                        }),
                                    ));
                                }
                                None => {
                                    let reference = payment_ref
                                        .clone()
                                        .unwrap_or_else(|| payment.transaction_id.clone());
                                    escrow.fund(payment.amount, Some(reference))?;
                                    payment.status.transition_to(PaymentStatus::Confirmed)?;

                                    changes.put_escrow(escrow).log(ActivityLogEntry::applied(
                                        Some(contract.id),
                                        &provider,
                                        events::ESCROW_FUNDED,
                                        Authority::Participant,
                                        serde_json::json!({
                                            "transaction_id": payment.transaction_id,
                                            "milestone_id": milestone.id,
                                            "amount": payment.amount,
                                            "payment_ref": payment.payment_ref,
                                        }),
                                    ));
                                    stage_contract(&mut changes, contract, &provider, Authority::Participant)?;
                                }
                            }
                        }
                    }

                    info!("Payment {} is now {}", payment.transaction_id, payment.status);
                    changes.put_payment(payment.clone());
                    Ok(Staged::new(changes, payment))
                },
            )
            .await
    }

    /// Per-milestone escrow accounts and totals of a contract's current milestones
    pub async fn status(&self, contract_id: Uuid, actor: &Actor) -> EscrowResult<EscrowStatus> {
        let contract = self.runner.load_contract(contract_id).await?;
        if let Err(err) = ensure_can_view(&contract, actor) {
            self.runner
                .deny(events::ESCROW_VIEWED, actor, Some(contract_id), &err)
                .await;
            return Err(err);
        }

        let accounts = self
            .runner
            .store()
            .escrows_for_contract(contract_id)
            .await?
            .into_iter()
            .filter(|account| contract.milestone_ids.contains(&account.milestone_id))
            .collect();
        Ok(EscrowStatus::from_accounts(contract_id, accounts))
    }

    async fn resolve_target(&self, target: FundingTarget) -> EscrowResult<(Contract, Milestone, EscrowAccount)> {
        match target {
            FundingTarget::Milestone(milestone_id) => {
                let milestone = self.runner.load_milestone(milestone_id).await?;
                let contract = self.runner.load_contract(milestone.contract_id).await?;
                let escrow = self.runner.load_escrow(milestone_id).await?;
                Ok((contract, milestone, escrow))
            }
            FundingTarget::Contract(contract_id) => {
                let contract = self.runner.load_contract(contract_id).await?;
                let (milestone, escrow) = self
                    .runner
                    .load_work(contract_id)
                    .await?
                    .into_iter()
                    .find(|(m, e)| e.state == EscrowState::Unfunded && !m.state.is_terminal())
                    .ok_or_else(|| {
                        EscrowError::invalid_state(
                            EscrowState::ENTITY,
                            EscrowState::Funded.as_str(),
                            EscrowState::Funded.as_str(),
                            format!("no milestone of contract {} awaits funding", contract_id),
                        )
                    })?;
                Ok((contract, milestone, escrow))
            }
        }
    }

    fn ensure_fundable(&self, contract: &Contract, milestone: &Milestone, authority: Authority) -> EscrowResult<()> {
        if !contract.state.is_fundable() {
            return Err(EscrowError::invalid_state(
                ContractState::ENTITY,
                contract.state.as_str(),
                ContractState::Active.as_str(),
                "only accepted, active or paused contracts can be funded",
            ));
        }

        if milestone.state.is_terminal() {
            return Err(EscrowError::invalid_state(
                EscrowState::ENTITY,
                milestone.state.as_str(),
                EscrowState::Funded.as_str(),
                "milestone is already closed",
            ));
        }

        if !authority.is_override() {
            ensure_milestone_unfrozen(contract, milestone)?;
        }

        Ok(())
    }
}
