//! Escrow account primitive
//!
//! Funds are held per milestone. Funding must match the milestone amount
//! exactly, and an account settles exactly once: released, refunded or
//! split. Settlement operations are crate-private so that only milestone
//! release, dispute resolution, cancellation and admin override reach them.

use crate::{
    error::EscrowError,
    lifecycle::{EscrowState, Lifecycle},
    models::{EscrowAccount, Settlement},
    EscrowResult,
};
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Basis points representing a whole escrow amount
pub const FULL_SHARE_BPS: u32 = 10_000;

impl EscrowAccount {
    /// Create an unfunded account for a milestone
    pub fn new(contract_id: Uuid, milestone_id: Uuid, required_amount: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contract_id,
            milestone_id,
            required_amount,
            funded_amount: Decimal::ZERO,
            released_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            payment_ref: None,
            state: EscrowState::Unfunded,
            created_at: now,
            updated_at: now,
            funded_at: None,
            settled_at: None,
            version: 0,
        }
    }

    /// Amount currently held by the platform
    pub fn held_amount(&self) -> Decimal {
        if self.state == EscrowState::Funded {
            self.funded_amount
        } else {
            Decimal::ZERO
        }
    }

    pub fn is_funded(&self) -> bool {
        self.state == EscrowState::Funded
    }

    /// Hold exactly the required amount
    pub(crate) fn fund(&mut self, amount: Decimal, payment_ref: Option<String>) -> EscrowResult<()> {
        if self.state != EscrowState::Unfunded {
            return Err(EscrowError::invalid_state(
                EscrowState::ENTITY,
                self.state.as_str(),
                EscrowState::Funded.as_str(),
                "escrow has already been funded",
            ));
        }
        check_amount(self.required_amount, amount)?;

        self.state.transition_to(EscrowState::Funded)?;
        self.funded_amount = amount;
        self.payment_ref = payment_ref;
        self.funded_at = Some(Utc::now());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pay the whole held amount to the provider
    pub(crate) fn release(&mut self) -> EscrowResult<Settlement> {
        self.ensure_settleable(EscrowState::Released)?;
        self.settle(EscrowState::Released, self.funded_amount, Decimal::ZERO)
    }

    /// Return the whole held amount to the client
    pub(crate) fn refund(&mut self) -> EscrowResult<Settlement> {
        self.ensure_settleable(EscrowState::Refunded)?;
        self.settle(EscrowState::Refunded, Decimal::ZERO, self.funded_amount)
    }

    /// Divide the held amount, provider share in basis points
    pub(crate) fn split(&mut self, provider_share_bps: u32, scale: u32) -> EscrowResult<Settlement> {
        self.ensure_settleable(EscrowState::Split)?;
        let (to_provider, to_client) = split_amount(self.funded_amount, provider_share_bps, scale)?;
        self.settle(EscrowState::Split, to_provider, to_client)
    }

    /// Change the required amount of an account that holds nothing yet
    pub(crate) fn reprice(&mut self, amount: Decimal) -> EscrowResult<()> {
        if self.state != EscrowState::Unfunded {
            return Err(EscrowError::invalid_state(
                EscrowState::ENTITY,
                self.state.as_str(),
                self.state.as_str(),
                "amount cannot change once escrow is funded",
            ));
        }
        self.required_amount = amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_settleable(&self, to: EscrowState) -> EscrowResult<()> {
        match self.state {
            EscrowState::Funded => Ok(()),
            EscrowState::Released => Err(EscrowError::AlreadyReleased(self.milestone_id)),
            other => Err(EscrowError::invalid_state(
                EscrowState::ENTITY,
                other.as_str(),
                to.as_str(),
                "escrow holds no funds",
            )),
        }
    }

    fn settle(
        &mut self,
        to: EscrowState,
        to_provider: Decimal,
        to_client: Decimal,
    ) -> EscrowResult<Settlement> {
        self.state.transition_to(to)?;
        self.released_amount = to_provider;
        self.refunded_amount = to_client;
        self.settled_at = Some(Utc::now());
        self.updated_at = Utc::now();

        Ok(Settlement {
            milestone_id: self.milestone_id,
            to_provider,
            to_client,
        })
    }
}

/// Funding must equal the required amount exactly
pub fn check_amount(required: Decimal, received: Decimal) -> EscrowResult<()> {
    if received < required {
        return Err(EscrowError::InsufficientFunds { required, received });
    }
    if received > required {
        return Err(EscrowError::AmountMismatch { required, received });
    }
    Ok(())
}

/// A provider share may not exceed the whole amount
pub fn check_share(provider_share_bps: u32) -> EscrowResult<()> {
    if provider_share_bps > FULL_SHARE_BPS {
        return Err(EscrowError::validation(format!(
            "Provider share {} bps exceeds {}",
            provider_share_bps, FULL_SHARE_BPS
        )));
    }
    Ok(())
}

/// Split `amount` into (provider, client) shares.
///
/// The provider share is rounded toward zero at `scale` decimal places and
/// the client receives the exact remainder, so both parts always sum to
/// `amount`.
pub fn split_amount(amount: Decimal, provider_share_bps: u32, scale: u32) -> EscrowResult<(Decimal, Decimal)> {
    check_share(provider_share_bps)?;

    let to_provider = (amount * Decimal::from(provider_share_bps) / Decimal::from(FULL_SHARE_BPS))
        .round_dp_with_strategy(scale, RoundingStrategy::ToZero);
    let to_client = amount - to_provider;

    Ok((to_provider, to_client))
}

/// Read-only escrow projection for a contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowStatus {
    pub contract_id: Uuid,
    pub accounts: Vec<EscrowAccount>,
    pub total_required: Decimal,
    pub total_held: Decimal,
    pub total_released: Decimal,
    pub total_refunded: Decimal,
}

impl EscrowStatus {
    pub fn from_accounts(contract_id: Uuid, accounts: Vec<EscrowAccount>) -> Self {
        let total_required = accounts.iter().map(|a| a.required_amount).sum();
        let total_held = accounts.iter().map(|a| a.held_amount()).sum();
        let total_released = accounts.iter().map(|a| a.released_amount).sum();
        let total_refunded = accounts.iter().map(|a| a.refunded_amount).sum();

        Self {
            contract_id,
            accounts,
            total_required,
            total_held,
            total_released,
            total_refunded,
        }
    }
}
