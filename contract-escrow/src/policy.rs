//! Caller identity and authorization policy
//!
//! Identity is resolved upstream; the engine receives a trusted [`Actor`].
//! Normal and admin paths share one transition function each and differ
//! only in the [`Authority`] they pass in.

use crate::{error::EscrowError, models::Contract, EscrowResult};
use serde::{Deserialize, Serialize};

/// Actor id recorded for payment provider callbacks
pub const PAYMENT_PROVIDER_ACTOR: &str = "payment-provider";

/// Actor id recorded for system-driven transitions
pub const SYSTEM_ACTOR: &str = "system";

/// Trusted role of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    /// May resolve disputes but holds no other elevated rights
    Arbitrator,
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn user<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    pub fn admin<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn arbitrator<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            role: Role::Arbitrator,
        }
    }

    pub(crate) fn system() -> Self {
        Self::user(SYSTEM_ACTOR)
    }

    pub(crate) fn payment_provider() -> Self {
        Self::user(PAYMENT_PROVIDER_ACTOR)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins and arbitrators may resolve disputes
    pub fn can_arbitrate(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Arbitrator)
    }
}

/// Authorization policy a transition runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    /// A contract party acting within normal two-party rules
    Participant,
    /// Admin override replacing the party check with a role check
    Override,
}

impl Authority {
    pub fn is_override(&self) -> bool {
        matches!(self, Self::Override)
    }

    /// Check `actor` may perform `action` as one of `parties`
    pub fn authorize(&self, actor: &Actor, parties: &[&str], action: &str) -> EscrowResult<()> {
        match self {
            Self::Participant if parties.contains(&actor.id.as_str()) => Ok(()),
            Self::Participant => Err(EscrowError::permission(format!(
                "Actor {} may not {}",
                actor.id, action
            ))),
            Self::Override if actor.is_admin() => Ok(()),
            Self::Override => Err(EscrowError::permission(format!(
                "{} requires an admin override",
                action
            ))),
        }
    }
}

/// Contract parties and admins may read a contract
pub fn ensure_can_view(contract: &Contract, actor: &Actor) -> EscrowResult<()> {
    if actor.is_admin() || contract.is_participant(&actor.id) {
        return Ok(());
    }
    Err(EscrowError::permission(format!(
        "Actor {} has no access to contract {}",
        actor.id, contract.id
    )))
}

/// A caller may only read another user's data with admin rights
pub fn authorize_user_data(actor: &Actor, requested_user_id: &str) -> EscrowResult<()> {
    if requested_user_id.trim().is_empty() {
        return Err(EscrowError::validation("User ID required"));
    }
    if actor.is_admin() || actor.id == requested_user_id {
        return Ok(());
    }
    Err(EscrowError::permission(format!(
        "Actor {} may not access data of user {}",
        actor.id, requested_user_id
    )))
}
