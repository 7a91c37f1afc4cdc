//! Finite state machines for every lifecycle-bearing entity
//!
//! Each entity gets one state enum with a static transition table. All
//! state changes in the crate go through [`Lifecycle::transition_to`], so
//! an edge missing from a table cannot be taken anywhere.

use crate::{error::EscrowError, EscrowResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A state enum with a static transition table
pub trait Lifecycle: Copy + Eq + fmt::Debug + 'static {
    /// Entity name used in error messages
    const ENTITY: &'static str;

    /// Canonical lower-case name of the state
    fn as_str(&self) -> &'static str;

    /// States reachable from this state in one step
    fn valid_transitions(&self) -> &'static [Self];

    /// Whether no further transitions are possible
    fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    fn can_transition_to(&self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Move to `to` if the table allows it
    fn transition_to(&mut self, to: Self) -> EscrowResult<()> {
        if !self.can_transition_to(to) {
            return Err(EscrowError::invalid_state(
                Self::ENTITY,
                self.as_str(),
                to.as_str(),
                "transition not permitted",
            ));
        }
        *self = to;
        Ok(())
    }
}

macro_rules! impl_display {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })+
    };
}

/// Contract state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    /// Being drafted by the client
    Draft,
    /// Offered to the provider
    Sent,
    /// Provider agreed, awaiting first escrow funding
    Accepted,
    /// Provider refused the offer
    Declined,
    /// Work in progress
    Active,
    /// Work halted by a party or an admin
    Paused,
    /// Every milestone released
    Completed,
    Cancelled,
}

impl Lifecycle for ContractState {
    const ENTITY: &'static str = "contract";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Sent, Self::Cancelled],
            Self::Sent => &[Self::Accepted, Self::Declined, Self::Cancelled],
            Self::Accepted => &[Self::Active, Self::Cancelled],
            Self::Active => &[Self::Paused, Self::Completed, Self::Cancelled],
            Self::Paused => &[Self::Active, Self::Completed, Self::Cancelled],
            Self::Declined | Self::Completed | Self::Cancelled => &[],
        }
    }
}

impl ContractState {
    /// Whether both parties have agreed and escrow may be funded
    pub fn is_fundable(&self) -> bool {
        matches!(self, Self::Accepted | Self::Active | Self::Paused)
    }
}

/// Milestone state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneState {
    Pending,
    Started,
    Submitted,
    /// Reviewed by the client; the review outcome decides what comes next
    Reviewed,
    /// Funds paid to the provider
    Released,
    /// Frozen by an open dispute
    Disputed,
    /// Closed without release (refund, split or cancellation)
    Closed,
}

impl Lifecycle for MilestoneState {
    const ENTITY: &'static str = "milestone";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Submitted => "submitted",
            Self::Reviewed => "reviewed",
            Self::Released => "released",
            Self::Disputed => "disputed",
            Self::Closed => "closed",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Started, Self::Disputed, Self::Closed],
            Self::Started => &[Self::Submitted, Self::Released, Self::Disputed, Self::Closed],
            Self::Submitted => &[Self::Reviewed, Self::Released, Self::Disputed, Self::Closed],
            Self::Reviewed => &[Self::Submitted, Self::Released, Self::Disputed, Self::Closed],
            Self::Disputed => &[
                Self::Pending,
                Self::Started,
                Self::Submitted,
                Self::Reviewed,
                Self::Released,
                Self::Closed,
            ],
            Self::Released | Self::Closed => &[],
        }
    }
}

/// Escrow account state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Unfunded,
    /// Exact milestone amount held
    Funded,
    /// Paid out to the provider
    Released,
    /// Returned to the client
    Refunded,
    /// Divided between the parties by a dispute resolution
    Split,
}

impl Lifecycle for EscrowState {
    const ENTITY: &'static str = "escrow";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Unfunded => "unfunded",
            Self::Funded => "funded",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Split => "split",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Unfunded => &[Self::Funded],
            Self::Funded => &[Self::Released, Self::Refunded, Self::Split],
            Self::Released | Self::Refunded | Self::Split => &[],
        }
    }
}

/// Payment provider transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Awaiting the provider callback
    Pending,
    Confirmed,
    Failed,
    /// Confirmed by the provider after the escrow was settled another way
    Superseded,
}

impl Lifecycle for PaymentStatus {
    const ENTITY: &'static str = "payment transaction";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Failed, Self::Superseded],
            Self::Confirmed | Self::Failed | Self::Superseded => &[],
        }
    }
}

/// Change request state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestState {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

impl Lifecycle for ChangeRequestState {
    const ENTITY: &'static str = "change request";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Accepted, Self::Rejected, Self::Cancelled],
            Self::Accepted | Self::Rejected | Self::Cancelled => &[],
        }
    }
}

/// Dispute state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeState {
    Open,
    Resolved,
}

impl Lifecycle for DisputeState {
    const ENTITY: &'static str = "dispute";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Open => &[Self::Resolved],
            Self::Resolved => &[],
        }
    }
}

impl_display!(
    ContractState,
    MilestoneState,
    EscrowState,
    PaymentStatus,
    ChangeRequestState,
    DisputeState
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CONTRACT_STATES: [ContractState; 8] = [
        ContractState::Draft,
        ContractState::Sent,
        ContractState::Accepted,
        ContractState::Declined,
        ContractState::Active,
        ContractState::Paused,
        ContractState::Completed,
        ContractState::Cancelled,
    ];

    const MILESTONE_STATES: [MilestoneState; 7] = [
        MilestoneState::Pending,
        MilestoneState::Started,
        MilestoneState::Submitted,
        MilestoneState::Reviewed,
        MilestoneState::Released,
        MilestoneState::Disputed,
        MilestoneState::Closed,
    ];

    fn assert_no_self_loops<S: Lifecycle>(states: &[S]) {
        for state in states {
            assert!(
                !state.can_transition_to(*state),
                "{} has a self transition",
                state.as_str()
            );
        }
    }

    #[test]
    fn test_tables_have_no_self_loops() {
        assert_no_self_loops(&CONTRACT_STATES);
        assert_no_self_loops(&MILESTONE_STATES);
        assert_no_self_loops(&[
            EscrowState::Unfunded,
            EscrowState::Funded,
            EscrowState::Released,
            EscrowState::Refunded,
            EscrowState::Split,
        ]);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ContractState::Completed.is_terminal());
        assert!(ContractState::Declined.is_terminal());
        assert!(ContractState::Cancelled.is_terminal());
        assert!(!ContractState::Paused.is_terminal());
        assert!(MilestoneState::Released.is_terminal());
        assert!(MilestoneState::Closed.is_terminal());
        assert!(!MilestoneState::Disputed.is_terminal());
        assert!(EscrowState::Released.is_terminal());
        assert!(EscrowState::Refunded.is_terminal());
    }

    #[test]
    fn test_escrow_release_and_refund_are_exclusive() {
        let mut state = EscrowState::Funded;
        state.transition_to(EscrowState::Released).unwrap();
        assert!(state.transition_to(EscrowState::Refunded).is_err());
        assert_eq!(state, EscrowState::Released);
    }

    #[test]
    fn test_released_milestone_cannot_be_disputed() {
        let mut state = MilestoneState::Released;
        let err = state.transition_to(MilestoneState::Disputed).unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&ContractState::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(MilestoneState::Reviewed.to_string(), "reviewed");
    }

    proptest! {
        #[test]
        fn contract_transition_matches_table(
            from in proptest::sample::select(CONTRACT_STATES.to_vec()),
            to in proptest::sample::select(CONTRACT_STATES.to_vec()),
        ) {
            let mut state = from;
            let allowed = from.valid_transitions().contains(&to);
            prop_assert_eq!(state.transition_to(to).is_ok(), allowed);
            prop_assert_eq!(state, if allowed { to } else { from });
        }

        #[test]
        fn milestone_transition_matches_table(
            from in proptest::sample::select(MILESTONE_STATES.to_vec()),
            to in proptest::sample::select(MILESTONE_STATES.to_vec()),
        ) {
            let mut state = from;
            let allowed = from.valid_transitions().contains(&to);
            prop_assert_eq!(state.transition_to(to).is_ok(), allowed);
        }
    }
}
