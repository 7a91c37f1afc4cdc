//! Core data models for the contract engine
//!
//! Every persisted entity carries a `version` used by the store for
//! optimistic concurrency. Lifecycle enums live in [`crate::lifecycle`].

use crate::lifecycle::{
    ChangeRequestState, ContractState, DisputeState, EscrowState, MilestoneState, PaymentStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a client review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approve,
    Reject,
}

/// Work contract between a client and a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub client_id: String,
    pub provider_id: String,
    pub title: String,
    pub description: Option<String>,
    pub state: ContractState,

    /// Milestones in execution order
    pub milestone_ids: Vec<Uuid>,

    /// Contract-level dispute currently freezing the contract
    pub open_dispute_id: Option<Uuid>,

    // Mutual-consent cancellation
    pub cancellation_requested_by: Option<String>,
    pub cancellation_reason: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,

    pub version: u64,
}

impl Contract {
    /// Create a new contract in `draft`
    pub fn new(
        client_id: String,
        provider_id: String,
        title: String,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id,
            provider_id,
            title,
            description,
            state: ContractState::Draft,
            milestone_ids: Vec::new(),
            open_dispute_id: None,
            cancellation_requested_by: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            activated_at: None,
            closed_at: None,
            version: 0,
        }
    }

    pub fn is_participant(&self, actor_id: &str) -> bool {
        self.client_id == actor_id || self.provider_id == actor_id
    }

    /// The other party of the contract, if `actor_id` is a party at all
    pub fn counterparty(&self, actor_id: &str) -> Option<&str> {
        if actor_id == self.client_id {
            Some(&self.provider_id)
        } else if actor_id == self.provider_id {
            Some(&self.client_id)
        } else {
            None
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Terms of a single milestone as supplied by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneTerms {
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
}

/// A separately funded unit of work within a contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub position: u32,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub state: MilestoneState,

    /// Outcome of the latest review
    pub review_outcome: Option<ReviewOutcome>,

    // Dispute freeze
    pub open_dispute_id: Option<Uuid>,
    pub frozen_state: Option<MilestoneState>,

    pub submissions: Vec<Submission>,
    pub reviews: Vec<Review>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,

    pub version: u64,
}

impl Milestone {
    /// Create a new pending milestone
    pub fn new(contract_id: Uuid, position: u32, terms: MilestoneTerms) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contract_id,
            position,
            title: terms.title,
            description: terms.description,
            amount: terms.amount,
            state: MilestoneState::Pending,
            review_outcome: None,
            open_dispute_id: None,
            frozen_state: None,
            submissions: Vec::new(),
            reviews: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            released_at: None,
            version: 0,
        }
    }

    /// Reviewed with an approving outcome
    pub fn is_approved(&self) -> bool {
        self.state == MilestoneState::Reviewed
            && self.review_outcome == Some(ReviewOutcome::Approve)
    }

    /// Reviewed with a rejecting outcome, awaiting resubmission
    pub fn awaits_resubmission(&self) -> bool {
        self.state == MilestoneState::Reviewed
            && self.review_outcome == Some(ReviewOutcome::Reject)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Deliverable handed in for a milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub submitted_by: String,
    pub content: String,
    pub note: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Client review of the latest submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub reviewer_id: String,
    pub outcome: ReviewOutcome,
    pub comment: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Escrow held for one milestone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub milestone_id: Uuid,

    // Amounts
    pub required_amount: Decimal,
    pub funded_amount: Decimal,
    pub released_amount: Decimal,
    pub refunded_amount: Decimal,

    pub payment_ref: Option<String>,
    pub state: EscrowState,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,

    pub version: u64,
}

/// Funding attempt routed through the external payment provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub contract_id: Uuid,
    pub milestone_id: Uuid,
    pub amount: Decimal,
    pub initiated_by: String,
    pub status: PaymentStatus,
    pub payment_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl PaymentTransaction {
    pub fn new(contract_id: Uuid, milestone_id: Uuid, amount: Decimal, initiated_by: String) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: format!("txn_{}", Uuid::new_v4().simple()),
            contract_id,
            milestone_id,
            amount,
            initiated_by,
            status: PaymentStatus::Pending,
            payment_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Result reported by the payment provider callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded { payment_ref: Option<String> },
    Failed { reason: String },
}

/// Proposed modification of contract or milestone terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeDiff {
    UpdateTerms {
        title: Option<String>,
        description: Option<String>,
    },
    UpdateMilestone {
        milestone_id: Uuid,
        title: Option<String>,
        description: Option<String>,
        amount: Option<Decimal>,
    },
    AddMilestone {
        title: String,
        description: Option<String>,
        amount: Decimal,
    },
    RemoveMilestone {
        milestone_id: Uuid,
    },
}

/// Change request awaiting counterparty consent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub proposer_id: String,
    pub diff: ChangeDiff,
    pub reason: Option<String>,
    pub state: ChangeRequestState,
    pub responder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl ChangeRequest {
    pub fn new(contract_id: Uuid, proposer_id: String, diff: ChangeDiff, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contract_id,
            proposer_id,
            diff,
            reason,
            state: ChangeRequestState::Pending,
            responder_id: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            version: 0,
        }
    }
}

/// Arbitration decision for a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Escrow released to the provider
    ReleaseToProvider,
    /// Escrow refunded to the client
    RefundToClient,
    /// Escrow divided; provider share in basis points (0..=10_000)
    Split { provider_share_bps: u32 },
    /// Dispute withdrawn, target unfrozen
    Dismiss,
}

/// Funds movement produced by settling one escrow account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub milestone_id: Uuid,
    pub to_provider: Decimal,
    pub to_client: Decimal,
}

/// Dispute on a contract or on one of its milestones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub contract_id: Uuid,
    /// `None` for a contract-level dispute
    pub milestone_id: Option<Uuid>,
    pub opened_by: String,
    pub reason: String,
    pub state: DisputeState,
    pub resolution: Option<DisputeResolution>,
    pub resolver_id: Option<String>,
    pub resolution_note: Option<String>,
    pub settlements: Vec<Settlement>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Dispute {
    pub fn new(contract_id: Uuid, milestone_id: Option<Uuid>, opened_by: String, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id,
            milestone_id,
            opened_by,
            reason,
            state: DisputeState::Open,
            resolution: None,
            resolver_id: None,
            resolution_note: None,
            settlements: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
            version: 0,
        }
    }
}

/// Whether a logged transition took effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivityOutcome {
    Applied,
    Rejected { kind: String, message: String },
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    /// Absent only for access audits not tied to a contract
    pub contract_id: Option<Uuid>,
    pub actor_id: String,
    pub event_type: String,
    pub outcome: ActivityOutcome,
    pub admin_override: bool,
    pub payload: serde_json::Value,

    // Timestamp (immutable)
    pub created_at: DateTime<Utc>,
}
