//! Activity log - append-only audit trail of every transition
//!
//! Entries are written inside the change set of the transition they
//! describe, so a transition and its log entry land together. Rejected
//! transitions get their own entry. This module holds the entry
//! constructors, the event names and the read-only views.

use crate::{
    config::EngineConfig,
    error::EscrowError,
    models::{ActivityLogEntry, ActivityOutcome},
    policy::{ensure_can_view, Actor, Authority},
    store::ContractStore,
    EscrowResult,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Event type names
pub mod events {
    pub const CONTRACT_CREATED: &str = "contract.created";
    pub const CONTRACT_SENT: &str = "contract.sent";
    pub const CONTRACT_ACCEPTED: &str = "contract.accepted";
    pub const CONTRACT_DECLINED: &str = "contract.declined";
    pub const CONTRACT_ACTIVATED: &str = "contract.activated";
    pub const CONTRACT_PAUSED: &str = "contract.paused";
    pub const CONTRACT_RESUMED: &str = "contract.resumed";
    pub const CONTRACT_COMPLETED: &str = "contract.completed";
    pub const CONTRACT_CANCELLATION_REQUESTED: &str = "contract.cancellation_requested";
    pub const CONTRACT_CANCELLED: &str = "contract.cancelled";
    pub const CONTRACT_VIEWED: &str = "contract.viewed";

    pub const MILESTONE_CREATED: &str = "milestone.created";
    pub const MILESTONE_UPDATED: &str = "milestone.updated";
    pub const MILESTONE_STARTED: &str = "milestone.started";
    pub const MILESTONE_SUBMITTED: &str = "milestone.submitted";
    pub const MILESTONE_REVIEWED: &str = "milestone.reviewed";
    pub const MILESTONE_RELEASED: &str = "milestone.released";

    pub const ESCROW_FUNDED: &str = "escrow.funded";
    pub const ESCROW_FUNDING_INITIATED: &str = "escrow.funding_initiated";
    pub const ESCROW_FUNDING_FAILED: &str = "escrow.funding_failed";
    pub const ESCROW_FUNDING_SUPERSEDED: &str = "escrow.funding_superseded";
    pub const ESCROW_VIEWED: &str = "escrow.viewed";

    pub const CHANGE_REQUEST_CREATED: &str = "change_request.created";
    pub const CHANGE_REQUEST_ACCEPTED: &str = "change_request.accepted";
    pub const CHANGE_REQUEST_REJECTED: &str = "change_request.rejected";
    pub const CHANGE_REQUEST_CANCELLED: &str = "change_request.cancelled";

    pub const DISPUTE_OPENED: &str = "dispute.opened";
    pub const DISPUTE_RESOLVED: &str = "dispute.resolved";

    pub const ACTIVITY_VIEWED: &str = "activity.viewed";
    pub const USER_DATA_ACCESS: &str = "user_data.access";
}

impl ActivityLogEntry {
    /// Entry for a transition that took effect
    pub fn applied(
        contract_id: Option<Uuid>,
        actor: &Actor,
        event_type: &str,
        authority: Authority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id,
            actor_id: actor.id.clone(),
            event_type: event_type.to_string(),
            outcome: ActivityOutcome::Applied,
            admin_override: authority.is_override(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Entry for a transition that was denied
    pub fn rejected(
        contract_id: Option<Uuid>,
        actor: &Actor,
        event_type: &str,
        authority: Authority,
        error: &EscrowError,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contract_id,
            actor_id: actor.id.clone(),
            event_type: event_type.to_string(),
            outcome: ActivityOutcome::Rejected {
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
            admin_override: authority.is_override(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.outcome, ActivityOutcome::Rejected { .. })
    }
}

/// Read-only views over the activity log
pub struct ActivityLog {
    store: Arc<dyn ContractStore>,
    config: Arc<EngineConfig>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn ContractStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Full history of a contract, oldest first
    pub async fn contract_activity(
        &self,
        contract_id: Uuid,
        actor: &Actor,
    ) -> EscrowResult<Vec<ActivityLogEntry>> {
        let contract = self
            .store
            .contract(contract_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("contract", contract_id))?;

        if let Err(err) = ensure_can_view(&contract, actor) {
            record_denial(self.store.as_ref(), Some(contract_id), actor, events::ACTIVITY_VIEWED, &err)
                .await;
            return Err(err);
        }

        self.store.activity_for_contract(contract_id).await
    }

    /// Newest entries first; admins see everything, other actors see their contracts
    pub async fn recent_activity(
        &self,
        actor: &Actor,
        limit: Option<usize>,
    ) -> EscrowResult<Vec<ActivityLogEntry>> {
        let limit = limit
            .unwrap_or(self.config.activity.default_recent_limit)
            .clamp(1, self.config.activity.max_recent_limit);

        if actor.is_admin() {
            return self.store.recent_activity(limit).await;
        }

        let mut entries = Vec::new();
        for contract in self.store.contracts_for_party(&actor.id).await? {
            entries.extend(self.store.activity_for_contract(contract.id).await?);
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Append an audit entry for a denied operation outside a transition
pub(crate) async fn record_denial(
    store: &dyn ContractStore,
    contract_id: Option<Uuid>,
    actor: &Actor,
    event_type: &str,
    error: &EscrowError,
) {
    warn!(
        "Denied {} by {} (contract: {:?}): {}",
        event_type, actor.id, contract_id, error
    );

    let mut changes = crate::store::ChangeSet::new();
    changes.log(ActivityLogEntry::rejected(
        contract_id,
        actor,
        event_type,
        Authority::Participant,
        error,
    ));
    if let Err(store_err) = store.commit(changes).await {
        tracing::error!("Failed to record audit entry for {}: {}", event_type, store_err);
    }
}
