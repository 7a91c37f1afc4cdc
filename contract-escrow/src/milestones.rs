//! Milestone Manager - work, review and release of milestones
//!
//! `pending → started → submitted → reviewed → released`, with rejected
//! reviews looping back through `submit`. Release moves the escrow and the
//! milestone in one change set, together with the contract completion when
//! it was the last open milestone.

use crate::{
    activity::events,
    contracts::stage_completion,
    disputes::ensure_milestone_unfrozen,
    error::EscrowError,
    lifecycle::{ContractState, EscrowState, Lifecycle, MilestoneState},
    models::{ActivityLogEntry, Contract, Milestone, Review, ReviewOutcome, Submission},
    policy::{ensure_can_view, Actor, Authority},
    store::ChangeSet,
    transition::{Scope, Staged, TransitionRunner},
    EscrowResult,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

fn ensure_contract_active(contract: &Contract, milestone: &Milestone, to: MilestoneState) -> EscrowResult<()> {
    if contract.state != ContractState::Active {
        return Err(EscrowError::invalid_state(
            MilestoneState::ENTITY,
            milestone.state.as_str(),
            to.as_str(),
            format!("contract {} is {}, not active", contract.id, contract.state),
        ));
    }
    Ok(())
}

/// Manages milestone work and release
pub struct MilestoneManager {
    runner: Arc<TransitionRunner>,
}

impl MilestoneManager {
    pub fn new(runner: Arc<TransitionRunner>) -> Self {
        Self { runner }
    }

    /// Provider starts work on a funded milestone
    pub async fn start(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Milestone> {
        self.runner
            .run(
                events::MILESTONE_STARTED,
                actor,
                Authority::Participant,
                Scope::Milestone(milestone_id),
                || async {
                    let mut milestone = self.runner.load_milestone(milestone_id).await?;
                    let contract = self.runner.load_contract(milestone.contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.provider_id], "start this milestone")?;
                    ensure_milestone_unfrozen(&contract, &milestone)?;
                    ensure_contract_active(&contract, &milestone, MilestoneState::Started)?;

                    if milestone.state != MilestoneState::Pending {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            milestone.state.as_str(),
                            MilestoneState::Started.as_str(),
                            "only pending milestones can be started",
                        ));
                    }

                    let escrow = self.runner.load_escrow(milestone_id).await?;
                    if !escrow.is_funded() {
                        return Err(EscrowError::invalid_state(
                            EscrowState::ENTITY,
                            escrow.state.as_str(),
                            EscrowState::Funded.as_str(),
                            "escrow must be funded before work starts",
                        ));
                    }

                    milestone.state.transition_to(MilestoneState::Started)?;
                    milestone.started_at = Some(Utc::now());
                    milestone.touch();

                    let mut changes = ChangeSet::new();
                    changes
                        .guard_contract(&contract)
                        .put_milestone(milestone.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract.id),
                            actor,
                            events::MILESTONE_STARTED,
                            Authority::Participant,
                            serde_json::json!({ "milestone_id": milestone.id }),
                        ));
                    Ok(Staged::new(changes, milestone))
                },
            )
            .await
    }

    /// Provider hands in work, first time or after a rejected review
    pub async fn submit(
        &self,
        milestone_id: Uuid,
        actor: &Actor,
        content: &str,
        note: Option<String>,
    ) -> EscrowResult<Milestone> {
        self.runner
            .run(
                events::MILESTONE_SUBMITTED,
                actor,
                Authority::Participant,
                Scope::Milestone(milestone_id),
                || async {
                    let mut milestone = self.runner.load_milestone(milestone_id).await?;
                    let contract = self.runner.load_contract(milestone.contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.provider_id], "submit work")?;
                    ensure_milestone_unfrozen(&contract, &milestone)?;
                    ensure_contract_active(&contract, &milestone, MilestoneState::Submitted)?;

                    if milestone.state != MilestoneState::Started && !milestone.awaits_resubmission() {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            milestone.state.as_str(),
                            MilestoneState::Submitted.as_str(),
                            "work can only be submitted once started or after a rejected review",
                        ));
                    }

                    if content.trim().is_empty() {
                        return Err(EscrowError::validation("Submission content cannot be empty"));
                    }

                    let submission = Submission {
                        id: Uuid::new_v4(),
                        milestone_id,
                        submitted_by: actor.id.clone(),
                        content: content.to_string(),
                        note: note.clone(),
                        submitted_at: Utc::now(),
                    };

                    milestone.state.transition_to(MilestoneState::Submitted)?;
                    milestone.review_outcome = None;
                    milestone.submissions.push(submission.clone());
                    milestone.touch();

                    let mut changes = ChangeSet::new();
                    changes
                        .guard_contract(&contract)
                        .put_milestone(milestone.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract.id),
                            actor,
                            events::MILESTONE_SUBMITTED,
                            Authority::Participant,
                            serde_json::json!({
                                "milestone_id": milestone.id,
                                "submission_id": submission.id,
                                "revision": milestone.submissions.len(),
                            }),
                        ));
                    Ok(Staged::new(changes, milestone))
                },
            )
            .await
    }

    /// Client approves or rejects the latest submission
    pub async fn review(
        &self,
        milestone_id: Uuid,
        actor: &Actor,
        outcome: ReviewOutcome,
        comment: Option<String>,
    ) -> EscrowResult<Milestone> {
        self.runner
            .run(
                events::MILESTONE_REVIEWED,
                actor,
                Authority::Participant,
                Scope::Milestone(milestone_id),
                || async {
                    let mut milestone = self.runner.load_milestone(milestone_id).await?;
                    let contract = self.runner.load_contract(milestone.contract_id).await?;
                    Authority::Participant.authorize(actor, &[&contract.client_id], "review this milestone")?;
                    ensure_milestone_unfrozen(&contract, &milestone)?;
                    ensure_contract_active(&contract, &milestone, MilestoneState::Reviewed)?;

                    if milestone.state != MilestoneState::Submitted {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            milestone.state.as_str(),
                            MilestoneState::Reviewed.as_str(),
                            "only submitted work can be reviewed",
                        ));
                    }

                    let review = Review {
                        id: Uuid::new_v4(),
                        milestone_id,
                        reviewer_id: actor.id.clone(),
                        outcome,
                        comment: comment.clone(),
                        reviewed_at: Utc::now(),
                    };

                    milestone.state.transition_to(MilestoneState::Reviewed)?;
                    milestone.review_outcome = Some(outcome);
                    milestone.reviews.push(review.clone());
                    milestone.touch();

                    let mut changes = ChangeSet::new();
                    changes
                        .guard_contract(&contract)
                        .put_milestone(milestone.clone())
                        .log(ActivityLogEntry::applied(
                            Some(contract.id),
                            actor,
                            events::MILESTONE_REVIEWED,
                            Authority::Participant,
                            serde_json::json!({
                                "milestone_id": milestone.id,
                                "review_id": review.id,
                                "outcome": outcome,
                                "comment": review.comment,
                            }),
                        ));
                    Ok(Staged::new(changes, milestone))
                },
            )
            .await
    }

    /// Client releases the escrow of an approved milestone
    pub async fn release(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Milestone> {
        self.release_with(milestone_id, actor, Authority::Participant).await
    }

    pub(crate) async fn release_with(
        &self,
        milestone_id: Uuid,
        actor: &Actor,
        authority: Authority,
    ) -> EscrowResult<Milestone> {
        let milestone = self
            .runner
            .run(events::MILESTONE_RELEASED, actor, authority, Scope::Milestone(milestone_id), || async {
                let mut milestone = self.runner.load_milestone(milestone_id).await?;
                let contract = self.runner.load_contract(milestone.contract_id).await?;
                authority.authorize(actor, &[&contract.client_id], "release funds for this milestone")?;

                if milestone.state == MilestoneState::Released {
                    return Err(EscrowError::AlreadyReleased(milestone.id));
                }
                ensure_milestone_unfrozen(&contract, &milestone)?;

                if authority.is_override() {
                    if !matches!(contract.state, ContractState::Active | ContractState::Paused) {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            contract.state.as_str(),
                            MilestoneState::Released.as_str(),
                            format!("contract {} is not active or paused", contract.id),
                        ));
                    }
                    if !matches!(
                        milestone.state,
                        MilestoneState::Started | MilestoneState::Submitted | MilestoneState::Reviewed
                    ) {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            milestone.state.as_str(),
                            MilestoneState::Released.as_str(),
                            "work has not started on this milestone",
                        ));
                    }
                } else {
                    ensure_contract_active(&contract, &milestone, MilestoneState::Released)?;
                    if !milestone.is_approved() {
                        return Err(EscrowError::invalid_state(
                            MilestoneState::ENTITY,
                            milestone.state.as_str(),
                            MilestoneState::Released.as_str(),
                            "milestone must be reviewed and approved before release",
                        ));
                    }
                }

                let mut escrow = self.runner.load_escrow(milestone_id).await?;
                let settlement = escrow.release()?;

                milestone.state.transition_to(MilestoneState::Released)?;
                milestone.released_at = Some(Utc::now());
                milestone.touch();

                // sibling releases serialize on the contract version
                let mut contract = contract;
                contract.touch();

                let mut changes = ChangeSet::new();
                changes
                    .put_contract(contract.clone())
                    .put_milestone(milestone.clone())
                    .put_escrow(escrow)
                    .log(ActivityLogEntry::applied(
                        Some(contract.id),
                        actor,
                        events::MILESTONE_RELEASED,
                        authority,
                        serde_json::json!({
                            "milestone_id": milestone.id,
                            "amount": settlement.to_provider,
                            "provider_id": contract.provider_id,
                        }),
                    ));

                let siblings = self.runner.store().milestones_for_contract(contract.id).await?;
                stage_completion(&contract, siblings, &mut changes)?;
                Ok(Staged::new(changes, milestone))
            })
            .await?;

        info!(
            "Released {} for milestone {} of contract {}",
            milestone.amount, milestone.id, milestone.contract_id
        );

        Ok(milestone)
    }

    /// Submission history, oldest first
    pub async fn submissions(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Vec<Submission>> {
        Ok(self.visible_milestone(milestone_id, actor).await?.submissions)
    }

    /// Review history, oldest first
    pub async fn reviews(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Vec<Review>> {
        Ok(self.visible_milestone(milestone_id, actor).await?.reviews)
    }

    async fn visible_milestone(&self, milestone_id: Uuid, actor: &Actor) -> EscrowResult<Milestone> {
        let milestone = self.runner.load_milestone(milestone_id).await?;
        let contract = self.runner.load_contract(milestone.contract_id).await?;
        if let Err(err) = ensure_can_view(&contract, actor) {
            self.runner
                .deny(events::CONTRACT_VIEWED, actor, Some(contract.id), &err)
                .await;
            return Err(err);
        }
        Ok(milestone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::EngineConfig,
        models::{EscrowAccount, MilestoneTerms},
        store::{ContractStore, MemoryStore},
    };
    use rust_decimal::Decimal;

    async fn active_contract(funded: bool) -> (Arc<MemoryStore>, MilestoneManager, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(TransitionRunner::new(store.clone(), Arc::new(EngineConfig::default())));

        let mut contract = Contract::new("client".into(), "provider".into(), "Logo".into(), None);
        contract.state = ContractState::Active;
        let milestone = Milestone::new(
            contract.id,
            0,
            MilestoneTerms {
                title: "Sketches".into(),
                description: None,
                amount: Decimal::from(100),
            },
        );
        let mut escrow = EscrowAccount::new(contract.id, milestone.id, milestone.amount);
        if funded {
            escrow.fund(milestone.amount, Some("pi_1".into())).unwrap();
        }
        contract.milestone_ids.push(milestone.id);

        let mut changes = ChangeSet::new();
        changes
            .put_contract(contract)
            .put_milestone(milestone.clone())
            .put_escrow(escrow);
        store.commit(changes).await.unwrap();

        (store, MilestoneManager::new(runner), milestone.id)
    }

    #[tokio::test]
    async fn test_start_requires_funded_escrow() {
        let (_store, manager, milestone_id) = active_contract(false).await;
        let err = manager.start(milestone_id, &Actor::user("provider")).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let (_store, manager, milestone_id) = active_contract(true).await;

        let err = manager.start(milestone_id, &Actor::user("client")).await.unwrap_err();
        assert_eq!(err.kind(), "PermissionError");

        manager.start(milestone_id, &Actor::user("provider")).await.unwrap();
        manager
            .submit(milestone_id, &Actor::user("provider"), "v1.png", None)
            .await
            .unwrap();

        let err = manager
            .review(milestone_id, &Actor::user("provider"), ReviewOutcome::Approve, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PermissionError");
    }

    #[tokio::test]
    async fn test_reject_then_resubmit_then_release() {
        let (store, manager, milestone_id) = active_contract(true).await;
        let client = Actor::user("client");
        let provider = Actor::user("provider");

        manager.start(milestone_id, &provider).await.unwrap();
        manager.submit(milestone_id, &provider, "v1.png", None).await.unwrap();

        let reviewed = manager
            .review(milestone_id, &client, ReviewOutcome::Reject, Some("colors".into()))
            .await
            .unwrap();
        assert!(reviewed.awaits_resubmission());

        let err = manager.release(milestone_id, &client).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidStateError");

        manager
            .submit(milestone_id, &provider, "v2.png", Some("fixed colors".into()))
            .await
            .unwrap();
        manager
            .review(milestone_id, &client, ReviewOutcome::Approve, None)
            .await
            .unwrap();

        let released = manager.release(milestone_id, &client).await.unwrap();
        assert_eq!(released.state, MilestoneState::Released);

        let err = manager.release(milestone_id, &client).await.unwrap_err();
        assert_eq!(err.kind(), "AlreadyReleasedError");

        assert_eq!(manager.submissions(milestone_id, &client).await.unwrap().len(), 2);
        assert_eq!(manager.reviews(milestone_id, &provider).await.unwrap().len(), 2);

        let escrow = store.escrow_for_milestone(milestone_id).await.unwrap().unwrap();
        assert_eq!(escrow.state, EscrowState::Released);
        assert_eq!(escrow.released_amount, Decimal::from(100));

        let milestone = store.milestone(milestone_id).await.unwrap().unwrap();
        let contract = store.contract(milestone.contract_id).await.unwrap().unwrap();
        assert_eq!(contract.state, ContractState::Completed);
    }

    #[tokio::test]
    async fn test_submit_requires_content() {
        let (_store, manager, milestone_id) = active_contract(true).await;
        let provider = Actor::user("provider");

        manager.start(milestone_id, &provider).await.unwrap();
        let err = manager.submit(milestone_id, &provider, "  ", None).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn test_history_hidden_from_strangers() {
        let (_store, manager, milestone_id) = active_contract(true).await;
        let err = manager
            .submissions(milestone_id, &Actor::user("stranger"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PermissionError");
    }

    /// Store that refuses any commit completing a contract while `refuse` is set
    struct CompletionRefusingStore {
        inner: MemoryStore,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ContractStore for CompletionRefusingStore {
        async fn contract(&self, id: Uuid) -> EscrowResult<Option<Contract>> {
            self.inner.contract(id).await
        }
        async fn contracts(&self) -> EscrowResult<Vec<Contract>> {
            self.inner.contracts().await
        }
        async fn contracts_for_party(&self, user_id: &str) -> EscrowResult<Vec<Contract>> {
            self.inner.contracts_for_party(user_id).await
        }
        async fn milestone(&self, id: Uuid) -> EscrowResult<Option<Milestone>> {
            self.inner.milestone(id).await
        }
        async fn milestones_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<Milestone>> {
            self.inner.milestones_for_contract(contract_id).await
        }
        async fn escrow_for_milestone(&self, milestone_id: Uuid) -> EscrowResult<Option<EscrowAccount>> {
            self.inner.escrow_for_milestone(milestone_id).await
        }
        async fn escrows_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<EscrowAccount>> {
            self.inner.escrows_for_contract(contract_id).await
        }
        async fn payment_transaction(
            &self,
            transaction_id: &str,
        ) -> EscrowResult<Option<crate::models::PaymentTransaction>> {
            self.inner.payment_transaction(transaction_id).await
        }
        async fn change_request(&self, id: Uuid) -> EscrowResult<Option<crate::models::ChangeRequest>> {
            self.inner.change_request(id).await
        }
        async fn change_requests_for_contract(
            &self,
            contract_id: Uuid,
        ) -> EscrowResult<Vec<crate::models::ChangeRequest>> {
            self.inner.change_requests_for_contract(contract_id).await
        }
        async fn dispute(&self, id: Uuid) -> EscrowResult<Option<crate::models::Dispute>> {
            self.inner.dispute(id).await
        }
        async fn disputes_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<crate::models::Dispute>> {
            self.inner.disputes_for_contract(contract_id).await
        }
        async fn activity_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<ActivityLogEntry>> {
            self.inner.activity_for_contract(contract_id).await
        }
        async fn recent_activity(&self, limit: usize) -> EscrowResult<Vec<ActivityLogEntry>> {
            self.inner.recent_activity(limit).await
        }
        async fn commit(&self, changes: ChangeSet) -> EscrowResult<()> {
            let completes = changes
                .contracts
                .iter()
                .any(|c| c.state == ContractState::Completed);
            if completes && self.refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EscrowError::storage("write refused"));
            }
            self.inner.commit(changes).await
        }
    }

    #[tokio::test]
    async fn test_final_release_and_completion_commit_together() {
        let (seeded, seeded_manager, milestone_id) = active_contract(true).await;
        drop(seeded_manager);
        let store = Arc::new(CompletionRefusingStore {
            inner: Arc::try_unwrap(seeded).unwrap(),
            refuse: std::sync::atomic::AtomicBool::new(true),
        });
        let runner = Arc::new(TransitionRunner::new(store.clone(), Arc::new(EngineConfig::default())));
        let manager = MilestoneManager::new(runner);
        let client = Actor::user("client");
        let provider = Actor::user("provider");

        manager.start(milestone_id, &provider).await.unwrap();
        manager.submit(milestone_id, &provider, "final.pdf", None).await.unwrap();
        manager
            .review(milestone_id, &client, ReviewOutcome::Approve, None)
            .await
            .unwrap();

        let err = manager.release(milestone_id, &client).await.unwrap_err();
        assert_eq!(err.kind(), "StorageError");
        let escrow = store.escrow_for_milestone(milestone_id).await.unwrap().unwrap();
        assert_eq!(escrow.state, EscrowState::Funded);
        let milestone = store.milestone(milestone_id).await.unwrap().unwrap();
        assert_eq!(milestone.state, MilestoneState::Reviewed);

        store.refuse.store(false, std::sync::atomic::Ordering::SeqCst);
        let released = manager.release(milestone_id, &client).await.unwrap();
        assert_eq!(released.state, MilestoneState::Released);

        let contract = store.contract(released.contract_id).await.unwrap().unwrap();
        assert_eq!(contract.state, ContractState::Completed);
        let applied: Vec<String> = store
            .activity_for_contract(contract.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_rejection())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            &applied[applied.len() - 2..],
            &[events::MILESTONE_RELEASED.to_string(), events::CONTRACT_COMPLETED.to_string()]
        );
    }

    #[tokio::test]
    async fn test_inactive_contract_error_names_milestone_transition() {
        let (store, manager, milestone_id) = active_contract(true).await;
        let milestone = store.milestone(milestone_id).await.unwrap().unwrap();
        let mut contract = store.contract(milestone.contract_id).await.unwrap().unwrap();
        contract.state = ContractState::Paused;
        let mut changes = ChangeSet::new();
        changes.put_contract(contract);
        store.commit(changes).await.unwrap();

        match manager.start(milestone_id, &Actor::user("provider")).await.unwrap_err() {
            EscrowError::InvalidState { entity, from, to, reason } => {
                assert_eq!(entity, MilestoneState::ENTITY);
                assert_eq!(from, "pending");
                assert_eq!(to, "started");
                assert!(reason.contains("paused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
