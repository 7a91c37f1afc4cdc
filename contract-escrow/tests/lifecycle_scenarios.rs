//! End-to-end scenarios through the public engine API

use contract_escrow::{
    activity::events,
    config::EngineConfig,
    contracts::{CreateContractRequest, EscrowDisposition},
    disputes::DisputeTarget,
    error::EscrowError,
    funding::FundingTarget,
    lifecycle::{ContractState, EscrowState, MilestoneState, PaymentStatus},
    models::{ChangeDiff, Contract, DisputeResolution, MilestoneTerms, PaymentOutcome, ReviewOutcome},
    Actor, ContractEngine,
};
use rust_decimal::Decimal;

fn engine() -> ContractEngine {
    ContractEngine::with_memory_store(EngineConfig::default()).expect("default config is valid")
}

fn client() -> Actor {
    Actor::user("client-1")
}

fn provider() -> Actor {
    Actor::user("provider-1")
}

fn terms(title: &str, amount: i64) -> MilestoneTerms {
    MilestoneTerms {
        title: title.to_string(),
        description: None,
        amount: Decimal::from(amount),
    }
}

/// Contract sent by the client and accepted by the provider
async fn accepted_contract(engine: &ContractEngine, amounts: &[i64]) -> anyhow::Result<Contract> {
    let contract = engine
        .contracts()
        .create_contract(
            &client(),
            CreateContractRequest {
                provider_id: provider().id,
                title: "Landing page".to_string(),
                description: Some("Design and build".to_string()),
                milestones: amounts
                    .iter()
                    .enumerate()
                    .map(|(i, amount)| terms(&format!("Milestone {}", i + 1), *amount))
                    .collect(),
            },
        )
        .await?;
    engine.contracts().send(contract.id, &client()).await?;
    Ok(engine.contracts().accept(contract.id, &provider()).await?)
}

/// Active contract whose first milestone is funded and submitted
async fn submitted_milestone(engine: &ContractEngine) -> anyhow::Result<Contract> {
    let contract = accepted_contract(engine, &[100]).await?;
    let milestone_id = contract.milestone_ids[0];

    engine
        .funding()
        .fund(FundingTarget::Contract(contract.id), &client(), Decimal::from(100), None)
        .await?;
    engine.milestones().start(milestone_id, &provider()).await?;
    engine
        .milestones()
        .submit(milestone_id, &provider(), "https://files.example/v1.zip", None)
        .await?;
    Ok(contract)
}

#[tokio::test]
async fn happy_path_with_rejected_review_completes_contract() -> anyhow::Result<()> {
    let engine = engine();
    let contract = submitted_milestone(&engine).await?;
    let milestone_id = contract.milestone_ids[0];

    let stored = engine.contracts().get_contract(contract.id, &client()).await?;
    assert_eq!(stored.state, ContractState::Active);

    engine
        .milestones()
        .review(milestone_id, &client(), ReviewOutcome::Reject, Some("missing footer".into()))
        .await?;
    engine
        .milestones()
        .submit(milestone_id, &provider(), "https://files.example/v2.zip", Some("footer added".into()))
        .await?;
    engine
        .milestones()
        .review(milestone_id, &client(), ReviewOutcome::Approve, None)
        .await?;
    let released = engine.milestones().release(milestone_id, &client()).await?;
    assert_eq!(released.state, MilestoneState::Released);

    let status = engine.funding().status(contract.id, &provider()).await?;
    assert_eq!(status.accounts[0].state, EscrowState::Released);
    assert_eq!(status.total_released, Decimal::from(100));
    assert_eq!(status.total_held, Decimal::ZERO);

    let stored = engine.contracts().get_contract(contract.id, &client()).await?;
    assert_eq!(stored.state, ContractState::Completed);

    let entries = engine.activity().contract_activity(contract.id, &client()).await?;
    let kinds: Vec<&str> = entries.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            events::CONTRACT_CREATED,
            events::CONTRACT_SENT,
            events::CONTRACT_ACCEPTED,
            events::ESCROW_FUNDED,
            events::CONTRACT_ACTIVATED,
            events::MILESTONE_STARTED,
            events::MILESTONE_SUBMITTED,
            events::MILESTONE_REVIEWED,
            events::MILESTONE_SUBMITTED,
            events::MILESTONE_REVIEWED,
            events::MILESTONE_RELEASED,
            events::CONTRACT_COMPLETED,
        ]
    );
    assert!(entries.iter().all(|e| !e.is_rejection() && !e.admin_override));
    Ok(())
}

#[tokio::test]
async fn underfunding_is_rejected_and_audited() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100]).await?;

    let err = engine
        .funding()
        .fund(FundingTarget::Milestone(contract.milestone_ids[0]), &client(), Decimal::from(60), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::InsufficientFunds { .. }));

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.accounts[0].state, EscrowState::Unfunded);
    assert_eq!(
        engine.contracts().get_contract(contract.id, &client()).await?.state,
        ContractState::Accepted
    );

    let entries = engine.activity().contract_activity(contract.id, &client()).await?;
    let last = entries.last().expect("rejection is logged");
    assert!(last.is_rejection());
    assert_eq!(last.event_type, events::ESCROW_FUNDED);
    Ok(())
}

#[tokio::test]
async fn dispute_blocks_review_until_refund() -> anyhow::Result<()> {
    let engine = engine();
    let contract = submitted_milestone(&engine).await?;
    let milestone_id = contract.milestone_ids[0];

    let dispute = engine
        .disputes()
        .create(DisputeTarget::Milestone(milestone_id), &client(), "work does not match the brief")
        .await?;

    let err = engine
        .milestones()
        .review(milestone_id, &client(), ReviewOutcome::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "DisputeActiveError");
    assert_eq!(err.status_code(), 423);

    let resolved = engine
        .disputes()
        .resolve(
            dispute.id,
            &Actor::arbitrator("arbiter-1"),
            DisputeResolution::RefundToClient,
            Some("deliverable incomplete".into()),
        )
        .await?;
    assert_eq!(resolved.settlements[0].to_client, Decimal::from(100));

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.accounts[0].state, EscrowState::Refunded);
    assert_eq!(status.total_refunded, Decimal::from(100));

    let milestones = engine.contracts().milestones(contract.id, &client()).await?;
    assert_eq!(milestones[0].state, MilestoneState::Closed);

    // a refunded milestone never counts toward completion
    let contract = engine.contracts().reconcile_completion(contract.id).await?;
    assert_eq!(contract.state, ContractState::Active);
    Ok(())
}

#[tokio::test]
async fn concurrent_release_moves_funds_once() -> anyhow::Result<()> {
    let engine = engine();
    let contract = submitted_milestone(&engine).await?;
    let milestone_id = contract.milestone_ids[0];
    engine
        .milestones()
        .review(milestone_id, &client(), ReviewOutcome::Approve, None)
        .await?;

    let client = client();
    let (first, second) = tokio::join!(
        engine.milestones().release(milestone_id, &client),
        engine.milestones().release(milestone_id, &client),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results
        .into_iter()
        .find_map(|r| r.err())
        .expect("one release fails");
    assert!(matches!(
        err.kind(),
        "AlreadyReleasedError" | "ConflictError"
    ));

    let status = engine.funding().status(contract.id, &client).await?;
    assert_eq!(status.total_released, Decimal::from(100));

    let entries = engine.activity().contract_activity(contract.id, &client).await?;
    let applied_releases = entries
        .iter()
        .filter(|e| e.event_type == events::MILESTONE_RELEASED && !e.is_rejection())
        .count();
    assert_eq!(applied_releases, 1);
    Ok(())
}

#[tokio::test]
async fn payment_callback_redelivery_is_a_noop() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[250]).await?;

    let payment = engine
        .funding()
        .initiate_funding(FundingTarget::Contract(contract.id), &client(), Decimal::from(250))
        .await?;
    assert_eq!(payment.status, PaymentStatus::Pending);

    let outcome = PaymentOutcome::Succeeded {
        payment_ref: Some("pi_3Nx".into()),
    };
    for _ in 0..3 {
        let confirmed = engine
            .funding()
            .fund_callback(&payment.transaction_id, outcome.clone())
            .await?;
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    }

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.total_held, Decimal::from(250));
    assert_eq!(status.accounts[0].payment_ref.as_deref(), Some("pi_3Nx"));

    let entries = engine.activity().contract_activity(contract.id, &client()).await?;
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event_type == events::ESCROW_FUNDED)
            .count(),
        1
    );
    assert_eq!(
        engine.contracts().get_contract(contract.id, &client()).await?.state,
        ContractState::Active
    );
    Ok(())
}

#[tokio::test]
async fn admin_overrides_are_tagged() -> anyhow::Result<()> {
    let engine = engine();
    let ops = Actor::admin("ops-1");
    let contract = accepted_contract(&engine, &[100, 50]).await?;

    engine
        .funding()
        .fund(FundingTarget::Contract(contract.id), &client(), Decimal::from(100), None)
        .await?;

    let err = engine
        .admin()
        .admin_pause_contract(contract.id, &provider())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PermissionError");

    engine.admin().admin_pause_contract(contract.id, &ops).await?;
    engine
        .admin()
        .admin_cancel_contract(contract.id, &ops, "terms violation", EscrowDisposition::Refund)
        .await?;

    let stored = engine.contracts().get_contract(contract.id, &ops).await?;
    assert_eq!(stored.state, ContractState::Cancelled);

    let entries = engine.activity().recent_activity(&ops, None).await?;
    let overrides: Vec<(&str, &str, bool)> = entries
        .iter()
        .filter(|e| e.admin_override)
        .map(|e| (e.event_type.as_str(), e.actor_id.as_str(), e.is_rejection()))
        .collect();
    // newest first, including the provider's denied override attempt
    assert_eq!(
        overrides,
        vec![
            (events::CONTRACT_CANCELLED, "ops-1", false),
            (events::CONTRACT_PAUSED, "ops-1", false),
            (events::CONTRACT_PAUSED, "provider-1", true),
        ]
    );

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.total_refunded, Decimal::from(100));
    assert_eq!(status.total_held, Decimal::ZERO);
    Ok(())
}

#[tokio::test]
async fn second_pending_change_request_conflicts() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100, 200]).await?;
    engine
        .funding()
        .fund(FundingTarget::Contract(contract.id), &client(), Decimal::from(100), None)
        .await?;

    let rename = ChangeDiff::UpdateTerms {
        title: Some("Landing page v2".into()),
        description: None,
    };
    let request = engine
        .change_requests()
        .create(contract.id, &provider(), rename.clone(), None)
        .await?;

    let err = engine
        .change_requests()
        .create(contract.id, &client(), rename, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConflictError");

    engine.change_requests().accept(request.id, &client()).await?;
    let stored = engine.contracts().get_contract(contract.id, &provider()).await?;
    assert_eq!(stored.title, "Landing page v2");
    Ok(())
}

#[tokio::test]
async fn cancellation_needs_both_parties_once_accepted() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100]).await?;
    engine
        .funding()
        .fund(FundingTarget::Contract(contract.id), &client(), Decimal::from(100), None)
        .await?;

    let pending = engine
        .contracts()
        .cancel(contract.id, &client(), "project shelved")
        .await?;
    assert_eq!(pending.state, ContractState::Active);
    assert_eq!(pending.cancellation_requested_by.as_deref(), Some("client-1"));

    let err = engine
        .contracts()
        .cancel(contract.id, &client(), "project shelved")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ConflictError");

    let cancelled = engine
        .contracts()
        .cancel(contract.id, &provider(), "agreed")
        .await?;
    assert_eq!(cancelled.state, ContractState::Cancelled);

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.accounts[0].state, EscrowState::Refunded);
    Ok(())
}

#[tokio::test]
async fn foreign_reads_are_denied_and_audited() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100]).await?;
    let stranger = Actor::user("stranger");

    let err = engine
        .contracts()
        .get_contract(contract.id, &stranger)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "PermissionError");
    assert!(engine.funding().status(contract.id, &stranger).await.is_err());

    let entries = engine
        .activity()
        .contract_activity(contract.id, &Actor::admin("ops-1"))
        .await?;
    let denied = entries.iter().filter(|e| e.actor_id == "stranger").count();
    assert_eq!(denied, 2);

    let body = engine.response_filter().to_filtered_value(&entries)?;
    assert_eq!(body.as_array().map(|a| a.len()), Some(entries.len()));
    Ok(())
}

#[tokio::test]
async fn payment_confirmed_during_dispute_stays_in_escrow() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100, 80]).await?;
    let second = contract.milestone_ids[1];

    engine
        .funding()
        .fund(FundingTarget::Contract(contract.id), &client(), Decimal::from(100), None)
        .await?;
    let payment = engine
        .funding()
        .initiate_funding(FundingTarget::Milestone(second), &client(), Decimal::from(80))
        .await?;

    let dispute = engine
        .disputes()
        .create(DisputeTarget::Milestone(second), &client(), "scope unclear")
        .await?;

    let confirmed = engine
        .funding()
        .fund_callback(
            &payment.transaction_id,
            PaymentOutcome::Succeeded {
                payment_ref: Some("ch_late".into()),
            },
        )
        .await?;
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);

    // still frozen: the funded milestone cannot be started yet
    let err = engine.milestones().start(second, &provider()).await.unwrap_err();
    assert_eq!(err.kind(), "DisputeActiveError");

    engine
        .disputes()
        .resolve(dispute.id, &Actor::arbitrator("arbiter-1"), DisputeResolution::Dismiss, None)
        .await?;

    let status = engine.funding().status(contract.id, &client()).await?;
    assert_eq!(status.accounts[1].state, EscrowState::Funded);
    assert_eq!(status.total_held, Decimal::from(180));

    let started = engine.milestones().start(second, &provider()).await?;
    assert_eq!(started.state, MilestoneState::Started);
    Ok(())
}

#[tokio::test]
async fn removed_milestone_is_left_out_of_completion() -> anyhow::Result<()> {
    let engine = engine();
    let contract = accepted_contract(&engine, &[100, 70]).await?;
    let (kept, dropped) = (contract.milestone_ids[0], contract.milestone_ids[1]);

    engine
        .funding()
        .fund(FundingTarget::Milestone(kept), &client(), Decimal::from(100), None)
        .await?;
    let request = engine
        .change_requests()
        .create(
            contract.id,
            &client(),
            ChangeDiff::RemoveMilestone { milestone_id: dropped },
            Some("out of budget".into()),
        )
        .await?;
    engine.change_requests().accept(request.id, &provider()).await?;

    engine.milestones().start(kept, &provider()).await?;
    engine
        .milestones()
        .submit(kept, &provider(), "https://files.example/final.zip", None)
        .await?;
    engine
        .milestones()
        .review(kept, &client(), ReviewOutcome::Approve, None)
        .await?;
    engine.milestones().release(kept, &client()).await?;

    let stored = engine.contracts().get_contract(contract.id, &client()).await?;
    assert_eq!(stored.state, ContractState::Completed);

    let completed = engine
        .activity()
        .contract_activity(contract.id, &client())
        .await?
        .into_iter()
        .find(|entry| entry.event_type == events::CONTRACT_COMPLETED)
        .expect("completion is logged");
    assert_eq!(completed.payload["milestones"], 1);
    assert_eq!(completed.payload["total_released"], serde_json::json!(Decimal::from(100)));
    Ok(())
}
