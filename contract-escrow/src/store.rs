//! Persistence seam for the contract engine
//!
//! Storage is passed explicitly as an `Arc<dyn ContractStore>`. Writes go
//! through [`ContractStore::commit`], which applies a whole [`ChangeSet`]
//! or nothing: every record carries the version it was read at, and a
//! change set built from a stale snapshot is rejected with
//! [`EscrowError::StaleWrite`].

use crate::{
    error::EscrowError,
    models::{
        ActivityLogEntry, ChangeRequest, Contract, Dispute, EscrowAccount, Milestone,
        PaymentTransaction,
    },
    EscrowResult,
};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, hash::Hash};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Entity stored under optimistic version control
pub trait Versioned: Clone {
    type Key: Eq + Hash + Clone + fmt::Display;

    const ENTITY: &'static str;

    fn key(&self) -> Self::Key;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

macro_rules! versioned {
    ($ty:ty, $key:ty, $entity:literal, |$r:ident| $key_expr:expr) => {
        impl Versioned for $ty {
            type Key = $key;

            const ENTITY: &'static str = $entity;

            fn key(&self) -> $key {
                let $r = self;
                $key_expr
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

versioned!(Contract, Uuid, "contract", |r| r.id);
versioned!(Milestone, Uuid, "milestone", |r| r.id);
// one account per milestone
versioned!(EscrowAccount, Uuid, "escrow", |r| r.milestone_id);
versioned!(PaymentTransaction, String, "payment transaction", |r| r.transaction_id.clone());
versioned!(ChangeRequest, Uuid, "change request", |r| r.id);
versioned!(Dispute, Uuid, "dispute", |r| r.id);

/// Writes of one transition, applied atomically
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub contracts: Vec<Contract>,
    pub milestones: Vec<Milestone>,
    pub escrows: Vec<EscrowAccount>,
    pub payments: Vec<PaymentTransaction>,
    pub change_requests: Vec<ChangeRequest>,
    pub disputes: Vec<Dispute>,
    /// Contracts read (not written) whose version must still match
    pub contract_guards: Vec<(Uuid, u64)>,
    pub activity: Vec<ActivityLogEntry>,
}

fn upsert<T: Versioned>(records: &mut Vec<T>, record: T) {
    match records.iter_mut().find(|r| r.key() == record.key()) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_contract(&mut self, contract: Contract) -> &mut Self {
        upsert(&mut self.contracts, contract);
        self
    }

    pub fn put_milestone(&mut self, milestone: Milestone) -> &mut Self {
        upsert(&mut self.milestones, milestone);
        self
    }

    pub fn put_escrow(&mut self, escrow: EscrowAccount) -> &mut Self {
        upsert(&mut self.escrows, escrow);
        self
    }

    pub fn put_payment(&mut self, payment: PaymentTransaction) -> &mut Self {
        upsert(&mut self.payments, payment);
        self
    }

    pub fn put_change_request(&mut self, change_request: ChangeRequest) -> &mut Self {
        upsert(&mut self.change_requests, change_request);
        self
    }

    pub fn put_dispute(&mut self, dispute: Dispute) -> &mut Self {
        upsert(&mut self.disputes, dispute);
        self
    }

    /// Require the contract to be unchanged since it was read
    pub fn guard_contract(&mut self, contract: &Contract) -> &mut Self {
        self.contract_guards.push((contract.id, contract.version));
        self
    }

    pub fn log(&mut self, entry: ActivityLogEntry) -> &mut Self {
        self.activity.push(entry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
            && self.milestones.is_empty()
            && self.escrows.is_empty()
            && self.payments.is_empty()
            && self.change_requests.is_empty()
            && self.disputes.is_empty()
            && self.activity.is_empty()
    }
}

/// Storage handle used by every manager
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn contract(&self, id: Uuid) -> EscrowResult<Option<Contract>>;

    async fn contracts(&self) -> EscrowResult<Vec<Contract>>;

    /// Contracts where `user_id` is client or provider
    async fn contracts_for_party(&self, user_id: &str) -> EscrowResult<Vec<Contract>>;

    async fn milestone(&self, id: Uuid) -> EscrowResult<Option<Milestone>>;

    /// Milestones of a contract ordered by position
    async fn milestones_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<Milestone>>;

    async fn escrow_for_milestone(&self, milestone_id: Uuid) -> EscrowResult<Option<EscrowAccount>>;

    async fn escrows_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<EscrowAccount>>;

    async fn payment_transaction(&self, transaction_id: &str) -> EscrowResult<Option<PaymentTransaction>>;

    async fn change_request(&self, id: Uuid) -> EscrowResult<Option<ChangeRequest>>;

    async fn change_requests_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<ChangeRequest>>;

    async fn dispute(&self, id: Uuid) -> EscrowResult<Option<Dispute>>;

    async fn disputes_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<Dispute>>;

    /// Activity of a contract in insertion order
    async fn activity_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<ActivityLogEntry>>;

    /// Newest entries first
    async fn recent_activity(&self, limit: usize) -> EscrowResult<Vec<ActivityLogEntry>>;

    /// Apply a change set atomically or fail with `StaleWrite`
    async fn commit(&self, changes: ChangeSet) -> EscrowResult<()>;
}

#[derive(Debug, Default)]
struct Tables {
    contracts: HashMap<Uuid, Contract>,
    milestones: HashMap<Uuid, Milestone>,
    escrows: HashMap<Uuid, EscrowAccount>,
    payments: HashMap<String, PaymentTransaction>,
    change_requests: HashMap<Uuid, ChangeRequest>,
    disputes: HashMap<Uuid, Dispute>,
    activity: Vec<ActivityLogEntry>,
}

fn check<T: Versioned>(table: &HashMap<T::Key, T>, records: &[T]) -> EscrowResult<()> {
    for record in records {
        let stored = table.get(&record.key()).map(|r| r.version());
        let fresh = match stored {
            Some(version) => version == record.version(),
            None => record.version() == 0,
        };
        if !fresh {
            return Err(EscrowError::StaleWrite {
                entity: T::ENTITY,
                id: record.key().to_string(),
            });
        }
    }
    Ok(())
}

fn apply<T: Versioned>(table: &mut HashMap<T::Key, T>, records: Vec<T>) {
    for mut record in records {
        record.set_version(record.version() + 1);
        table.insert(record.key(), record);
    }
}

/// In-process store; one write lock per commit serializes change sets
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn contract(&self, id: Uuid) -> EscrowResult<Option<Contract>> {
        Ok(self.tables.read().await.contracts.get(&id).cloned())
    }

    async fn contracts(&self) -> EscrowResult<Vec<Contract>> {
        let tables = self.tables.read().await;
        let mut contracts: Vec<Contract> = tables.contracts.values().cloned().collect();
        contracts.sort_by_key(|c| c.created_at);
        Ok(contracts)
    }

    async fn contracts_for_party(&self, user_id: &str) -> EscrowResult<Vec<Contract>> {
        let tables = self.tables.read().await;
        let mut contracts: Vec<Contract> = tables
            .contracts
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect();
        contracts.sort_by_key(|c| c.created_at);
        Ok(contracts)
    }

    async fn milestone(&self, id: Uuid) -> EscrowResult<Option<Milestone>> {
        Ok(self.tables.read().await.milestones.get(&id).cloned())
    }

    async fn milestones_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<Milestone>> {
        let tables = self.tables.read().await;
        let mut milestones: Vec<Milestone> = tables
            .milestones
            .values()
            .filter(|m| m.contract_id == contract_id)
            .cloned()
            .collect();
        milestones.sort_by_key(|m| m.position);
        Ok(milestones)
    }

    async fn escrow_for_milestone(&self, milestone_id: Uuid) -> EscrowResult<Option<EscrowAccount>> {
        Ok(self.tables.read().await.escrows.get(&milestone_id).cloned())
    }

    async fn escrows_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<EscrowAccount>> {
        let tables = self.tables.read().await;
        let mut escrows: Vec<EscrowAccount> = tables
            .escrows
            .values()
            .filter(|e| e.contract_id == contract_id)
            .cloned()
            .collect();
        escrows.sort_by_key(|e| {
            tables
                .milestones
                .get(&e.milestone_id)
                .map(|m| m.position)
                .unwrap_or(u32::MAX)
        });
        Ok(escrows)
    }

    async fn payment_transaction(&self, transaction_id: &str) -> EscrowResult<Option<PaymentTransaction>> {
        Ok(self.tables.read().await.payments.get(transaction_id).cloned())
    }

    async fn change_request(&self, id: Uuid) -> EscrowResult<Option<ChangeRequest>> {
        Ok(self.tables.read().await.change_requests.get(&id).cloned())
    }

    async fn change_requests_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<ChangeRequest>> {
        let tables = self.tables.read().await;
        let mut requests: Vec<ChangeRequest> = tables
            .change_requests
            .values()
            .filter(|r| r.contract_id == contract_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn dispute(&self, id: Uuid) -> EscrowResult<Option<Dispute>> {
        Ok(self.tables.read().await.disputes.get(&id).cloned())
    }

    async fn disputes_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<Dispute>> {
        let tables = self.tables.read().await;
        let mut disputes: Vec<Dispute> = tables
            .disputes
            .values()
            .filter(|d| d.contract_id == contract_id)
            .cloned()
            .collect();
        disputes.sort_by_key(|d| d.created_at);
        Ok(disputes)
    }

    async fn activity_for_contract(&self, contract_id: Uuid) -> EscrowResult<Vec<ActivityLogEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .activity
            .iter()
            .filter(|entry| entry.contract_id == Some(contract_id))
            .cloned()
            .collect())
    }

    async fn recent_activity(&self, limit: usize) -> EscrowResult<Vec<ActivityLogEntry>> {
        let tables = self.tables.read().await;
        Ok(tables.activity.iter().rev().take(limit).cloned().collect())
    }

    async fn commit(&self, changes: ChangeSet) -> EscrowResult<()> {
        let mut tables = self.tables.write().await;

        for (contract_id, version) in &changes.contract_guards {
            let stored = tables.contracts.get(contract_id).map(|c| c.version);
            if stored != Some(*version) {
                return Err(EscrowError::StaleWrite {
                    entity: "contract",
                    id: contract_id.to_string(),
                });
            }
        }
        check(&tables.contracts, &changes.contracts)?;
        check(&tables.milestones, &changes.milestones)?;
        check(&tables.escrows, &changes.escrows)?;
        check(&tables.payments, &changes.payments)?;
        check(&tables.change_requests, &changes.change_requests)?;
        check(&tables.disputes, &changes.disputes)?;

        apply(&mut tables.contracts, changes.contracts);
        apply(&mut tables.milestones, changes.milestones);
        apply(&mut tables.escrows, changes.escrows);
        apply(&mut tables.payments, changes.payments);
        apply(&mut tables.change_requests, changes.change_requests);
        apply(&mut tables.disputes, changes.disputes);
        tables.activity.extend(changes.activity);

        Ok(())
    }
}
