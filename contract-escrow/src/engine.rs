//! Contract Engine - high-level entry point
//!
//! Wires every manager to one store and one configuration. Callers enter
//! through the accessors; all managers share a single transition runner.

use crate::{
    activity::ActivityLog,
    admin::AdminOverride,
    change_requests::ChangeRequestManager,
    config::EngineConfig,
    contracts::ContractManager,
    disputes::DisputeManager,
    funding::EscrowService,
    milestones::MilestoneManager,
    response::SensitiveFieldFilter,
    store::{ContractStore, MemoryStore},
    transition::TransitionRunner,
    EscrowResult,
};
use std::sync::Arc;
use tracing::info;

/// Main engine that coordinates all components
pub struct ContractEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn ContractStore>,
    contracts: Arc<ContractManager>,
    milestones: Arc<MilestoneManager>,
    funding: Arc<EscrowService>,
    change_requests: ChangeRequestManager,
    disputes: DisputeManager,
    admin: AdminOverride,
    activity: ActivityLog,
    response_filter: SensitiveFieldFilter,
}

impl ContractEngine {
    /// Create an engine over `store`; fails on invalid configuration
    pub fn new(store: Arc<dyn ContractStore>, config: EngineConfig) -> EscrowResult<Self> {
        config.validate()?;
        info!("Initializing contract engine");

        let config = Arc::new(config);
        let runner = Arc::new(TransitionRunner::new(store.clone(), config.clone()));

        let contracts = Arc::new(ContractManager::new(runner.clone()));
        let milestones = Arc::new(MilestoneManager::new(runner.clone()));
        let funding = Arc::new(EscrowService::new(runner.clone()));
        let admin = AdminOverride::new(
            runner.clone(),
            contracts.clone(),
            milestones.clone(),
            funding.clone(),
        );

        Ok(Self {
            change_requests: ChangeRequestManager::new(runner.clone()),
            disputes: DisputeManager::new(runner),
            activity: ActivityLog::new(store.clone(), config.clone()),
            response_filter: SensitiveFieldFilter::new(&config.response),
            contracts,
            milestones,
            funding,
            admin,
            store,
            config,
        })
    }

    /// Engine over a fresh in-memory store
    pub fn with_memory_store(config: EngineConfig) -> EscrowResult<Self> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn ContractStore {
        self.store.as_ref()
    }

    pub fn contracts(&self) -> &ContractManager {
        &self.contracts
    }

    pub fn milestones(&self) -> &MilestoneManager {
        &self.milestones
    }

    pub fn funding(&self) -> &EscrowService {
        &self.funding
    }

    pub fn change_requests(&self) -> &ChangeRequestManager {
        &self.change_requests
    }

    pub fn disputes(&self) -> &DisputeManager {
        &self.disputes
    }

    pub fn admin(&self) -> &AdminOverride {
        &self.admin
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Filter configured from `response.sensitive_fields`
    pub fn response_filter(&self) -> &SensitiveFieldFilter {
        &self.response_filter
    }
}
