//! Error types for the contract engine
//!
//! Every state-machine failure is a recoverable value. Each variant maps
//! to a stable taxonomy name and an HTTP status for the response layer.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for contract, milestone and escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Wrong actor for this transition
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Transition not legal from the current state
    #[error("Invalid state transition for {entity}: {from} -> {to}: {reason}")]
    InvalidState {
        entity: String,
        from: String,
        to: String,
        reason: String,
    },

    /// Conflicting entity state, e.g. a duplicate pending request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Optimistic version check failed at commit time
    #[error("Stale write on {entity} {id}")]
    StaleWrite { entity: &'static str, id: String },

    /// The target is frozen by an open dispute
    #[error("Dispute {dispute_id} is open on this {target}")]
    DisputeActive { dispute_id: Uuid, target: String },

    /// Funding below the required escrow amount
    #[error("Insufficient funds: required {required}, received {received}")]
    InsufficientFunds { required: Decimal, received: Decimal },

    /// Funding above the required escrow amount
    #[error("Amount mismatch: required {required}, received {received}")]
    AmountMismatch { required: Decimal, received: Decimal },

    /// Release attempted on an already released milestone
    #[error("Milestone {0} has already been released")]
    AlreadyReleased(Uuid),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Missing or invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failures
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a permission error
    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Self::Permission(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<E, F, T, R>(entity: E, from: F, to: T, reason: R) -> Self
    where
        E: Into<String>,
        F: Into<String>,
        T: Into<String>,
        R: Into<String>,
    {
        Self::InvalidState {
            entity: entity.into(),
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: ToString>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable taxonomy name surfaced in response bodies and audit entries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Permission(_) => "PermissionError",
            Self::InvalidState { .. } => "InvalidStateError",
            Self::Conflict(_) | Self::StaleWrite { .. } => "ConflictError",
            Self::DisputeActive { .. } => "DisputeActiveError",
            Self::InsufficientFunds { .. } => "InsufficientFundsError",
            Self::AmountMismatch { .. } => "AmountMismatchError",
            Self::AlreadyReleased(_) => "AlreadyReleasedError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Config(_) => "ConfigurationError",
            Self::Storage(_) => "StorageError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// HTTP status code for the response layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_)
            | Self::InsufficientFunds { .. }
            | Self::AmountMismatch { .. } => 400,
            Self::Permission(_) => 403,
            Self::NotFound { .. } => 404,
            Self::InvalidState { .. }
            | Self::Conflict(_)
            | Self::StaleWrite { .. }
            | Self::AlreadyReleased(_) => 409,
            Self::DisputeActive { .. } => 423,
            Self::Config(_) | Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether a denied transition with this error gets an activity entry
    pub fn is_audited(&self) -> bool {
        !matches!(
            self,
            Self::NotFound { .. }
                | Self::StaleWrite { .. }
                | Self::Config(_)
                | Self::Storage(_)
                | Self::Serialization(_)
                | Self::Internal(_)
        )
    }

    /// Whether the message may be shown to callers verbatim
    pub fn is_client_facing(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
