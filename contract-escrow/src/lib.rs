//! Contract, milestone and escrow lifecycle engine for a freelance marketplace
//!
//! This crate coordinates the multi-party lifecycle of a work contract:
//! - Contract and milestone state machines with static transition tables
//! - Per-milestone escrow accounts that only move funds on audited transitions
//! - Change requests and disputes that gate or override the normal flow
//! - An append-only activity log and an admin override layer
//!
//! Storage is reached through the [`store::ContractStore`] trait and every
//! transition commits as one atomic, version-checked change set.

pub mod activity;
pub mod admin;
pub mod change_requests;
pub mod config;
pub mod contracts;
pub mod disputes;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod funding;
pub mod lifecycle;
pub mod milestones;
pub mod models;
pub mod policy;
pub mod response;
pub mod store;
pub mod telemetry;
pub mod transition;

use error::EscrowError;

pub use engine::ContractEngine;
pub use policy::{Actor, Role};

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
