//! Micro-grants disbursement orchestrator.
//!
//! Drives a milestone payout through a Safe multisig from proposal to
//! confirmed execution, and reports each step to subscribers as it changes.
//!
//! ```text
//! POST /disbursements ─▶ Orchestrator::start ─▶ DisbursementHandle
//!                                                  │
//!                     poller ─▶ ChainStateReader ─▶ StepController ─▶ listeners
//!                     wallet ─▶ WalletSigner ────▶      │
//!                                                  DisbursementStore
//! ```

pub mod api;
pub mod chain;
pub mod config;
pub mod controller;
pub mod db;
pub mod errors;
pub mod orchestrator;
pub mod poller;
pub mod session;
pub mod steps;
pub mod store;
pub mod types;
pub mod wallet;

#[cfg(test)]
mod testutils;

pub use chain::{ChainStateReader, SafeTxServiceReader};
pub use config::{Config, OrchestratorConfig};
pub use controller::StepController;
pub use errors::{DisburserError, Result};
pub use orchestrator::{DisbursementHandle, Orchestrator, Phase, Snapshot, StepListener, Unsubscribe};
pub use session::SessionStore;
pub use store::{DisbursementStore, MemoryStore};
pub use types::{
    ChainState, DisbursementRequest, DisbursementTransaction, MilestoneId, Status, Step, StepEvent,
};
pub use wallet::{SigningPayload, SubmittedTx, WalletSigner};
