//! The fixed catalog of disbursement steps.
//!
//! Each definition is a pure function of what the chain reports and what this
//! client has submitted. The controller decides what to do with the result;
//! nothing here knows about ordering or stored statuses.

use crate::types::{ChainState, Status, Step, Submission, WalletState};

/// Signature of a step's evaluation rule. `chain` is `None` until the
/// transaction was proposed and read at least once.
pub type Evaluate = fn(Option<&ChainState>, &WalletState) -> Status;

#[derive(Clone, Copy)]
pub struct StepDefinition {
    pub step: Step,
    pub evaluate: Evaluate,
}

/// The pipeline, in evaluation order.
pub const PIPELINE: [StepDefinition; 4] = [
    StepDefinition {
        step: Step::Propose,
        evaluate: evaluate_propose,
    },
    StepDefinition {
        step: Step::CollectSignatures,
        evaluate: evaluate_collect_signatures,
    },
    StepDefinition {
        step: Step::Execute,
        evaluate: evaluate_execute,
    },
    StepDefinition {
        step: Step::Completed,
        evaluate: evaluate_completed,
    },
];

pub fn definition(step: Step) -> &'static StepDefinition {
    &PIPELINE[step.index()]
}

fn evaluate_propose(_chain: Option<&ChainState>, wallet: &WalletState) -> Status {
    if wallet.transaction_hash.is_some() {
        return Status::Success;
    }
    match wallet.proposal {
        Submission::InFlight => Status::InProgress,
        Submission::Rejected { .. } => Status::Error,
        // A submitted proposal always records its hash.
        Submission::Idle | Submission::Submitted { .. } => Status::Pending,
    }
}

fn evaluate_collect_signatures(chain: Option<&ChainState>, wallet: &WalletState) -> Status {
    let (collected, threshold_met) = match chain {
        Some(chain) => (
            chain.collected_signatures,
            chain.threshold_met() || chain.is_executed,
        ),
        None => (0, false),
    };

    if threshold_met {
        Status::Success
    } else if wallet.signature.rejection().is_some() {
        Status::Error
    } else if collected > 0 || wallet.signature.is_in_flight() {
        Status::InProgress
    } else {
        Status::Pending
    }
}

fn evaluate_execute(chain: Option<&ChainState>, wallet: &WalletState) -> Status {
    // Someone else may have executed the transaction.
    if chain.is_some_and(|c| c.is_executed) {
        return Status::Success;
    }
    // A reverted execution spent the nonce; no wallet answer overrides it.
    if chain.is_some_and(|c| c.reverted) {
        return Status::Error;
    }
    match wallet.execution {
        Submission::Submitted { .. } => Status::Success,
        Submission::InFlight => Status::InProgress,
        Submission::Rejected { .. } => Status::Error,
        Submission::Idle => Status::Pending,
    }
}

fn evaluate_completed(chain: Option<&ChainState>, _wallet: &WalletState) -> Status {
    if chain.is_some_and(|c| c.is_executed) {
        Status::Success
    } else {
        Status::Pending
    }
}
