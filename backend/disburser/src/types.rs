//! Domain types shared by the controller, the facade and the stores.
//!
//! ## Pipeline
//!
//! Every disbursement walks the same fixed pipeline:
//!
//! ```text
//! PROPOSE ──► COLLECT_SIGNATURES ──► EXECUTE ──► COMPLETED
//! ```
//!
//! and each step carries one [`Status`]. `COMPLETED` is a pure observation of
//! the chain reporting the Safe transaction as executed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DisburserError;

/// Identifier of the milestone a payout belongs to.
pub type MilestoneId = u64;

// ─────────────────────────────────────────────────────────
// Step / Status
// ─────────────────────────────────────────────────────────

/// One stage of the disbursement pipeline, in strict forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    Propose,
    CollectSignatures,
    Execute,
    Completed,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 4] = [
        Step::Propose,
        Step::CollectSignatures,
        Step::Execute,
        Step::Completed,
    ];

    /// Position of the step in the pipeline.
    pub fn index(self) -> usize {
        match self {
            Self::Propose => 0,
            Self::CollectSignatures => 1,
            Self::Execute => 2,
            Self::Completed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Propose => "PROPOSE",
            Self::CollectSignatures => "COLLECT_SIGNATURES",
            Self::Execute => "EXECUTE",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = DisburserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DisburserError::Config(format!("unknown step: {s}")))
    }
}

/// Evaluation state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    InProgress,
    Success,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = DisburserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            other => Err(DisburserError::Config(format!("unknown status: {other}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Evaluation inputs
// ─────────────────────────────────────────────────────────

/// What the chain / transaction service reports for a proposed Safe transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub collected_signatures: u32,
    pub required_signatures: u32,
    pub is_executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    /// The Safe executed the transaction but the payout call reverted. The
    /// nonce is spent and `is_executed` stays `false`: nothing was paid.
    #[serde(default)]
    pub reverted: bool,
}

impl ChainState {
    /// Fold a newer observation into this one.
    ///
    /// Signature counts never decrease and neither execution nor a revert is
    /// ever forgotten, so a lagging service response cannot undo what was
    /// already seen.
    pub fn merge(&self, newer: &ChainState) -> ChainState {
        ChainState {
            collected_signatures: self.collected_signatures.max(newer.collected_signatures),
            required_signatures: newer.required_signatures,
            is_executed: self.is_executed || newer.is_executed,
            executed_at: newer.executed_at.or(self.executed_at),
            reverted: self.reverted || newer.reverted,
        }
    }

    pub fn threshold_met(&self) -> bool {
        self.required_signatures > 0 && self.collected_signatures >= self.required_signatures
    }
}

/// Progress of one client-side wallet action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Submission {
    #[default]
    Idle,
    InFlight,
    Submitted {
        #[serde(rename = "txHash")]
        tx_hash: String,
    },
    Rejected {
        reason: String,
    },
}

impl Submission {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight)
    }

    pub fn rejection(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}

/// The client-side half of step evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub transaction_hash: Option<String>,
    pub proposal: Submission,
    pub signature: Submission,
    pub execution: Submission,
}

impl WalletState {
    /// The submission that drives `step`, if the step has one.
    pub fn submission(&self, step: Step) -> Option<&Submission> {
        match step {
            Step::Propose => Some(&self.proposal),
            Step::CollectSignatures => Some(&self.signature),
            Step::Execute => Some(&self.execution),
            Step::Completed => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Disbursement record
// ─────────────────────────────────────────────────────────

/// Request to pay out an approved milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisbursementRequest {
    pub milestone_id: MilestoneId,
    pub safe_address: String,
    pub recipient: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    /// Hash of a Safe transaction already proposed by the application layer.
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// One milestone payout routed through the multisig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisbursementTransaction {
    pub milestone_id: MilestoneId,
    pub safe_address: String,
    pub transaction_hash: Option<String>,
    pub required_signatures: u32,
    pub collected_signatures: u32,
    pub is_executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub recipient: String,
    /// Immutable once set.
    pub retired: bool,
}

impl DisbursementTransaction {
    pub fn new(request: DisbursementRequest) -> Self {
        DisbursementTransaction {
            milestone_id: request.milestone_id,
            safe_address: request.safe_address,
            transaction_hash: request.transaction_hash,
            required_signatures: 0,
            collected_signatures: 0,
            is_executed: false,
            executed_at: None,
            amount: request.amount,
            recipient: request.recipient,
            retired: false,
        }
    }

    /// Chain state last recorded for this transaction, if it was ever observed.
    pub fn chain_state(&self) -> Option<ChainState> {
        if self.required_signatures == 0 && !self.is_executed {
            return None;
        }
        Some(ChainState {
            collected_signatures: self.collected_signatures,
            required_signatures: self.required_signatures,
            is_executed: self.is_executed,
            executed_at: self.executed_at,
            reverted: false,
        })
    }

    /// Copy an observation onto the record. Retired records are left untouched.
    pub fn observe(&mut self, chain: &ChainState) {
        if self.retired {
            return;
        }
        self.collected_signatures = self.collected_signatures.max(chain.collected_signatures);
        self.required_signatures = chain.required_signatures;
        if chain.is_executed {
            self.is_executed = true;
        }
        if self.executed_at.is_none() {
            self.executed_at = chain.executed_at;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────

/// Emitted by the step controller whenever a step's status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub milestone_id: MilestoneId,
    pub step: Step,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A step event as stored in / read from the step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEventRecord {
    pub id: i64,
    #[serde(flatten)]
    pub event: StepEvent,
    pub created_at: i64,
}

/// Serialize `u128` token amounts as decimal strings so JSON clients keep precision.
pub mod amount_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_round_trips_through_str() {
        for step in Step::ALL {
            assert_eq!(step.as_str().parse::<Step>().unwrap(), step);
        }
        assert!("NOPE".parse::<Step>().is_err());
    }

    #[test]
    fn step_order_matches_index() {
        for (i, step) in Step::ALL.iter().enumerate() {
            assert_eq!(step.index(), i);
        }
        assert!(Step::Propose < Step::Completed);
    }

    #[test]
    fn merge_keeps_signatures_monotonic() {
        let optimistic = ChainState {
            collected_signatures: 2,
            required_signatures: 2,
            is_executed: false,
            executed_at: None,
            reverted: false,
        };
        let lagging = ChainState {
            collected_signatures: 1,
            ..optimistic.clone()
        };
        let merged = optimistic.merge(&lagging);
        assert_eq!(merged.collected_signatures, 2);
        assert!(merged.threshold_met());
    }

    #[test]
    fn merge_never_unexecutes() {
        let executed = ChainState {
            collected_signatures: 2,
            required_signatures: 2,
            is_executed: true,
            executed_at: Some(Utc::now()),
            reverted: false,
        };
        let stale = ChainState {
            is_executed: false,
            executed_at: None,
            reverted: false,
            ..executed.clone()
        };
        let merged = executed.merge(&stale);
        assert!(merged.is_executed);
        assert_eq!(merged.executed_at, executed.executed_at);
    }

    #[test]
    fn zero_threshold_is_never_met() {
        let state = ChainState {
            collected_signatures: 0,
            required_signatures: 0,
            is_executed: false,
            executed_at: None,
            reverted: false,
        };
        assert!(!state.threshold_met());
    }

    #[test]
    fn request_amount_is_a_string_on_the_wire() {
        let json = serde_json::json!({
            "milestoneId": 7,
            "safeAddress": "0xSafe",
            "recipient": "0xPod",
            "amount": "340282366920938463463374607431768211455",
        });
        let request: DisbursementRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.amount, u128::MAX);
        assert_eq!(request.transaction_hash, None);

        let record = DisbursementTransaction::new(request);
        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["amount"], "340282366920938463463374607431768211455");
        assert_eq!(out["isExecuted"], false);
    }

    #[test]
    fn retired_record_ignores_observations() {
        let mut record = DisbursementTransaction::new(DisbursementRequest {
            milestone_id: 1,
            safe_address: "0xSafe".into(),
            recipient: "0xPod".into(),
            amount: 10,
            transaction_hash: None,
        });
        record.retired = true;
        record.observe(&ChainState {
            collected_signatures: 3,
            required_signatures: 3,
            is_executed: true,
            executed_at: None,
            reverted: false,
        });
        assert_eq!(record.collected_signatures, 0);
        assert!(!record.is_executed);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(Status::InProgress).unwrap(),
            serde_json::json!("IN_PROGRESS")
        );
        assert_eq!(
            serde_json::to_value(Step::CollectSignatures).unwrap(),
            serde_json::json!("COLLECT_SIGNATURES")
        );
    }
}
