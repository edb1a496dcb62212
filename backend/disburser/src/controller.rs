//! Transaction step controller — the state machine over `Step × Status`.
//!
//! The controller owns the last observed [`ChainState`], the client's
//! [`WalletState`] and the stored status of every step. It is synchronous and
//! never awaits: wallet calls are split into `begin_*` / `finish_*` pairs so
//! the facade can release the handle lock while the user is deciding.
//!
//! ## Rules enforced by [`StepController::advance`]
//!
//! * Steps are evaluated in pipeline order; everything after the first step
//!   that is not `SUCCESS` is held at `PENDING`.
//! * A stored `SUCCESS` never changes.
//! * Only status changes produce a [`StepEvent`]; re-running with the same
//!   inputs is silent.

use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::{DisburserError, Result};
use crate::steps::PIPELINE;
use crate::types::{
    ChainState, DisbursementTransaction, MilestoneId, Status, Step, StepEvent, Submission,
    WalletState,
};
use crate::wallet::SubmittedTx;

/// Reported when the chain shows the payout call reverted.
const REVERTED: &str = "execution reverted on-chain";

/// What the wallet answered to a submission.
pub type Outcome<'a> = std::result::Result<&'a SubmittedTx, &'a DisburserError>;

/// Stored status of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: Step,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A failure surfaced on a step that is not derivable from wallet state
/// (e.g. the poller giving up). Cleared by the next chain observation or
/// user action.
#[derive(Debug, Clone)]
struct Fault {
    step: Step,
    reason: String,
}

#[derive(Debug, Clone)]
pub struct StepController {
    milestone_id: MilestoneId,
    records: [StepRecord; 4],
    chain: Option<ChainState>,
    wallet: WalletState,
    fault: Option<Fault>,
    /// Signatures already observed when this client's signature went out.
    signature_baseline: Option<u32>,
}

impl StepController {
    /// Fresh pipeline at `(PROPOSE, PENDING)`.
    pub fn new(milestone_id: MilestoneId) -> Self {
        StepController {
            milestone_id,
            records: Step::ALL.map(|step| StepRecord {
                step,
                status: Status::Pending,
                error: None,
            }),
            chain: None,
            wallet: WalletState::default(),
            fault: None,
            signature_baseline: None,
        }
    }

    /// Rebuild the pipeline from a persisted record. Statuses are recomputed
    /// silently: the events that led here were delivered in a previous run.
    pub fn resume(record: &DisbursementTransaction) -> Self {
        let mut controller = Self::new(record.milestone_id);
        controller.wallet.transaction_hash = record.transaction_hash.clone();
        controller.chain = record.chain_state();
        let _ = controller.reevaluate();
        controller
    }

    // ─────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────

    pub fn milestone_id(&self) -> MilestoneId {
        self.milestone_id
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn status(&self, step: Step) -> Status {
        self.records[step.index()].status
    }

    /// The first step that is not `SUCCESS`, or `COMPLETED` once the pipeline
    /// has finished.
    pub fn current_step(&self) -> Step {
        self.records
            .iter()
            .find(|r| r.status != Status::Success)
            .map(|r| r.step)
            .unwrap_or(Step::Completed)
    }

    pub fn is_complete(&self) -> bool {
        self.status(Step::Completed) == Status::Success
    }

    pub fn chain_state(&self) -> Option<&ChainState> {
        self.chain.as_ref()
    }

    pub fn wallet_state(&self) -> &WalletState {
        &self.wallet
    }

    // ─────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────

    /// Fold in new inputs and re-evaluate every step.
    ///
    /// A chain observation is merged monotonically into what was seen before
    /// and clears any fault left by the poller.
    pub fn advance(&mut self, chain: Option<&ChainState>, wallet: &WalletState) -> Vec<StepEvent> {
        let was_reverted = self.is_reverted();
        if let Some(newer) = chain {
            self.chain = Some(match &self.chain {
                Some(previous) => previous.merge(newer),
                None => newer.clone(),
            });
            self.fault = None;
            if !self.is_reverted() {
                self.records[Step::Completed.index()].error = None;
            }
        }
        self.wallet = wallet.clone();
        let mut events = self.reevaluate();

        // EXECUTE already succeeded from this client's point of view and
        // cannot go back; the revert is reported on COMPLETED instead.
        if self.is_reverted() && !was_reverted && self.current_step() == Step::Completed {
            events.extend(self.note_on_completed(REVERTED.to_string()));
        }
        events
    }

    /// Record a chain observation, keeping the current wallet state.
    pub fn observe(&mut self, chain: &ChainState) -> Vec<StepEvent> {
        let wallet = self.wallet.clone();
        self.advance(Some(chain), &wallet)
    }

    /// Re-run evaluation against the inputs already held.
    pub fn refresh(&mut self) -> Vec<StepEvent> {
        self.reevaluate()
    }

    /// Surface `error` on the active step.
    ///
    /// `COMPLETED` never enters `ERROR`; when it is the active step the error is
    /// reported on a `PENDING` event instead.
    pub fn fail_active(&mut self, error: &DisburserError) -> Vec<StepEvent> {
        let step = self.current_step();
        if self.is_complete() {
            return Vec::new();
        }
        let reason = error.to_string();
        if step == Step::Completed {
            return self.note_on_completed(reason).into_iter().collect();
        }
        self.fault = Some(Fault { step, reason });
        self.reevaluate()
    }

    /// `true` once the chain reported that the payout call reverted.
    pub fn is_reverted(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| c.reverted)
    }

    /// Attach `reason` to the still-`PENDING` COMPLETED step and report it
    /// once. The note stays on the step record until the next clean chain
    /// observation.
    fn note_on_completed(&mut self, reason: String) -> Option<StepEvent> {
        let step = Step::Completed;
        let record = &mut self.records[step.index()];
        if record.status == Status::Success || record.error.as_deref() == Some(reason.as_str()) {
            return None;
        }
        record.error = Some(reason.clone());
        Some(StepEvent {
            milestone_id: self.milestone_id,
            step,
            status: Status::Pending,
            data: self.step_data(step),
            error: Some(reason),
        })
    }

    fn reevaluate(&mut self) -> Vec<StepEvent> {
        let mut events = Vec::new();
        let mut blocked = false;

        for definition in PIPELINE.iter() {
            let step = definition.step;
            let stored = self.records[step.index()].status;

            let computed = if stored == Status::Success {
                Status::Success
            } else if blocked {
                Status::Pending
            } else {
                match &self.fault {
                    Some(fault) if fault.step == step => Status::Error,
                    _ => (definition.evaluate)(self.chain.as_ref(), &self.wallet),
                }
            };

            if computed != Status::Success {
                blocked = true;
            }
            if computed == stored {
                continue;
            }

            let error = if computed == Status::Error {
                self.failure_reason(step)
            } else {
                None
            };
            let record = &mut self.records[step.index()];
            record.status = computed;
            record.error = error.clone();

            events.push(StepEvent {
                milestone_id: self.milestone_id,
                step,
                status: computed,
                data: self.step_data(step),
                error,
            });
        }

        events
    }

    fn failure_reason(&self, step: Step) -> Option<String> {
        if let Some(fault) = self.fault.as_ref().filter(|f| f.step == step) {
            return Some(fault.reason.clone());
        }
        if step == Step::Execute && self.is_reverted() {
            return Some(REVERTED.to_string());
        }
        self.wallet
            .submission(step)
            .and_then(Submission::rejection)
            .map(String::from)
    }

    fn step_data(&self, step: Step) -> Option<Value> {
        match step {
            Step::Propose => self
                .wallet
                .transaction_hash
                .as_ref()
                .map(|hash| json!({ "transactionHash": hash })),
            Step::CollectSignatures => self.chain.as_ref().map(|c| {
                json!({
                    "collectedSignatures": c.collected_signatures,
                    "requiredSignatures": c.required_signatures,
                })
            }),
            Step::Execute => match &self.wallet.execution {
                _ if self.is_reverted() => Some(json!({ "reverted": true })),
                Submission::Submitted { tx_hash } => Some(json!({ "txHash": tx_hash })),
                _ if self.chain.as_ref().is_some_and(|c| c.is_executed) => {
                    Some(json!({ "executedElsewhere": true }))
                }
                _ => None,
            },
            Step::Completed => self
                .chain
                .as_ref()
                .filter(|c| c.is_executed)
                .map(|c| json!({ "executedAt": c.executed_at })),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Client actions
    // ─────────────────────────────────────────────────────────

    /// Mark a proposal as in flight.
    pub fn begin_proposal(&mut self) -> Result<Vec<StepEvent>> {
        let status = self.status(Step::Propose);
        if !matches!(status, Status::Pending | Status::Error) {
            return Err(DisburserError::InvalidStateTransition {
                action: "propose",
                step: Step::Propose,
                status,
            });
        }
        self.wallet.proposal = Submission::InFlight;
        self.fault = None;
        Ok(self.reevaluate())
    }

    /// Apply the wallet's answer to a proposal. On success the returned hash
    /// becomes the Safe transaction hash.
    pub fn finish_proposal(&mut self, outcome: Outcome<'_>) -> Vec<StepEvent> {
        match outcome {
            Ok(tx) => {
                self.wallet.transaction_hash = Some(tx.tx_hash.clone());
                self.wallet.proposal = Submission::Submitted {
                    tx_hash: tx.tx_hash.clone(),
                };
            }
            Err(e) => {
                self.wallet.proposal = Submission::Rejected {
                    reason: e.to_string(),
                };
            }
        }
        self.reevaluate()
    }

    /// Mark this client's signature as in flight. Returns the Safe
    /// transaction hash to confirm.
    pub fn begin_signature(&mut self) -> Result<(String, Vec<StepEvent>)> {
        let propose = self.status(Step::Propose);
        let hash = match (&self.wallet.transaction_hash, propose) {
            (Some(hash), Status::Success) => hash.clone(),
            _ => {
                return Err(DisburserError::InvalidStateTransition {
                    action: "sign",
                    step: Step::Propose,
                    status: propose,
                })
            }
        };

        let collect = self.status(Step::CollectSignatures);
        if collect == Status::Success || self.wallet.signature.is_in_flight() {
            return Err(DisburserError::InvalidStateTransition {
                action: "sign",
                step: Step::CollectSignatures,
                status: collect,
            });
        }

        self.wallet.signature = Submission::InFlight;
        self.signature_baseline = Some(self.chain.as_ref().map_or(0, |c| c.collected_signatures));
        self.fault = None;
        Ok((hash, self.reevaluate()))
    }

    /// Apply the wallet's answer to a signature request. A successful
    /// signature is counted immediately, ahead of the next chain read.
    ///
    /// The count becomes at least one more than what was observed when the
    /// signature went out. A read taken while the wallet was open may already
    /// include this signature and must not be bumped again.
    pub fn finish_signature(&mut self, outcome: Outcome<'_>) -> Vec<StepEvent> {
        let baseline = self.signature_baseline.take().unwrap_or(0);
        match outcome {
            Ok(tx) => {
                self.wallet.signature = Submission::Submitted {
                    tx_hash: tx.tx_hash.clone(),
                };
                let chain = self.chain.get_or_insert(ChainState {
                    collected_signatures: 0,
                    required_signatures: 0,
                    is_executed: false,
                    executed_at: None,
                    reverted: false,
                });
                chain.collected_signatures =
                    chain.collected_signatures.max(baseline.saturating_add(1));
            }
            Err(e) => {
                self.wallet.signature = Submission::Rejected {
                    reason: e.to_string(),
                };
            }
        }
        self.reevaluate()
    }

    /// Mark an execution as in flight. Returns the Safe transaction hash to
    /// execute.
    ///
    /// Fails with [`DisburserError::AlreadyExecuted`] once the chain reports
    /// execution; callers should [`refresh`](Self::refresh) in that case.
    pub fn begin_execution(&mut self) -> Result<(String, Vec<StepEvent>)> {
        if self.chain.as_ref().is_some_and(|c| c.is_executed) {
            return Err(DisburserError::AlreadyExecuted);
        }
        if self.is_reverted() {
            return Err(DisburserError::InvalidStateTransition {
                action: "execute",
                step: Step::Execute,
                status: self.status(Step::Execute),
            });
        }

        let collect = self.status(Step::CollectSignatures);
        if collect != Status::Success {
            return Err(DisburserError::InvalidStateTransition {
                action: "execute",
                step: Step::CollectSignatures,
                status: collect,
            });
        }

        let execute = self.status(Step::Execute);
        if !matches!(execute, Status::Pending | Status::Error) {
            return Err(DisburserError::InvalidStateTransition {
                action: "execute",
                step: Step::Execute,
                status: execute,
            });
        }

        // COLLECT_SIGNATURES is only SUCCESS after PROPOSE recorded a hash.
        let hash = self.wallet.transaction_hash.clone().ok_or(
            DisburserError::InvalidStateTransition {
                action: "execute",
                step: Step::Propose,
                status: self.status(Step::Propose),
            },
        )?;

        self.wallet.execution = Submission::InFlight;
        self.fault = None;
        Ok((hash, self.reevaluate()))
    }

    pub fn finish_execution(&mut self, outcome: Outcome<'_>) -> Vec<StepEvent> {
        self.wallet.execution = match outcome {
            Ok(tx) => Submission::Submitted {
                tx_hash: tx.tx_hash.clone(),
            },
            Err(e) => Submission::Rejected {
                reason: e.to_string(),
            },
        };
        self.reevaluate()
    }
}
