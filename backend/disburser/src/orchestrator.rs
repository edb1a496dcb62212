//! Orchestrator facade — the object callers hold.
//!
//! [`Orchestrator::start`] creates or resumes a disbursement and returns a
//! [`DisbursementHandle`]. Each handle owns:
//!
//! * one [`StepController`] behind a `tokio` mutex. Polls and user actions
//!   for the same handle are serialized on it, and events are forwarded to
//!   subscribers while it is held, so delivery order is computation order;
//! * a [`CancellationToken`] raced against every chain read and wallet call;
//! * a background poller task (see [`crate::poller`]).
//!
//! Different handles share nothing but the reader and the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::ChainStateReader;
use crate::config::OrchestratorConfig;
use crate::controller::{StepController, StepRecord};
use crate::errors::{DisburserError, Result};
use crate::poller;
use crate::store::DisbursementStore;
use crate::types::{
    ChainState, DisbursementRequest, DisbursementTransaction, MilestoneId, Step, StepEvent,
};
use crate::wallet::{SigningPayload, SubmittedTx, WalletSigner};

// ─────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────

/// Receives step events for one handle.
///
/// Listeners run while the handle is locked and must not block.
pub trait StepListener: Send + Sync {
    fn on_event(&self, event: &StepEvent);
}

impl<F> StepListener for F
where
    F: Fn(&StepEvent) + Send + Sync,
{
    fn on_event(&self, event: &StepEvent) {
        self(event)
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    listeners: Vec<(u64, Arc<dyn StepListener>)>,
}

type SharedSubscribers = Arc<StdMutex<Subscribers>>;

/// Returned by `subscribe`; call [`Unsubscribe::unsubscribe`] to stop
/// receiving events. Dropping it keeps the subscription alive.
pub struct Unsubscribe {
    id: u64,
    subscribers: Weak<StdMutex<Subscribers>>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|(id, _)| *id != self.id);
        }
    }
}

// ─────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────

/// Lifecycle of a handle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Polling the chain.
    Active,
    /// The poller gave up; waiting for `retry`.
    Stalled,
    /// `(COMPLETED, SUCCESS)` observed; read-only.
    Completed,
    Cancelled,
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub milestone_id: MilestoneId,
    pub phase: Phase,
    pub current_step: Step,
    pub steps: Vec<StepRecord>,
    pub disbursement: DisbursementTransaction,
}

struct HandleState {
    controller: StepController,
    record: DisbursementTransaction,
    phase: Phase,
}

struct HandleInner {
    milestone_id: MilestoneId,
    state: Mutex<HandleState>,
    cancel: CancellationToken,
    /// Set once the record is retired.
    finished: AtomicBool,
    subscribers: SharedSubscribers,
    store: Arc<dyn DisbursementStore>,
}

/// A running (or finished) disbursement. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct DisbursementHandle {
    inner: Arc<HandleInner>,
}

impl DisbursementHandle {
    fn new(record: DisbursementTransaction, store: Arc<dyn DisbursementStore>) -> Self {
        let controller = StepController::resume(&record);
        let finished = controller.is_complete();
        let phase = if finished {
            Phase::Completed
        } else {
            Phase::Active
        };
        DisbursementHandle {
            inner: Arc::new(HandleInner {
                milestone_id: record.milestone_id,
                state: Mutex::new(HandleState {
                    controller,
                    record,
                    phase,
                }),
                cancel: CancellationToken::new(),
                finished: AtomicBool::new(finished),
                subscribers: SharedSubscribers::default(),
                store,
            }),
        }
    }

    pub fn milestone_id(&self) -> MilestoneId {
        self.inner.milestone_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Neither cancelled nor completed.
    fn is_live(&self) -> bool {
        !self.is_cancelled() && !self.inner.finished.load(Ordering::Acquire)
    }

    fn same_as(&self, other: &DisbursementHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock().await;
        Snapshot {
            milestone_id: self.inner.milestone_id,
            phase: state.phase,
            current_step: state.controller.current_step(),
            steps: state.controller.steps().to_vec(),
            disbursement: state.record.clone(),
        }
    }

    pub async fn current_step(&self) -> Step {
        self.inner.state.lock().await.controller.current_step()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    /// `true` once the pipeline completed: no more polling or submissions.
    pub async fn is_read_only(&self) -> bool {
        self.phase().await == Phase::Completed
    }

    /// Register a listener for this handle's step events.
    pub fn subscribe(&self, listener: Arc<dyn StepListener>) -> Unsubscribe {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.listeners.push((id, listener));
        Unsubscribe {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Client actions
    // ─────────────────────────────────────────────────────────

    /// Ask `signer` to propose the Safe transaction for this payout.
    pub async fn submit_proposal(&self, signer: &dyn WalletSigner) -> Result<SubmittedTx> {
        let payload = {
            let mut state = self.lock_active().await?;
            let events = state.controller.begin_proposal()?;
            self.commit(&mut state, events).await;
            SigningPayload::Propose {
                safe_address: state.record.safe_address.clone(),
                recipient: state.record.recipient.clone(),
                amount: state.record.amount,
                milestone_id: state.record.milestone_id,
            }
        };

        let outcome = self.sign(signer, &payload).await?;

        let mut state = self.lock_active().await?;
        let events = state.controller.finish_proposal(outcome.as_ref());
        self.commit(&mut state, events).await;
        if let Ok(tx) = &outcome {
            info!(milestone = self.inner.milestone_id, tx_hash = %tx.tx_hash, "Disbursement proposed");
        }
        outcome
    }

    /// Ask `signer` to confirm the proposed Safe transaction.
    pub async fn submit_signature(&self, signer: &dyn WalletSigner) -> Result<SubmittedTx> {
        let payload = {
            let mut state = self.lock_active().await?;
            let (safe_tx_hash, events) = state.controller.begin_signature()?;
            self.commit(&mut state, events).await;
            SigningPayload::Confirm {
                safe_address: state.record.safe_address.clone(),
                safe_tx_hash,
            }
        };

        let outcome = self.sign(signer, &payload).await?;

        let mut state = self.lock_active().await?;
        let events = state.controller.finish_signature(outcome.as_ref());
        self.commit(&mut state, events).await;
        outcome
    }

    /// Ask `signer` to execute the fully confirmed Safe transaction.
    ///
    /// Fails with `AlreadyExecuted` when the chain already reports execution;
    /// the pipeline is brought up to date before returning.
    pub async fn submit_execution(&self, signer: &dyn WalletSigner) -> Result<SubmittedTx> {
        let payload = {
            let mut state = self.lock_active().await?;
            let (safe_tx_hash, events) = match state.controller.begin_execution() {
                Ok(begun) => begun,
                Err(DisburserError::AlreadyExecuted) => {
                    let events = state.controller.refresh();
                    self.commit(&mut state, events).await;
                    return Err(DisburserError::AlreadyExecuted);
                }
                Err(e) => return Err(e),
            };
            self.commit(&mut state, events).await;
            SigningPayload::Execute {
                safe_address: state.record.safe_address.clone(),
                safe_tx_hash,
            }
        };

        let outcome = self.sign(signer, &payload).await?;

        let mut state = self.lock_active().await?;
        let events = state.controller.finish_execution(outcome.as_ref());
        self.commit(&mut state, events).await;
        if let Ok(tx) = &outcome {
            info!(milestone = self.inner.milestone_id, tx_hash = %tx.tx_hash, "Execution submitted");
        }
        outcome
    }

    /// Run the wallet call, abandoning it if the handle is cancelled.
    /// The inner result is the wallet's answer; the outer one is cancellation.
    async fn sign(
        &self,
        signer: &dyn WalletSigner,
        payload: &SigningPayload,
    ) -> Result<Result<SubmittedTx>> {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(DisburserError::Cancelled),
            outcome = signer.sign_and_submit(payload) => Ok(outcome),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Poller entry points
    // ─────────────────────────────────────────────────────────

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) async fn transaction_hash(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .controller
            .wallet_state()
            .transaction_hash
            .clone()
    }

    /// Feed a chain read into the controller. Returns `true` once the
    /// pipeline has completed.
    pub(crate) async fn observe(&self, chain: ChainState) -> Result<bool> {
        let mut state = self.lock_active().await?;
        let events = state.controller.observe(&chain);
        self.commit(&mut state, events).await;
        Ok(state.controller.is_complete())
    }

    /// The poller gave up: surface `error` on the active step.
    pub(crate) async fn stall(&self, error: &DisburserError) -> Result<()> {
        let mut state = self.lock_active().await?;
        let events = state.controller.fail_active(error);
        if state.phase == Phase::Active {
            state.phase = Phase::Stalled;
        }
        self.commit(&mut state, events).await;
        Ok(())
    }

    /// Move a stalled handle back to active. Returns `true` when the caller
    /// should spawn a new poller.
    async fn reactivate(&self) -> Result<bool> {
        let mut state = self.lock_active().await?;
        if state.phase == Phase::Stalled {
            state.phase = Phase::Active;
            return Ok(true);
        }
        Ok(false)
    }

    async fn cancel(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.lock().await;
        if state.phase != Phase::Completed {
            state.phase = Phase::Cancelled;
        }
        info!(milestone = self.inner.milestone_id, "Disbursement cancelled");
    }

    // ─────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────

    async fn lock_active(&self) -> Result<MutexGuard<'_, HandleState>> {
        if self.inner.cancel.is_cancelled() {
            return Err(DisburserError::Cancelled);
        }
        let guard = self.inner.state.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(DisburserError::Cancelled);
        }
        Ok(guard)
    }

    /// Sync the record with the controller, persist, then forward `events`.
    ///
    /// Store failures are logged; the in-memory pipeline stays authoritative
    /// and the next commit writes the record again.
    async fn commit(&self, state: &mut HandleState, events: Vec<StepEvent>) {
        let before = state.record.clone();
        if !state.record.retired {
            state.record.transaction_hash = state.controller.wallet_state().transaction_hash.clone();
            if let Some(chain) = state.controller.chain_state() {
                state.record.observe(chain);
            }
            if state.controller.is_complete() {
                state.record.retired = true;
                state.phase = Phase::Completed;
                self.inner.finished.store(true, Ordering::Release);
                info!(
                    milestone = self.inner.milestone_id,
                    "Disbursement completed; record retired"
                );
            }
        }

        if state.record != before {
            if let Err(e) = self.inner.store.save(&state.record).await {
                warn!(milestone = self.inner.milestone_id, error = %e, "Failed to persist disbursement");
            }
        }

        if events.is_empty() {
            return;
        }
        if let Err(e) = self.inner.store.append_events(&events).await {
            warn!(milestone = self.inner.milestone_id, error = %e, "Failed to persist step events");
        }

        let listeners: Vec<Arc<dyn StepListener>> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for event in &events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Facade
// ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: OrchestratorConfig,
    reader: Arc<dyn ChainStateReader>,
    store: Arc<dyn DisbursementStore>,
    handles: Mutex<HashMap<MilestoneId, DisbursementHandle>>,
    /// Attached to every handle this orchestrator creates.
    default_listeners: StdMutex<Vec<Arc<dyn StepListener>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        reader: Arc<dyn ChainStateReader>,
        store: Arc<dyn DisbursementStore>,
    ) -> Self {
        Orchestrator {
            config,
            reader,
            store,
            handles: Mutex::new(HashMap::new()),
            default_listeners: StdMutex::new(Vec::new()),
        }
    }

    /// Subscribe `listener` to every handle created from now on.
    pub fn subscribe_all(&self, listener: Arc<dyn StepListener>) {
        self.default_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Create or resume the disbursement for `request.milestone_id`.
    ///
    /// A live handle for the milestone is returned as is. Otherwise the stored
    /// record is resumed (adopting `request.transaction_hash` if the record has
    /// none yet) or a new record is created. Retired records produce a
    /// read-only handle without a poller.
    pub async fn start(&self, request: DisbursementRequest) -> Result<DisbursementHandle> {
        let milestone_id = request.milestone_id;
        let mut handles = self.handles.lock().await;
        handles.retain(|_, handle| handle.is_live());
        if let Some(handle) = handles.get(&milestone_id) {
            return Ok(handle.clone());
        }

        let record = match self.store.load(milestone_id).await? {
            Some(mut existing) => {
                if existing.transaction_hash.is_none() && !existing.retired {
                    existing.transaction_hash = request.transaction_hash;
                    self.store.save(&existing).await?;
                }
                info!(milestone = milestone_id, "Resuming disbursement");
                existing
            }
            None => {
                let record = DisbursementTransaction::new(request);
                self.store.save(&record).await?;
                info!(
                    milestone = milestone_id,
                    safe = %record.safe_address,
                    recipient = %record.recipient,
                    amount = %record.amount,
                    "Disbursement created"
                );
                record
            }
        };

        let handle = DisbursementHandle::new(record, Arc::clone(&self.store));
        for listener in self
            .default_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handle.subscribe(Arc::clone(listener));
        }

        // Read-only handles are handed out but not tracked.
        if !handle.is_read_only().await {
            self.spawn_poller(&handle);
            handles.insert(milestone_id, handle.clone());
        }
        Ok(handle)
    }

    /// Resume a previously created disbursement from the store.
    pub async fn resume(&self, milestone_id: MilestoneId) -> Result<DisbursementHandle> {
        if let Some(handle) = self.handle(milestone_id).await {
            if !handle.is_cancelled() {
                return Ok(handle);
            }
        }
        let record = self
            .store
            .load(milestone_id)
            .await?
            .ok_or_else(|| DisburserError::NotFound(format!("disbursement {milestone_id}")))?;
        self.start(DisbursementRequest {
            milestone_id,
            safe_address: record.safe_address,
            recipient: record.recipient,
            amount: record.amount,
            transaction_hash: record.transaction_hash,
        })
        .await
    }

    /// The live handle for a milestone, if one was started. Completed handles
    /// stay visible until the next `start` sweeps them out.
    pub async fn handle(&self, milestone_id: MilestoneId) -> Option<DisbursementHandle> {
        self.handles.lock().await.get(&milestone_id).cloned()
    }

    pub fn subscribe(&self, handle: &DisbursementHandle, listener: Arc<dyn StepListener>) -> Unsubscribe {
        handle.subscribe(listener)
    }

    /// Stop polling and reject further submissions. On-chain effects already
    /// committed are left alone.
    pub async fn cancel(&self, handle: &DisbursementHandle) {
        handle.cancel().await;
        let mut handles = self.handles.lock().await;
        if handles
            .get(&handle.milestone_id())
            .is_some_and(|tracked| tracked.same_as(handle))
        {
            handles.remove(&handle.milestone_id());
        }
    }

    /// Restart polling after the poller gave up.
    pub async fn retry(&self, handle: &DisbursementHandle) -> Result<()> {
        if handle.reactivate().await? {
            info!(milestone = handle.milestone_id(), "Retrying chain polling");
            self.spawn_poller(handle);
        }
        Ok(())
    }

    /// Cancel every live handle.
    pub async fn shutdown(&self) {
        let handles: Vec<DisbursementHandle> =
            self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.cancel().await;
        }
    }

    fn spawn_poller(&self, handle: &DisbursementHandle) {
        tokio::spawn(poller::run(
            handle.clone(),
            Arc::clone(&self.reader),
            self.config,
        ));
    }
}
