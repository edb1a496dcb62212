//! Fakes shared by the async test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::ChainStateReader;
use crate::config::OrchestratorConfig;
use crate::errors::{DisburserError, Result};
use crate::orchestrator::StepListener;
use crate::types::{ChainState, DisbursementRequest, Status, Step, StepEvent};
use crate::wallet::{SigningPayload, SubmittedTx, WalletSigner};

pub const SAFE: &str = "0x5afe5afe5afe5afe5afe5afe5afe5afe5afe5afe";
pub const RECIPIENT: &str = "0xbeefbeefbeefbeefbeefbeefbeefbeefbeefbeef";
pub const PROPOSED: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(10),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        max_poll_failures: 3,
    }
}

pub fn request(milestone_id: u64, transaction_hash: Option<&str>) -> DisbursementRequest {
    DisbursementRequest {
        milestone_id,
        safe_address: SAFE.into(),
        recipient: RECIPIENT.into(),
        amount: 1_500_000_000_000_000_000,
        transaction_hash: transaction_hash.map(String::from),
    }
}

pub fn chain(collected: u32, required: u32, executed: bool) -> ChainState {
    ChainState {
        collected_signatures: collected,
        required_signatures: required,
        is_executed: executed,
        executed_at: executed.then(chrono::Utc::now),
        reverted: false,
    }
}

// ─────────────────────────────────────────────────────────
// Chain reader
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Reply {
    State(ChainState),
    Unavailable,
    NotFound,
}

pub struct FakeReader {
    reply: Mutex<Reply>,
    reads: AtomicUsize,
}

impl FakeReader {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(FakeReader {
            reply: Mutex::new(reply),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainStateReader for FakeReader {
    async fn read(&self, transaction_hash: &str) -> Result<ChainState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::State(state) => Ok(state),
            Reply::Unavailable => Err(DisburserError::ChainUnavailable("connection refused".into())),
            Reply::NotFound => Err(DisburserError::NotFound(transaction_hash.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Wallets
// ─────────────────────────────────────────────────────────

/// Answers from a queue, then accepts everything with a fresh hash.
#[derive(Default)]
pub struct FakeSigner {
    queued: Mutex<VecDeque<Result<SubmittedTx>>>,
    payloads: Mutex<Vec<SigningPayload>>,
}

impl FakeSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, answer: Result<SubmittedTx>) {
        self.queued.lock().unwrap().push_back(answer);
    }

    pub fn payloads(&self) -> Vec<SigningPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl WalletSigner for FakeSigner {
    async fn sign_and_submit(&self, payload: &SigningPayload) -> Result<SubmittedTx> {
        let n = {
            let mut payloads = self.payloads.lock().unwrap();
            payloads.push(payload.clone());
            payloads.len()
        };
        match self.queued.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => Ok(SubmittedTx {
                tx_hash: format!("0x{n:064x}"),
            }),
        }
    }
}

/// A wallet whose confirmation reaches the transaction service before the
/// wallet itself answers.
pub struct SlowWallet {
    pub reader: Arc<FakeReader>,
    pub indexed: ChainState,
    pub hold: Duration,
}

#[async_trait]
impl WalletSigner for SlowWallet {
    async fn sign_and_submit(&self, _payload: &SigningPayload) -> Result<SubmittedTx> {
        self.reader.set(Reply::State(self.indexed.clone()));
        tokio::time::sleep(self.hold).await;
        Ok(SubmittedTx {
            tx_hash: format!("0x{:064x}", 0xc0ffee),
        })
    }
}

/// A wallet prompt the user never answers.
pub struct StuckSigner;

#[async_trait]
impl WalletSigner for StuckSigner {
    async fn sign_and_submit(&self, _payload: &SigningPayload) -> Result<SubmittedTx> {
        std::future::pending().await
    }
}

// ─────────────────────────────────────────────────────────
// Event collection
// ─────────────────────────────────────────────────────────

pub type Events = Arc<Mutex<Vec<StepEvent>>>;

pub fn collector() -> (Arc<dyn StepListener>, Events) {
    let events = Events::default();
    let sink = Arc::clone(&events);
    let listener: Arc<dyn StepListener> =
        Arc::new(move |event: &StepEvent| sink.lock().unwrap().push(event.clone()));
    (listener, events)
}

pub fn transitions(events: &Events) -> Vec<(Step, Status)> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.step, e.status))
        .collect()
}

/// Wait (bounded) until `step` has been reported with `status`.
pub async fn wait_for(events: &Events, step: Step, status: Status) {
    let reached = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let seen = events
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.step == step && e.status == status);
            if seen {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "timed out waiting for {step} {status}; saw {:?}",
        transitions(events)
    );
}
