//! Background task that polls the chain state reader for one disbursement and
//! feeds each observation into its step controller.
//!
//! The loop ends when the pipeline completes, the handle is cancelled, the
//! transaction is unknown to the service, or `max_poll_failures` consecutive
//! reads fail. In the last two cases the failure is surfaced as an `ERROR`
//! on the active step and the handle waits for `Orchestrator::retry`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::chain::ChainStateReader;
use crate::config::OrchestratorConfig;
use crate::orchestrator::DisbursementHandle;

/// Exponential back-off: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Poll loop for one handle. Spawned by the orchestrator.
pub async fn run(
    handle: DisbursementHandle,
    reader: Arc<dyn ChainStateReader>,
    config: OrchestratorConfig,
) {
    let milestone = handle.milestone_id();
    let token = handle.cancellation_token().clone();
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    let mut failures: u32 = 0;
    // First read happens immediately so a resumed handle catches up at once.
    let mut delay = Duration::ZERO;

    info!(milestone, "Poller starting");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = config.poll_interval;

        // Nothing to read until the transaction has been proposed.
        let Some(hash) = handle.transaction_hash().await else {
            continue;
        };

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = reader.read(&hash) => result,
        };

        match result {
            Ok(chain) => {
                if failures > 0 {
                    info!(milestone, "Chain reachable again after {failures} failed polls");
                }
                failures = 0;
                backoff.reset();
                match handle.observe(chain).await {
                    Ok(true) => {
                        info!(milestone, "Disbursement confirmed on-chain; poller stopping");
                        break;
                    }
                    Ok(false) => {}
                    // Cancelled between the read and the update.
                    Err(_) => break,
                }
            }
            Err(e) if e.is_retryable() => {
                failures += 1;
                if failures >= config.max_poll_failures {
                    error!(milestone, error = %e, "Giving up after {failures} consecutive failed polls");
                    if let Err(stall_err) = handle.stall(&e).await {
                        debug!(milestone, error = %stall_err, "Handle closed before stall was recorded");
                    }
                    break;
                }
                delay = backoff.next_delay();
                warn!(
                    milestone,
                    error = %e,
                    "Poll failed ({failures}/{}), retrying in {delay:?}",
                    config.max_poll_failures
                );
            }
            Err(e) => {
                error!(milestone, error = %e, "Poll failed permanently");
                if let Err(stall_err) = handle.stall(&e).await {
                    debug!(milestone, error = %stall_err, "Handle closed before stall was recorded");
                }
                break;
            }
        }
    }

    debug!(milestone, "Poller stopped");
}
