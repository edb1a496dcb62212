//! Chain state reader — asks the Safe Transaction Service how far a proposed
//! multisig transaction has progressed.
//!
//! ## Failure policy
//!
//! * `404` → [`DisburserError::NotFound`]: the hash was never proposed.
//! * Connection errors, timeouts, `429` and `5xx` → [`DisburserError::ChainUnavailable`].
//!   The reader itself never retries; the poller owns back-off.
//! * A body that does not describe a sane transaction is also reported as
//!   `ChainUnavailable`. It is never mapped to a default state.
//! * `isExecuted: true` with `isSuccessful: false` is a valid answer: the
//!   payout reverted. It comes back as a [`ChainState`] with `reverted` set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::{DisburserError, Result};
use crate::types::ChainState;

/// Read-only view of a Safe transaction's progress.
///
/// Implementations must be side-effect free: the poller calls `read`
/// repeatedly and may overlap calls for different handles.
#[async_trait]
pub trait ChainStateReader: Send + Sync {
    async fn read(&self, transaction_hash: &str) -> Result<ChainState>;
}

// ─────────────────────────────────────────────────────────
// Safe Transaction Service response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeMultisigTransaction {
    pub safe_tx_hash: Option<String>,
    pub confirmations_required: Option<u32>,
    #[serde(default)]
    pub confirmations: Option<Vec<Value>>,
    pub is_executed: Option<bool>,
    pub is_successful: Option<bool>,
    pub execution_date: Option<String>,
}

impl SafeMultisigTransaction {
    /// Validate the response and convert it into a [`ChainState`].
    pub fn into_chain_state(self) -> Result<ChainState> {
        let required = self
            .confirmations_required
            .ok_or_else(|| malformed("missing confirmationsRequired"))?;
        if required == 0 {
            return Err(malformed("confirmationsRequired is zero"));
        }

        let is_executed = self
            .is_executed
            .ok_or_else(|| malformed("missing isExecuted"))?;
        // Executed but the inner call failed: a permanent on-chain fact.
        let reverted = is_executed && self.is_successful == Some(false);

        let collected = self.confirmations.map(|c| c.len()).unwrap_or(0);
        let collected =
            u32::try_from(collected).map_err(|_| malformed("confirmation count overflow"))?;

        let executed_at = match self.execution_date.as_deref() {
            Some(raw) => Some(parse_rfc3339(raw).ok_or_else(|| {
                malformed(&format!("invalid executionDate {raw:?}"))
            })?),
            None => None,
        };

        Ok(ChainState {
            collected_signatures: collected,
            required_signatures: required,
            is_executed: is_executed && !reverted,
            executed_at: if reverted { None } else { executed_at },
            reverted,
        })
    }
}

// ─────────────────────────────────────────────────────────
// HTTP reader
// ─────────────────────────────────────────────────────────

/// [`ChainStateReader`] backed by the Safe Transaction Service REST API.
#[derive(Debug, Clone)]
pub struct SafeTxServiceReader {
    client: Client,
    base_url: String,
}

impl SafeTxServiceReader {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        SafeTxServiceReader { client, base_url }
    }

    fn transaction_url(&self, transaction_hash: &str) -> String {
        format!(
            "{}/api/v1/multisig-transactions/{}/",
            self.base_url, transaction_hash
        )
    }
}

#[async_trait]
impl ChainStateReader for SafeTxServiceReader {
    async fn read(&self, transaction_hash: &str) -> Result<ChainState> {
        validate_tx_hash(transaction_hash)?;

        let response = self
            .client
            .get(self.transaction_url(transaction_hash))
            .send()
            .await
            .map_err(|e| DisburserError::ChainUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DisburserError::NotFound(format!(
                "Safe transaction {transaction_hash}"
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DisburserError::ChainUnavailable(
                "rate-limited by transaction service".to_string(),
            ));
        }
        if !status.is_success() {
            return Err(DisburserError::ChainUnavailable(format!(
                "transaction service returned {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DisburserError::ChainUnavailable(format!("failed to read body: {e}")))?;

        let state = parse_transaction(&body)?;
        debug!(
            "Read {transaction_hash}: {}/{} signatures, executed={}",
            state.collected_signatures, state.required_signatures, state.is_executed
        );
        Ok(state)
    }
}

/// Decode a Safe Transaction Service body into a [`ChainState`].
pub fn parse_transaction(body: &str) -> Result<ChainState> {
    let tx: SafeMultisigTransaction = serde_json::from_str(body)
        .map_err(|e| malformed(&format!("invalid JSON: {e}")))?;
    tx.into_chain_state()
}

/// A Safe transaction hash is `0x` followed by 32 hex-encoded bytes.
/// Anything else cannot name a proposed transaction.
pub fn validate_tx_hash(hash: &str) -> Result<()> {
    let digits = hash
        .strip_prefix("0x")
        .ok_or_else(|| DisburserError::NotFound(format!("invalid transaction hash {hash:?}")))?;
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(DisburserError::NotFound(format!(
            "invalid transaction hash {hash:?}"
        ))),
    }
}

fn malformed(detail: &str) -> DisburserError {
    DisburserError::ChainUnavailable(format!("malformed transaction service response: {detail}"))
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
