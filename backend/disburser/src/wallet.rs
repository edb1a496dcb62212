//! Wallet-signing capability consumed by the orchestrator.
//!
//! The signer lives outside the core (browser wallet, hardware signer,
//! custodial key service…). It may block for as long as the user takes to
//! answer a prompt; the orchestrator races every call against the handle's
//! cancellation token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::types::MilestoneId;

/// What the wallet is asked to sign and submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SigningPayload {
    /// Propose a new Safe transaction paying `amount` to `recipient`.
    #[serde(rename_all = "camelCase")]
    Propose {
        safe_address: String,
        recipient: String,
        #[serde(with = "crate::types::amount_string")]
        amount: u128,
        milestone_id: MilestoneId,
    },
    /// Add this owner's confirmation to a proposed Safe transaction.
    #[serde(rename_all = "camelCase")]
    Confirm {
        safe_address: String,
        safe_tx_hash: String,
    },
    /// Execute a fully confirmed Safe transaction.
    #[serde(rename_all = "camelCase")]
    Execute {
        safe_address: String,
        safe_tx_hash: String,
    },
}

/// Hash returned by the wallet once a payload was accepted.
///
/// For `Propose` this is the Safe transaction hash; for `Confirm` and
/// `Execute` it is whatever the wallet reports for the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedTx {
    pub tx_hash: String,
}

#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Sign `payload` and submit it.
    ///
    /// Fails with `UserRejected` when the user declines and `WalletError` when
    /// the wallet or provider misbehaves. Both are recoverable.
    async fn sign_and_submit(&self, payload: &SigningPayload) -> Result<SubmittedTx>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = SigningPayload::Confirm {
            safe_address: "0xSafe".into(),
            safe_tx_hash: "0xabc".into(),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "kind": "confirm",
                "safeAddress": "0xSafe",
                "safeTxHash": "0xabc",
            })
        );
    }

    #[test]
    fn propose_amount_is_a_string() {
        let payload = SigningPayload::Propose {
            safe_address: "0xSafe".into(),
            recipient: "0xPod".into(),
            amount: 1_000_000_000_000_000_000,
            milestone_id: 3,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "propose");
        assert_eq!(value["amount"], "1000000000000000000");
        assert_eq!(value["milestoneId"], 3);
    }
}
