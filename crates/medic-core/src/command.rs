//! Remediation commands and their idempotency keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{PrRef, RemediationAction};

/// A corrective command bound for the command queue.
///
/// Downstream delivery is at-least-once; consumers dedupe on
/// `idempotency_key`, so a redelivered or re-enqueued attempt runs once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationCommand {
    pub pr: PrRef,
    pub action: RemediationAction,
    /// 1-based attempt for budgeted actions
    pub attempt_number: u32,
    pub idempotency_key: String,
    /// Slash command for the router, e.g. `/rebuild`
    pub command: String,
}

impl RemediationCommand {
    /// Build the command for the attempt after `counter_before` prior attempts.
    pub fn new(pr: PrRef, action: RemediationAction, counter_before: u32) -> Self {
        let idempotency_key = idempotency_key(&pr, action, counter_before);
        Self {
            command: action.slash_command().to_string(),
            attempt_number: counter_before + 1,
            idempotency_key,
            action,
            pr,
        }
    }
}

/// SHA-256 over `"{repository}#{number}:{action}:{counter}"`, hex-encoded.
pub fn idempotency_key(pr: &PrRef, action: RemediationAction, counter_before: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", pr, action.as_str(), counter_before).as_bytes());
    format!("{:x}", hasher.finalize())
}
