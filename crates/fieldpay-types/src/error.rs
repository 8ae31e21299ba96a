//! Error taxonomy for Fieldpay
//!
//! Every rejection carries a stable machine-readable code so integrators
//! can branch programmatically rather than parsing prose. Business-rule
//! rejections are values, never panics.

use thiserror::Error;

use crate::event::EventKind;
use crate::job::JobStatus;
use crate::month::Month;

/// Result type for Fieldpay operations
pub type Result<T> = std::result::Result<T, FieldpayError>;

/// Fieldpay error taxonomy
#[derive(Debug, Clone, Error)]
pub enum FieldpayError {
    /// Malformed input; never persisted
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Event not valid for the job's current status
    #[error("Event {kind:?} is illegal while job status is {status:?}")]
    IllegalTransition { kind: EventKind, status: JobStatus },

    /// Expected-prev-chain-hash mismatch; caller must re-read the head and retry
    #[error("Chain head conflict: expected {expected:?}, found {actual:?}")]
    Conflict {
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Same idempotency key with a different request fingerprint
    #[error("Idempotency key {key} was already used with a different request")]
    IdempotencyConflict { key: String },

    /// Settlement attempted under a strict gate with no proof evaluation
    #[error("Settlement requires a proof evaluation for job {job_id}")]
    ProofRequired { job_id: String },

    /// Settlement attempted without a passing proof
    #[error("Proof for job {job_id} is insufficient; missing evidence: {missing_evidence:?}")]
    ProofInsufficient {
        job_id: String,
        missing_evidence: Vec<String>,
    },

    /// Non-system actor submitted an unsigned event
    #[error("Event from actor {actor} must be signed")]
    SignatureMissing { actor: String },

    /// Signature did not verify against the claimed key
    #[error("Signature by key {key_id} failed verification")]
    SignatureInvalid { key_id: String },

    /// The claimed signer key id is not registered
    #[error("Signer key {key_id} is not known")]
    SignatureUnknownKey { key_id: String },

    /// Chain linkage or hash recomputation failed during verification
    #[error("Event chain broken at {chain_hash}: {reason}")]
    ChainBroken { chain_hash: String, reason: String },

    /// Settlement into an already-closed calendar month
    #[error("Month {month} is closed for settlement")]
    MonthClosed { month: Month },

    /// Governance change conflicts with its effective-from window
    #[error("Governance change conflicts with effective-from: {detail}")]
    GovernanceEffectiveFromConflict { detail: String },

    /// Referenced entity does not exist (within the caller's tenant)
    #[error("Not found: {entity}")]
    NotFound { entity: String },

    /// Storage-layer failure; fatal to the current transaction only
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Serialization failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl FieldpayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Storage { .. })
    }

    /// Stable machine-readable code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Conflict { .. } => "CONFLICT",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::ProofRequired { .. } => "PROOF_REQUIRED",
            Self::ProofInsufficient { .. } => "PROOF_INSUFFICIENT",
            Self::SignatureMissing { .. } => "SIGNATURE_MISSING",
            Self::SignatureInvalid { .. } => "SIGNATURE_INVALID",
            Self::SignatureUnknownKey { .. } => "SIGNATURE_UNKNOWN_KEY",
            Self::ChainBroken { .. } => "CHAIN_BROKEN",
            Self::MonthClosed { .. } => "MONTH_CLOSED",
            Self::GovernanceEffectiveFromConflict { .. } => "GOVERNANCE_EFFECTIVE_FROM_CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage { .. } => "STORAGE",
            Self::Serialization { .. } => "SERIALIZATION",
        }
    }
}

impl From<serde_json::Error> for FieldpayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
