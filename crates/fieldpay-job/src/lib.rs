//! Fieldpay Job - the job aggregate and state machine
//!
//! The authoritative projection of a job's event stream into current
//! status, booking, reservation, proof and settlement-hold state. The
//! machine:
//!
//! - rejects any event illegal for the current status (legality tables)
//! - enforces the access-plan, proof-gate and month-close invariants
//! - queues side effects as outbox payloads, never applies them inline
//!
//! # Invariants
//!
//! 1. Jobs are folded from events, never mutated directly
//! 2. Terminal statuses (SETTLED, ABORTED, CANCELLED) admit no further
//!    lifecycle events; late proof re-evaluation only updates the live
//!    proof view
//! 3. A strict-gate settlement snapshots the authorizing proof ref; later
//!    evaluations never change it

pub mod context;
pub mod control;
pub mod legality;
pub mod machine;

pub use context::{AgentDirectory, AgentRecord, ContractRegistry, MonthCloseState};
pub use control::apply_control;
pub use legality::{legal_statuses, next_status};
pub use machine::{apply, compute_facts_hash, Applied, ApplyContext};

use chrono::{DateTime, Utc};
use fieldpay_types::{EventPayload, Job, Month};

/// Build a `JOB_SETTLED` payload snapshotting the job's current proof
/// ref, the shape the strict gate expects.
pub fn settlement_payload(job: &Job, amount_cents: i64, at: DateTime<Utc>) -> EventPayload {
    EventPayload::JobSettled {
        amount_cents,
        effective_month: Month::of(at),
        settlement_proof_ref: job.proof.as_ref().map(|p| p.proof_ref()),
    }
}

#[cfg(test)]
mod tests;
