//! Job projection state
//!
//! A [`Job`] is derived state: it is never mutated directly, only folded
//! from the events of its stream. Terminal statuses are `Settled`,
//! `Aborted` and `Cancelled`; jobs are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{AccessPlanId, AgentId, ContractId, HoldId, JobId, TenantId};
use crate::month::Month;

/// Status of a job over its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Quoted,
    Booked,
    Matched,
    Reserved,
    EnRoute,
    AccessGranted,
    Executing,
    Stalled,
    Completed,
    Held,
    Settled,
    AbortingSafeExit,
    Aborted,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses admit no further lifecycle events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Settled | JobStatus::Aborted | JobStatus::Cancelled
        )
    }
}

/// The agreed service window of a booking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingWindow {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl BookingWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_at <= at && at <= self.end_at
    }
}

/// Booking state pinned at `JOB_BOOKED` time.
///
/// The policy and contract hashes are frozen here so later edits to the
/// live contract never retroactively alter an already-booked job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub window: BookingWindow,
    pub contract_id: ContractId,
    pub contract_version: u32,
    pub policy_hash: String,
    pub customer_contract_hash: String,
    pub required_capabilities: Vec<String>,
}

/// Outcome of a proof evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofStatus {
    Pass,
    Fail,
    InsufficientEvidence,
}

/// Anchor identifying one proof evaluation: the facts that were evaluated
/// and the chain hash of the `PROOF_EVALUATED` event recording it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRef {
    pub facts_hash: String,
    pub evaluation_chain_hash: String,
}

/// The job's live proof view (latest evaluation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofState {
    pub status: ProofStatus,
    pub facts_hash: String,
    pub reason_codes: Vec<String>,
    pub missing_evidence: Vec<String>,
    pub evaluation_chain_hash: String,
}

impl ProofState {
    pub fn proof_ref(&self) -> ProofRef {
        ProofRef {
            facts_hash: self.facts_hash.clone(),
            evaluation_chain_hash: self.evaluation_chain_hash.clone(),
        }
    }
}

/// Status of a settlement hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Held,
    Released,
}

/// A settlement hold blocking the terminal `SETTLED` transition.
///
/// Holds are released, never deleted: the full history of holds stays on
/// the projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementHold {
    pub hold_id: HoldId,
    pub status: HoldStatus,
    pub missing_evidence: Vec<String>,
    pub triggering_proof_ref: ProofRef,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Settlement state frozen when `JOB_SETTLED` is recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub amount_cents: i64,
    pub effective_month: Month,
    /// Snapshot of the proof that authorized settlement. Later proof
    /// re-evaluations update the live [`ProofState`] but never this ref.
    pub settlement_proof_ref: Option<ProofRef>,
    pub settled_at: DateTime<Utc>,
}

/// An issued access plan as tracked on the projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPlan {
    pub plan_id: AccessPlanId,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Captured evidence for one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEvidence {
    pub zone_id: String,
    pub facts_hash: String,
    pub captured_at: DateTime<Utc>,
}

/// The job aggregate projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub service_kind: String,
    pub zone_ids: Vec<String>,
    pub quoted_amount_cents: Option<i64>,
    pub booking: Option<Booking>,
    pub matched_agent: Option<AgentId>,
    pub reservation_ref: Option<String>,
    pub access_plans: Vec<AccessPlan>,
    pub evidence: Vec<ZoneEvidence>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// When execution began; the liveness baseline until the first
    /// heartbeat arrives.
    pub execution_started_at: Option<DateTime<Utc>>,
    pub proof: Option<ProofState>,
    pub holds: Vec<SettlementHold>,
    pub settlement: Option<Settlement>,
    pub sla_credits_cents: i64,
    pub last_chain_hash: String,
}

impl Job {
    /// The currently open hold, if any
    pub fn open_hold(&self) -> Option<&SettlementHold> {
        self.holds.iter().find(|h| h.status == HoldStatus::Held)
    }

    /// The plan usable for an access grant at `at`: issued, not revoked,
    /// not expired.
    pub fn usable_access_plan(&self, plan_id: &AccessPlanId, at: DateTime<Utc>) -> Option<&AccessPlan> {
        self.access_plans
            .iter()
            .find(|p| &p.plan_id == plan_id && !p.revoked && p.expires_at > at)
    }

    /// Zones with captured evidence
    pub fn covered_zones(&self) -> Vec<&str> {
        self.evidence.iter().map(|e| e.zone_id.as_str()).collect()
    }
}
