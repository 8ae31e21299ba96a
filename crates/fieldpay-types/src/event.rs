//! Event kinds and payloads
//!
//! Every event payload is a closed, tagged variant with its own typed
//! fields. There is deliberately no loose `serde_json::Value` payload:
//! payload shape is validated by deserialization before anything is chain
//! hashed or signed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{AccessPlanId, AgentId, ContractId, HoldId, RobotId};
use crate::job::{BookingWindow, ProofRef, ProofStatus};
use crate::month::Month;

/// Schema version stamped on every event
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Severity of a reported incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Low,
    Medium,
    High,
}

/// The discriminant of an event payload, used for legality tables and
/// logging without cloning the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    JobCreated,
    QuoteIssued,
    JobBooked,
    DispatchConfirmed,
    ReservationConfirmed,
    AccessPlanIssued,
    AccessPlanRevoked,
    EnRouteStarted,
    AccessGranted,
    ExecutionStarted,
    Heartbeat,
    CheckpointReached,
    EvidenceCaptured,
    StallDetected,
    ExecutionResumed,
    ExecutionCompleted,
    ProofEvaluated,
    SettlementHoldCreated,
    SettlementHoldReleased,
    JobSettled,
    SlaCreditIssued,
    RescheduleRequested,
    JobCancelled,
    AbortSafeExitStarted,
    JobAborted,
    MonthClosed,
    MonthReopened,
    IncidentReported,
    AgentQuarantined,
    AgentReinstated,
    AgentRegistered,
    RobotRegistered,
    GovernancePolicyUpdated,
}

/// Event payloads, one variant per event kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    JobCreated {
        service_kind: String,
        zone_ids: Vec<String>,
    },
    QuoteIssued {
        amount_cents: i64,
    },
    JobBooked {
        window: BookingWindow,
        contract_id: ContractId,
        contract_version: u32,
        policy_hash: String,
        customer_contract_hash: String,
        required_capabilities: Vec<String>,
    },
    DispatchConfirmed {
        agent_id: AgentId,
    },
    ReservationConfirmed {
        reservation_ref: String,
    },
    AccessPlanIssued {
        plan_id: AccessPlanId,
        expires_at: DateTime<Utc>,
    },
    AccessPlanRevoked {
        plan_id: AccessPlanId,
    },
    EnRouteStarted {},
    AccessGranted {
        plan_id: AccessPlanId,
    },
    ExecutionStarted {},
    Heartbeat {},
    CheckpointReached {
        zone_id: String,
    },
    EvidenceCaptured {
        zone_id: String,
        facts_hash: String,
    },
    StallDetected {
        missed_heartbeats: u32,
    },
    ExecutionResumed {},
    ExecutionCompleted {},
    ProofEvaluated {
        status: ProofStatus,
        facts_hash: String,
        reason_codes: Vec<String>,
        missing_evidence: Vec<String>,
    },
    SettlementHoldCreated {
        hold_id: HoldId,
        missing_evidence: Vec<String>,
        triggering_proof_ref: ProofRef,
    },
    SettlementHoldReleased {
        hold_id: HoldId,
    },
    JobSettled {
        amount_cents: i64,
        effective_month: Month,
        settlement_proof_ref: Option<ProofRef>,
    },
    SlaCreditIssued {
        amount_cents: i64,
        policy_hash: String,
        reason: String,
    },
    RescheduleRequested {
        window: BookingWindow,
    },
    JobCancelled {
        reason: String,
    },
    AbortSafeExitStarted {
        reason: String,
    },
    JobAborted {},
    MonthClosed {
        month: Month,
    },
    MonthReopened {
        month: Month,
        authorized_by: String,
    },
    IncidentReported {
        agent_id: AgentId,
        severity: IncidentSeverity,
        description: String,
    },
    AgentQuarantined {
        agent_id: AgentId,
        reason: String,
    },
    AgentReinstated {
        agent_id: AgentId,
    },
    AgentRegistered {
        agent_id: AgentId,
        capabilities: Vec<String>,
    },
    RobotRegistered {
        robot_id: RobotId,
    },
    GovernancePolicyUpdated {
        policy_hash: String,
        effective_from: DateTime<Utc>,
    },
}

impl EventPayload {
    /// The discriminant of this payload
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::JobCreated { .. } => EventKind::JobCreated,
            EventPayload::QuoteIssued { .. } => EventKind::QuoteIssued,
            EventPayload::JobBooked { .. } => EventKind::JobBooked,
            EventPayload::DispatchConfirmed { .. } => EventKind::DispatchConfirmed,
            EventPayload::ReservationConfirmed { .. } => EventKind::ReservationConfirmed,
            EventPayload::AccessPlanIssued { .. } => EventKind::AccessPlanIssued,
            EventPayload::AccessPlanRevoked { .. } => EventKind::AccessPlanRevoked,
            EventPayload::EnRouteStarted {} => EventKind::EnRouteStarted,
            EventPayload::AccessGranted { .. } => EventKind::AccessGranted,
            EventPayload::ExecutionStarted {} => EventKind::ExecutionStarted,
            EventPayload::Heartbeat {} => EventKind::Heartbeat,
            EventPayload::CheckpointReached { .. } => EventKind::CheckpointReached,
            EventPayload::EvidenceCaptured { .. } => EventKind::EvidenceCaptured,
            EventPayload::StallDetected { .. } => EventKind::StallDetected,
            EventPayload::ExecutionResumed {} => EventKind::ExecutionResumed,
            EventPayload::ExecutionCompleted {} => EventKind::ExecutionCompleted,
            EventPayload::ProofEvaluated { .. } => EventKind::ProofEvaluated,
            EventPayload::SettlementHoldCreated { .. } => EventKind::SettlementHoldCreated,
            EventPayload::SettlementHoldReleased { .. } => EventKind::SettlementHoldReleased,
            EventPayload::JobSettled { .. } => EventKind::JobSettled,
            EventPayload::SlaCreditIssued { .. } => EventKind::SlaCreditIssued,
            EventPayload::RescheduleRequested { .. } => EventKind::RescheduleRequested,
            EventPayload::JobCancelled { .. } => EventKind::JobCancelled,
            EventPayload::AbortSafeExitStarted { .. } => EventKind::AbortSafeExitStarted,
            EventPayload::JobAborted {} => EventKind::JobAborted,
            EventPayload::MonthClosed { .. } => EventKind::MonthClosed,
            EventPayload::MonthReopened { .. } => EventKind::MonthReopened,
            EventPayload::IncidentReported { .. } => EventKind::IncidentReported,
            EventPayload::AgentQuarantined { .. } => EventKind::AgentQuarantined,
            EventPayload::AgentReinstated { .. } => EventKind::AgentReinstated,
            EventPayload::AgentRegistered { .. } => EventKind::AgentRegistered,
            EventPayload::RobotRegistered { .. } => EventKind::RobotRegistered,
            EventPayload::GovernancePolicyUpdated { .. } => EventKind::GovernancePolicyUpdated,
        }
    }
}
