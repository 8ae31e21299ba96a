//! Outbox message types
//!
//! Outbox messages are written in the same atomic commit as the events
//! that produced them and become visible to workers only once that commit
//! is durable. Delivery is at-least-once: every payload must be safe to
//! apply more than once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::IncidentSeverity;
use crate::identity::{AgentId, JobId, TenantId};
use crate::job::BookingWindow;
use crate::ledger::LedgerEntry;
use crate::month::Month;

/// Topics drained by the outbox workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Ledger,
    Dispatch,
    Proof,
    Delivery,
    MonthClose,
    RobotHealth,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Ledger => "ledger",
            Topic::Dispatch => "dispatch",
            Topic::Proof => "proof",
            Topic::Delivery => "delivery",
            Topic::MonthClose => "month_close",
            Topic::RobotHealth => "robot_health",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ledger" => Some(Topic::Ledger),
            "dispatch" => Some(Topic::Dispatch),
            "proof" => Some(Topic::Proof),
            "delivery" => Some(Topic::Delivery),
            "month_close" => Some(Topic::MonthClose),
            "robot_health" => Some(Topic::RobotHealth),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification pushed to an external destination by the delivery worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryNotification {
    pub subject: String,
    pub job_id: JobId,
    /// Content hash of the artifact being announced
    pub artifact_hash: String,
}

/// Typed outbox payloads, one variant per side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxPayload {
    LedgerEntryApply {
        entry: LedgerEntry,
    },
    DispatchRequested {
        job_id: JobId,
        window: BookingWindow,
        zone_ids: Vec<String>,
        required_capabilities: Vec<String>,
    },
    ProofEvaluate {
        job_id: JobId,
    },
    NotifyDelivery {
        notification: DeliveryNotification,
    },
    MonthCloseRequested {
        month: Month,
    },
    RobotHealthIncident {
        agent_id: AgentId,
        severity: IncidentSeverity,
    },
}

impl OutboxPayload {
    /// The topic this payload is delivered on
    pub fn topic(&self) -> Topic {
        match self {
            OutboxPayload::LedgerEntryApply { .. } => Topic::Ledger,
            OutboxPayload::DispatchRequested { .. } => Topic::Dispatch,
            OutboxPayload::ProofEvaluate { .. } => Topic::Proof,
            OutboxPayload::NotifyDelivery { .. } => Topic::Delivery,
            OutboxPayload::MonthCloseRequested { .. } => Topic::MonthClose,
            OutboxPayload::RobotHealthIncident { .. } => Topic::RobotHealth,
        }
    }
}

/// A message as persisted in the outbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Monotonically increasing commit-order cursor
    pub cursor: u64,
    pub tenant_id: TenantId,
    pub payload: OutboxPayload,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub dead_lettered: bool,
}

impl OutboxMessage {
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}
