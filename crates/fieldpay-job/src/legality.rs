//! Per-event-kind legality tables
//!
//! Each event kind declares the job statuses in which it may be appended.
//! An event submitted in any other status is rejected with
//! `ILLEGAL_TRANSITION` and never reaches the stream.

use fieldpay_types::{EventKind, JobStatus};

use JobStatus::*;

/// Statuses in which an event kind is legal. `JobCreated` is the only
/// genesis event and is handled separately (the job must not exist yet).
pub fn legal_statuses(kind: EventKind) -> &'static [JobStatus] {
    match kind {
        EventKind::JobCreated => &[],
        EventKind::QuoteIssued => &[Created],
        EventKind::JobBooked => &[Quoted],
        EventKind::DispatchConfirmed => &[Booked],
        EventKind::ReservationConfirmed => &[Matched],
        // Plans may be issued or revoked any time between reservation and
        // the site approach.
        EventKind::AccessPlanIssued => &[Reserved, EnRoute],
        EventKind::AccessPlanRevoked => &[Reserved, EnRoute, AccessGranted],
        EventKind::EnRouteStarted => &[Reserved],
        EventKind::AccessGranted => &[EnRoute],
        EventKind::ExecutionStarted => &[AccessGranted],
        // Execution-phase telemetry is illegal before EXECUTION_STARTED.
        EventKind::Heartbeat => &[Executing, Stalled],
        EventKind::CheckpointReached => &[Executing],
        // Late or contested evidence may still arrive after completion.
        EventKind::EvidenceCaptured => &[Executing, Completed, Held],
        EventKind::StallDetected => &[Executing],
        EventKind::ExecutionResumed => &[Stalled],
        EventKind::ExecutionCompleted => &[Executing],
        // Re-evaluation after settlement updates the live proof view only.
        EventKind::ProofEvaluated => &[Completed, Held, Settled],
        EventKind::SettlementHoldCreated => &[Completed],
        EventKind::SettlementHoldReleased => &[Held],
        // Settling from Held is legal to attempt; the proof gate then
        // rejects it with the specific missing-evidence reasons.
        EventKind::JobSettled => &[Completed, Held],
        EventKind::SlaCreditIssued => &[Completed, Held, Settled],
        // Reschedule is legal after dispatch but closes at access grant.
        EventKind::RescheduleRequested => &[Booked, Matched, Reserved],
        EventKind::JobCancelled => &[
            Created,
            Quoted,
            Booked,
            Matched,
            Reserved,
            EnRoute,
            AccessGranted,
        ],
        EventKind::AbortSafeExitStarted => &[EnRoute, AccessGranted, Executing, Stalled],
        EventKind::JobAborted => &[AbortingSafeExit],
        // Control-stream kinds never appear on a job stream.
        EventKind::MonthClosed
        | EventKind::MonthReopened
        | EventKind::IncidentReported
        | EventKind::AgentQuarantined
        | EventKind::AgentReinstated
        | EventKind::AgentRegistered
        | EventKind::RobotRegistered
        | EventKind::GovernancePolicyUpdated => &[],
    }
}

/// The status a job moves to when this event kind is applied, if it
/// changes status at all.
pub fn next_status(kind: EventKind) -> Option<JobStatus> {
    match kind {
        EventKind::JobCreated => Some(Created),
        EventKind::QuoteIssued => Some(Quoted),
        EventKind::JobBooked => Some(Booked),
        EventKind::DispatchConfirmed => Some(Matched),
        EventKind::ReservationConfirmed => Some(Reserved),
        EventKind::EnRouteStarted => Some(EnRoute),
        EventKind::AccessGranted => Some(AccessGranted),
        EventKind::ExecutionStarted => Some(Executing),
        EventKind::StallDetected => Some(Stalled),
        EventKind::ExecutionResumed => Some(Executing),
        EventKind::ExecutionCompleted => Some(Completed),
        EventKind::SettlementHoldCreated => Some(Held),
        EventKind::SettlementHoldReleased => Some(Completed),
        EventKind::JobSettled => Some(Settled),
        EventKind::JobCancelled => Some(Cancelled),
        EventKind::AbortSafeExitStarted => Some(AbortingSafeExit),
        EventKind::JobAborted => Some(Aborted),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_requires_execution() {
        assert!(!legal_statuses(EventKind::Heartbeat).contains(&Booked));
        assert!(legal_statuses(EventKind::Heartbeat).contains(&Executing));
    }

    #[test]
    fn test_terminal_statuses_admit_no_lifecycle_events() {
        for status in [Settled, Aborted, Cancelled] {
            assert!(!legal_statuses(EventKind::ExecutionStarted).contains(&status));
            assert!(!legal_statuses(EventKind::JobBooked).contains(&status));
        }
        // Except late proof re-evaluation and SLA credits after settle.
        assert!(legal_statuses(EventKind::ProofEvaluated).contains(&Settled));
        assert!(legal_statuses(EventKind::SlaCreditIssued).contains(&Settled));
    }

    #[test]
    fn test_reschedule_window_closes_at_en_route() {
        assert!(legal_statuses(EventKind::RescheduleRequested).contains(&Matched));
        assert!(!legal_statuses(EventKind::RescheduleRequested).contains(&EnRoute));
    }
}
