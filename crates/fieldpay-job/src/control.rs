//! Control streams: month close and governance
//!
//! These streams carry no job projection; their validation is against the
//! folded month-close state and the actor's authority.

use fieldpay_eventlog::Event;
use fieldpay_types::{ActorKind, EventPayload, FieldpayError, Job, Month, OutboxPayload, Result};

use crate::context::MonthCloseState;

/// Whether a job prevents its period from closing: an open hold, or a
/// non-terminal job whose settlement would fall in the month.
fn blocks_close(job: &Job, month: Month) -> bool {
    let in_month = match (&job.settlement, &job.booking) {
        (Some(settlement), _) => settlement.effective_month == month,
        (None, Some(booking)) => Month::of(booking.window.end_at) == month,
        (None, None) => false,
    };
    if !in_month {
        return false;
    }
    job.open_hold().is_some() || (job.settlement.is_none() && !job.status.is_terminal())
}

/// Validate a control-stream event and return its side effects.
///
/// `jobs` is the tenant's job projections, consulted when closing a
/// month. The caller folds the event into [`MonthCloseState`] after a
/// successful commit.
pub fn apply_control(
    state: &MonthCloseState,
    jobs: &[Job],
    event: &Event,
) -> Result<Vec<OutboxPayload>> {
    match &event.payload {
        EventPayload::MonthClosed { month } => {
            if state.is_closed(*month) {
                return Err(FieldpayError::validation(format!(
                    "month {month} is already closed"
                )));
            }
            // A period closes only once its jobs have settled and no
            // hold remains open.
            if let Some(job) = jobs.iter().find(|j| blocks_close(j, *month)) {
                return Err(FieldpayError::validation(format!(
                    "cannot close {month}: job {} is unsettled or holds an open hold",
                    job.id
                )));
            }
            Ok(vec![OutboxPayload::MonthCloseRequested { month: *month }])
        }
        EventPayload::MonthReopened { month, .. } => {
            if !state.is_closed(*month) {
                return Err(FieldpayError::validation(format!(
                    "month {month} is not closed"
                )));
            }
            // Reopening a period is an authorized operation.
            if !matches!(event.actor.kind, ActorKind::Operator | ActorKind::System) {
                return Err(FieldpayError::validation(
                    "month reopen requires an operator or system actor",
                ));
            }
            Ok(vec![])
        }
        EventPayload::GovernancePolicyUpdated { effective_from, .. } => {
            if *effective_from < event.at {
                return Err(FieldpayError::GovernanceEffectiveFromConflict {
                    detail: format!(
                        "effective_from {effective_from} is before the event timestamp {}",
                        event.at
                    ),
                });
            }
            Ok(vec![])
        }
        EventPayload::IncidentReported {
            agent_id, severity, ..
        } => Ok(vec![OutboxPayload::RobotHealthIncident {
            agent_id: agent_id.clone(),
            severity: *severity,
        }]),
        EventPayload::AgentRegistered { .. }
        | EventPayload::AgentQuarantined { .. }
        | EventPayload::AgentReinstated { .. }
        | EventPayload::RobotRegistered { .. } => Ok(vec![]),
        _ => Err(FieldpayError::validation(
            "event kind is not valid on a control stream",
        )),
    }
}
