//! The job state machine
//!
//! `apply` validates one event against the current projection, folds it,
//! and returns the queued side effects as outbox payloads. Side effects
//! are never performed inline; ledger mutation, dispatch and artifact
//! generation all happen later in the outbox workers.

use tracing::debug;

use fieldpay_crypto::hash_canonical;
use fieldpay_eventlog::Event;
use fieldpay_types::{
    AccessPlan, Booking, DeliveryNotification, EventKind, EventPayload, FieldpayError, GateMode,
    HoldStatus, Job, JobId, JobStatus, LedgerEntry, OutboxPayload, Posting, ProofState,
    ProofStatus, Result, Settlement, SettlementHold, ZoneEvidence,
};

use crate::context::{AgentDirectory, ContractRegistry, MonthCloseState};
use crate::legality::{legal_statuses, next_status};

/// Read-only context consulted while applying a job event
pub struct ApplyContext<'a> {
    pub contracts: &'a ContractRegistry,
    pub months: &'a MonthCloseState,
    pub agents: &'a AgentDirectory,
}

/// Result of applying one event: the next projection and the side
/// effects to enqueue in the same commit.
#[derive(Debug, Clone)]
pub struct Applied {
    pub job: Job,
    pub outbox: Vec<OutboxPayload>,
}

/// Deterministic hash over the job's current evidence set, the facts
/// anchor a proof evaluation commits to.
pub fn compute_facts_hash(evidence: &[ZoneEvidence]) -> Result<String> {
    let mut facts: Vec<(&str, &str)> = evidence
        .iter()
        .map(|e| (e.zone_id.as_str(), e.facts_hash.as_str()))
        .collect();
    facts.sort();
    hash_canonical(&facts).map_err(|e| FieldpayError::Serialization {
        message: e.to_string(),
    })
}

/// Validate and apply one event to a job projection.
///
/// `job` is `None` only for the genesis `JOB_CREATED` event.
pub fn apply(job: Option<&Job>, event: &Event, ctx: &ApplyContext<'_>) -> Result<Applied> {
    let kind = event.kind();

    let job = match (job, kind) {
        (None, EventKind::JobCreated) => {
            let job = fold_genesis(event)?;
            debug!(job_id = %job.id, "job created");
            return Ok(Applied {
                job,
                outbox: vec![],
            });
        }
        (Some(_), EventKind::JobCreated) => {
            return Err(FieldpayError::validation("job already exists"));
        }
        (None, _) => {
            return Err(FieldpayError::not_found(format!(
                "job stream {}",
                event.stream_id
            )));
        }
        (Some(job), _) => job,
    };

    if !legal_statuses(kind).contains(&job.status) {
        return Err(FieldpayError::IllegalTransition {
            kind,
            status: job.status,
        });
    }

    validate_invariants(job, event, ctx)?;

    let mut next = job.clone();
    fold(&mut next, event)?;
    let outbox = side_effects(&next, event, ctx)?;

    if next.status != job.status {
        debug!(job_id = %next.id, from = ?job.status, to = ?next.status, "job transition");
    }

    Ok(Applied { job: next, outbox })
}

fn fold_genesis(event: &Event) -> Result<Job> {
    let EventPayload::JobCreated {
        service_kind,
        zone_ids,
    } = &event.payload
    else {
        return Err(FieldpayError::validation("genesis event must be JOB_CREATED"));
    };

    let id = JobId::parse(&event.stream_id)
        .map_err(|_| FieldpayError::validation("job stream id must be a job id"))?;

    Ok(Job {
        id,
        tenant_id: fieldpay_types::TenantId::from_uuid(uuid_nil()),
        status: JobStatus::Created,
        service_kind: service_kind.clone(),
        zone_ids: zone_ids.clone(),
        quoted_amount_cents: None,
        booking: None,
        matched_agent: None,
        reservation_ref: None,
        access_plans: vec![],
        evidence: vec![],
        last_heartbeat_at: None,
        execution_started_at: None,
        proof: None,
        holds: vec![],
        settlement: None,
        sla_credits_cents: 0,
        last_chain_hash: event.chain_hash.clone(),
    })
}

// The projection's tenant is stamped by the store at commit time; the
// fold itself is tenant-agnostic.
fn uuid_nil() -> uuid::Uuid {
    uuid::Uuid::nil()
}

/// Business-rule checks beyond the legality table
fn validate_invariants(job: &Job, event: &Event, ctx: &ApplyContext<'_>) -> Result<()> {
    match &event.payload {
        EventPayload::QuoteIssued { amount_cents } => {
            if *amount_cents <= 0 {
                return Err(FieldpayError::validation("quote amount must be positive"));
            }
        }
        EventPayload::JobBooked {
            window,
            contract_id,
            policy_hash,
            contract_version,
            ..
        } => {
            if window.start_at >= window.end_at {
                return Err(FieldpayError::validation("booking window is empty"));
            }
            let doc = ctx.contracts.by_policy_hash(policy_hash)?;
            if &doc.contract_id != contract_id || doc.version != *contract_version {
                return Err(FieldpayError::validation(
                    "policy hash does not match contract id and version",
                ));
            }
        }
        EventPayload::DispatchConfirmed { agent_id } => {
            let agent = ctx
                .agents
                .get(agent_id)
                .ok_or_else(|| FieldpayError::not_found(format!("agent {agent_id}")))?;
            if agent.quarantined {
                return Err(FieldpayError::validation(format!(
                    "agent {agent_id} is quarantined"
                )));
            }
        }
        EventPayload::AccessGranted { plan_id } => {
            if job.usable_access_plan(plan_id, event.at).is_none() {
                return Err(FieldpayError::validation(format!(
                    "no usable access plan {plan_id}: it must be issued, unrevoked and unexpired"
                )));
            }
        }
        EventPayload::SettlementHoldCreated {
            triggering_proof_ref,
            ..
        } => {
            let proof = job
                .proof
                .as_ref()
                .ok_or_else(|| FieldpayError::validation("hold requires a proof evaluation"))?;
            if proof.status != ProofStatus::InsufficientEvidence {
                return Err(FieldpayError::validation(
                    "hold requires an INSUFFICIENT_EVIDENCE proof",
                ));
            }
            if &proof.proof_ref() != triggering_proof_ref {
                return Err(FieldpayError::validation(
                    "hold does not reference the latest proof evaluation",
                ));
            }
        }
        EventPayload::SettlementHoldReleased { hold_id } => {
            let open = job
                .open_hold()
                .ok_or_else(|| FieldpayError::validation("no open hold to release"))?;
            if &open.hold_id != hold_id {
                return Err(FieldpayError::validation("hold id does not match open hold"));
            }
            let passing = job
                .proof
                .as_ref()
                .map(|p| p.status == ProofStatus::Pass)
                .unwrap_or(false);
            if !passing {
                return Err(FieldpayError::validation(
                    "hold release requires a passing proof",
                ));
            }
        }
        EventPayload::JobSettled {
            amount_cents,
            effective_month,
            settlement_proof_ref,
        } => {
            if *amount_cents <= 0 {
                return Err(FieldpayError::validation("settlement amount must be positive"));
            }
            if ctx.months.is_closed(*effective_month) {
                return Err(FieldpayError::MonthClosed {
                    month: *effective_month,
                });
            }
            let booking = job
                .booking
                .as_ref()
                .ok_or_else(|| FieldpayError::validation("settlement requires a booking"))?;
            let contract = ctx.contracts.by_policy_hash(&booking.policy_hash)?;

            if contract.gate_mode == GateMode::Strict {
                check_proof_gate(job, settlement_proof_ref)?;
            }
        }
        EventPayload::SlaCreditIssued {
            amount_cents,
            policy_hash,
            ..
        } => {
            if *amount_cents <= 0 {
                return Err(FieldpayError::validation("SLA credit must be positive"));
            }
            let booking = job
                .booking
                .as_ref()
                .ok_or_else(|| FieldpayError::validation("SLA credit requires a booking"))?;
            // Credits always apply under the policy pinned at booking
            // time, not whatever the contract says today.
            if policy_hash != &booking.policy_hash {
                return Err(FieldpayError::validation(
                    "SLA credit must reference the booking's pinned policy hash",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// The strict proof gate for settlement
fn check_proof_gate(
    job: &Job,
    settlement_proof_ref: &Option<fieldpay_types::ProofRef>,
) -> Result<()> {
    if let Some(hold) = job.open_hold() {
        return Err(FieldpayError::ProofInsufficient {
            job_id: job.id.to_string(),
            missing_evidence: hold.missing_evidence.clone(),
        });
    }

    let proof = job.proof.as_ref().ok_or_else(|| FieldpayError::ProofRequired {
        job_id: job.id.to_string(),
    })?;

    match proof.status {
        ProofStatus::Pass => {}
        ProofStatus::Fail | ProofStatus::InsufficientEvidence => {
            return Err(FieldpayError::ProofInsufficient {
                job_id: job.id.to_string(),
                missing_evidence: proof.missing_evidence.clone(),
            });
        }
    }

    // A passing proof over stale facts does not authorize settlement.
    let current_facts = compute_facts_hash(&job.evidence)?;
    if proof.facts_hash != current_facts {
        return Err(FieldpayError::ProofRequired {
            job_id: job.id.to_string(),
        });
    }

    match settlement_proof_ref {
        Some(r) if r == &proof.proof_ref() => Ok(()),
        _ => Err(FieldpayError::validation(
            "settlement must snapshot the authorizing proof ref",
        )),
    }
}

/// Fold a validated event into the projection
fn fold(job: &mut Job, event: &Event) -> Result<()> {
    match &event.payload {
        EventPayload::QuoteIssued { amount_cents } => {
            job.quoted_amount_cents = Some(*amount_cents);
        }
        EventPayload::JobBooked {
            window,
            contract_id,
            contract_version,
            policy_hash,
            customer_contract_hash,
            required_capabilities,
        } => {
            job.booking = Some(Booking {
                window: *window,
                contract_id: contract_id.clone(),
                contract_version: *contract_version,
                policy_hash: policy_hash.clone(),
                customer_contract_hash: customer_contract_hash.clone(),
                required_capabilities: required_capabilities.clone(),
            });
        }
        EventPayload::DispatchConfirmed { agent_id } => {
            job.matched_agent = Some(agent_id.clone());
        }
        EventPayload::ReservationConfirmed { reservation_ref } => {
            job.reservation_ref = Some(reservation_ref.clone());
        }
        EventPayload::AccessPlanIssued { plan_id, expires_at } => {
            job.access_plans.push(AccessPlan {
                plan_id: plan_id.clone(),
                expires_at: *expires_at,
                revoked: false,
            });
        }
        EventPayload::AccessPlanRevoked { plan_id } => {
            if let Some(plan) = job.access_plans.iter_mut().find(|p| &p.plan_id == plan_id) {
                plan.revoked = true;
            }
        }
        EventPayload::ExecutionStarted {} => {
            job.execution_started_at = Some(event.at);
        }
        EventPayload::Heartbeat {} => {
            job.last_heartbeat_at = Some(event.at);
        }
        EventPayload::EvidenceCaptured { zone_id, facts_hash } => {
            job.evidence.push(ZoneEvidence {
                zone_id: zone_id.clone(),
                facts_hash: facts_hash.clone(),
                captured_at: event.at,
            });
        }
        EventPayload::ProofEvaluated {
            status,
            facts_hash,
            reason_codes,
            missing_evidence,
        } => {
            job.proof = Some(ProofState {
                status: *status,
                facts_hash: facts_hash.clone(),
                reason_codes: reason_codes.clone(),
                missing_evidence: missing_evidence.clone(),
                evaluation_chain_hash: event.chain_hash.clone(),
            });
            // A narrower insufficient evaluation updates the open hold's
            // checklist in place.
            if *status == ProofStatus::InsufficientEvidence {
                if let Some(hold) = job
                    .holds
                    .iter_mut()
                    .find(|h| h.status == HoldStatus::Held)
                {
                    hold.missing_evidence = missing_evidence.clone();
                }
            }
        }
        EventPayload::SettlementHoldCreated {
            hold_id,
            missing_evidence,
            triggering_proof_ref,
        } => {
            job.holds.push(SettlementHold {
                hold_id: hold_id.clone(),
                status: HoldStatus::Held,
                missing_evidence: missing_evidence.clone(),
                triggering_proof_ref: triggering_proof_ref.clone(),
                created_at: event.at,
                released_at: None,
            });
        }
        EventPayload::SettlementHoldReleased { hold_id } => {
            if let Some(hold) = job.holds.iter_mut().find(|h| &h.hold_id == hold_id) {
                hold.status = HoldStatus::Released;
                hold.released_at = Some(event.at);
            }
        }
        EventPayload::JobSettled {
            amount_cents,
            effective_month,
            settlement_proof_ref,
        } => {
            job.settlement = Some(Settlement {
                amount_cents: *amount_cents,
                effective_month: *effective_month,
                settlement_proof_ref: settlement_proof_ref.clone(),
                settled_at: event.at,
            });
        }
        EventPayload::SlaCreditIssued { amount_cents, .. } => {
            job.sla_credits_cents += amount_cents;
        }
        EventPayload::RescheduleRequested { window } => {
            if let Some(booking) = job.booking.as_mut() {
                booking.window = *window;
            }
        }
        _ => {}
    }

    if let Some(status) = next_status(event.kind()) {
        job.status = status;
    }
    job.last_chain_hash = event.chain_hash.clone();
    Ok(())
}

/// Outbox payloads queued alongside the event's commit
fn side_effects(job: &Job, event: &Event, ctx: &ApplyContext<'_>) -> Result<Vec<OutboxPayload>> {
    let mut out = vec![];

    match &event.payload {
        EventPayload::JobBooked {
            window,
            required_capabilities,
            ..
        } => {
            out.push(OutboxPayload::DispatchRequested {
                job_id: job.id.clone(),
                window: *window,
                zone_ids: job.zone_ids.clone(),
                required_capabilities: required_capabilities.clone(),
            });
        }
        EventPayload::EvidenceCaptured { .. } | EventPayload::ExecutionCompleted {} => {
            out.push(OutboxPayload::ProofEvaluate {
                job_id: job.id.clone(),
            });
        }
        EventPayload::JobSettled { amount_cents, .. } => {
            let booking = job
                .booking
                .as_ref()
                .ok_or_else(|| FieldpayError::validation("settlement requires a booking"))?;
            let contract = ctx.contracts.by_policy_hash(&booking.policy_hash)?;

            let fee = amount_cents * i64::from(contract.pricing.platform_fee_bps) / 10_000;
            let entry = LedgerEntry::balanced(
                format!("settle-{}", event.chain_hash),
                format!("settlement of job {}", job.id),
                event.at,
                vec![
                    Posting::new(contract.customer_account.clone(), -amount_cents),
                    Posting::new(contract.operator_account.clone(), amount_cents - fee),
                    Posting::new(contract.platform_account.clone(), fee),
                ],
            )?;
            out.push(OutboxPayload::LedgerEntryApply { entry });
            out.push(OutboxPayload::NotifyDelivery {
                notification: DeliveryNotification {
                    subject: "job.settled".to_string(),
                    job_id: job.id.clone(),
                    artifact_hash: event.chain_hash.clone(),
                },
            });
        }
        EventPayload::SlaCreditIssued {
            amount_cents,
            policy_hash,
            reason,
        } => {
            let contract = ctx.contracts.by_policy_hash(policy_hash)?;
            let entry = LedgerEntry::balanced(
                format!("sla-{}", event.chain_hash),
                format!("SLA credit for job {}: {reason}", job.id),
                event.at,
                vec![
                    Posting::new(contract.operator_account.clone(), -amount_cents),
                    Posting::new(contract.customer_account.clone(), *amount_cents),
                ],
            )?;
            out.push(OutboxPayload::LedgerEntryApply { entry });
        }
        _ => {}
    }

    Ok(out)
}
