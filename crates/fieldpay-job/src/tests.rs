//! State machine tests: lifecycle legality, proof gating, pinning,
//! month close.

use chrono::{Duration, TimeZone, Utc};

use fieldpay_eventlog::{append_event, Event, EventDraft};
use fieldpay_types::{
    AccessPlanId, Actor, AgentId, BookingWindow, ContractDocument, ContractId, EventPayload,
    GateMode, HoldId, HoldStatus, Job, JobId, JobStatus, Month, OutboxPayload, PricingPolicy,
    ProofStatus,
};

use crate::context::{AgentDirectory, ContractRegistry, MonthCloseState};
use crate::machine::{apply, compute_facts_hash, ApplyContext};
use crate::settlement_payload;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 10, 12, 0, 0).unwrap()
}

struct Harness {
    contracts: ContractRegistry,
    months: MonthCloseState,
    agents: AgentDirectory,
    events: Vec<Event>,
    job: Option<Job>,
    job_id: JobId,
    agent_id: AgentId,
    policy_hash: String,
    contract_id: ContractId,
}

fn contract_doc(contract_id: &ContractId, version: u32, gate_mode: GateMode) -> ContractDocument {
    ContractDocument {
        contract_id: contract_id.clone(),
        version,
        gate_mode,
        required_zones: vec!["lobby".into(), "dock".into()],
        pricing: PricingPolicy {
            base_amount_cents: 20_000,
            platform_fee_bps: 1000,
            sla_credit_cents: 500,
        },
        operator_account: "operator".into(),
        platform_account: "platform".into(),
        customer_account: "customer".into(),
    }
}

impl Harness {
    fn new(gate_mode: GateMode) -> Self {
        let mut contracts = ContractRegistry::new();
        let contract_id = ContractId::new();
        let policy_hash = contracts
            .publish(contract_doc(&contract_id, 1, gate_mode))
            .unwrap();

        let mut agents = AgentDirectory::new();
        let agent_id = AgentId::new();
        let registration = append_event(
            vec![],
            EventDraft::new(
                "agents",
                Actor::system(),
                EventPayload::AgentRegistered {
                    agent_id: agent_id.clone(),
                    capabilities: vec!["floor_clean".into()],
                },
                now(),
            ),
            None,
        )
        .unwrap();
        agents.fold(&registration[0]);

        Self {
            contracts,
            months: MonthCloseState::new(),
            agents,
            events: vec![],
            job: None,
            job_id: JobId::new(),
            agent_id,
            policy_hash,
            contract_id,
        }
    }

    fn try_apply(&mut self, payload: EventPayload) -> Result<(), fieldpay_types::FieldpayError> {
        let draft = EventDraft::new(self.job_id.to_string(), Actor::system(), payload, now());
        let events = append_event(self.events.clone(), draft, None)?;
        let event = events.last().unwrap();
        let ctx = ApplyContext {
            contracts: &self.contracts,
            months: &self.months,
            agents: &self.agents,
        };
        let applied = apply(self.job.as_ref(), event, &ctx)?;
        self.events = events;
        self.job = Some(applied.job);
        Ok(())
    }

    fn must_apply(&mut self, payload: EventPayload) {
        self.try_apply(payload).expect("event should apply");
    }

    fn apply_with_outbox(&mut self, payload: EventPayload) -> Vec<OutboxPayload> {
        let draft = EventDraft::new(self.job_id.to_string(), Actor::system(), payload, now());
        let events = append_event(self.events.clone(), draft, None).unwrap();
        let event = events.last().unwrap();
        let ctx = ApplyContext {
            contracts: &self.contracts,
            months: &self.months,
            agents: &self.agents,
        };
        let applied = apply(self.job.as_ref(), event, &ctx).unwrap();
        self.events = events;
        self.job = Some(applied.job);
        applied.outbox
    }

    fn job(&self) -> &Job {
        self.job.as_ref().unwrap()
    }

    fn booked_payload(&self) -> EventPayload {
        EventPayload::JobBooked {
            window: BookingWindow {
                start_at: now(),
                end_at: now() + Duration::hours(4),
            },
            contract_id: self.contract_id.clone(),
            contract_version: 1,
            policy_hash: self.policy_hash.clone(),
            customer_contract_hash: "cust-hash-1".into(),
            required_capabilities: vec!["floor_clean".into()],
        }
    }

    fn advance_to_executing(&mut self) {
        self.must_apply(EventPayload::JobCreated {
            service_kind: "floor_clean".into(),
            zone_ids: vec!["lobby".into(), "dock".into()],
        });
        self.must_apply(EventPayload::QuoteIssued { amount_cents: 20_000 });
        self.must_apply(self.booked_payload());
        self.must_apply(EventPayload::DispatchConfirmed {
            agent_id: self.agent_id.clone(),
        });
        self.must_apply(EventPayload::ReservationConfirmed {
            reservation_ref: "res-1".into(),
        });
        let plan_id = AccessPlanId::new();
        self.must_apply(EventPayload::AccessPlanIssued {
            plan_id: plan_id.clone(),
            expires_at: now() + Duration::hours(2),
        });
        self.must_apply(EventPayload::EnRouteStarted {});
        self.must_apply(EventPayload::AccessGranted { plan_id });
        self.must_apply(EventPayload::ExecutionStarted {});
    }

    fn capture_evidence(&mut self, zone: &str) {
        self.must_apply(EventPayload::EvidenceCaptured {
            zone_id: zone.into(),
            facts_hash: format!("facts-{zone}"),
        });
    }

    fn evaluate_proof(&mut self, status: ProofStatus, missing: Vec<String>) {
        let facts_hash = compute_facts_hash(&self.job().evidence).unwrap();
        self.must_apply(EventPayload::ProofEvaluated {
            status,
            facts_hash,
            reason_codes: vec![],
            missing_evidence: missing,
        });
    }
}

#[test]
fn test_happy_path_reaches_completed() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    h.capture_evidence("lobby");
    h.capture_evidence("dock");
    h.must_apply(EventPayload::ExecutionCompleted {});
    assert_eq!(h.job().status, JobStatus::Completed);
    assert_eq!(h.job().evidence.len(), 2);
}

#[test]
fn test_heartbeat_before_execution_is_illegal() {
    let mut h = Harness::new(GateMode::Strict);
    h.must_apply(EventPayload::JobCreated {
        service_kind: "floor_clean".into(),
        zone_ids: vec![],
    });
    let err = h.try_apply(EventPayload::Heartbeat {}).unwrap_err();
    assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");
}

#[test]
fn test_access_grant_requires_usable_plan() {
    let mut h = Harness::new(GateMode::Strict);
    h.must_apply(EventPayload::JobCreated {
        service_kind: "floor_clean".into(),
        zone_ids: vec![],
    });
    h.must_apply(EventPayload::QuoteIssued { amount_cents: 100 });
    h.must_apply(h.booked_payload());
    h.must_apply(EventPayload::DispatchConfirmed {
        agent_id: h.agent_id.clone(),
    });
    h.must_apply(EventPayload::ReservationConfirmed {
        reservation_ref: "res-1".into(),
    });
    h.must_apply(EventPayload::EnRouteStarted {});

    // No plan issued at all.
    let err = h
        .try_apply(EventPayload::AccessGranted {
            plan_id: AccessPlanId::new(),
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");
}

#[test]
fn test_revoked_plan_cannot_grant_access() {
    let mut h = Harness::new(GateMode::Strict);
    h.must_apply(EventPayload::JobCreated {
        service_kind: "floor_clean".into(),
        zone_ids: vec![],
    });
    h.must_apply(EventPayload::QuoteIssued { amount_cents: 100 });
    h.must_apply(h.booked_payload());
    h.must_apply(EventPayload::DispatchConfirmed {
        agent_id: h.agent_id.clone(),
    });
    h.must_apply(EventPayload::ReservationConfirmed {
        reservation_ref: "res-1".into(),
    });
    let plan_id = AccessPlanId::new();
    h.must_apply(EventPayload::AccessPlanIssued {
        plan_id: plan_id.clone(),
        expires_at: now() + Duration::hours(2),
    });
    h.must_apply(EventPayload::AccessPlanRevoked {
        plan_id: plan_id.clone(),
    });
    h.must_apply(EventPayload::EnRouteStarted {});

    let err = h
        .try_apply(EventPayload::AccessGranted { plan_id })
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");
}

#[test]
fn test_strict_gate_requires_proof() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    h.must_apply(EventPayload::ExecutionCompleted {});

    let payload = settlement_payload(h.job(), 20_000, now());
    let err = h.try_apply(payload).unwrap_err();
    assert_eq!(err.error_code(), "PROOF_REQUIRED");
}

#[test]
fn test_hold_checklist_shrinks_then_releases() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    h.must_apply(EventPayload::ExecutionCompleted {});

    // No zone evidence: both required zones missing.
    h.evaluate_proof(
        ProofStatus::InsufficientEvidence,
        vec!["zone:lobby".into(), "zone:dock".into()],
    );
    let hold_id = HoldId::new();
    h.must_apply(EventPayload::SettlementHoldCreated {
        hold_id: hold_id.clone(),
        missing_evidence: vec!["zone:lobby".into(), "zone:dock".into()],
        triggering_proof_ref: h.job().proof.as_ref().unwrap().proof_ref(),
    });
    assert_eq!(h.job().status, JobStatus::Held);

    // Settlement while held surfaces the checklist.
    let payload = settlement_payload(h.job(), 20_000, now());
    let err = h.try_apply(payload).unwrap_err();
    assert_eq!(err.error_code(), "PROOF_INSUFFICIENT");

    // Partial evidence arrives: checklist shrinks from 2 to 1.
    h.capture_evidence("lobby");
    h.evaluate_proof(ProofStatus::InsufficientEvidence, vec!["zone:dock".into()]);
    assert_eq!(h.job().open_hold().unwrap().missing_evidence.len(), 1);

    // Full evidence: proof passes, hold releases, settlement succeeds.
    h.capture_evidence("dock");
    h.evaluate_proof(ProofStatus::Pass, vec![]);
    h.must_apply(EventPayload::SettlementHoldReleased { hold_id });
    assert_eq!(h.job().status, JobStatus::Completed);

    let payload = settlement_payload(h.job(), 20_000, now());
    h.must_apply(payload);
    assert_eq!(h.job().status, JobStatus::Settled);

    // The released hold stays on the projection as history.
    assert_eq!(h.job().holds.len(), 1);
    assert_eq!(h.job().holds[0].status, HoldStatus::Released);
}

#[test]
fn test_settlement_snapshot_survives_reevaluation() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    h.capture_evidence("lobby");
    h.capture_evidence("dock");
    h.must_apply(EventPayload::ExecutionCompleted {});
    h.evaluate_proof(ProofStatus::Pass, vec![]);

    let payload = settlement_payload(h.job(), 20_000, now());
    h.must_apply(payload);
    let frozen = h.job().settlement.as_ref().unwrap().settlement_proof_ref.clone();

    // Contested evidence triggers a failing re-evaluation after settle.
    let facts_hash = compute_facts_hash(&h.job().evidence).unwrap();
    h.must_apply(EventPayload::ProofEvaluated {
        status: ProofStatus::Fail,
        facts_hash,
        reason_codes: vec!["contested".into()],
        missing_evidence: vec![],
    });

    // The live proof view changed; the frozen snapshot did not.
    assert_eq!(h.job().proof.as_ref().unwrap().status, ProofStatus::Fail);
    assert_eq!(
        h.job().settlement.as_ref().unwrap().settlement_proof_ref,
        frozen
    );
}

#[test]
fn test_stale_proof_does_not_authorize_settlement() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    h.capture_evidence("lobby");
    h.capture_evidence("dock");
    h.must_apply(EventPayload::ExecutionCompleted {});
    h.evaluate_proof(ProofStatus::Pass, vec![]);

    // New evidence after the passing evaluation changes the facts anchor.
    h.capture_evidence("dock");

    let payload = settlement_payload(h.job(), 20_000, now());
    let err = h.try_apply(payload).unwrap_err();
    assert_eq!(err.error_code(), "PROOF_REQUIRED");
}

#[test]
fn test_month_close_blocks_settlement_until_reopened() {
    let mut h = Harness::new(GateMode::Lenient);
    h.advance_to_executing();
    h.must_apply(EventPayload::ExecutionCompleted {});

    let month = Month::of(now());
    let mut months = MonthCloseState::new();
    let close = append_event(
        vec![],
        EventDraft::new(
            "month_close",
            Actor::system(),
            EventPayload::MonthClosed { month },
            now(),
        ),
        None,
    )
    .unwrap();
    months.fold(&close[0]);
    h.months = months;

    let payload = settlement_payload(h.job(), 20_000, now());
    let err = h.try_apply(payload.clone()).unwrap_err();
    assert_eq!(err.error_code(), "MONTH_CLOSED");

    // Authorized reopen makes the same settlement succeed.
    let reopen = append_event(
        close,
        EventDraft::new(
            "month_close",
            Actor::system(),
            EventPayload::MonthReopened {
                month,
                authorized_by: "finance-lead".into(),
            },
            now(),
        ),
        None,
    )
    .unwrap();
    let mut months = MonthCloseState::new();
    for event in &reopen {
        months.fold(event);
    }
    h.months = months;

    h.must_apply(payload);
    assert_eq!(h.job().status, JobStatus::Settled);
}

#[test]
fn test_sla_credit_pins_booking_policy_hash() {
    let mut h = Harness::new(GateMode::Lenient);
    h.advance_to_executing();
    h.must_apply(EventPayload::ExecutionCompleted {});

    let pinned = h.policy_hash.clone();

    // The contract is edited after booking: new version, new hash.
    let edited = contract_doc(&h.contract_id, 2, GateMode::Lenient);
    let new_hash = h.contracts.publish(edited).unwrap();
    assert_ne!(pinned, new_hash);

    // Credit referencing the new hash is rejected.
    let err = h
        .try_apply(EventPayload::SlaCreditIssued {
            amount_cents: 500,
            policy_hash: new_hash,
            reason: "late arrival".into(),
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");

    // Credit referencing the pinned hash applies.
    h.must_apply(EventPayload::SlaCreditIssued {
        amount_cents: 500,
        policy_hash: pinned,
        reason: "late arrival".into(),
    });
    assert_eq!(h.job().sla_credits_cents, 500);
}

#[test]
fn test_settlement_queues_balanced_entry_and_notification() {
    let mut h = Harness::new(GateMode::Lenient);
    h.advance_to_executing();
    h.must_apply(EventPayload::ExecutionCompleted {});

    let payload = settlement_payload(h.job(), 20_000, now());
    let outbox = h.apply_with_outbox(payload);

    let entry = outbox
        .iter()
        .find_map(|p| match p {
            OutboxPayload::LedgerEntryApply { entry } => Some(entry),
            _ => None,
        })
        .expect("settlement queues a ledger entry");
    assert!(entry.check_balanced().is_ok());
    // 10% platform fee on 20_000.
    assert!(entry
        .postings
        .iter()
        .any(|p| p.account_id == "platform" && p.amount_cents == 2_000));

    assert!(outbox
        .iter()
        .any(|p| matches!(p, OutboxPayload::NotifyDelivery { .. })));
}

#[test]
fn test_cancel_is_illegal_mid_execution() {
    let mut h = Harness::new(GateMode::Strict);
    h.advance_to_executing();
    let err = h
        .try_apply(EventPayload::JobCancelled {
            reason: "customer change".into(),
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "ILLEGAL_TRANSITION");

    // Safe-exit abort is the legal path out of execution.
    h.must_apply(EventPayload::AbortSafeExitStarted {
        reason: "customer change".into(),
    });
    h.must_apply(EventPayload::JobAborted {});
    assert_eq!(h.job().status, JobStatus::Aborted);
}

#[test]
fn test_quarantined_agent_cannot_be_dispatched() {
    let mut h = Harness::new(GateMode::Strict);
    let quarantine = append_event(
        vec![],
        EventDraft::new(
            "agents",
            Actor::system(),
            EventPayload::AgentQuarantined {
                agent_id: h.agent_id.clone(),
                reason: "high severity incident".into(),
            },
            now(),
        ),
        None,
    )
    .unwrap();
    h.agents.fold(&quarantine[0]);

    h.must_apply(EventPayload::JobCreated {
        service_kind: "floor_clean".into(),
        zone_ids: vec![],
    });
    h.must_apply(EventPayload::QuoteIssued { amount_cents: 100 });
    h.must_apply(h.booked_payload());

    let err = h
        .try_apply(EventPayload::DispatchConfirmed {
            agent_id: h.agent_id.clone(),
        })
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");
}
