//! End-to-end pipeline tests: append events, drain the outbox, observe
//! the ledger, statements and notifications converge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use fieldpay_job::settlement_payload;
use fieldpay_ledger::Ledger;
use fieldpay_outbox::{
    DeliveryDestination, DeliveryWorker, DispatchWorker, Dispatcher, LedgerApplyWorker,
    LivenessMonitor, MonthCloseWorker, ProofWorker, RobotHealthWorker, WorkerConfig,
};
use fieldpay_store::{AppendRequest, Appender, MemoryStore, Store};
use fieldpay_types::{
    AccessPlanId, Actor, AgentId, BookingWindow, ContractDocument, ContractId,
    DeliveryNotification, EventPayload, GateMode, HoldStatus, IncidentSeverity, Job, JobId,
    JobStatus, Month, PricingPolicy, ProofStatus, Result, StreamKey, TenantId, Topic,
};

struct RecordingDestination {
    delivered: Arc<Mutex<Vec<DeliveryNotification>>>,
}

#[async_trait::async_trait]
impl DeliveryDestination for RecordingDestination {
    async fn deliver(
        &self,
        _tenant_id: &TenantId,
        notification: &DeliveryNotification,
    ) -> Result<()> {
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

struct Pipeline {
    appender: Arc<Appender>,
    dispatcher: Dispatcher,
    ledger: Arc<Mutex<Ledger>>,
    delivered: Arc<Mutex<Vec<DeliveryNotification>>>,
    tenant: TenantId,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Pipeline {
    async fn new() -> Self {
        init_tracing();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_lease(0));
        let appender = Arc::new(Appender::new(store.clone()));
        let ledger = Arc::new(Mutex::new(Ledger::new()));
        let delivered = Arc::new(Mutex::new(vec![]));

        let mut dispatcher = Dispatcher::new(store, WorkerConfig::default());
        dispatcher.register(Arc::new(LedgerApplyWorker::new(ledger.clone())));
        dispatcher.register(Arc::new(DispatchWorker::new(appender.clone())));
        dispatcher.register(Arc::new(ProofWorker::new(appender.clone())));
        dispatcher.register(Arc::new(DeliveryWorker::new(
            Arc::new(RecordingDestination {
                delivered: delivered.clone(),
            }),
            Duration::from_secs(1),
        )));
        dispatcher.register(Arc::new(MonthCloseWorker::new(appender.clone())));
        dispatcher.register(Arc::new(RobotHealthWorker::new(appender.clone())));

        Self {
            appender,
            dispatcher,
            ledger,
            delivered,
            tenant: TenantId::new(),
        }
    }

    async fn append_sys(&self, stream: StreamKey, payload: EventPayload) {
        self.appender
            .append(AppendRequest::new(stream, Actor::system(), payload), None)
            .await
            .unwrap();
    }

    async fn publish_contract(&self, gate_mode: GateMode, required_zones: &[&str]) -> String {
        self.appender
            .publish_contract(ContractDocument {
                contract_id: ContractId::from_uuid(uuid::Uuid::from_u128(1)),
                version: 1,
                gate_mode,
                required_zones: required_zones.iter().map(|z| z.to_string()).collect(),
                pricing: PricingPolicy {
                    base_amount_cents: 10_000,
                    platform_fee_bps: 1000,
                    sla_credit_cents: 500,
                },
                operator_account: "operator".into(),
                platform_account: "platform".into(),
                customer_account: "customer".into(),
            })
            .await
            .unwrap()
    }

    async fn register_agent(&self, capabilities: &[&str]) -> AgentId {
        let agent_id = AgentId::new();
        self.append_sys(
            StreamKey::agent(self.tenant.clone(), &agent_id),
            EventPayload::AgentRegistered {
                agent_id: agent_id.clone(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            },
        )
        .await;
        agent_id
    }

    /// Create a job, book it under `policy_hash` and run the pipeline up
    /// to EXECUTING.
    async fn executing_job(&self, policy_hash: &str, zone_ids: &[&str]) -> StreamKey {
        let job_id = JobId::new();
        let stream = StreamKey::job(self.tenant.clone(), &job_id);

        self.append_sys(
            stream.clone(),
            EventPayload::JobCreated {
                service_kind: "floor_clean".into(),
                zone_ids: zone_ids.iter().map(|z| z.to_string()).collect(),
            },
        )
        .await;
        self.append_sys(stream.clone(), EventPayload::QuoteIssued { amount_cents: 9900 })
            .await;

        let now = Utc::now();
        self.append_sys(
            stream.clone(),
            EventPayload::JobBooked {
                window: BookingWindow {
                    start_at: now,
                    end_at: now + chrono::Duration::hours(4),
                },
                contract_id: ContractId::from_uuid(uuid::Uuid::from_u128(1)),
                contract_version: 1,
                policy_hash: policy_hash.to_string(),
                customer_contract_hash: "cch".into(),
                required_capabilities: vec!["mop".into()],
            },
        )
        .await;

        // Booking enqueued DISPATCH_REQUESTED; the worker matches an agent.
        self.dispatcher
            .drain(&self.tenant, Topic::Dispatch)
            .await
            .unwrap();
        assert_eq!(self.job(&stream).await.status, JobStatus::Matched);

        self.append_sys(
            stream.clone(),
            EventPayload::ReservationConfirmed {
                reservation_ref: "res-1".into(),
            },
        )
        .await;
        let plan_id = AccessPlanId::new();
        self.append_sys(
            stream.clone(),
            EventPayload::AccessPlanIssued {
                plan_id: plan_id.clone(),
                expires_at: now + chrono::Duration::hours(8),
            },
        )
        .await;
        self.append_sys(stream.clone(), EventPayload::EnRouteStarted {}).await;
        self.append_sys(stream.clone(), EventPayload::AccessGranted { plan_id })
            .await;
        self.append_sys(stream.clone(), EventPayload::ExecutionStarted {}).await;
        stream
    }

    async fn capture(&self, stream: &StreamKey, zone_id: &str) {
        self.append_sys(
            stream.clone(),
            EventPayload::EvidenceCaptured {
                zone_id: zone_id.into(),
                facts_hash: format!("facts-{zone_id}"),
            },
        )
        .await;
    }

    async fn job(&self, stream: &StreamKey) -> Job {
        let job_id = JobId::parse(&stream.stream_id).unwrap();
        self.appender
            .store()
            .job(&self.tenant, &job_id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn settle(&self, stream: &StreamKey, amount_cents: i64) -> Result<()> {
        let job = self.job(stream).await;
        let at = Utc::now();
        self.appender
            .append(
                AppendRequest::new(
                    stream.clone(),
                    Actor::system(),
                    settlement_payload(&job, amount_cents, at),
                )
                .at(at),
                None,
            )
            .await
            .map(|_| ())
    }
}

#[tokio::test]
async fn test_settlement_flows_to_ledger_and_delivery() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Strict, &["lobby"]).await;

    let stream = p.executing_job(&policy, &["lobby"]).await;
    p.capture(&stream, "lobby").await;
    p.append_sys(stream.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let job = p.job(&stream).await;
    assert_eq!(job.proof.as_ref().unwrap().status, ProofStatus::Pass);

    p.settle(&stream, 10_000).await.unwrap();
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let ledger = p.ledger.lock().await;
    assert_eq!(ledger.balance("customer"), -10_000);
    assert_eq!(ledger.balance("operator"), 9_000);
    assert_eq!(ledger.balance("platform"), 1_000);
    assert_eq!(ledger.total(), 0);
    drop(ledger);

    let delivered = p.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].subject, "job.settled");

    assert_eq!(p.job(&stream).await.status, JobStatus::Settled);
}

#[tokio::test]
async fn test_redelivered_ledger_message_posts_once() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;

    let stream = p.executing_job(&policy, &["lobby"]).await;
    p.capture(&stream, "lobby").await;
    p.append_sys(stream.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    p.settle(&stream, 10_000).await.unwrap();

    // Crash between effect and acknowledgement: apply the ledger entry by
    // hand, leave the message unmarked, then let the dispatcher redeliver.
    let claimed = p
        .appender
        .store()
        .claim_batch(&p.tenant, Topic::Ledger, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    if let fieldpay_types::OutboxPayload::LedgerEntryApply { entry } = &claimed[0].payload {
        p.ledger.lock().await.apply_entry(entry.clone()).unwrap();
    } else {
        panic!("expected a ledger entry");
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let ledger = p.ledger.lock().await;
    assert_eq!(ledger.entries().len(), 1);
    assert_eq!(ledger.balance("operator"), 9_000);
}

#[tokio::test]
async fn test_strict_gate_hold_shrinks_then_releases() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p
        .publish_contract(GateMode::Strict, &["lobby", "dock", "atrium"])
        .await;

    let stream = p.executing_job(&policy, &["lobby", "dock", "atrium"]).await;
    p.capture(&stream, "lobby").await;
    p.append_sys(stream.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    // Two zones uncovered: held, settlement blocked.
    let job = p.job(&stream).await;
    assert_eq!(job.status, JobStatus::Held);
    let hold = job.open_hold().unwrap();
    assert_eq!(hold.missing_evidence.len(), 2);
    let err = p.settle(&stream, 10_000).await.unwrap_err();
    assert_eq!(err.error_code(), "PROOF_INSUFFICIENT");

    // One more zone: still held, but the checklist shrinks in place.
    p.capture(&stream, "dock").await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    let job = p.job(&stream).await;
    assert_eq!(job.status, JobStatus::Held);
    assert_eq!(job.open_hold().unwrap().missing_evidence, vec!["zone:atrium"]);

    // Full cover: pass, release, settle.
    p.capture(&stream, "atrium").await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    let job = p.job(&stream).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.open_hold().is_none());
    // The released hold stays on the projection.
    assert_eq!(job.holds.len(), 1);
    assert_eq!(job.holds[0].status, HoldStatus::Released);

    p.settle(&stream, 10_000).await.unwrap();
    assert_eq!(p.job(&stream).await.status, JobStatus::Settled);
}

#[tokio::test]
async fn test_no_matching_agent_cancels_job() {
    let p = Pipeline::new().await;
    p.register_agent(&["weld"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;

    let job_id = JobId::new();
    let stream = StreamKey::job(p.tenant.clone(), &job_id);
    p.append_sys(
        stream.clone(),
        EventPayload::JobCreated {
            service_kind: "floor_clean".into(),
            zone_ids: vec!["lobby".into()],
        },
    )
    .await;
    p.append_sys(stream.clone(), EventPayload::QuoteIssued { amount_cents: 9900 })
        .await;
    let now = Utc::now();
    p.append_sys(
        stream.clone(),
        EventPayload::JobBooked {
            window: BookingWindow {
                start_at: now,
                end_at: now + chrono::Duration::hours(4),
            },
            contract_id: ContractId::from_uuid(uuid::Uuid::from_u128(1)),
            contract_version: 1,
            policy_hash: policy,
            customer_contract_hash: "cch".into(),
            required_capabilities: vec!["mop".into()],
        },
    )
    .await;

    p.dispatcher.drain(&p.tenant, Topic::Dispatch).await.unwrap();
    assert_eq!(p.job(&stream).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_month_close_statements_and_reopen() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;

    let stream = p.executing_job(&policy, &["lobby"]).await;
    p.capture(&stream, "lobby").await;
    p.append_sys(stream.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    p.settle(&stream, 10_000).await.unwrap();
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let month = Month::of(Utc::now());
    let close_stream = StreamKey::month_close(p.tenant.clone());
    p.append_sys(close_stream.clone(), EventPayload::MonthClosed { month })
        .await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let statements = p.appender.store().statements(&p.tenant).await.unwrap();
    assert_eq!(statements.len(), 3);
    let operator = statements.iter().find(|s| s.party == "operator").unwrap();
    assert_eq!(operator.gross_cents, 9_000);
    assert_eq!(operator.job_count, 1);
    assert_eq!(
        statements.iter().map(|s| s.gross_cents).sum::<i64>(),
        0
    );

    // Settling another job into the closed month is rejected.
    let stream2 = p.executing_job(&policy, &["lobby"]).await;
    p.capture(&stream2, "lobby").await;
    p.append_sys(stream2.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    let err = p.settle(&stream2, 5_000).await.unwrap_err();
    assert_eq!(err.error_code(), "MONTH_CLOSED");

    // Reopen and settle the second job into the same month.
    p.append_sys(
        close_stream.clone(),
        EventPayload::MonthReopened {
            month,
            authorized_by: "ops-lead".into(),
        },
    )
    .await;
    p.settle(&stream2, 5_000).await.unwrap();
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    assert_eq!(
        p.appender.store().statements(&p.tenant).await.unwrap().len(),
        3
    );

    // Re-closing folds the reopen-window settlement into the period's
    // statements: one row per party, totals recomputed.
    p.append_sys(close_stream, EventPayload::MonthClosed { month })
        .await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    let statements = p.appender.store().statements(&p.tenant).await.unwrap();
    assert_eq!(statements.len(), 3);
    let operator = statements.iter().find(|s| s.party == "operator").unwrap();
    assert_eq!(operator.gross_cents, 9_000 + 4_500);
    assert_eq!(operator.job_count, 2);
    assert_eq!(statements.iter().map(|s| s.gross_cents).sum::<i64>(), 0);
}

#[tokio::test]
async fn test_month_close_blocked_while_job_unsettled() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;

    // A job still executing in the period blocks the close.
    let _stream = p.executing_job(&policy, &["lobby"]).await;

    let month = Month::of(Utc::now());
    let close_stream = StreamKey::month_close(p.tenant.clone());
    let err = p
        .appender
        .append(
            AppendRequest::new(
                close_stream,
                Actor::system(),
                EventPayload::MonthClosed { month },
            ),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");
}

#[tokio::test]
async fn test_high_severity_incident_quarantines_agent() {
    let p = Pipeline::new().await;
    let agent_id = p.register_agent(&["mop"]).await;

    p.append_sys(
        StreamKey::agent(p.tenant.clone(), &agent_id),
        EventPayload::IncidentReported {
            agent_id: agent_id.clone(),
            severity: IncidentSeverity::High,
            description: "collision with fixture".into(),
        },
    )
    .await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    // The quarantined agent is no longer dispatchable: a new booking
    // finds no candidate and the job is cancelled.
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;
    let job_id = JobId::new();
    let stream = StreamKey::job(p.tenant.clone(), &job_id);
    p.append_sys(
        stream.clone(),
        EventPayload::JobCreated {
            service_kind: "floor_clean".into(),
            zone_ids: vec!["lobby".into()],
        },
    )
    .await;
    p.append_sys(stream.clone(), EventPayload::QuoteIssued { amount_cents: 9900 })
        .await;
    let now = Utc::now();
    p.append_sys(
        stream.clone(),
        EventPayload::JobBooked {
            window: BookingWindow {
                start_at: now,
                end_at: now + chrono::Duration::hours(4),
            },
            contract_id: ContractId::from_uuid(uuid::Uuid::from_u128(1)),
            contract_version: 1,
            policy_hash: policy,
            customer_contract_hash: "cch".into(),
            required_capabilities: vec!["mop".into()],
        },
    )
    .await;
    p.dispatcher.drain(&p.tenant, Topic::Dispatch).await.unwrap();
    assert_eq!(p.job(&stream).await.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_liveness_stall_and_resume() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;
    let stream = p.executing_job(&policy, &["lobby"]).await;

    p.append_sys(stream.clone(), EventPayload::Heartbeat {}).await;
    let monitor = LivenessMonitor::new(p.appender.clone(), 90);

    // Quiet for twice the timeout: stalled.
    let later = Utc::now() + chrono::Duration::seconds(200);
    assert_eq!(monitor.tick(&p.tenant, later).await.unwrap(), 1);
    assert_eq!(p.job(&stream).await.status, JobStatus::Stalled);

    // A fresh heartbeat brings it back.
    p.appender
        .append(
            AppendRequest::new(stream.clone(), Actor::system(), EventPayload::Heartbeat {})
                .at(later),
            None,
        )
        .await
        .unwrap();
    assert_eq!(monitor.tick(&p.tenant, later).await.unwrap(), 1);
    assert_eq!(p.job(&stream).await.status, JobStatus::Executing);
}

#[tokio::test]
async fn test_liveness_stalls_job_that_never_heartbeats() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;
    let policy = p.publish_contract(GateMode::Lenient, &["lobby"]).await;
    let stream = p.executing_job(&policy, &["lobby"]).await;

    // Silent from the moment execution started: the stall baseline is
    // the execution start, not a heartbeat that never came.
    let monitor = LivenessMonitor::new(p.appender.clone(), 90);
    let later = Utc::now() + chrono::Duration::seconds(200);
    assert_eq!(monitor.tick(&p.tenant, later).await.unwrap(), 1);
    assert_eq!(p.job(&stream).await.status, JobStatus::Stalled);
}

#[tokio::test]
async fn test_policy_pinning_survives_contract_edits() {
    let p = Pipeline::new().await;
    p.register_agent(&["mop"]).await;

    // v1: 10% platform fee.
    let v1 = p.publish_contract(GateMode::Lenient, &["lobby"]).await;
    let stream = p.executing_job(&v1, &["lobby"]).await;

    // v2 triples the fee after booking; the booked job must not see it.
    let v2 = p
        .appender
        .publish_contract(ContractDocument {
            contract_id: ContractId::from_uuid(uuid::Uuid::from_u128(1)),
            version: 2,
            gate_mode: GateMode::Lenient,
            required_zones: vec!["lobby".into()],
            pricing: PricingPolicy {
                base_amount_cents: 10_000,
                platform_fee_bps: 3000,
                sla_credit_cents: 500,
            },
            operator_account: "operator".into(),
            platform_account: "platform".into(),
            customer_account: "customer".into(),
        })
        .await
        .unwrap();
    assert_ne!(v1, v2);

    p.capture(&stream, "lobby").await;
    p.append_sys(stream.clone(), EventPayload::ExecutionCompleted {}).await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();
    p.settle(&stream, 10_000).await.unwrap();

    // An SLA credit must cite the pinned v1 hash, not the live v2.
    let err = p
        .appender
        .append(
            AppendRequest::new(
                stream.clone(),
                Actor::system(),
                EventPayload::SlaCreditIssued {
                    amount_cents: 500,
                    policy_hash: v2,
                    reason: "late arrival".into(),
                },
            ),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION");

    p.append_sys(
        stream.clone(),
        EventPayload::SlaCreditIssued {
            amount_cents: 500,
            policy_hash: v1,
            reason: "late arrival".into(),
        },
    )
    .await;
    p.dispatcher.drain_until_quiet(&p.tenant).await.unwrap();

    // Fee split used the pinned 10%, and the credit moved operator to
    // customer under the same policy.
    let ledger = p.ledger.lock().await;
    assert_eq!(ledger.balance("platform"), 1_000);
    assert_eq!(ledger.balance("operator"), 9_000 - 500);
    assert_eq!(ledger.balance("customer"), -10_000 + 500);
}
