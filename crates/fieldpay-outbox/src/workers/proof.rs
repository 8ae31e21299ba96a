//! Proof evaluation worker
//!
//! Evaluates a job's captured evidence against the required zones of the
//! contract version pinned at booking. A full cover passes; anything less
//! is INSUFFICIENT_EVIDENCE with the uncovered zones listed. The worker
//! also drives holds: an insufficient evaluation on a completed job opens
//! one, a passing evaluation releases the open one. Re-running an
//! evaluation over unchanged evidence reaches the same verdict.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use fieldpay_job::compute_facts_hash;
use fieldpay_store::{AppendRequest, Appender};
use fieldpay_types::{
    Actor, EventPayload, FieldpayError, HoldId, Job, JobStatus, OutboxMessage, OutboxPayload,
    ProofRef, ProofStatus, Result, StreamKey, Topic,
};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

pub struct ProofWorker {
    appender: Arc<Appender>,
}

impl ProofWorker {
    pub fn new(appender: Arc<Appender>) -> Self {
        Self { appender }
    }

    fn verdict(job: &Job, required_zones: &[String]) -> (ProofStatus, Vec<String>, Vec<String>) {
        let covered = job.covered_zones();
        let missing: Vec<String> = required_zones
            .iter()
            .filter(|z| !covered.contains(&z.as_str()))
            .map(|z| format!("zone:{z}"))
            .collect();

        if missing.is_empty() {
            (ProofStatus::Pass, vec![], vec![])
        } else {
            (
                ProofStatus::InsufficientEvidence,
                vec!["EVIDENCE_MISSING".to_string()],
                missing,
            )
        }
    }
}

#[async_trait]
impl OutboxWorker for ProofWorker {
    fn topic(&self) -> Topic {
        Topic::Proof
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::ProofEvaluate { job_id } = &message.payload else {
            return Err(unexpected_payload(self.topic(), message));
        };
        let tenant_id = &message.tenant_id;

        let job = self
            .appender
            .store()
            .job(tenant_id, job_id)
            .await?
            .ok_or_else(|| FieldpayError::not_found(format!("job {job_id}")))?;
        // Mid-execution evidence is evaluated once the job completes;
        // a later PROOF_EVALUATE message covers it.
        if !matches!(job.status, JobStatus::Completed | JobStatus::Held) {
            return Ok(());
        }

        let booking = job
            .booking
            .as_ref()
            .ok_or_else(|| FieldpayError::validation("proof evaluation requires a booking"))?;
        let contract = self
            .appender
            .contract_by_policy_hash(&booking.policy_hash)
            .await?;

        let (status, reason_codes, missing_evidence) = Self::verdict(&job, &contract.required_zones);
        let facts_hash = compute_facts_hash(&job.evidence)?;
        info!(job_id = %job_id, ?status, missing = missing_evidence.len(), "proof evaluated");

        let stream = StreamKey::job(tenant_id.clone(), job_id);
        let evaluated = self
            .appender
            .append(
                AppendRequest::new(
                    stream.clone(),
                    Actor::system(),
                    EventPayload::ProofEvaluated {
                        status,
                        facts_hash: facts_hash.clone(),
                        reason_codes,
                        missing_evidence: missing_evidence.clone(),
                    },
                ),
                None,
            )
            .await?;
        let job = evaluated.job.unwrap_or(job);

        match status {
            ProofStatus::InsufficientEvidence
                if job.status == JobStatus::Completed && job.open_hold().is_none() =>
            {
                let triggering_proof_ref = ProofRef {
                    facts_hash,
                    evaluation_chain_hash: evaluated.event.chain_hash.clone(),
                };
                self.appender
                    .append(
                        AppendRequest::new(
                            stream,
                            Actor::system(),
                            EventPayload::SettlementHoldCreated {
                                hold_id: HoldId::new(),
                                missing_evidence,
                                triggering_proof_ref,
                            },
                        ),
                        None,
                    )
                    .await?;
            }
            ProofStatus::Pass => {
                if let Some(hold) = job.open_hold() {
                    self.appender
                        .append(
                            AppendRequest::new(
                                stream,
                                Actor::system(),
                                EventPayload::SettlementHoldReleased {
                                    hold_id: hold.hold_id.clone(),
                                },
                            ),
                            None,
                        )
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
