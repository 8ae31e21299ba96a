//! Dispatch worker
//!
//! Matches a booked job to an available agent. Candidates come from the
//! tenant's agent streams: registered, not quarantined, carrying every
//! required capability, picked in deterministic id order. With no
//! candidate the job is cancelled rather than left dangling.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use fieldpay_job::AgentDirectory;
use fieldpay_store::{AppendRequest, Appender};
use fieldpay_types::{
    Actor, EventPayload, FieldpayError, JobStatus, OutboxMessage, OutboxPayload, Result, StreamKey,
    StreamType, Topic,
};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

pub struct DispatchWorker {
    appender: Arc<Appender>,
}

impl DispatchWorker {
    pub fn new(appender: Arc<Appender>) -> Self {
        Self { appender }
    }
}

#[async_trait]
impl OutboxWorker for DispatchWorker {
    fn topic(&self) -> Topic {
        Topic::Dispatch
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::DispatchRequested {
            job_id,
            window,
            required_capabilities,
            ..
        } = &message.payload
        else {
            return Err(unexpected_payload(self.topic(), message));
        };
        let tenant_id = &message.tenant_id;

        let job = self
            .appender
            .store()
            .job(tenant_id, job_id)
            .await?
            .ok_or_else(|| FieldpayError::not_found(format!("job {job_id}")))?;
        // Redelivery after the match was already recorded.
        if job.status != JobStatus::Booked {
            return Ok(());
        }

        let agent_events = self
            .appender
            .store()
            .read_streams_of_type(tenant_id, StreamType::Agent)
            .await?;
        let directory = AgentDirectory::from_events(&agent_events);
        let stream = StreamKey::job(tenant_id.clone(), job_id);

        // A window that already closed cannot be dispatched into.
        let candidate = if window.end_at <= Utc::now() {
            None
        } else {
            directory
                .available(required_capabilities)
                .first()
                .map(|a| a.agent_id.clone())
        };

        match candidate {
            Some(agent_id) => {
                info!(job_id = %job_id, agent_id = %agent_id, "job matched to agent");
                self.appender
                    .append(
                        AppendRequest::new(
                            stream,
                            Actor::system(),
                            EventPayload::DispatchConfirmed { agent_id },
                        ),
                        None,
                    )
                    .await?;
            }
            None => {
                info!(job_id = %job_id, "no agent available, cancelling job");
                self.appender
                    .append(
                        AppendRequest::new(
                            stream,
                            Actor::system(),
                            EventPayload::JobCancelled {
                                reason: "no available agent matches the required capabilities"
                                    .to_string(),
                            },
                        ),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
