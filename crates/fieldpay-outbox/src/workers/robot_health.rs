//! Robot health worker
//!
//! Reacts to reported incidents: a high-severity incident quarantines the
//! agent, taking it out of dispatch until an operator reinstates it.
//! Lower severities are recorded on the agent stream and nothing more.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use fieldpay_job::AgentDirectory;
use fieldpay_store::{AppendRequest, Appender};
use fieldpay_types::{
    Actor, EventPayload, IncidentSeverity, OutboxMessage, OutboxPayload, Result, StreamKey,
    StreamType, Topic,
};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

pub struct RobotHealthWorker {
    appender: Arc<Appender>,
}

impl RobotHealthWorker {
    pub fn new(appender: Arc<Appender>) -> Self {
        Self { appender }
    }
}

#[async_trait]
impl OutboxWorker for RobotHealthWorker {
    fn topic(&self) -> Topic {
        Topic::RobotHealth
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::RobotHealthIncident { agent_id, severity } = &message.payload else {
            return Err(unexpected_payload(self.topic(), message));
        };
        if *severity != IncidentSeverity::High {
            debug!(agent_id = %agent_id, ?severity, "incident below quarantine threshold");
            return Ok(());
        }
        let tenant_id = &message.tenant_id;

        let agent_events = self
            .appender
            .store()
            .read_streams_of_type(tenant_id, StreamType::Agent)
            .await?;
        let directory = AgentDirectory::from_events(&agent_events);
        if directory.get(agent_id).map(|a| a.quarantined).unwrap_or(false) {
            return Ok(());
        }

        warn!(agent_id = %agent_id, "quarantining agent after high-severity incident");
        self.appender
            .append(
                AppendRequest::new(
                    StreamKey::agent(tenant_id.clone(), agent_id),
                    Actor::system(),
                    EventPayload::AgentQuarantined {
                        agent_id: agent_id.clone(),
                        reason: "high-severity incident".to_string(),
                    },
                ),
                None,
            )
            .await?;
        Ok(())
    }
}
