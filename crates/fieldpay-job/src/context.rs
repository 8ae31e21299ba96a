//! Apply-time context: pinned contracts, month-close state, agent directory
//!
//! These are projections of the governance, month-close and agent streams
//! that the job machine consults when validating an event. They are folded
//! from events, never mutated directly.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use fieldpay_crypto::hash_canonical;
use fieldpay_types::{
    AgentId, ContractDocument, ContractId, EventPayload, FieldpayError, IncidentSeverity, Month,
    Result,
};

use fieldpay_eventlog::Event;

/// Immutable, content-hashed contract versions.
///
/// A job pins the policy hash of the version it was booked under; editing
/// a contract publishes a new version under a new hash and never touches
/// booked jobs.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    by_policy_hash: HashMap<String, ContractDocument>,
    latest: HashMap<ContractId, String>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a contract version, returning its content hash
    pub fn publish(&mut self, doc: ContractDocument) -> Result<String> {
        let policy_hash = hash_canonical(&doc).map_err(|e| FieldpayError::Serialization {
            message: e.to_string(),
        })?;
        self.latest.insert(doc.contract_id.clone(), policy_hash.clone());
        self.by_policy_hash.insert(policy_hash.clone(), doc);
        Ok(policy_hash)
    }

    /// The contract version pinned under a policy hash
    pub fn by_policy_hash(&self, policy_hash: &str) -> Result<&ContractDocument> {
        self.by_policy_hash
            .get(policy_hash)
            .ok_or_else(|| FieldpayError::not_found(format!("contract policy {policy_hash}")))
    }

    /// The policy hash of the most recently published version
    pub fn latest_policy_hash(&self, contract_id: &ContractId) -> Result<&str> {
        self.latest
            .get(contract_id)
            .map(|s| s.as_str())
            .ok_or_else(|| FieldpayError::not_found(format!("contract {contract_id}")))
    }
}

/// Which calendar months are closed, folded from the month-close stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonthCloseState {
    closed: HashSet<Month>,
}

impl MonthCloseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self, month: Month) -> bool {
        self.closed.contains(&month)
    }

    /// Fold one month-close stream event into the state
    pub fn fold(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::MonthClosed { month } => {
                self.closed.insert(*month);
            }
            EventPayload::MonthReopened { month, .. } => {
                self.closed.remove(month);
            }
            _ => {}
        }
    }

    pub fn from_events(events: &[Event]) -> Self {
        let mut state = Self::new();
        for event in events {
            state.fold(event);
        }
        state
    }
}

/// An agent as known to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    pub quarantined: bool,
    pub high_severity_incidents: u32,
}

/// Directory of registered agents, folded from agent streams.
///
/// Quarantined agents are never matched to new jobs until reinstated.
#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    agents: HashMap<AgentId, AgentRecord>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(agent_id)
    }

    /// Agents that are not quarantined and carry every required capability
    pub fn available(&self, required_capabilities: &[String]) -> Vec<&AgentRecord> {
        let mut out: Vec<&AgentRecord> = self
            .agents
            .values()
            .filter(|a| !a.quarantined)
            .filter(|a| {
                required_capabilities
                    .iter()
                    .all(|c| a.capabilities.contains(c))
            })
            .collect();
        // Deterministic pick order for reproducible dispatch decisions.
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Fold one agent-stream event into the directory
    pub fn fold(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::AgentRegistered {
                agent_id,
                capabilities,
            } => {
                self.agents.insert(
                    agent_id.clone(),
                    AgentRecord {
                        agent_id: agent_id.clone(),
                        capabilities: capabilities.clone(),
                        quarantined: false,
                        high_severity_incidents: 0,
                    },
                );
            }
            EventPayload::AgentQuarantined { agent_id, .. } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.quarantined = true;
                }
            }
            EventPayload::AgentReinstated { agent_id } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.quarantined = false;
                }
            }
            EventPayload::IncidentReported {
                agent_id, severity, ..
            } => {
                if *severity == IncidentSeverity::High {
                    if let Some(agent) = self.agents.get_mut(agent_id) {
                        agent.high_severity_incidents += 1;
                    }
                }
            }
            _ => {}
        }
    }

    pub fn from_events(events: &[Event]) -> Self {
        let mut dir = Self::new();
        for event in events {
            dir.fold(event);
        }
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldpay_types::{GateMode, PricingPolicy};

    fn doc(version: u32) -> ContractDocument {
        ContractDocument {
            contract_id: ContractId::from_uuid(uuid_fixed()),
            version,
            gate_mode: GateMode::Strict,
            required_zones: vec!["lobby".into()],
            pricing: PricingPolicy {
                base_amount_cents: 10_000,
                platform_fee_bps: 1000,
                sla_credit_cents: 500,
            },
            operator_account: "operator".into(),
            platform_account: "platform".into(),
            customer_account: "customer".into(),
        }
    }

    fn uuid_fixed() -> uuid::Uuid {
        uuid::Uuid::from_u128(42)
    }

    #[test]
    fn test_publishing_new_version_keeps_old_hash_resolvable() {
        let mut registry = ContractRegistry::new();
        let v1_hash = registry.publish(doc(1)).unwrap();
        let v2_hash = registry.publish(doc(2)).unwrap();

        assert_ne!(v1_hash, v2_hash);
        assert_eq!(registry.by_policy_hash(&v1_hash).unwrap().version, 1);
        assert_eq!(
            registry
                .latest_policy_hash(&doc(1).contract_id)
                .unwrap(),
            v2_hash
        );
    }
}
