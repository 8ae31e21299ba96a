//! Identity types for Fieldpay
//!
//! All identity types are strongly typed wrappers around UUIDs to prevent
//! accidental mixing of different ID types. Every entity is additionally
//! scoped by a [`TenantId`]; no lookup may cross tenants even when the
//! inner UUIDs collide.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

// Isolation root
define_id_type!(TenantId, "tenant", "Unique identifier for a tenant (isolation root)");

// Stream entity types
define_id_type!(JobId, "job", "Unique identifier for a job");
define_id_type!(RobotId, "robot", "Unique identifier for a physical robot");
define_id_type!(AgentId, "agent", "Unique identifier for an autonomous agent");

// Operational identity types
define_id_type!(EventId, "evt", "Unique identifier for a stream event");
define_id_type!(ContractId, "contract", "Unique identifier for a contract document");
define_id_type!(AccessPlanId, "plan", "Unique identifier for an access plan");
define_id_type!(HoldId, "hold", "Unique identifier for a settlement hold");
define_id_type!(AccountId, "acct", "Unique identifier for a ledger account");
define_id_type!(EntryId, "entry", "Unique identifier for a ledger entry");
define_id_type!(StatementId, "stmt", "Unique identifier for a period statement");

/// The kind of actor that produced an event.
///
/// System events are implicitly trusted (persisted under the server's own
/// key); all other actor kinds must carry a verifiable signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Robot,
    Operator,
    Agent,
}

impl ActorKind {
    /// Whether events from this actor kind must be signed
    pub fn requires_signature(&self) -> bool {
        !matches!(self, ActorKind::System)
    }
}

/// The actor that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: "server".to_string(),
        }
    }

    pub fn robot(id: &RobotId) -> Self {
        Self {
            kind: ActorKind::Robot,
            id: id.to_string(),
        }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Operator,
            id: id.into(),
        }
    }

    pub fn agent(id: &AgentId) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: id.to_string(),
        }
    }
}

/// The type of an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Job,
    Robot,
    Agent,
    Governance,
    MonthClose,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamType::Job => "job",
            StreamType::Robot => "robot",
            StreamType::Agent => "agent",
            StreamType::Governance => "governance",
            StreamType::MonthClose => "month_close",
        };
        write!(f, "{s}")
    }
}

/// Full identity of a stream: `(tenant, stream type, stream id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub tenant_id: TenantId,
    pub stream_type: StreamType,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(tenant_id: TenantId, stream_type: StreamType, stream_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            stream_type,
            stream_id: stream_id.into(),
        }
    }

    /// Stream key for a job stream
    pub fn job(tenant_id: TenantId, job_id: &JobId) -> Self {
        Self::new(tenant_id, StreamType::Job, job_id.to_string())
    }

    /// Stream key for an agent stream
    pub fn agent(tenant_id: TenantId, agent_id: &AgentId) -> Self {
        Self::new(tenant_id, StreamType::Agent, agent_id.to_string())
    }

    /// Stream key for the tenant's single month-close stream
    pub fn month_close(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, StreamType::MonthClose, "month_close")
    }

    /// Stream key for the tenant's single governance stream
    pub fn governance(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, StreamType::Governance, "governance")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.stream_type, self.stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_system_actor_is_trusted() {
        assert!(!Actor::system().kind.requires_signature());
        assert!(Actor::robot(&RobotId::new()).kind.requires_signature());
        assert!(Actor::operator("ops-1").kind.requires_signature());
    }

    #[test]
    fn test_stream_keys_are_tenant_scoped() {
        let job = JobId::new();
        let a = StreamKey::job(TenantId::new(), &job);
        let b = StreamKey::job(TenantId::new(), &job);
        // Same natural id, different tenants: distinct keys.
        assert_ne!(a, b);
    }
}
