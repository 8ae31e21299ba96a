//! The appender: validated, idempotent, optimistically-concurrent writes
//!
//! All writes funnel through [`Appender::append`]. One append is one
//! event: the draft is finalized against the stream head, its signature
//! is checked against the key ring, the domain machine validates and
//! folds it, and the store commits events + projection + outbox +
//! idempotency atomically. A concurrent writer loses the head race and
//! gets `CONFLICT`; re-reading and retrying is the caller's move.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use fieldpay_crypto::{hash_canonical, KeyId, KeyRing, PublicKey};
use fieldpay_eventlog::{finalize_event, verify_event_signature, Event, EventDraft, EventSigner};
use fieldpay_job::{apply, apply_control, AgentDirectory, ApplyContext, ContractRegistry, MonthCloseState};
use fieldpay_types::{
    Actor, ContractDocument, ContractId, EventKind, EventPayload, FieldpayError, Job, JobId,
    Result, StreamKey, StreamType,
};

use crate::{Commit, CommitOutcome, IdempotencyRecord, Store};

/// What the caller asserts about the stream head before appending
#[derive(Debug, Clone, Default, PartialEq)]
pub enum HeadExpectation {
    /// Append after whatever the current head is
    #[default]
    Any,
    /// The stream must be empty
    Genesis,
    /// The head must carry exactly this chain hash
    At(String),
}

/// One append request
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub stream: StreamKey,
    pub actor: Actor,
    pub payload: EventPayload,
    pub at: DateTime<Utc>,
    pub expected_head: HeadExpectation,
    /// When set, a retry with the same key and payload replays the cached
    /// response instead of appending twice.
    pub idempotency_key: Option<String>,
}

impl AppendRequest {
    pub fn new(stream: StreamKey, actor: Actor, payload: EventPayload) -> Self {
        Self {
            stream,
            actor,
            payload,
            at: Utc::now(),
            expected_head: HeadExpectation::Any,
            idempotency_key: None,
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn expecting(mut self, expected: HeadExpectation) -> Self {
        self.expected_head = expected;
        self
    }

    pub fn idempotent(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// The committed outcome of an append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub event: Event,
    pub job: Option<Job>,
}

/// Write-side entry point over a [`Store`]
pub struct Appender {
    store: Arc<dyn Store>,
    contracts: Arc<RwLock<ContractRegistry>>,
    ring: Arc<RwLock<KeyRing>>,
}

impl Appender {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            contracts: Arc::new(RwLock::new(ContractRegistry::new())),
            ring: Arc::new(RwLock::new(KeyRing::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Publish a contract version; returns its policy hash
    pub async fn publish_contract(&self, doc: ContractDocument) -> Result<String> {
        self.contracts.write().await.publish(doc)
    }

    /// The latest policy hash published for a contract
    pub async fn latest_policy_hash(&self, contract_id: &ContractId) -> Result<String> {
        Ok(self
            .contracts
            .read()
            .await
            .latest_policy_hash(contract_id)?
            .to_string())
    }

    /// The contract version pinned under a policy hash
    pub async fn contract_by_policy_hash(&self, policy_hash: &str) -> Result<ContractDocument> {
        Ok(self
            .contracts
            .read()
            .await
            .by_policy_hash(policy_hash)?
            .clone())
    }

    /// Register a signer public key
    pub async fn register_key(&self, key_id: KeyId, public_key: PublicKey) {
        self.ring.write().await.register(key_id, public_key);
    }

    /// Append one event to a stream.
    ///
    /// Non-system actors must pass a `signer` whose key is registered.
    #[instrument(skip(self, request, signer), fields(stream = %request.stream, kind = ?request.payload.kind()))]
    pub async fn append(
        &self,
        request: AppendRequest,
        signer: Option<&EventSigner>,
    ) -> Result<AppendResponse> {
        let tenant_id = request.stream.tenant_id.clone();

        let idempotency_key = request.idempotency_key.clone();
        let fingerprint = request_fingerprint(&request)?;
        if let Some(key) = &idempotency_key {
            if let Some(record) = self.store.idempotency(&tenant_id, key).await? {
                if record.request_fingerprint != fingerprint {
                    return Err(FieldpayError::IdempotencyConflict { key: key.clone() });
                }
                debug!(key = %key, "idempotent replay, returning cached response");
                return Ok(serde_json::from_value(record.response)?);
            }
        }

        let head = self.store.head(&request.stream).await?;
        match &request.expected_head {
            HeadExpectation::Any => {}
            HeadExpectation::Genesis if head.is_none() => {}
            HeadExpectation::At(h) if head.as_deref() == Some(h.as_str()) => {}
            expected => {
                return Err(FieldpayError::Conflict {
                    expected: match expected {
                        HeadExpectation::At(h) => Some(h.clone()),
                        _ => None,
                    },
                    actual: head,
                });
            }
        }

        let draft = EventDraft::new(
            request.stream.stream_id.clone(),
            request.actor,
            request.payload,
            request.at,
        );
        let event = finalize_event(draft, head.clone(), signer)?;
        {
            let ring = self.ring.read().await;
            verify_event_signature(&event, &ring)?;
        }

        let (job, outbox) = match request.stream.stream_type {
            StreamType::Job => {
                let applied = self.apply_job_event(&request.stream, &event).await?;
                let mut job = applied.job;
                job.tenant_id = tenant_id.clone();
                (Some(job), applied.outbox)
            }
            _ => {
                let months = self.month_close_state(&request.stream).await?;
                // Closing a month is conditioned on the period's jobs;
                // other control events never consult them.
                let jobs = match event.kind() {
                    EventKind::MonthClosed => self.store.jobs(&tenant_id).await?,
                    _ => vec![],
                };
                let outbox = apply_control(&months, &jobs, &event)?;
                (None, outbox)
            }
        };

        let response = AppendResponse {
            event: event.clone(),
            job: job.clone(),
        };
        let idempotency = match idempotency_key {
            Some(key) => Some(IdempotencyRecord {
                tenant_id: tenant_id.clone(),
                key,
                request_fingerprint: fingerprint,
                response: serde_json::to_value(&response)?,
            }),
            None => None,
        };

        let outcome = self
            .store
            .commit(Commit {
                stream: request.stream,
                expected_prev_chain_hash: head,
                events: vec![event],
                job,
                outbox,
                idempotency,
            })
            .await?;

        match outcome {
            CommitOutcome::Applied(_) => Ok(response),
            // A racing retry under the same key won the commit; its
            // cached response is the one to return.
            CommitOutcome::AlreadyApplied(record) => Ok(serde_json::from_value(record.response)?),
        }
    }

    async fn apply_job_event(
        &self,
        stream: &StreamKey,
        event: &Event,
    ) -> Result<fieldpay_job::Applied> {
        let job_id = JobId::parse(&stream.stream_id)
            .map_err(|_| FieldpayError::validation("job stream id must be a job id"))?;
        let job = self.store.job(&stream.tenant_id, &job_id).await?;

        let months = self.month_close_state(stream).await?;
        let agent_events = self
            .store
            .read_streams_of_type(&stream.tenant_id, StreamType::Agent)
            .await?;
        let agents = AgentDirectory::from_events(&agent_events);

        let contracts = self.contracts.read().await;
        let ctx = ApplyContext {
            contracts: &contracts,
            months: &months,
            agents: &agents,
        };
        apply(job.as_ref(), event, &ctx)
    }

    async fn month_close_state(&self, stream: &StreamKey) -> Result<MonthCloseState> {
        let key = StreamKey::month_close(stream.tenant_id.clone());
        let events = self.store.read_stream(&key).await?;
        Ok(MonthCloseState::from_events(&events))
    }
}

/// Fingerprint binding an idempotency key to its request content
fn request_fingerprint(request: &AppendRequest) -> Result<String> {
    let view = json!({
        "stream": request.stream,
        "actor": request.actor,
        "payload": request.payload,
    });
    hash_canonical(&view).map_err(|e| FieldpayError::Serialization {
        message: e.to_string(),
    })
}
