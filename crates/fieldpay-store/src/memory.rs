//! In-memory store backend
//!
//! A single mutex serializes commits, which makes the head
//! compare-and-append trivially atomic. Used by tests and single-process
//! deployments; the contract is identical to the SQLite backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fieldpay_eventlog::Event;
use fieldpay_types::{
    FieldpayError, Job, JobId, Month, OutboxMessage, Result, Statement, StreamKey, StreamType,
    TenantId, Topic,
};

use crate::{Commit, CommitOutcome, Committed, IdempotencyRecord, Store};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: OutboxMessage,
    claimed_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<Event>>,
    jobs: HashMap<(TenantId, JobId), Job>,
    outbox: Vec<StoredMessage>,
    next_cursor: u64,
    idempotency: HashMap<(TenantId, String), IdempotencyRecord>,
    statements: HashMap<(TenantId, String, Month), Statement>,
}

/// In-memory [`Store`] implementation
pub struct MemoryStore {
    inner: Mutex<Inner>,
    lease_secs: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lease(30)
    }

    /// A store whose outbox claims expire after `lease_secs`. Tests use
    /// a zero lease to simulate a crashed claimant being re-delivered.
    pub fn with_lease(lease_secs: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_cursor: 1,
                ..Inner::default()
            }),
            lease_secs,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn commit(&self, commit: Commit) -> Result<CommitOutcome> {
        let mut inner = self.inner.lock().await;

        // A racing retry that already committed under this key must not
        // append a second copy, even when it carries a fresh head.
        if let Some(record) = &commit.idempotency {
            let key = (record.tenant_id.clone(), record.key.clone());
            if let Some(existing) = inner.idempotency.get(&key) {
                if existing.request_fingerprint != record.request_fingerprint {
                    return Err(FieldpayError::IdempotencyConflict {
                        key: record.key.clone(),
                    });
                }
                debug!(key = %record.key, "idempotency key already applied, skipping commit");
                return Ok(CommitOutcome::AlreadyApplied(existing.clone()));
            }
        }

        let stream = inner.streams.entry(commit.stream.clone()).or_default();
        let head = stream.last().map(|e| e.chain_hash.clone());
        if head != commit.expected_prev_chain_hash {
            return Err(FieldpayError::Conflict {
                expected: commit.expected_prev_chain_hash,
                actual: head,
            });
        }

        let stream = inner.streams.entry(commit.stream.clone()).or_default();
        stream.extend(commit.events.iter().cloned());

        if let Some(job) = &commit.job {
            inner
                .jobs
                .insert((commit.stream.tenant_id.clone(), job.id.clone()), job.clone());
        }

        let mut cursors = vec![];
        let now = Utc::now();
        for payload in &commit.outbox {
            let cursor = inner.next_cursor;
            inner.next_cursor += 1;
            inner.outbox.push(StoredMessage {
                message: OutboxMessage {
                    cursor,
                    tenant_id: commit.stream.tenant_id.clone(),
                    payload: payload.clone(),
                    created_at: now,
                    processed_at: None,
                    attempts: 0,
                    dead_lettered: false,
                },
                claimed_until: None,
            });
            cursors.push(cursor);
        }

        if let Some(record) = commit.idempotency.clone() {
            inner
                .idempotency
                .insert((record.tenant_id.clone(), record.key.clone()), record);
        }

        Ok(CommitOutcome::Applied(Committed {
            events: commit.events,
            job: commit.job,
            outbox_cursors: cursors,
        }))
    }

    async fn read_stream(&self, key: &StreamKey) -> Result<Vec<Event>> {
        let inner = self.inner.lock().await;
        Ok(inner.streams.get(key).cloned().unwrap_or_default())
    }

    async fn read_streams_of_type(
        &self,
        tenant_id: &TenantId,
        stream_type: StreamType,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.lock().await;
        let mut out = vec![];
        for (key, events) in &inner.streams {
            if &key.tenant_id == tenant_id && key.stream_type == stream_type {
                out.extend(events.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn head(&self, key: &StreamKey) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(key)
            .and_then(|s| s.last())
            .map(|e| e.chain_hash.clone()))
    }

    async fn job(&self, tenant_id: &TenantId, job_id: &JobId) -> Result<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .get(&(tenant_id.clone(), job_id.clone()))
            .cloned())
    }

    async fn jobs(&self, tenant_id: &TenantId) -> Result<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn idempotency(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .idempotency
            .get(&(tenant_id.clone(), key.to_string()))
            .cloned())
    }

    async fn claim_batch(
        &self,
        tenant_id: &TenantId,
        topic: Topic,
        max: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let lease_until = now + Duration::seconds(self.lease_secs);

        let mut claimed = vec![];
        for stored in inner.outbox.iter_mut() {
            if claimed.len() >= max {
                break;
            }
            let m = &stored.message;
            if &m.tenant_id != tenant_id
                || m.topic() != topic
                || m.processed_at.is_some()
                || m.dead_lettered
            {
                continue;
            }
            if let Some(until) = stored.claimed_until {
                if until > now {
                    continue;
                }
            }
            stored.claimed_until = Some(lease_until);
            claimed.push(stored.message.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, tenant_id: &TenantId, cursor: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .outbox
            .iter_mut()
            .find(|s| s.message.cursor == cursor && &s.message.tenant_id == tenant_id)
            .ok_or_else(|| FieldpayError::not_found(format!("outbox cursor {cursor}")))?;
        stored.message.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn record_failure(
        &self,
        tenant_id: &TenantId,
        cursor: u64,
        max_attempts: u32,
    ) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .outbox
            .iter_mut()
            .find(|s| s.message.cursor == cursor && &s.message.tenant_id == tenant_id)
            .ok_or_else(|| FieldpayError::not_found(format!("outbox cursor {cursor}")))?;
        stored.message.attempts += 1;
        stored.claimed_until = None;
        if stored.message.attempts >= max_attempts {
            stored.message.dead_lettered = true;
            warn!(
                cursor,
                topic = %stored.message.topic(),
                attempts = stored.message.attempts,
                "outbox message dead-lettered"
            );
        }
        Ok(stored.message.attempts)
    }

    async fn dead_letters(&self, tenant_id: &TenantId) -> Result<Vec<OutboxMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|s| &s.message.tenant_id == tenant_id && s.message.dead_lettered)
            .map(|s| s.message.clone())
            .collect())
    }

    async fn put_statement(&self, statement: Statement) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (
            statement.tenant_id.clone(),
            statement.party.clone(),
            statement.period,
        );
        if let Some(existing) = inner.statements.get(&key) {
            if existing.content_hash == statement.content_hash {
                return Ok(false);
            }
        }
        inner.statements.insert(key, statement);
        Ok(true)
    }

    async fn statements(&self, tenant_id: &TenantId) -> Result<Vec<Statement>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Statement> = inner
            .statements
            .values()
            .filter(|s| &s.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.period, a.party.clone()).cmp(&(b.period, b.party.clone())));
        Ok(out)
    }
}
