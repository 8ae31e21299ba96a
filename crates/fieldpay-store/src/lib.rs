//! Fieldpay Store - the transactional event store
//!
//! One commit is one atomic unit: the stream head is compared against the
//! caller's expectation, events are appended, the job projection is
//! updated, outbox messages are enqueued and the idempotency record is
//! cached. All of it happens or none of it does, across both backends:
//!
//! - [`MemoryStore`] - in-memory, for tests and single-process use
//! - [`SqliteStore`] - durable, sqlx/SQLite backed
//!
//! Both satisfy the same [`Store`] contract bit-for-bit, including
//! atomicity across restart: a process killed mid-commit leaves either
//! the pre- or post-commit state, never a partial one.

pub mod appender;
pub mod config;
pub mod memory;
pub mod sqlite;

pub use appender::{AppendRequest, AppendResponse, Appender, HeadExpectation};
pub use config::StoreConfig;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fieldpay_eventlog::Event;
use fieldpay_types::{
    Job, JobId, OutboxMessage, OutboxPayload, Result, Statement, StreamKey, TenantId, Topic,
};

/// A cached idempotent response: `(tenant, key)` maps to the fingerprint
/// of the request that produced it and the response it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub key: String,
    pub request_fingerprint: String,
    pub response: serde_json::Value,
}

/// One atomic commit against a stream
#[derive(Debug, Clone)]
pub struct Commit {
    pub stream: StreamKey,
    /// Chain hash of the expected current head (`None` for genesis)
    pub expected_prev_chain_hash: Option<String>,
    /// Events already finalized against `expected_prev_chain_hash`
    pub events: Vec<Event>,
    /// Updated job projection, for job streams
    pub job: Option<Job>,
    /// Side-effect messages enqueued with the commit
    pub outbox: Vec<OutboxPayload>,
    /// Idempotency record written with the commit
    pub idempotency: Option<IdempotencyRecord>,
}

/// What a successful commit durably wrote
#[derive(Debug, Clone)]
pub struct Committed {
    pub events: Vec<Event>,
    pub job: Option<Job>,
    /// Cursors assigned to the enqueued outbox messages
    pub outbox_cursors: Vec<u64>,
}

/// Outcome of a commit attempt
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The commit was applied
    Applied(Committed),
    /// A prior commit under the same idempotency key and fingerprint
    /// already applied this request; nothing was written. Carries the
    /// record cached by that commit.
    AlreadyApplied(IdempotencyRecord),
}

/// The transactional store contract.
///
/// Tenancy is part of every key; implementations must never let a read or
/// write cross tenants.
#[async_trait]
pub trait Store: Send + Sync {
    /// Commit events, projection, outbox and idempotency atomically.
    ///
    /// Fails with `CONFLICT` when the stream head no longer matches
    /// `expected_prev_chain_hash`; nothing is written in that case.
    ///
    /// The idempotency record is checked inside the same transaction: a
    /// record already present for `(tenant, key)` with a matching
    /// fingerprint short-circuits to [`CommitOutcome::AlreadyApplied`]
    /// without appending, so two racing retries under one key can never
    /// both commit. A mismatched fingerprint is `IDEMPOTENCY_CONFLICT`.
    async fn commit(&self, commit: Commit) -> Result<CommitOutcome>;

    /// All events of one stream, in order
    async fn read_stream(&self, key: &StreamKey) -> Result<Vec<Event>>;

    /// All events of every stream of one type for a tenant
    async fn read_streams_of_type(
        &self,
        tenant_id: &TenantId,
        stream_type: fieldpay_types::StreamType,
    ) -> Result<Vec<Event>>;

    /// Chain hash of the stream head, `None` for an empty stream
    async fn head(&self, key: &StreamKey) -> Result<Option<String>>;

    /// The job projection, if the job exists for this tenant
    async fn job(&self, tenant_id: &TenantId, job_id: &JobId) -> Result<Option<Job>>;

    /// All job projections for a tenant
    async fn jobs(&self, tenant_id: &TenantId) -> Result<Vec<Job>>;

    /// Look up a cached idempotent response
    async fn idempotency(&self, tenant_id: &TenantId, key: &str)
        -> Result<Option<IdempotencyRecord>>;

    /// Claim up to `max` unprocessed messages of one topic, in commit
    /// order, leasing them for the configured interval. At-least-once:
    /// a crashed claimant's lease expires and the messages are
    /// re-claimable.
    async fn claim_batch(
        &self,
        tenant_id: &TenantId,
        topic: Topic,
        max: usize,
    ) -> Result<Vec<OutboxMessage>>;

    /// Advance the cursor: only called after the message's effect is
    /// durably applied.
    async fn mark_processed(&self, tenant_id: &TenantId, cursor: u64) -> Result<()>;

    /// Record a failed processing attempt; dead-letters the message once
    /// `max_attempts` is reached. Returns the attempt count.
    async fn record_failure(
        &self,
        tenant_id: &TenantId,
        cursor: u64,
        max_attempts: u32,
    ) -> Result<u32>;

    /// Messages that exhausted their retries
    async fn dead_letters(&self, tenant_id: &TenantId) -> Result<Vec<OutboxMessage>>;

    /// Write a per-period statement, keyed on `(tenant, party, period)`.
    /// An existing row with the same `content_hash` is left untouched and
    /// reported as `false` (idempotent re-apply); different totals replace
    /// the row, as after a reopen-window settlement.
    async fn put_statement(&self, statement: Statement) -> Result<bool>;

    /// All statements for a tenant
    async fn statements(&self, tenant_id: &TenantId) -> Result<Vec<Statement>>;
}
