//! SQLite store backend
//!
//! One commit is one SQLite transaction. The head check is re-enforced by
//! a UNIQUE constraint on `(tenant_id, stream_type, stream_id, seq)`: a
//! concurrent writer that slips past the read loses the insert race and
//! surfaces as `CONFLICT`, never as a forked stream.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use fieldpay_eventlog::Event;
use fieldpay_types::{
    FieldpayError, Job, JobId, OutboxMessage, OutboxPayload, Result, Statement, StreamKey,
    StreamType, TenantId, Topic,
};

use crate::config::StoreConfig;
use crate::{Commit, CommitOutcome, Committed, IdempotencyRecord, Store};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        tenant_id TEXT NOT NULL,
        stream_type TEXT NOT NULL,
        stream_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        chain_hash TEXT NOT NULL,
        event_json TEXT NOT NULL,
        UNIQUE (tenant_id, stream_type, stream_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        tenant_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        job_json TEXT NOT NULL,
        PRIMARY KEY (tenant_id, job_id)
    )",
    "CREATE TABLE IF NOT EXISTS outbox (
        cursor INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        processed_at TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        dead_lettered INTEGER NOT NULL DEFAULT 0,
        claimed_until TEXT
    )",
    "CREATE TABLE IF NOT EXISTS idempotency (
        tenant_id TEXT NOT NULL,
        key TEXT NOT NULL,
        request_fingerprint TEXT NOT NULL,
        response_json TEXT NOT NULL,
        PRIMARY KEY (tenant_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS statements (
        tenant_id TEXT NOT NULL,
        party TEXT NOT NULL,
        period TEXT NOT NULL,
        statement_json TEXT NOT NULL,
        PRIMARY KEY (tenant_id, party, period)
    )",
];

fn storage_err(e: sqlx::Error) -> FieldpayError {
    FieldpayError::storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FieldpayError::storage(format!("bad timestamp {s}: {e}")))
}

/// Durable [`Store`] implementation on SQLite via sqlx
pub struct SqliteStore {
    pool: SqlitePool,
    lease_secs: i64,
}

impl SqliteStore {
    /// Connect and bootstrap the schema
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(storage_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await.map_err(storage_err)?;
        }
        info!(url = %config.database_url_masked(), "sqlite store ready");

        Ok(Self {
            pool,
            lease_secs: config.outbox_lease_secs,
        })
    }

    async fn head_row(&self, key: &StreamKey) -> Result<Option<(i64, String)>> {
        let row = sqlx::query(
            "SELECT seq, chain_hash FROM events
             WHERE tenant_id = ? AND stream_type = ? AND stream_id = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(key.tenant_id.to_string())
        .bind(key.stream_type.to_string())
        .bind(&key.stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row.map(|r| (r.get::<i64, _>("seq"), r.get::<String, _>("chain_hash"))))
    }

    fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxMessage> {
        let payload: OutboxPayload = serde_json::from_str(&row.get::<String, _>("payload_json"))?;
        let processed_at = match row.get::<Option<String>, _>("processed_at") {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        };
        Ok(OutboxMessage {
            cursor: row.get::<i64, _>("cursor") as u64,
            tenant_id: TenantId::parse(&row.get::<String, _>("tenant_id"))
                .map_err(|e| FieldpayError::storage(e.to_string()))?,
            payload,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            processed_at,
            attempts: row.get::<i64, _>("attempts") as u32,
            dead_lettered: row.get::<i64, _>("dead_lettered") != 0,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn commit(&self, commit: Commit) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // A racing retry that already committed under this key must not
        // append a second copy, even when it carries a fresh head.
        if let Some(record) = &commit.idempotency {
            let existing = sqlx::query(
                "SELECT request_fingerprint, response_json FROM idempotency
                 WHERE tenant_id = ? AND key = ?",
            )
            .bind(record.tenant_id.to_string())
            .bind(&record.key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?;
            if let Some(row) = existing {
                if row.get::<String, _>("request_fingerprint") != record.request_fingerprint {
                    return Err(FieldpayError::IdempotencyConflict {
                        key: record.key.clone(),
                    });
                }
                debug!(key = %record.key, "idempotency key already applied, skipping commit");
                return Ok(CommitOutcome::AlreadyApplied(IdempotencyRecord {
                    tenant_id: record.tenant_id.clone(),
                    key: record.key.clone(),
                    request_fingerprint: record.request_fingerprint.clone(),
                    response: serde_json::from_str(&row.get::<String, _>("response_json"))?,
                }));
            }
        }

        let head = sqlx::query(
            "SELECT seq, chain_hash FROM events
             WHERE tenant_id = ? AND stream_type = ? AND stream_id = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(commit.stream.tenant_id.to_string())
        .bind(commit.stream.stream_type.to_string())
        .bind(&commit.stream.stream_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .map(|r| (r.get::<i64, _>("seq"), r.get::<String, _>("chain_hash")));

        let head_hash = head.as_ref().map(|(_, h)| h.clone());
        if head_hash != commit.expected_prev_chain_hash {
            return Err(FieldpayError::Conflict {
                expected: commit.expected_prev_chain_hash,
                actual: head_hash,
            });
        }
        let mut next_seq = head.map(|(seq, _)| seq + 1).unwrap_or(0);

        for event in &commit.events {
            let res = sqlx::query(
                "INSERT INTO events (tenant_id, stream_type, stream_id, seq, chain_hash, event_json)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(commit.stream.tenant_id.to_string())
            .bind(commit.stream.stream_type.to_string())
            .bind(&commit.stream.stream_id)
            .bind(next_seq)
            .bind(&event.chain_hash)
            .bind(serde_json::to_string(event)?)
            .execute(&mut *tx)
            .await;
            match res {
                Ok(_) => next_seq += 1,
                // Lost the insert race to a concurrent writer.
                Err(e) if is_unique_violation(&e) => {
                    drop(tx);
                    let actual = self.head_row(&commit.stream).await?.map(|(_, h)| h);
                    warn!(stream = %commit.stream, "concurrent append detected");
                    return Err(FieldpayError::Conflict {
                        expected: commit.expected_prev_chain_hash,
                        actual,
                    });
                }
                Err(e) => return Err(storage_err(e)),
            }
        }

        if let Some(job) = &commit.job {
            sqlx::query(
                "INSERT INTO jobs (tenant_id, job_id, job_json) VALUES (?, ?, ?)
                 ON CONFLICT (tenant_id, job_id) DO UPDATE SET job_json = excluded.job_json",
            )
            .bind(commit.stream.tenant_id.to_string())
            .bind(job.id.to_string())
            .bind(serde_json::to_string(job)?)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        let now = fmt_ts(Utc::now());
        let mut cursors = vec![];
        for payload in &commit.outbox {
            let res = sqlx::query(
                "INSERT INTO outbox (tenant_id, topic, payload_json, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(commit.stream.tenant_id.to_string())
            .bind(payload.topic().as_str())
            .bind(serde_json::to_string(payload)?)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
            cursors.push(res.last_insert_rowid() as u64);
        }

        if let Some(record) = &commit.idempotency {
            let res = sqlx::query(
                "INSERT INTO idempotency (tenant_id, key, request_fingerprint, response_json)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(record.tenant_id.to_string())
            .bind(&record.key)
            .bind(&record.request_fingerprint)
            .bind(serde_json::to_string(&record.response)?)
            .execute(&mut *tx)
            .await;
            if let Err(e) = res {
                // Lost the insert race to a concurrent retry under the
                // same key: roll back and surface the winner's record.
                if is_unique_violation(&e) {
                    drop(tx);
                    let winner = self
                        .idempotency(&record.tenant_id, &record.key)
                        .await?
                        .ok_or_else(|| {
                            FieldpayError::storage("idempotency record vanished after conflict")
                        })?;
                    if winner.request_fingerprint != record.request_fingerprint {
                        return Err(FieldpayError::IdempotencyConflict {
                            key: record.key.clone(),
                        });
                    }
                    warn!(key = %record.key, "concurrent idempotent commit detected");
                    return Ok(CommitOutcome::AlreadyApplied(winner));
                }
                return Err(storage_err(e));
            }
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(CommitOutcome::Applied(Committed {
            events: commit.events,
            job: commit.job,
            outbox_cursors: cursors,
        }))
    }

    async fn read_stream(&self, key: &StreamKey) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT event_json FROM events
             WHERE tenant_id = ? AND stream_type = ? AND stream_id = ?
             ORDER BY seq ASC",
        )
        .bind(key.tenant_id.to_string())
        .bind(key.stream_type.to_string())
        .bind(&key.stream_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("event_json"))?))
            .collect()
    }

    async fn read_streams_of_type(
        &self,
        tenant_id: &TenantId,
        stream_type: StreamType,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT event_json FROM events
             WHERE tenant_id = ? AND stream_type = ?
             ORDER BY stream_id ASC, seq ASC",
        )
        .bind(tenant_id.to_string())
        .bind(stream_type.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("event_json"))?))
            .collect()
    }

    async fn head(&self, key: &StreamKey) -> Result<Option<String>> {
        Ok(self.head_row(key).await?.map(|(_, h)| h))
    }

    async fn job(&self, tenant_id: &TenantId, job_id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT job_json FROM jobs WHERE tenant_id = ? AND job_id = ?")
            .bind(tenant_id.to_string())
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        match row {
            Some(r) => Ok(Some(serde_json::from_str(&r.get::<String, _>("job_json"))?)),
            None => Ok(None),
        }
    }

    async fn jobs(&self, tenant_id: &TenantId) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT job_json FROM jobs WHERE tenant_id = ? ORDER BY job_id")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("job_json"))?))
            .collect()
    }

    async fn idempotency(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            "SELECT request_fingerprint, response_json FROM idempotency
             WHERE tenant_id = ? AND key = ?",
        )
        .bind(tenant_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        match row {
            Some(r) => Ok(Some(IdempotencyRecord {
                tenant_id: tenant_id.clone(),
                key: key.to_string(),
                request_fingerprint: r.get::<String, _>("request_fingerprint"),
                response: serde_json::from_str(&r.get::<String, _>("response_json"))?,
            })),
            None => Ok(None),
        }
    }

    async fn claim_batch(
        &self,
        tenant_id: &TenantId,
        topic: Topic,
        max: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let now = Utc::now();
        let now_s = fmt_ts(now);
        let lease_s = fmt_ts(now + chrono::Duration::seconds(self.lease_secs));

        let rows = sqlx::query(
            "SELECT cursor, tenant_id, payload_json, created_at, processed_at, attempts, dead_lettered
             FROM outbox
             WHERE tenant_id = ? AND topic = ? AND processed_at IS NULL AND dead_lettered = 0
               AND (claimed_until IS NULL OR claimed_until <= ?)
             ORDER BY cursor ASC LIMIT ?",
        )
        .bind(tenant_id.to_string())
        .bind(topic.as_str())
        .bind(&now_s)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;

        let mut claimed = vec![];
        for row in &rows {
            let message = Self::message_from_row(row)?;
            sqlx::query("UPDATE outbox SET claimed_until = ? WHERE cursor = ?")
                .bind(&lease_s)
                .bind(message.cursor as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            claimed.push(message);
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(claimed)
    }

    async fn mark_processed(&self, tenant_id: &TenantId, cursor: u64) -> Result<()> {
        let res = sqlx::query(
            "UPDATE outbox SET processed_at = ? WHERE tenant_id = ? AND cursor = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(tenant_id.to_string())
        .bind(cursor as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if res.rows_affected() == 0 {
            return Err(FieldpayError::not_found(format!("outbox cursor {cursor}")));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        tenant_id: &TenantId,
        cursor: u64,
        max_attempts: u32,
    ) -> Result<u32> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let row = sqlx::query(
            "SELECT attempts, topic FROM outbox WHERE tenant_id = ? AND cursor = ?",
        )
        .bind(tenant_id.to_string())
        .bind(cursor as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| FieldpayError::not_found(format!("outbox cursor {cursor}")))?;

        let attempts = row.get::<i64, _>("attempts") as u32 + 1;
        let dead = attempts >= max_attempts;
        sqlx::query(
            "UPDATE outbox SET attempts = ?, dead_lettered = ?, claimed_until = NULL
             WHERE tenant_id = ? AND cursor = ?",
        )
        .bind(attempts as i64)
        .bind(dead as i64)
        .bind(tenant_id.to_string())
        .bind(cursor as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        if dead {
            warn!(
                cursor,
                topic = %row.get::<String, _>("topic"),
                attempts,
                "outbox message dead-lettered"
            );
        }
        Ok(attempts)
    }

    async fn dead_letters(&self, tenant_id: &TenantId) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            "SELECT cursor, tenant_id, payload_json, created_at, processed_at, attempts, dead_lettered
             FROM outbox WHERE tenant_id = ? AND dead_lettered = 1 ORDER BY cursor ASC",
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn put_statement(&self, statement: Statement) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let existing = sqlx::query(
            "SELECT statement_json FROM statements
             WHERE tenant_id = ? AND party = ? AND period = ?",
        )
        .bind(statement.tenant_id.to_string())
        .bind(&statement.party)
        .bind(statement.period.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?;
        if let Some(row) = existing {
            let current: Statement = serde_json::from_str(&row.get::<String, _>("statement_json"))?;
            if current.content_hash == statement.content_hash {
                return Ok(false);
            }
        }
        sqlx::query(
            "INSERT INTO statements (tenant_id, party, period, statement_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (tenant_id, party, period)
             DO UPDATE SET statement_json = excluded.statement_json",
        )
        .bind(statement.tenant_id.to_string())
        .bind(&statement.party)
        .bind(statement.period.to_string())
        .bind(serde_json::to_string(&statement)?)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(true)
    }

    async fn statements(&self, tenant_id: &TenantId) -> Result<Vec<Statement>> {
        let rows = sqlx::query(
            "SELECT statement_json FROM statements WHERE tenant_id = ? ORDER BY period, party",
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("statement_json"))?))
            .collect()
    }
}
