//! The pull-based outbox dispatcher
//!
//! A drain pass claims a batch of one topic's messages in commit order
//! and hands each to the registered worker. A message's cursor advances
//! only after the worker returned success; a failure is recorded and the
//! message is redelivered until the attempt bound dead-letters it. All
//! workers apply their effects idempotently, so at-least-once delivery
//! converges.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use fieldpay_store::Store;
use fieldpay_types::{FieldpayError, OutboxMessage, Result, TenantId, Topic};

use crate::config::WorkerConfig;

/// One topic's message handler
#[async_trait]
pub trait OutboxWorker: Send + Sync {
    fn topic(&self) -> Topic;

    /// Apply one message's effect. Must be idempotent: the same message
    /// may be delivered more than once.
    async fn handle(&self, message: &OutboxMessage) -> Result<()>;
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Routes claimed messages to their topic's worker
pub struct Dispatcher {
    store: Arc<dyn Store>,
    config: WorkerConfig,
    workers: HashMap<Topic, Arc<dyn OutboxWorker>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            workers: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker: Arc<dyn OutboxWorker>) {
        self.workers.insert(worker.topic(), worker);
    }

    /// Claim and process up to one batch of a topic's messages
    pub async fn drain(&self, tenant_id: &TenantId, topic: Topic) -> Result<DrainReport> {
        let worker = self
            .workers
            .get(&topic)
            .ok_or_else(|| FieldpayError::not_found(format!("worker for topic {topic}")))?;

        let batch = self
            .store
            .claim_batch(tenant_id, topic, self.config.batch_size)
            .await?;
        let mut report = DrainReport {
            claimed: batch.len(),
            ..DrainReport::default()
        };

        for message in &batch {
            match worker.handle(message).await {
                Ok(()) => {
                    self.store.mark_processed(tenant_id, message.cursor).await?;
                    report.processed += 1;
                    debug!(topic = %topic, cursor = message.cursor, "outbox message processed");
                }
                Err(e) => {
                    let attempts = self
                        .store
                        .record_failure(tenant_id, message.cursor, self.config.max_attempts)
                        .await?;
                    report.failed += 1;
                    warn!(
                        topic = %topic,
                        cursor = message.cursor,
                        attempts,
                        error = %e,
                        "outbox message failed"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Drain every registered topic repeatedly until a full pass makes no
    /// progress. Workers may enqueue new messages while handling; this
    /// runs the pipeline to quiescence.
    pub async fn drain_until_quiet(&self, tenant_id: &TenantId) -> Result<DrainReport> {
        let mut topics: Vec<Topic> = self.workers.keys().copied().collect();
        topics.sort_by_key(|t| t.as_str());

        let mut total = DrainReport::default();
        loop {
            let mut progressed = false;
            for topic in &topics {
                let report = self.drain(tenant_id, *topic).await?;
                total.claimed += report.claimed;
                total.processed += report.processed;
                total.failed += report.failed;
                if report.processed > 0 {
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(total);
            }
        }
    }
}

/// Rejection for a payload that does not belong on the worker's topic
pub(crate) fn unexpected_payload(topic: Topic, message: &OutboxMessage) -> FieldpayError {
    FieldpayError::validation(format!(
        "unexpected payload on topic {topic}: cursor {}",
        message.cursor
    ))
}
