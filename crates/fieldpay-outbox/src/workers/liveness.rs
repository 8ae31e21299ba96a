//! Liveness monitor
//!
//! A periodic sweep over executing jobs. A job whose last heartbeat is
//! older than the timeout is stalled; a stalled job whose heartbeat came
//! back is resumed. A job that never heartbeats is measured from its
//! execution start. Runs off the clock, not the outbox, since silence
//! produces no messages to react to.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use fieldpay_store::{AppendRequest, Appender};
use fieldpay_types::{Actor, EventPayload, JobStatus, Result, StreamKey, TenantId};

pub struct LivenessMonitor {
    appender: Arc<Appender>,
    heartbeat_timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(appender: Arc<Appender>, heartbeat_timeout_secs: i64) -> Self {
        Self {
            appender,
            heartbeat_timeout: Duration::seconds(heartbeat_timeout_secs),
        }
    }

    /// One sweep at `now`; returns how many stall/resume events were
    /// appended.
    pub async fn tick(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> Result<u32> {
        let mut appended = 0;
        for job in self.appender.store().jobs(tenant_id).await? {
            let Some(last) = job.last_heartbeat_at.or(job.execution_started_at) else {
                continue;
            };
            let silent_for = now - last;

            match job.status {
                JobStatus::Executing if silent_for > self.heartbeat_timeout => {
                    let missed = (silent_for.num_seconds()
                        / self.heartbeat_timeout.num_seconds().max(1))
                        as u32;
                    info!(job_id = %job.id, missed, "heartbeat timeout, stalling job");
                    self.appender
                        .append(
                            AppendRequest::new(
                                StreamKey::job(tenant_id.clone(), &job.id),
                                Actor::system(),
                                EventPayload::StallDetected {
                                    missed_heartbeats: missed,
                                },
                            )
                            .at(now),
                            None,
                        )
                        .await?;
                    appended += 1;
                }
                JobStatus::Stalled if silent_for <= self.heartbeat_timeout => {
                    info!(job_id = %job.id, "heartbeat recovered, resuming job");
                    self.appender
                        .append(
                            AppendRequest::new(
                                StreamKey::job(tenant_id.clone(), &job.id),
                                Actor::system(),
                                EventPayload::ExecutionResumed {},
                            )
                            .at(now),
                            None,
                        )
                        .await?;
                    appended += 1;
                }
                _ => {}
            }
        }
        Ok(appended)
    }
}
