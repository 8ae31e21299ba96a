//! Delivery worker
//!
//! Pushes settlement notifications to an external destination behind the
//! [`DeliveryDestination`] trait. One push is bounded by a timeout; the
//! dispatcher's retry bound takes care of transient outages and
//! dead-letters the message once exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fieldpay_types::{
    DeliveryNotification, FieldpayError, OutboxMessage, OutboxPayload, Result, TenantId, Topic,
};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

/// Where notifications go. Implementations must tolerate receiving the
/// same notification more than once.
#[async_trait]
pub trait DeliveryDestination: Send + Sync {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        notification: &DeliveryNotification,
    ) -> Result<()>;
}

pub struct DeliveryWorker {
    destination: Arc<dyn DeliveryDestination>,
    timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(destination: Arc<dyn DeliveryDestination>, timeout: Duration) -> Self {
        Self {
            destination,
            timeout,
        }
    }
}

#[async_trait]
impl OutboxWorker for DeliveryWorker {
    fn topic(&self) -> Topic {
        Topic::Delivery
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::NotifyDelivery { notification } = &message.payload else {
            return Err(unexpected_payload(self.topic(), message));
        };

        tokio::time::timeout(
            self.timeout,
            self.destination.deliver(&message.tenant_id, notification),
        )
        .await
        .map_err(|_| {
            FieldpayError::storage(format!(
                "delivery of {} timed out after {:?}",
                notification.subject, self.timeout
            ))
        })??;

        debug!(subject = %notification.subject, job_id = %notification.job_id, "notification delivered");
        Ok(())
    }
}
