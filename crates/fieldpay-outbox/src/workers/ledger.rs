//! Ledger apply worker
//!
//! Applies `LEDGER_ENTRY_APPLY` messages to the shared ledger. Entry ids
//! are derived from the chain hash of the triggering event, so a
//! redelivered message finds its entry already applied and succeeds
//! without posting twice.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fieldpay_ledger::Ledger;
use fieldpay_types::{OutboxMessage, OutboxPayload, Result, Topic};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

pub struct LedgerApplyWorker {
    ledger: Arc<Mutex<Ledger>>,
}

impl LedgerApplyWorker {
    pub fn new(ledger: Arc<Mutex<Ledger>>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl OutboxWorker for LedgerApplyWorker {
    fn topic(&self) -> Topic {
        Topic::Ledger
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::LedgerEntryApply { entry } = &message.payload else {
            return Err(unexpected_payload(self.topic(), message));
        };
        self.ledger.lock().await.apply_entry(entry.clone())?;
        Ok(())
    }
}
