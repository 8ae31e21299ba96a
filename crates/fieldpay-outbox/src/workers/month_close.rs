//! Month close worker
//!
//! Materializes per-party statements for a closed month from the jobs
//! whose settlement fell inside it. Statements are keyed on
//! `(tenant, party, period)`: a redelivered close request recomputes the
//! same totals and changes nothing, while a close after a reopen window
//! replaces the period's rows with the recomputed totals.

use std::collections::BTreeMap;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use fieldpay_crypto::hash_canonical;
use fieldpay_store::Appender;
use fieldpay_types::{
    FieldpayError, Month, OutboxMessage, OutboxPayload, Result, Statement, StatementId, TenantId,
    Topic,
};

use crate::dispatcher::{unexpected_payload, OutboxWorker};

#[derive(Debug, Default, Clone, Copy)]
struct PartyTotals {
    gross_cents: i64,
    credits_cents: i64,
    job_count: u32,
}

pub struct MonthCloseWorker {
    appender: Arc<Appender>,
}

impl MonthCloseWorker {
    pub fn new(appender: Arc<Appender>) -> Self {
        Self { appender }
    }

    async fn party_totals(
        &self,
        tenant_id: &TenantId,
        month: Month,
    ) -> Result<BTreeMap<String, PartyTotals>> {
        let mut totals: BTreeMap<String, PartyTotals> = BTreeMap::new();
        for job in self.appender.store().jobs(tenant_id).await? {
            let Some(settlement) = &job.settlement else {
                continue;
            };
            if settlement.effective_month != month {
                continue;
            }
            let booking = job
                .booking
                .as_ref()
                .ok_or_else(|| FieldpayError::validation("settled job has no booking"))?;
            let contract = self
                .appender
                .contract_by_policy_hash(&booking.policy_hash)
                .await?;

            let amount = settlement.amount_cents;
            let fee = amount * i64::from(contract.pricing.platform_fee_bps) / 10_000;
            let credits = job.sla_credits_cents;

            let customer = totals.entry(contract.customer_account.clone()).or_default();
            customer.gross_cents -= amount;
            customer.credits_cents += credits;
            customer.job_count += 1;

            let operator = totals.entry(contract.operator_account.clone()).or_default();
            operator.gross_cents += amount - fee;
            operator.credits_cents -= credits;
            operator.job_count += 1;

            let platform = totals.entry(contract.platform_account.clone()).or_default();
            platform.gross_cents += fee;
            platform.job_count += 1;
        }
        Ok(totals)
    }
}

#[async_trait]
impl OutboxWorker for MonthCloseWorker {
    fn topic(&self) -> Topic {
        Topic::MonthClose
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<()> {
        let OutboxPayload::MonthCloseRequested { month } = &message.payload else {
            return Err(unexpected_payload(self.topic(), message));
        };
        let tenant_id = &message.tenant_id;

        let totals = self.party_totals(tenant_id, *month).await?;
        for (party, t) in totals {
            let content_hash = hash_canonical(&json!({
                "tenant_id": tenant_id,
                "party": party,
                "period": month,
                "gross_cents": t.gross_cents,
                "credits_cents": t.credits_cents,
                "job_count": t.job_count,
            }))
            .map_err(|e| FieldpayError::Serialization {
                message: e.to_string(),
            })?;

            let written = self
                .appender
                .store()
                .put_statement(Statement {
                    id: StatementId::new(),
                    tenant_id: tenant_id.clone(),
                    party: party.clone(),
                    period: *month,
                    gross_cents: t.gross_cents,
                    credits_cents: t.credits_cents,
                    job_count: t.job_count,
                    content_hash,
                })
                .await?;
            if written {
                info!(party = %party, period = %month, "statement issued");
            } else {
                debug!(party = %party, period = %month, "statement totals unchanged");
            }
        }
        Ok(())
    }
}
