//! Escrow primitives keyed by agreement hash
//!
//! An agreement hash identifies one customer commitment. Locking moves
//! funds from the party account into a dedicated escrow account for that
//! agreement; release and refund empty it back out. Each operation
//! returns a balanced entry for the ledger, with a deterministic id so
//! redelivery stays idempotent. A lock can be consumed exactly once:
//! release and refund are mutually exclusive and unrepeatable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::info;

use fieldpay_types::{FieldpayError, LedgerEntry, Posting, Result};

#[derive(Debug, Clone, PartialEq)]
enum EscrowPhase {
    Locked,
    Released,
    Refunded,
}

#[derive(Debug, Clone)]
struct Agreement {
    phase: EscrowPhase,
    party_account: String,
    amount_cents: i64,
}

/// Escrow state per agreement hash
#[derive(Debug, Clone, Default)]
pub struct Escrow {
    agreements: HashMap<String, Agreement>,
}

fn escrow_account(agreement_hash: &str) -> String {
    format!("escrow:{agreement_hash}")
}

impl Escrow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock funds for an agreement. Rejected if the agreement already has
    /// escrow history.
    pub fn lock(
        &mut self,
        agreement_hash: &str,
        party_account: &str,
        amount_cents: i64,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        if amount_cents <= 0 {
            return Err(FieldpayError::validation("escrow amount must be positive"));
        }
        if self.agreements.contains_key(agreement_hash) {
            return Err(FieldpayError::validation(format!(
                "agreement {agreement_hash} already has escrow"
            )));
        }

        let entry = LedgerEntry::balanced(
            format!("escrow-lock-{agreement_hash}"),
            format!("escrow lock for agreement {agreement_hash}"),
            at,
            vec![
                Posting::new(party_account, -amount_cents),
                Posting::new(escrow_account(agreement_hash), amount_cents),
            ],
        )?;

        self.agreements.insert(
            agreement_hash.to_string(),
            Agreement {
                phase: EscrowPhase::Locked,
                party_account: party_account.to_string(),
                amount_cents,
            },
        );
        info!(agreement = %agreement_hash, amount_cents, "escrow locked");
        Ok(entry)
    }

    /// Release locked funds to a beneficiary account
    pub fn release(
        &mut self,
        agreement_hash: &str,
        beneficiary_account: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let agreement = self.locked_mut(agreement_hash)?;
        let amount = agreement.amount_cents;
        agreement.phase = EscrowPhase::Released;

        info!(agreement = %agreement_hash, amount_cents = amount, "escrow released");
        LedgerEntry::balanced(
            format!("escrow-release-{agreement_hash}"),
            format!("escrow release for agreement {agreement_hash}"),
            at,
            vec![
                Posting::new(escrow_account(agreement_hash), -amount),
                Posting::new(beneficiary_account, amount),
            ],
        )
    }

    /// Refund locked funds back to the party that locked them
    pub fn refund(&mut self, agreement_hash: &str, at: DateTime<Utc>) -> Result<LedgerEntry> {
        let agreement = self.locked_mut(agreement_hash)?;
        let amount = agreement.amount_cents;
        let party = agreement.party_account.clone();
        agreement.phase = EscrowPhase::Refunded;

        info!(agreement = %agreement_hash, amount_cents = amount, "escrow refunded");
        LedgerEntry::balanced(
            format!("escrow-refund-{agreement_hash}"),
            format!("escrow refund for agreement {agreement_hash}"),
            at,
            vec![
                Posting::new(escrow_account(agreement_hash), -amount),
                Posting::new(party, amount),
            ],
        )
    }

    fn locked_mut(&mut self, agreement_hash: &str) -> Result<&mut Agreement> {
        let agreement = self
            .agreements
            .get_mut(agreement_hash)
            .ok_or_else(|| FieldpayError::not_found(format!("escrow agreement {agreement_hash}")))?;
        if agreement.phase != EscrowPhase::Locked {
            return Err(FieldpayError::validation(format!(
                "escrow for agreement {agreement_hash} was already consumed"
            )));
        }
        Ok(agreement)
    }
}
