//! Ledger entry and posting types
//!
//! Entries are double-entry: the postings of every entry must sum to
//! zero. Entry ids are deterministic (derived from the chain hash of the
//! triggering event) so re-applying a redelivered outbox message is a
//! no-op instead of a duplicate posting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FieldpayError, Result};

/// One side of a double-entry movement, in cents. Positive amounts
/// credit the account, negative amounts debit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account_id: String,
    pub amount_cents: i64,
}

impl Posting {
    pub fn new(account_id: impl Into<String>, amount_cents: i64) -> Self {
        Self {
            account_id: account_id.into(),
            amount_cents,
        }
    }
}

/// A balanced ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Deterministic id, unique per logical entry
    pub id: String,
    pub memo: String,
    pub at: DateTime<Utc>,
    pub postings: Vec<Posting>,
}

impl LedgerEntry {
    /// Build an entry, validating the zero-sum invariant up front
    pub fn balanced(
        id: impl Into<String>,
        memo: impl Into<String>,
        at: DateTime<Utc>,
        postings: Vec<Posting>,
    ) -> Result<Self> {
        let entry = Self {
            id: id.into(),
            memo: memo.into(),
            at,
            postings,
        };
        entry.check_balanced()?;
        Ok(entry)
    }

    /// Validate that postings sum to zero
    pub fn check_balanced(&self) -> Result<()> {
        if self.postings.is_empty() {
            return Err(FieldpayError::Validation {
                message: format!("ledger entry {} has no postings", self.id),
            });
        }
        let sum: i64 = self.postings.iter().map(|p| p.amount_cents).sum();
        if sum != 0 {
            return Err(FieldpayError::Validation {
                message: format!("ledger entry {} postings sum to {sum}, expected 0", self.id),
            });
        }
        Ok(())
    }
}

/// An immutable per-period statement for one party.
///
/// Statements are unique on `(tenant, party, period)`; a redelivered
/// month-close message finds the row already present and does nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: crate::identity::StatementId,
    pub tenant_id: crate::identity::TenantId,
    pub party: String,
    pub period: crate::month::Month,
    pub gross_cents: i64,
    pub credits_cents: i64,
    pub job_count: u32,
    /// Content hash over the statement body; reproducible offline
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_entry_accepted() {
        let entry = LedgerEntry::balanced(
            "entry-1",
            "job settlement",
            Utc::now(),
            vec![Posting::new("customer", -10_000), Posting::new("operator", 10_000)],
        );
        assert!(entry.is_ok());
    }

    #[test]
    fn test_unbalanced_entry_rejected() {
        let entry = LedgerEntry::balanced(
            "entry-2",
            "bad",
            Utc::now(),
            vec![Posting::new("customer", -10_000), Posting::new("operator", 9_999)],
        );
        assert!(entry.is_err());
    }

    #[test]
    fn test_empty_entry_rejected() {
        assert!(LedgerEntry::balanced("entry-3", "empty", Utc::now(), vec![]).is_err());
    }
}
