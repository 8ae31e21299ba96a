//! Fieldpay Ledger - double-entry money movement
//!
//! Every entry is a set of postings that sum to zero; applying an entry
//! moves value between accounts without creating or destroying any. Entry
//! ids are deterministic, so re-applying a redelivered entry is a no-op
//! success rather than a duplicate posting.
//!
//! # Invariants
//!
//! 1. Non-zero-sum entries are rejected before any balance changes
//! 2. The sum of all account balances is always exactly zero
//! 3. An entry id is applied at most once

pub mod allocation;
pub mod escrow;

pub use allocation::{allocate, Allocation, Party};
pub use escrow::Escrow;

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use fieldpay_types::{LedgerEntry, Result};

/// An in-memory double-entry ledger with running balances
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    applied: HashSet<String>,
    balances: HashMap<String, i64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one balanced entry.
    ///
    /// Returns `Ok(false)` when the entry id was already applied; the
    /// redelivered entry changes nothing.
    pub fn apply_entry(&mut self, entry: LedgerEntry) -> Result<bool> {
        entry.check_balanced()?;

        if self.applied.contains(&entry.id) {
            debug!(entry_id = %entry.id, "duplicate ledger entry ignored");
            return Ok(false);
        }

        for posting in &entry.postings {
            *self.balances.entry(posting.account_id.clone()).or_insert(0) +=
                posting.amount_cents;
        }
        info!(entry_id = %entry.id, postings = entry.postings.len(), "ledger entry applied");
        self.applied.insert(entry.id.clone());
        self.entries.push(entry);
        Ok(true)
    }

    /// Current balance of an account, zero if never posted to
    pub fn balance(&self, account_id: &str) -> i64 {
        self.balances.get(account_id).copied().unwrap_or(0)
    }

    /// All applied entries, in application order
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.applied.contains(entry_id)
    }

    /// Sum of every balance; zero by construction
    pub fn total(&self) -> i64 {
        self.balances.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fieldpay_types::Posting;

    fn settle_entry(id: &str, amount: i64) -> LedgerEntry {
        LedgerEntry::balanced(
            id,
            "settlement",
            Utc::now(),
            vec![
                Posting::new("customer", -amount),
                Posting::new("operator", amount - amount / 10),
                Posting::new("platform", amount / 10),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_balances_track_postings() {
        let mut ledger = Ledger::new();
        assert!(ledger.apply_entry(settle_entry("e1", 10_000)).unwrap());

        assert_eq!(ledger.balance("customer"), -10_000);
        assert_eq!(ledger.balance("operator"), 9_000);
        assert_eq!(ledger.balance("platform"), 1_000);
        assert_eq!(ledger.total(), 0);
    }

    #[test]
    fn test_duplicate_entry_is_noop() {
        let mut ledger = Ledger::new();
        assert!(ledger.apply_entry(settle_entry("e1", 10_000)).unwrap());
        assert!(!ledger.apply_entry(settle_entry("e1", 10_000)).unwrap());

        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.balance("operator"), 9_000);
    }

    #[test]
    fn test_unbalanced_entry_rejected_without_side_effects() {
        let mut ledger = Ledger::new();
        let bad = LedgerEntry {
            id: "bad".into(),
            memo: "broken".into(),
            at: Utc::now(),
            postings: vec![Posting::new("customer", -100), Posting::new("operator", 99)],
        };
        assert!(ledger.apply_entry(bad).is_err());
        assert_eq!(ledger.balance("customer"), 0);
        assert!(!ledger.contains("bad"));
    }

    #[test]
    fn test_total_stays_zero_across_entries() {
        let mut ledger = Ledger::new();
        for (i, amount) in [10_000, 2_500, 99_999].into_iter().enumerate() {
            ledger.apply_entry(settle_entry(&format!("e{i}"), amount)).unwrap();
        }
        assert_eq!(ledger.total(), 0);
    }
}
