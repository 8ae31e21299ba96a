//! Party allocations over ledger entries
//!
//! An allocation restates an entry's postings as per-party amounts using
//! the account mapping of the contract the job settled under. The split
//! is fully determined by the entry and the contract; running it twice
//! yields identical output.

use serde::{Deserialize, Serialize};

use fieldpay_types::{ContractDocument, FieldpayError, LedgerEntry, Result};

/// Settlement parties recognized by contract account mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Customer,
    Operator,
    Platform,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Customer => "customer",
            Party::Operator => "operator",
            Party::Platform => "platform",
        }
    }
}

/// One party's share of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub party: Party,
    pub account_id: String,
    pub amount_cents: i64,
}

/// Restate an entry's postings per party.
///
/// Every posting must hit one of the contract's three accounts; a posting
/// against any other account means the entry does not belong to this
/// contract and is rejected.
pub fn allocate(entry: &LedgerEntry, contract: &ContractDocument) -> Result<Vec<Allocation>> {
    let mut customer = 0i64;
    let mut operator = 0i64;
    let mut platform = 0i64;

    for posting in &entry.postings {
        if posting.account_id == contract.customer_account {
            customer += posting.amount_cents;
        } else if posting.account_id == contract.operator_account {
            operator += posting.amount_cents;
        } else if posting.account_id == contract.platform_account {
            platform += posting.amount_cents;
        } else {
            return Err(FieldpayError::validation(format!(
                "entry {} posts to account {} outside contract {}",
                entry.id, posting.account_id, contract.contract_id
            )));
        }
    }

    Ok(vec![
        Allocation {
            party: Party::Customer,
            account_id: contract.customer_account.clone(),
            amount_cents: customer,
        },
        Allocation {
            party: Party::Operator,
            account_id: contract.operator_account.clone(),
            amount_cents: operator,
        },
        Allocation {
            party: Party::Platform,
            account_id: contract.platform_account.clone(),
            amount_cents: platform,
        },
    ])
}
