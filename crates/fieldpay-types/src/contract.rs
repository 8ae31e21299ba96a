//! Contract documents and policy hash pinning
//!
//! A contract document is an immutable, content-hashed snapshot of the
//! pricing, SLA and evidence policy in force. A job pins the hash of the
//! version it was booked under; publishing a new version never changes
//! the obligations of an already-booked job.

use serde::{Deserialize, Serialize};

use crate::identity::ContractId;

/// How strictly settlement is gated on proof of completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Settlement requires the latest proof evaluation to be PASS
    Strict,
    /// Settlement is allowed without a passing proof
    Lenient,
}

/// Pricing terms of a contract version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Base price per job in cents
    pub base_amount_cents: i64,
    /// Platform share of each settlement, in basis points
    pub platform_fee_bps: u32,
    /// SLA credit per missed-window incident, in cents
    pub sla_credit_cents: i64,
}

/// One immutable version of a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDocument {
    pub contract_id: ContractId,
    pub version: u32,
    pub gate_mode: GateMode,
    /// Zones that must carry captured evidence before proof can pass
    pub required_zones: Vec<String>,
    pub pricing: PricingPolicy,
    pub operator_account: String,
    pub platform_account: String,
    pub customer_account: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_serializes_gate_mode() {
        let doc = ContractDocument {
            contract_id: ContractId::new(),
            version: 1,
            gate_mode: GateMode::Strict,
            required_zones: vec!["lobby".into()],
            pricing: PricingPolicy {
                base_amount_cents: 10_000,
                platform_fee_bps: 1500,
                sla_credit_cents: 500,
            },
            operator_account: "operator".into(),
            platform_account: "platform".into(),
            customer_account: "customer".into(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["gate_mode"], "strict");
    }
}
