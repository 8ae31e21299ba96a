//! Fieldpay Types - Canonical domain types for agent work settlement
//!
//! This crate contains all foundational types for Fieldpay with zero
//! dependencies on other fieldpay crates. It defines the complete type
//! system for:
//!
//! - Identity types (TenantId, JobId, AgentId, StreamKey, etc.)
//! - Event kinds and typed payloads
//! - The job projection (status, booking, proof, holds, settlement)
//! - Contract documents with content-hash pinning
//! - Outbox topics and payloads
//! - Ledger entries and postings
//! - The error taxonomy with stable machine-readable codes
//!
//! # Architectural Invariants
//!
//! 1. Every entity is scoped by a tenant; nothing crosses tenants
//! 2. Event payloads are a closed tagged union, never loose blobs
//! 3. Ledger entries are double-entry: postings always sum to zero
//! 4. Rejections are error values with stable codes, never panics

pub mod contract;
pub mod error;
pub mod event;
pub mod identity;
pub mod job;
pub mod ledger;
pub mod month;
pub mod outbox;

pub use contract::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use job::*;
pub use ledger::*;
pub use month::*;
pub use outbox::*;

/// Version of the Fieldpay types schema
pub const TYPES_VERSION: &str = "0.1.0";
