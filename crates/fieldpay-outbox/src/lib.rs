//! Fieldpay Outbox - at-least-once side-effect processing
//!
//! Events never perform side effects inline; they enqueue typed outbox
//! messages in the same commit. The dispatcher drains each topic in
//! commit order and hands messages to workers:
//!
//! - [`LedgerApplyWorker`] - posts balanced entries to the ledger
//! - [`DispatchWorker`] - matches booked jobs to available agents
//! - [`ProofWorker`] - evaluates evidence, opens and releases holds
//! - [`DeliveryWorker`] - pushes notifications to a destination trait
//! - [`MonthCloseWorker`] - materializes immutable period statements
//! - [`RobotHealthWorker`] - quarantines agents after severe incidents
//! - [`LivenessMonitor`] - clock-driven stall / resume sweeps
//!
//! Every handler is idempotent, so crash-and-redeliver converges on the
//! same state.

pub mod config;
pub mod dispatcher;
pub mod workers;

pub use config::WorkerConfig;
pub use dispatcher::{Dispatcher, DrainReport, OutboxWorker};
pub use workers::{
    DeliveryDestination, DeliveryWorker, DispatchWorker, LedgerApplyWorker, LivenessMonitor,
    MonthCloseWorker, ProofWorker, RobotHealthWorker,
};
