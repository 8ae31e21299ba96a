//! Topic workers and background monitors

pub mod delivery;
pub mod dispatch;
pub mod ledger;
pub mod liveness;
pub mod month_close;
pub mod proof;
pub mod robot_health;

pub use delivery::{DeliveryDestination, DeliveryWorker};
pub use dispatch::DispatchWorker;
pub use ledger::LedgerApplyWorker;
pub use liveness::LivenessMonitor;
pub use month_close::MonthCloseWorker;
pub use proof::ProofWorker;
pub use robot_health::RobotHealthWorker;
