//! Batch execution: worker pool, per-run ledger, progress fan-out and the
//! coordinator that ties them together.

pub mod broadcaster;
pub mod coordinator;
pub mod pool;
pub mod state;
mod worker;

pub use broadcaster::{ProgressBroadcaster, Subscription};
pub use coordinator::{BatchCoordinator, BatchSettings};
pub use pool::{SlotToken, WorkerPool};
