//! Task engine: record store, bounded event logs, runner, and reclamation.

pub mod log;
pub mod model;
pub mod reclaim;
pub mod runner;
pub mod store;

pub use log::{EVENT_LOG_CAPACITY, EventLog, Subscription};
pub use model::{
    EventData, OutputStream, TaskEvent, TaskId, TaskKind, TaskOutcome, TaskRecord, TaskScope,
    TaskSnapshot, TaskStatus,
};
pub use reclaim::{DEFAULT_RECLAIM_GRACE, Reclaimer};
pub use runner::TaskRunner;
pub use store::{TaskEntry, TaskStore};
