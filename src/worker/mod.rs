//! Worker Module
//!
//! Per-worker half of the weight-sync protocol:
//! - Communicator state machine (uninitialized, initialized, closed)
//! - Broadcast receive, barrier, and model load
//! - Operations dispatched by the engine

pub mod ops;
pub mod state;
pub mod weight_sync;

pub use ops::{WeightUpdateRequest, WorkerOp};
pub use state::{CommState, WorkerCommunicatorState};
pub use weight_sync::{WeightSyncWorker, WorkerSnapshot};
