//! Asynchronous jobs: submission, bounded execution and polling.
//!
//! * [`registry`]: job records and their state machine
//! * [`orchestrator`]: worker pool, `submit` / `poll` / `run_sync` / `cancel`

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{Orchestrator, SyncOutcome};
pub use registry::{JobRegistry, JobState, JobStatus};
