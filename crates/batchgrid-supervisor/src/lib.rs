//! batchgrid-supervisor: keeps the fleet usable between passes.
//!
//! - **`backoff`**: per-host Healthy/Backoff state after launch failures
//! - **`ledger`**: outstanding jobs and the reconciliation that decides
//!   which running jobs to tear down before the next allocation pass

pub mod backoff;
pub mod ledger;

pub use backoff::{BackoffPolicy, BackoffTable, HostBackoffState, HostHealth};
pub use ledger::{HostObservation, JobLedger, OutstandingJob, Teardown, TeardownReason};
