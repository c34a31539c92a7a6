//! Remus worker library.
//!
//! Everything a mesher process needs to serve jobs from a Remus broker:
//! connect, advertise requirements, poll for work adaptively, execute
//! through a [`JobHandler`], and report progress and results.

pub mod polling;
pub mod worker;

pub use polling::{PollBackoff, PollingRates};
pub use worker::{ActiveJob, JobContext, JobHandler, Worker, WorkerConfig};
