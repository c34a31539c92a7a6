//! Remus server library.
//!
//! The broker that accepts mesh-generation jobs from clients, matches them
//! against worker capabilities, dispatches each job to exactly one worker,
//! and streams status back. See [`server::Server`] for the event loop,
//! [`factory::WorkerFactory`] for admission control.

pub mod factory;
pub mod job_store;
pub mod metrics;
pub mod registry;
pub mod server;

pub use factory::{
    AlwaysSupportFactory, ProcessWorkerFactory, WorkerCommand, WorkerFactory,
    DEFAULT_MAX_WORKERS,
};
pub use job_store::{Job, JobStore};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use registry::{ConnectedClient, ConnectedWorker, PeerRegistry, WorkerStatus};
pub use server::{Server, ServerConfig, ServerPorts};
