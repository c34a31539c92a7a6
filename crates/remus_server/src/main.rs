//! Remus broker daemon.
//!
//! Binds the client, worker, and status endpoints and runs the brokering
//! loop until interrupted.
//!
//! Usage:
//!     remus-server --client-endpoint tcp://127.0.0.1:50505

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use remus_server::{ProcessWorkerFactory, Server, ServerConfig, WorkerFactory};
use remus_transport::Endpoint;

#[derive(Parser, Debug)]
#[command(name = "remus-server", about = "Job broker for mesh-generation workers")]
struct Args {
    /// Endpoint for client submissions (routed request/reply)
    #[arg(long, env = "REMUS_CLIENT_ENDPOINT", default_value = "tcp://127.0.0.1:50505")]
    client_endpoint: String,

    /// Endpoint for worker traffic (routed request/reply)
    #[arg(long, env = "REMUS_WORKER_ENDPOINT", default_value = "tcp://127.0.0.1:50510")]
    worker_endpoint: String,

    /// Endpoint for the status event stream (publish)
    #[arg(long, env = "REMUS_STATUS_ENDPOINT", default_value = "tcp://127.0.0.1:50515")]
    status_endpoint: String,

    /// Worker heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_interval_ms: u64,

    /// Retention of terminal jobs and their results, in seconds
    #[arg(long, default_value_t = 30)]
    retention_secs: u64,

    /// How long a silent client keeps its queued jobs alive, in seconds
    #[arg(long, default_value_t = 60)]
    client_timeout_secs: u64,

    /// Cap on factory-launched workers
    #[arg(long, default_value_t = remus_server::DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// Verbose console logging
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    remus_logging::init_logging(remus_logging::LogConfig {
        app_name: "remus-server",
        verbose: args.verbose,
    })?;

    let config = ServerConfig {
        client_endpoint: args.client_endpoint.parse::<Endpoint>()?,
        worker_endpoint: args.worker_endpoint.parse::<Endpoint>()?,
        status_endpoint: args.status_endpoint.parse::<Endpoint>()?,
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        retention_window: Duration::from_secs(args.retention_secs),
        client_timeout: Duration::from_secs(args.client_timeout_secs),
        ..ServerConfig::default()
    };

    // Workers connect on their own in this deployment; the factory only
    // bounds how many could be launched if commands were configured.
    let mut factory = ProcessWorkerFactory::without_commands();
    factory.set_max_worker_count(args.max_workers);

    let mut server = Server::bind(config, Box::new(factory))?;
    let ports = server.ports();
    tracing::info!("Accepting clients on {}", ports.client);
    tracing::info!("Accepting workers on {}", ports.worker);
    tracing::info!("Publishing status on {}", ports.status);

    server.run()
}
