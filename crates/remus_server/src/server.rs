//! Remus broker.
//!
//! A single cooperative loop multiplexes three bound sockets (client,
//! worker, status-publish), decodes messages, advances the job state
//! machine, consults the worker factory, expires dead peers, and publishes
//! status events. All broker state is owned by the loop thread; other
//! threads only ever talk to it through the sockets.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use remus_protocol::{
    wire, JobAssignment, JobId, JobRequirements, JobResult, JobState, JobStatusInfo, Message,
    MeshIOType, ProtocolError, ServiceType, StatusEvent,
};
use remus_transport::{
    bind_endpoint, poll_readable, recv_frames, send_frames, Endpoint, MessagingContext,
    PollOutcome,
};

use crate::factory::WorkerFactory;
use crate::job_store::{Job, JobStore};
use crate::metrics::METRICS;
use crate::registry::{PeerRegistry, WorkerStatus};

/// Upper bound on one poll wait (ms), keeping maintenance ticks timely.
const DEFAULT_MAX_POLL_MS: i64 = 250;

/// Heartbeats a worker may miss before it is declared gone.
const HEARTBEAT_MISS_FACTOR: f64 = 5.0;

/// Factory launch backoff base (ms) after an unsuccessful dispatch pass.
const LAUNCH_BACKOFF_BASE_MS: u64 = 50;
/// Factory launch backoff cap (ms).
const LAUNCH_BACKOFF_MAX_MS: u64 = 1_000;

/// Broker configuration.
pub struct ServerConfig {
    pub client_endpoint: Endpoint,
    pub worker_endpoint: Endpoint,
    pub status_endpoint: Endpoint,
    /// Worker heartbeat interval; liveness threshold is five times this.
    pub heartbeat_interval: Duration,
    /// How long terminal jobs (and their results) are retained.
    pub retention_window: Duration,
    /// How long a silent client keeps its queued jobs alive.
    pub client_timeout: Duration,
    pub max_poll_interval: Duration,
    /// Context to share with in-process workers. A fresh one is created
    /// when absent. Must not be replaced once brokering has begun.
    pub context: Option<MessagingContext>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_endpoint: Endpoint::tcp("127.0.0.1", 50505),
            worker_endpoint: Endpoint::tcp("127.0.0.1", 50510),
            status_endpoint: Endpoint::tcp("127.0.0.1", 50515),
            heartbeat_interval: Duration::from_secs(1),
            retention_window: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            max_poll_interval: Duration::from_millis(DEFAULT_MAX_POLL_MS as u64),
            context: None,
        }
    }
}

/// The endpoints the broker actually bound (TCP ports may differ from the
/// configured ones when those were taken).
#[derive(Debug, Clone)]
pub struct ServerPorts {
    pub client: Endpoint,
    pub worker: Endpoint,
    pub status: Endpoint,
}

/// The broker.
pub struct Server {
    context: MessagingContext,
    client_socket: zmq::Socket,
    worker_socket: zmq::Socket,
    status_socket: zmq::Socket,
    ports: ServerPorts,
    registry: PeerRegistry,
    store: JobStore,
    factory: Box<dyn WorkerFactory>,
    heartbeat_interval: f64,
    worker_timeout: f64,
    retention_window: f64,
    client_timeout: f64,
    max_poll_ms: i64,
    running: bool,
    pending_events: Vec<StatusEvent>,
    launch_backoff_ms: u64,
    launch_cooldown_until: Option<f64>,
}

impl Server {
    /// Bind the three endpoints and wire up the broker.
    pub fn bind(config: ServerConfig, factory: Box<dyn WorkerFactory>) -> Result<Self> {
        let context = config
            .context
            .clone()
            .unwrap_or_else(MessagingContext::new);

        let client_socket = context
            .socket(zmq::ROUTER)
            .context("Failed to create client ROUTER socket")?;
        let worker_socket = context
            .socket(zmq::ROUTER)
            .context("Failed to create worker ROUTER socket")?;
        let status_socket = context
            .socket(zmq::PUB)
            .context("Failed to create status PUB socket")?;
        for socket in [&client_socket, &worker_socket, &status_socket] {
            socket.set_linger(0).context("Failed to set linger")?;
        }

        let client = bind_endpoint(&client_socket, &config.client_endpoint)
            .context("Failed to bind client endpoint")?;
        let worker = bind_endpoint(&worker_socket, &config.worker_endpoint)
            .context("Failed to bind worker endpoint")?;
        let status = bind_endpoint(&status_socket, &config.status_endpoint)
            .context("Failed to bind status endpoint")?;

        info!("Broker bound: client {client}, worker {worker}, status {status}");

        Ok(Self {
            context,
            client_socket,
            worker_socket,
            status_socket,
            ports: ServerPorts {
                client,
                worker,
                status,
            },
            registry: PeerRegistry::new(),
            store: JobStore::new(),
            factory,
            heartbeat_interval: config.heartbeat_interval.as_secs_f64(),
            worker_timeout: config.heartbeat_interval.as_secs_f64() * HEARTBEAT_MISS_FACTOR,
            retention_window: config.retention_window.as_secs_f64(),
            client_timeout: config.client_timeout.as_secs_f64(),
            max_poll_ms: config.max_poll_interval.as_millis() as i64,
            running: false,
            pending_events: Vec::new(),
            launch_backoff_ms: 0,
            launch_cooldown_until: None,
        })
    }

    /// The endpoints actually bound.
    pub fn ports(&self) -> &ServerPorts {
        &self.ports
    }

    /// The messaging context, for in-process workers sharing `inproc`
    /// endpoints with this broker.
    pub fn messaging_context(&self) -> MessagingContext {
        self.context.clone()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    pub fn connected_worker_count(&self) -> usize {
        self.registry.worker_count()
    }

    pub fn busy_worker_count(&self) -> usize {
        self.registry.busy_worker_count()
    }

    pub fn in_progress_job_count(&self) -> usize {
        self.store.in_progress_count()
    }

    pub fn queued_job_count(&self) -> usize {
        self.store.queued_ids().len()
    }

    /// Main event loop.
    pub fn run(&mut self) -> Result<()> {
        self.run_inner(None)
    }

    /// Main event loop with a shutdown channel.
    pub fn run_with_shutdown(&mut self, stop_rx: mpsc::Receiver<()>) -> Result<()> {
        self.run_inner(Some(stop_rx))
    }

    fn run_inner(&mut self, stop_rx: Option<mpsc::Receiver<()>>) -> Result<()> {
        self.running = true;
        info!("Broker loop started");

        while self.running {
            if let Some(rx) = stop_rx.as_ref() {
                match rx.try_recv() {
                    Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                        info!("Broker received stop signal");
                        self.running = false;
                        break;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                }
            }
            self.step();
        }

        // Drain outstanding status deltas before the sockets close.
        self.publish_pending_events();
        info!("Broker stopped; {}", METRICS.snapshot().summary());
        Ok(())
    }

    /// One loop iteration: wait for traffic, drain it, run maintenance and
    /// the dispatch pass, publish status deltas. Exposed so embedders and
    /// tests can drive the broker step by step.
    pub fn step(&mut self) {
        let (client_ready, worker_ready) = {
            let mut items = [
                self.client_socket.as_poll_item(zmq::POLLIN),
                self.worker_socket.as_poll_item(zmq::POLLIN),
            ];
            match poll_readable(&mut items, self.max_poll_ms) {
                Ok(PollOutcome::Ready(_)) => (items[0].is_readable(), items[1].is_readable()),
                Ok(PollOutcome::TimedOut) => (false, false),
                Ok(PollOutcome::Interrupted) => return,
                Err(e) => {
                    error!("Poll error: {e}");
                    return;
                }
            }
        };

        if client_ready {
            if let Err(e) = self.drain_client_socket() {
                error!("Client socket error: {e}");
            }
        }
        if worker_ready {
            if let Err(e) = self.drain_worker_socket() {
                error!("Worker socket error: {e}");
            }
        }

        self.maintenance();
        self.dispatch_pass();
        self.publish_pending_events();
    }

    // ========================================================================
    // Socket plumbing
    // ========================================================================

    fn drain_client_socket(&mut self) -> Result<()> {
        while let Some(frames) = recv_frames(&self.client_socket)? {
            if let Some((identity, msg)) = split_routed(&frames) {
                if let Err(e) = self.handle_client_message(identity, msg) {
                    error!("Error handling client message: {e}");
                }
            }
        }
        Ok(())
    }

    fn drain_worker_socket(&mut self) -> Result<()> {
        while let Some(frames) = recv_frames(&self.worker_socket)? {
            if let Some((identity, msg)) = split_routed(&frames) {
                if let Err(e) = self.handle_worker_message(identity, msg) {
                    error!("Error handling worker message: {e}");
                }
            }
        }
        Ok(())
    }

    fn reply_client(&self, identity: &[u8], msg: Message) {
        self.send_routed(&self.client_socket, identity, msg);
    }

    fn reply_worker(&self, identity: &[u8], msg: Message) {
        self.send_routed(&self.worker_socket, identity, msg);
    }

    fn send_routed(&self, socket: &zmq::Socket, identity: &[u8], msg: Message) {
        let mut frames = vec![identity.to_vec()];
        frames.extend(msg.pack());
        match send_frames(socket, frames) {
            Ok(()) => METRICS.inc_messages_sent(),
            // A failed routed send means the peer is already gone; the
            // liveness pass will clean it up.
            Err(e) => warn!("Dropped reply to vanished peer: {e}"),
        }
    }

    // ========================================================================
    // Client services
    // ========================================================================

    fn handle_client_message(&mut self, identity: Vec<u8>, msg: Message) -> Result<()> {
        let now = current_time();
        METRICS.inc_messages_received();
        self.registry.touch_client(&identity, now);

        match msg.service {
            ServiceType::CanMeshType => {
                let Some(io) = decode(MeshIOType::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                let supported = self.registry.any_worker_for_io(&io)
                    || self.factory.supported_io_types().contains(&io);
                self.reply_client(
                    &identity,
                    Message::new(ServiceType::CanMeshType, wire::encode_bool(supported)),
                );
            }

            ServiceType::CanMeshRequirements => {
                let Some(reqs) = decode(JobRequirements::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                let supported = self.registry.any_worker_for_requirements(&reqs)
                    || self.factory.have_support(&reqs);
                self.reply_client(
                    &identity,
                    Message::new(
                        ServiceType::CanMeshRequirements,
                        wire::encode_bool(supported),
                    ),
                );
            }

            ServiceType::RetrieveRequirements => {
                let Some(io) = decode(MeshIOType::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                let mut set: HashSet<JobRequirements> = self.registry.requirements_for_io(&io);
                set.extend(self.factory.worker_requirements(&io));
                let set: Vec<JobRequirements> = set.into_iter().collect();
                self.reply_client(
                    &identity,
                    Message::new(
                        ServiceType::RetrieveRequirements,
                        wire::encode_requirements_set(&set),
                    ),
                );
            }

            ServiceType::SubmitJob => {
                let Some(submission) = decode(remus_protocol::JobSubmission::decode_payload(
                    &msg.payload,
                )) else {
                    return Ok(());
                };
                let job_id = JobId::mint();
                info!(
                    "Job {} submitted ({}, {} content keys)",
                    job_id,
                    submission.requirements.io_type,
                    submission.len()
                );
                self.store
                    .enqueue(Job::new(job_id, identity.clone(), submission, now));
                self.registry.record_submission(&identity, job_id, now);
                self.push_event(job_id, JobState::Queued);
                METRICS.inc_jobs_submitted();
                self.reply_client(
                    &identity,
                    Message::new(ServiceType::SubmitJob, wire::encode_job_id(job_id)),
                );
            }

            ServiceType::QueryStatus => {
                let Some(job_id) = decode(wire::decode_job_id(&msg.payload)) else {
                    return Ok(());
                };
                let info = self
                    .store
                    .get(job_id)
                    .map(|job| job.status_info())
                    .unwrap_or_else(|| JobStatusInfo::invalid(job_id));
                self.reply_client(
                    &identity,
                    Message::new(ServiceType::QueryStatus, info.encode()),
                );
            }

            ServiceType::Retrieve => {
                let Some(job_id) = decode(wire::decode_job_id(&msg.payload)) else {
                    return Ok(());
                };
                let reply = self.retrieve_result(&identity, job_id, now);
                self.reply_client(&identity, reply);
            }

            ServiceType::TerminateJob => {
                let Some(job_id) = decode(wire::decode_job_id(&msg.payload)) else {
                    return Ok(());
                };
                let accepted = self.terminate_job(&identity, job_id, now);
                self.reply_client(
                    &identity,
                    Message::new(ServiceType::TerminateJob, wire::encode_bool(accepted)),
                );
            }

            other => {
                warn!("Worker-service tag {other:?} on the client endpoint; dropping");
                METRICS.inc_protocol_violations();
            }
        }
        Ok(())
    }

    fn retrieve_result(&mut self, identity: &[u8], job_id: JobId, now: f64) -> Message {
        let Some(job) = self.store.get(job_id) else {
            return Message::empty(ServiceType::Retrieve);
        };
        if job.submitter != identity {
            warn!("Job {job_id}: result requested by a non-submitter; dropping");
            METRICS.inc_protocol_violations();
            return Message::empty(ServiceType::Retrieve);
        }
        if job.status != JobState::Finished {
            return Message::empty(ServiceType::Retrieve);
        }
        match self.store.take_result(job_id, now) {
            Some(data) => {
                debug!("Job {job_id}: result handed to submitter ({} bytes)", data.len());
                Message::new(
                    ServiceType::Retrieve,
                    JobResult::new(job_id, data).encode(),
                )
            }
            None => Message::empty(ServiceType::Retrieve),
        }
    }

    fn terminate_job(&mut self, identity: &[u8], job_id: JobId, now: f64) -> bool {
        let Some(job) = self.store.get(job_id) else {
            return false;
        };
        if job.submitter != identity {
            warn!("Job {job_id}: termination requested by a non-submitter; dropping");
            METRICS.inc_protocol_violations();
            return false;
        }

        match job.status {
            JobState::Queued => {
                let reserved = job.assigned_worker.clone();
                self.store.update_status(job_id, JobState::Failed, now);
                if let Some(worker) = reserved {
                    self.registry.release_worker(&worker, now);
                }
                self.push_event(job_id, JobState::Failed);
                METRICS.inc_jobs_terminated();
                info!("Job {job_id} terminated while queued");
                true
            }
            JobState::InProgress => {
                if let Some(worker) = self.store.get(job_id).and_then(|j| j.assigned_worker.clone())
                {
                    // Best effort; the final state comes from the worker's
                    // next message or a heartbeat timeout.
                    self.reply_worker(
                        &worker,
                        Message::new(ServiceType::Terminate, wire::encode_job_id(job_id)),
                    );
                }
                METRICS.inc_jobs_terminated();
                info!("Job {job_id}: termination forwarded to its worker");
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Worker services
    // ========================================================================

    fn handle_worker_message(&mut self, identity: Vec<u8>, msg: Message) -> Result<()> {
        let now = current_time();
        METRICS.inc_messages_received();

        match msg.service {
            ServiceType::WorkerRegister => {
                let Some(reqs) = decode(JobRequirements::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                let mut advertised = self
                    .registry
                    .worker(&identity)
                    .map(|w| w.requirements.clone())
                    .unwrap_or_default();
                if !advertised.contains(&reqs) {
                    advertised.push(reqs.clone());
                }
                info!("Worker registered for {} ({:?})", reqs.io_type, reqs.worker_name);
                self.registry.register_worker(identity, advertised, now);
                METRICS.inc_workers_registered();
                // A worker arriving is the activity the launch backoff was
                // waiting for.
                self.launch_backoff_ms = 0;
                self.launch_cooldown_until = None;
            }

            ServiceType::AskForJob => {
                let Some(reqs) = decode(JobRequirements::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                self.handle_ask_for_job(identity, reqs, now);
            }

            ServiceType::Progress => {
                let Some(info) = decode(JobStatusInfo::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                self.handle_progress(&identity, info, now);
            }

            ServiceType::Result => {
                let Some(result) = decode(JobResult::decode_payload(&msg.payload)) else {
                    return Ok(());
                };
                self.handle_result(&identity, result, now);
            }

            ServiceType::Failure => {
                let Some(job_id) = decode(wire::decode_job_id(&msg.payload)) else {
                    return Ok(());
                };
                self.handle_failure(&identity, job_id, now);
            }

            ServiceType::Heartbeat => {
                if self.registry.touch_worker(&identity, now) {
                    if let Some(job_id) =
                        self.registry.worker(&identity).and_then(|w| w.current_job)
                    {
                        if let Some(job) = self.store.get_mut(job_id) {
                            job.last_heartbeat = now;
                        }
                    }
                } else {
                    // Could be a worker that was reaped for staleness and
                    // is still draining its send queue.
                    debug!("Heartbeat from unknown worker identity ({} bytes)", identity.len());
                }
            }

            other => {
                warn!("Client-service tag {other:?} on the worker endpoint; dropping");
                METRICS.inc_protocol_violations();
            }
        }
        Ok(())
    }

    fn handle_ask_for_job(&mut self, identity: Vec<u8>, reqs: JobRequirements, now: f64) {
        if !self.registry.touch_worker(&identity, now) {
            warn!("Work request from an unregistered worker; dropping");
            METRICS.inc_protocol_violations();
            self.reply_worker(&identity, Message::empty(ServiceType::AskForJob));
            return;
        }

        // A job reserved for this worker by the dispatch pass goes out
        // first; otherwise try a direct match against the queue.
        let reserved = self
            .registry
            .worker(&identity)
            .filter(|w| w.status == WorkerStatus::Assigned)
            .and_then(|w| w.current_job);

        let job_id = match reserved {
            Some(job_id) => Some(job_id),
            None => {
                let idle = self
                    .registry
                    .worker(&identity)
                    .map(|w| w.status == WorkerStatus::Idle)
                    .unwrap_or(false);
                if idle {
                    let mut advertised = self
                        .registry
                        .worker(&identity)
                        .map(|w| w.requirements.clone())
                        .unwrap_or_default();
                    if !advertised.contains(&reqs) {
                        advertised.push(reqs);
                    }
                    match self.store.first_queued_matching(&advertised) {
                        Some(candidate)
                            if self.registry.assign_worker(&identity, candidate)
                                && self.store.assign(candidate, identity.clone()) =>
                        {
                            Some(candidate)
                        }
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };

        let reply = match job_id.and_then(|id| {
            self.store
                .take_submission(id)
                .map(|submission| JobAssignment {
                    job_id: id,
                    submission,
                })
        }) {
            Some(assignment) => {
                info!("Job {} handed to its worker", assignment.job_id);
                if let Some(job) = self.store.get_mut(assignment.job_id) {
                    job.last_heartbeat = now;
                }
                METRICS.inc_jobs_dispatched();
                Message::new(ServiceType::AskForJob, assignment.encode())
            }
            None => Message::empty(ServiceType::AskForJob),
        };
        self.reply_worker(&identity, reply);
    }

    fn handle_progress(&mut self, identity: &[u8], info: JobStatusInfo, now: f64) {
        self.registry.touch_worker(identity, now);

        let Some(job) = self.store.get(info.job_id) else {
            debug!("Progress for unknown job {}; dropping", info.job_id);
            METRICS.inc_protocol_violations();
            return;
        };
        if job.assigned_worker.as_deref() != Some(identity) {
            warn!("Job {}: progress from a worker not assigned to it; dropping", info.job_id);
            METRICS.inc_protocol_violations();
            return;
        }
        // A progress report cannot finish a job; only a result can.
        if info.state == JobState::Finished {
            warn!("Job {}: FINISHED via progress; dropping", info.job_id);
            METRICS.inc_protocol_violations();
            return;
        }
        if !matches!(info.state, JobState::Queued | JobState::InProgress) {
            warn!(
                "Job {}: unexpected state {} in progress report; dropping",
                info.job_id, info.state
            );
            METRICS.inc_protocol_violations();
            return;
        }

        let job_id = info.job_id;
        if self.store.get(job_id).map(|j| j.status) == Some(JobState::Queued) {
            self.store.update_status(job_id, JobState::InProgress, now);
            self.registry.mark_executing(identity);
            self.push_event(job_id, JobState::InProgress);
            debug!("Job {job_id} promoted to IN_PROGRESS");
        }
        if let Some(job) = self.store.get_mut(job_id) {
            job.progress = info.progress;
            job.last_heartbeat = now;
        }
    }

    fn handle_result(&mut self, identity: &[u8], result: JobResult, now: f64) {
        self.registry.touch_worker(identity, now);

        let job_id = result.job_id;
        let valid = self
            .store
            .get(job_id)
            .map(|job| {
                job.assigned_worker.as_deref() == Some(identity)
                    && job.status == JobState::InProgress
            })
            .unwrap_or(false);
        if !valid {
            warn!("Job {job_id}: result from a worker not executing it; dropping");
            METRICS.inc_protocol_violations();
            return;
        }

        info!("Job {job_id} finished ({} result bytes)", result.data.len());
        self.store.set_result(job_id, result.data);
        self.store.update_status(job_id, JobState::Finished, now);
        self.registry.release_worker(identity, now);
        self.push_event(job_id, JobState::Finished);
        METRICS.inc_jobs_finished();
    }

    fn handle_failure(&mut self, identity: &[u8], job_id: JobId, now: f64) {
        self.registry.touch_worker(identity, now);

        let valid = self
            .store
            .get(job_id)
            .map(|job| {
                job.assigned_worker.as_deref() == Some(identity) && !job.status.is_terminal()
            })
            .unwrap_or(false);
        if !valid {
            warn!("Job {job_id}: failure report from a worker not assigned to it; dropping");
            METRICS.inc_protocol_violations();
            return;
        }

        warn!("Job {job_id} failed on its worker");
        self.store.update_status(job_id, JobState::Failed, now);
        self.registry.release_worker(identity, now);
        self.push_event(job_id, JobState::Failed);
        METRICS.inc_jobs_failed();
    }

    // ========================================================================
    // Maintenance & dispatch
    // ========================================================================

    fn maintenance(&mut self) {
        let now = current_time();

        // Workers that missed too many heartbeats are gone; their jobs fail.
        for (identity, held_job) in self.registry.reap_workers(now, self.worker_timeout) {
            warn!("Reaped unresponsive worker ({} bytes identity)", identity.len());
            METRICS.inc_workers_reaped();
            if let Some(job_id) = held_job {
                self.fail_job_for_lost_worker(job_id, now);
            }
        }

        // Silent clients take their still-queued jobs with them.
        for (_identity, jobs) in self.registry.reap_clients(now, self.client_timeout) {
            METRICS.inc_clients_reaped();
            for job_id in jobs {
                let queued = self
                    .store
                    .get(job_id)
                    .map(|job| job.status == JobState::Queued)
                    .unwrap_or(false);
                if queued {
                    let reserved = self
                        .store
                        .get(job_id)
                        .and_then(|job| job.assigned_worker.clone());
                    self.store.update_status(job_id, JobState::Expired, now);
                    if let Some(worker) = reserved {
                        self.registry.release_worker(&worker, now);
                    }
                    self.push_event(job_id, JobState::Expired);
                    METRICS.inc_jobs_expired();
                    info!("Job {job_id} expired: submitter disappeared");
                }
            }
        }

        // Retention: terminal jobs eventually vanish entirely.
        let cutoff = now - self.retention_window;
        for job in self.store.expire_before(cutoff) {
            if job.status != JobState::Expired {
                self.push_event(job.id, JobState::Expired);
            }
            self.registry.forget_job(&job.submitter, job.id);
            METRICS.inc_jobs_expired();
            debug!("Job {} reaped after retention window", job.id);
        }

        self.factory.update_worker_count();
    }

    fn fail_job_for_lost_worker(&mut self, job_id: JobId, now: f64) {
        let lost = self
            .store
            .get(job_id)
            .map(|job| !job.status.is_terminal())
            .unwrap_or(false);
        if lost {
            warn!("Job {job_id} failed: its worker became unresponsive");
            self.store.update_status(job_id, JobState::Failed, now);
            self.push_event(job_id, JobState::Failed);
            METRICS.inc_jobs_failed();
        }
    }

    /// Pair queued jobs with idle workers in FIFO order; when none matches,
    /// ask the factory to bring one up (rate-limited by a backoff so an
    /// unsupported queue does not hammer the factory every poll interval).
    fn dispatch_pass(&mut self) {
        let now = current_time();
        let factory_open = self
            .launch_cooldown_until
            .map(|until| now >= until)
            .unwrap_or(true);
        let mut consulted_factory = false;

        for job_id in self.store.queued_ids() {
            let Some(reqs) = self.store.get(job_id).map(|job| job.requirements.clone()) else {
                continue;
            };

            if let Some(worker) = self.registry.find_idle_worker(&reqs) {
                if self.store.assign(job_id, worker.clone())
                    && self.registry.assign_worker(&worker, job_id)
                {
                    debug!("Job {job_id} reserved for an idle worker");
                }
                continue;
            }

            if !factory_open || !self.factory.have_support(&reqs) {
                continue;
            }
            if self.factory.current_worker_count() >= self.factory.max_worker_count() {
                continue;
            }
            consulted_factory = true;
            if self.factory.create_worker(&reqs) {
                info!("Factory launching a worker for {}", reqs.io_type);
            }
        }

        if consulted_factory {
            self.schedule_launch_backoff(now);
        }
    }

    fn schedule_launch_backoff(&mut self, now: f64) {
        let next = if self.launch_backoff_ms == 0 {
            LAUNCH_BACKOFF_BASE_MS
        } else {
            (self.launch_backoff_ms * 2).min(LAUNCH_BACKOFF_MAX_MS)
        };
        self.launch_backoff_ms = next;
        self.launch_cooldown_until = Some(now + next as f64 / 1000.0);
    }

    // ========================================================================
    // Status publishing
    // ========================================================================

    fn push_event(&mut self, job_id: JobId, state: JobState) {
        self.pending_events.push(StatusEvent { job_id, state });
    }

    /// Best-effort stream; subscribers needing certainty poll QueryStatus.
    fn publish_pending_events(&mut self) {
        for event in std::mem::take(&mut self.pending_events) {
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    if let Err(e) = send_frames(&self.status_socket, vec![payload]) {
                        debug!("Status publish failed: {e}");
                    } else {
                        METRICS.inc_status_events_published();
                    }
                }
                Err(e) => error!("Status event serialization failed: {e}"),
            }
        }
    }
}

/// Split a routed multipart message into (identity, decoded message).
///
/// REQ-style peers insert an empty delimiter frame after the identity;
/// tolerate both shapes. Undecodable messages are dropped and counted, the
/// peer stays connected.
fn split_routed(frames: &[Vec<u8>]) -> Option<(Vec<u8>, Message)> {
    if frames.len() < 3 {
        warn!("Routed message with {} frames; dropping", frames.len());
        METRICS.inc_decode_errors();
        return None;
    }
    let identity = frames[0].clone();
    let body = if frames[1].is_empty() {
        &frames[2..]
    } else {
        &frames[1..]
    };
    match Message::unpack(body) {
        Ok(msg) => Some((identity, msg)),
        Err(e) => {
            warn!("Dropping undecodable message: {e}");
            METRICS.inc_decode_errors();
            None
        }
    }
}

fn decode<T>(result: std::result::Result<T, ProtocolError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Dropping message with undecodable payload: {e}");
            METRICS.inc_decode_errors();
            None
        }
    }
}

fn current_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::AlwaysSupportFactory;
    use remus_protocol::{ContentEncoding, JobContent, JobSubmission};

    fn io() -> MeshIOType {
        MeshIOType::new("Edges", "Mesh2D")
    }

    fn reqs() -> JobRequirements {
        JobRequirements::new(io(), "")
    }

    fn submission(payload: &[u8]) -> JobSubmission {
        let mut sub = JobSubmission::new(reqs());
        sub.insert(
            "data",
            JobContent::in_memory("raw", ContentEncoding::Binary, payload.to_vec()),
        );
        sub
    }

    struct Harness {
        server: Server,
        client: zmq::Socket,
        worker: zmq::Socket,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let ctx = MessagingContext::new();
            let config = ServerConfig {
                client_endpoint: Endpoint::inproc(format!("{name}-client")),
                worker_endpoint: Endpoint::inproc(format!("{name}-worker")),
                status_endpoint: Endpoint::inproc(format!("{name}-status")),
                heartbeat_interval: Duration::from_millis(100),
                retention_window: Duration::from_millis(400),
                client_timeout: Duration::from_secs(60),
                max_poll_interval: Duration::from_millis(10),
                context: Some(ctx.clone()),
            };
            let server = Server::bind(
                config,
                Box::new(AlwaysSupportFactory::new(vec![io()])),
            )
            .expect("bind server");

            let client = ctx.socket(zmq::DEALER).unwrap();
            client.set_rcvtimeo(2000).unwrap();
            client
                .connect(&server.ports().client.to_string())
                .unwrap();

            let worker = ctx.socket(zmq::DEALER).unwrap();
            worker.set_rcvtimeo(2000).unwrap();
            worker
                .connect(&server.ports().worker.to_string())
                .unwrap();

            Self {
                server,
                client,
                worker,
            }
        }

        fn send(socket: &zmq::Socket, msg: Message) {
            socket.send_multipart(msg.pack(), 0).unwrap();
        }

        fn recv(socket: &zmq::Socket) -> Message {
            let frames = socket.recv_multipart(0).expect("reply");
            Message::unpack(&frames).expect("well-formed reply")
        }

        fn request(&mut self, socket: Side, msg: Message) -> Message {
            let socket = match socket {
                Side::Client => &self.client,
                Side::Worker => &self.worker,
            };
            Self::send(socket, msg);
            self.server.step();
            Self::recv(socket)
        }

        fn submit(&mut self, payload: &[u8]) -> JobId {
            let reply = self.request(
                Side::Client,
                Message::new(ServiceType::SubmitJob, submission(payload).encode()),
            );
            assert_eq!(reply.service, ServiceType::SubmitJob);
            wire::decode_job_id(&reply.payload).unwrap()
        }

        fn status(&mut self, job_id: JobId) -> JobStatusInfo {
            let reply = self.request(
                Side::Client,
                Message::new(ServiceType::QueryStatus, wire::encode_job_id(job_id)),
            );
            JobStatusInfo::decode_payload(&reply.payload).unwrap()
        }

        fn register_worker(&mut self) {
            Self::send(
                &self.worker,
                Message::new(ServiceType::WorkerRegister, reqs().encode()),
            );
            self.server.step();
        }

        fn ask_for_job(&mut self) -> Option<JobAssignment> {
            let reply = self.request(
                Side::Worker,
                Message::new(ServiceType::AskForJob, reqs().encode()),
            );
            assert_eq!(reply.service, ServiceType::AskForJob);
            if reply.is_empty() {
                None
            } else {
                Some(JobAssignment::decode_payload(&reply.payload).unwrap())
            }
        }

        fn send_progress(&mut self, job_id: JobId, state: JobState, message: &str) {
            let mut info = JobStatusInfo::new(job_id, state);
            info.progress.message = Some(message.to_string());
            Self::send(
                &self.worker,
                Message::new(ServiceType::Progress, info.encode()),
            );
            self.server.step();
        }
    }

    enum Side {
        Client,
        Worker,
    }

    #[test]
    fn test_submit_assigns_unique_ids() {
        let mut h = Harness::new("srv-unique");
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            assert!(seen.insert(h.submit(b"x")));
        }
        assert_eq!(h.server.queued_job_count(), 50);
    }

    #[test]
    fn test_accepts_jobs_without_workers() {
        let mut h = Harness::new("srv-noworkers");

        let reply = h.request(
            Side::Client,
            Message::new(ServiceType::CanMeshType, io().encode()),
        );
        assert!(wire::decode_bool(&reply.payload).unwrap());

        let job_id = h.submit(b"payload");
        assert_eq!(h.status(job_id).state, JobState::Queued);

        // A worker arriving later still gets the job, bytes intact.
        h.register_worker();
        h.server.step();
        let assignment = h.ask_for_job().expect("assignment");
        assert_eq!(assignment.job_id, job_id);
        assert_eq!(
            assignment.submission.get("data").unwrap().payload,
            b"payload"
        );
    }

    #[test]
    fn test_in_progress_jobs_match_busy_workers() {
        let mut h = Harness::new("srv-invariant");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();

        let assignment = h.ask_for_job().expect("assignment");
        assert_eq!(assignment.job_id, job_id);
        // Reserved but not yet progressing: still QUEUED, worker busy.
        assert_eq!(h.server.in_progress_job_count(), 0);
        assert_eq!(h.server.busy_worker_count(), 1);

        h.send_progress(job_id, JobState::InProgress, "starting work");
        assert_eq!(h.server.in_progress_job_count(), 1);
        assert_eq!(h.server.busy_worker_count(), 1);
        let status = h.status(job_id);
        assert_eq!(status.state, JobState::InProgress);
        assert_eq!(status.progress.message.as_deref(), Some("starting work"));

        // Result releases the worker and finishes the job together.
        Harness::send(
            &h.worker,
            Message::new(
                ServiceType::Result,
                JobResult::new(job_id, b"Here be results".to_vec()).encode(),
            ),
        );
        h.server.step();
        assert_eq!(h.server.in_progress_job_count(), 0);
        assert_eq!(h.server.busy_worker_count(), 0);
        assert_eq!(h.status(job_id).state, JobState::Finished);
    }

    #[test]
    fn test_finished_via_progress_is_dropped() {
        let mut h = Harness::new("srv-finprogress");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();
        h.ask_for_job().expect("assignment");

        h.send_progress(job_id, JobState::InProgress, "starting work");
        h.send_progress(job_id, JobState::Finished, "done");

        let status = h.status(job_id);
        assert_eq!(status.state, JobState::InProgress);
        assert!(!status.result_available);
    }

    #[test]
    fn test_result_without_progress_is_dropped() {
        let mut h = Harness::new("srv-earlyresult");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();
        h.ask_for_job().expect("assignment");

        // Still QUEUED from the client's point of view; a result now
        // violates the state machine and must not finish the job.
        Harness::send(
            &h.worker,
            Message::new(
                ServiceType::Result,
                JobResult::new(job_id, b"too soon".to_vec()).encode(),
            ),
        );
        h.server.step();
        assert_eq!(h.status(job_id).state, JobState::Queued);
    }

    #[test]
    fn test_result_roundtrip_and_retention() {
        let mut h = Harness::new("srv-retrieve");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();
        h.ask_for_job().expect("assignment");
        h.send_progress(job_id, JobState::InProgress, "meshing");

        Harness::send(
            &h.worker,
            Message::new(
                ServiceType::Result,
                JobResult::new(job_id, b"Here be results".to_vec()).encode(),
            ),
        );
        h.server.step();

        let status = h.status(job_id);
        assert_eq!(status.state, JobState::Finished);
        assert!(status.result_available);

        let reply = h.request(
            Side::Client,
            Message::new(ServiceType::Retrieve, wire::encode_job_id(job_id)),
        );
        let result = JobResult::decode_payload(&reply.payload).unwrap();
        assert_eq!(result.data, b"Here be results");

        // Second retrieval finds nothing.
        let reply = h.request(
            Side::Client,
            Message::new(ServiceType::Retrieve, wire::encode_job_id(job_id)),
        );
        assert!(reply.is_empty());

        // After the retention window the identifier itself is gone.
        std::thread::sleep(Duration::from_millis(500));
        h.server.step();
        assert_eq!(h.status(job_id).state, JobState::Invalid);
    }

    #[test]
    fn test_terminate_queued_job() {
        let mut h = Harness::new("srv-terminate");
        let job_id = h.submit(b"x");

        let reply = h.request(
            Side::Client,
            Message::new(ServiceType::TerminateJob, wire::encode_job_id(job_id)),
        );
        assert!(wire::decode_bool(&reply.payload).unwrap());
        assert_eq!(h.status(job_id).state, JobState::Failed);
        assert_eq!(h.server.queued_job_count(), 0);

        // No worker ever sees it.
        h.register_worker();
        h.server.step();
        assert!(h.ask_for_job().is_none());
    }

    #[test]
    fn test_worker_death_fails_job() {
        let mut h = Harness::new("srv-workerdeath");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();
        h.ask_for_job().expect("assignment");
        h.send_progress(job_id, JobState::InProgress, "started");

        // Five missed heartbeat intervals (100 ms each).
        std::thread::sleep(Duration::from_millis(600));
        h.server.step();

        assert_eq!(h.status(job_id).state, JobState::Failed);
        assert_eq!(h.server.connected_worker_count(), 0);
        assert_eq!(h.server.busy_worker_count(), 0);
    }

    #[test]
    fn test_unknown_job_is_invalid_status() {
        let mut h = Harness::new("srv-unknown");
        let status = h.status(JobId::mint());
        assert_eq!(status.state, JobState::Invalid);
    }

    #[test]
    fn test_retrieve_by_non_submitter_is_refused() {
        let mut h = Harness::new("srv-owner");
        h.register_worker();
        let job_id = h.submit(b"x");
        h.server.step();
        h.ask_for_job().expect("assignment");
        h.send_progress(job_id, JobState::InProgress, "meshing");
        Harness::send(
            &h.worker,
            Message::new(
                ServiceType::Result,
                JobResult::new(job_id, b"secret".to_vec()).encode(),
            ),
        );
        h.server.step();

        // A different client identity asks for the result.
        let stranger = h.server.messaging_context().socket(zmq::DEALER).unwrap();
        stranger.set_rcvtimeo(2000).unwrap();
        stranger
            .connect(&h.server.ports().client.to_string())
            .unwrap();
        Harness::send(
            &stranger,
            Message::new(ServiceType::Retrieve, wire::encode_job_id(job_id)),
        );
        h.server.step();
        let reply = Harness::recv(&stranger);
        assert!(reply.is_empty());

        // The submitter still gets it.
        let reply = h.request(
            Side::Client,
            Message::new(ServiceType::Retrieve, wire::encode_job_id(job_id)),
        );
        let result = JobResult::decode_payload(&reply.payload).unwrap();
        assert_eq!(result.data, b"secret");
    }

    #[test]
    fn test_undecodable_message_does_not_disconnect_peer() {
        let mut h = Harness::new("srv-badframe");
        h.client
            .send_multipart([b"garbage".to_vec()], 0)
            .unwrap();
        h.server.step();

        // The same peer can still submit normally.
        let job_id = h.submit(b"x");
        assert_eq!(h.status(job_id).state, JobState::Queued);
    }
}
