//! Worker node.
//!
//! Connects to the broker's worker endpoint, advertises what it can mesh,
//! and polls for work with an adaptive backoff. Jobs execute inline through
//! a [`JobHandler`]; long-running handlers report progress and watch for
//! termination through the [`JobContext`] they are given.

use anyhow::{Context, Result};
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use remus_protocol::{
    wire, JobAssignment, JobId, JobProgress, JobRequirements, JobResult, JobState, JobStatusInfo,
    JobSubmission, Message, ServiceType,
};
use remus_transport::{poll_readable, recv_frames, send_frames, Endpoint, MessagingContext};

use crate::polling::{PollBackoff, PollingRates};

/// How long to wait for the broker's reply to one work request.
const ASK_REPLY_TIMEOUT_MS: i64 = 1_000;

/// Worker configuration (plain data).
pub struct WorkerConfig {
    pub server_endpoint: Endpoint,
    /// Requirement variants this worker advertises; at least one.
    pub requirements: Vec<JobRequirements>,
    pub heartbeat_interval: Duration,
    pub polling: PollingRates,
}

impl WorkerConfig {
    pub fn new(server_endpoint: Endpoint, requirements: Vec<JobRequirements>) -> Self {
        Self {
            server_endpoint,
            requirements,
            heartbeat_interval: Duration::from_secs(1),
            polling: PollingRates::default(),
        }
    }
}

/// The job a handler is currently meshing.
pub struct ActiveJob {
    pub id: JobId,
    pub submission: JobSubmission,
}

/// User-supplied meshing logic.
pub trait JobHandler {
    fn mesh(&mut self, job: &ActiveJob, ctx: &mut JobContext<'_>) -> Result<Vec<u8>>;
}

impl<F> JobHandler for F
where
    F: FnMut(&ActiveJob, &mut JobContext<'_>) -> Result<Vec<u8>>,
{
    fn mesh(&mut self, job: &ActiveJob, ctx: &mut JobContext<'_>) -> Result<Vec<u8>> {
        self(job, ctx)
    }
}

/// Handle a running handler uses to talk back to the broker.
///
/// Handlers should call [`JobContext::update_progress`] (or at least
/// [`JobContext::terminate_requested`]) regularly; both double as liveness
/// signals, and a silent worker is reaped after five missed heartbeats.
pub struct JobContext<'a> {
    socket: &'a zmq::Socket,
    job_id: JobId,
    heartbeat_interval: f64,
    last_heartbeat: f64,
    terminated: bool,
}

impl<'a> JobContext<'a> {
    fn new(socket: &'a zmq::Socket, job_id: JobId, heartbeat_interval: f64, now: f64) -> Self {
        Self {
            socket,
            job_id,
            heartbeat_interval,
            last_heartbeat: now,
            terminated: false,
        }
    }

    /// Report progress on the active job.
    pub fn update_progress(&mut self, value: Option<u32>, message: Option<&str>) -> Result<()> {
        let mut info = JobStatusInfo::new(self.job_id, JobState::InProgress);
        info.progress = JobProgress {
            value: value.map(|v| v.clamp(1, 100)),
            message: message.map(str::to_string),
        };
        send_message(self.socket, Message::new(ServiceType::Progress, info.encode()))?;
        self.last_heartbeat = current_time();
        Ok(())
    }

    /// Check whether the broker asked to cancel the active job, sending a
    /// heartbeat when one is due. Sticky once observed.
    pub fn terminate_requested(&mut self) -> bool {
        let now = current_time();
        if now - self.last_heartbeat >= self.heartbeat_interval {
            if let Err(e) = send_message(self.socket, Message::empty(ServiceType::Heartbeat)) {
                warn!("Heartbeat failed: {e}");
            }
            self.last_heartbeat = now;
        }

        loop {
            match recv_frames(self.socket) {
                Ok(Some(frames)) => match Message::unpack(&frames) {
                    Ok(msg) if msg.service == ServiceType::Terminate => {
                        match wire::decode_job_id(&msg.payload) {
                            Ok(id) if id == self.job_id => {
                                info!("Job {id}: termination requested");
                                self.terminated = true;
                            }
                            _ => {}
                        }
                    }
                    Ok(msg) => debug!("Ignoring {:?} while meshing", msg.service),
                    Err(e) => warn!("Dropping undecodable message: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Recv error while meshing: {e}");
                    break;
                }
            }
        }
        self.terminated
    }
}

/// Active worker with a connected socket.
pub struct Worker {
    context: MessagingContext,
    socket: zmq::Socket,
    config: WorkerConfig,
    backoff: PollBackoff,
    last_heartbeat: f64,
    running: bool,
}

impl Worker {
    /// Connect to the broker and advertise every requirement variant.
    ///
    /// Pass the broker's context to talk over `inproc`; without one the
    /// worker creates its own.
    pub fn connect(config: WorkerConfig, context: Option<MessagingContext>) -> Result<Self> {
        let context = context.unwrap_or_default();
        let socket = context
            .socket(zmq::DEALER)
            .context("Failed to create DEALER socket")?;
        socket.set_linger(0).context("Failed to set linger")?;
        socket
            .connect(&config.server_endpoint.to_string())
            .with_context(|| format!("Failed to connect to {}", config.server_endpoint))?;

        for reqs in &config.requirements {
            send_message(
                &socket,
                Message::new(ServiceType::WorkerRegister, reqs.encode()),
            )?;
        }
        info!(
            "Connected to {} advertising {} requirement variant(s)",
            config.server_endpoint,
            config.requirements.len()
        );

        let backoff = PollBackoff::new(config.polling);
        Ok(Self {
            context,
            socket,
            config,
            backoff,
            last_heartbeat: current_time(),
            running: false,
        })
    }

    pub fn messaging_context(&self) -> MessagingContext {
        self.context.clone()
    }

    /// Main event loop: poll for work, execute, report.
    pub fn run(&mut self, handler: &mut dyn JobHandler) -> Result<()> {
        self.run_inner(handler, None)
    }

    /// Main event loop with a shutdown channel.
    pub fn run_with_shutdown(
        &mut self,
        handler: &mut dyn JobHandler,
        stop_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.run_inner(handler, Some(stop_rx))
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    fn run_inner(
        &mut self,
        handler: &mut dyn JobHandler,
        stop_rx: Option<mpsc::Receiver<()>>,
    ) -> Result<()> {
        self.running = true;
        info!("Worker loop started");

        while self.running {
            if let Some(rx) = stop_rx.as_ref() {
                match rx.try_recv() {
                    Ok(()) | Err(mpsc::TryRecvError::Disconnected) => {
                        info!("Worker received stop signal");
                        break;
                    }
                    Err(mpsc::TryRecvError::Empty) => {}
                }
            }

            self.maybe_heartbeat();

            match self.ask_for_job() {
                Ok(Some(assignment)) => {
                    self.backoff.reset();
                    self.execute(assignment, handler);
                }
                Ok(None) => {
                    self.idle_wait();
                    self.backoff.backoff();
                }
                Err(e) => {
                    error!("Work request failed: {e}");
                    self.idle_wait();
                    self.backoff.backoff();
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// One request/reply against the broker's work queue.
    fn ask_for_job(&mut self) -> Result<Option<JobAssignment>> {
        let reqs = self
            .config
            .requirements
            .first()
            .context("Worker advertises no requirements")?;
        send_message(
            &self.socket,
            Message::new(ServiceType::AskForJob, reqs.encode()),
        )?;

        let deadline = current_time() + ASK_REPLY_TIMEOUT_MS as f64 / 1000.0;
        loop {
            let remaining_ms = ((deadline - current_time()) * 1000.0) as i64;
            if remaining_ms <= 0 {
                debug!("No reply to work request");
                return Ok(None);
            }
            {
                let mut items = [self.socket.as_poll_item(zmq::POLLIN)];
                match poll_readable(&mut items, remaining_ms)? {
                    remus_transport::PollOutcome::Ready(_) => {}
                    remus_transport::PollOutcome::TimedOut => continue,
                    remus_transport::PollOutcome::Interrupted => return Ok(None),
                }
            }
            let Some(frames) = recv_frames(&self.socket)? else {
                continue;
            };
            match Message::unpack(&frames) {
                Ok(msg) if msg.service == ServiceType::AskForJob => {
                    if msg.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(JobAssignment::decode_payload(&msg.payload)?));
                }
                // Stale terminations for jobs this worker no longer runs.
                Ok(msg) => debug!("Ignoring {:?} while idle", msg.service),
                Err(e) => warn!("Dropping undecodable message: {e}"),
            }
        }
    }

    fn execute(&mut self, assignment: JobAssignment, handler: &mut dyn JobHandler) {
        let job_id = assignment.job_id;
        info!("Meshing job {job_id}");

        let now = current_time();
        let mut ctx = JobContext::new(
            &self.socket,
            job_id,
            self.config.heartbeat_interval.as_secs_f64(),
            now,
        );
        // First progress report moves the job out of its queued state.
        if let Err(e) = ctx.update_progress(None, Some("job accepted")) {
            warn!("Job {job_id}: initial progress report failed: {e}");
        }

        let job = ActiveJob {
            id: job_id,
            submission: assignment.submission,
        };
        let outcome = handler.mesh(&job, &mut ctx);
        self.last_heartbeat = current_time();

        match outcome {
            Ok(data) => {
                info!("Job {job_id} meshed ({} result bytes)", data.len());
                let result = JobResult::new(job_id, data);
                if let Err(e) = send_message(
                    &self.socket,
                    Message::new(ServiceType::Result, result.encode()),
                ) {
                    error!("Job {job_id}: result send failed: {e}");
                }
            }
            Err(e) => {
                warn!("Job {job_id} failed: {e}");
                if let Err(send_err) = send_message(
                    &self.socket,
                    Message::new(ServiceType::Failure, wire::encode_job_id(job_id)),
                ) {
                    error!("Job {job_id}: failure send failed: {send_err}");
                }
            }
        }
    }

    fn maybe_heartbeat(&mut self) {
        let now = current_time();
        if now - self.last_heartbeat >= self.config.heartbeat_interval.as_secs_f64() {
            if let Err(e) = send_message(&self.socket, Message::empty(ServiceType::Heartbeat)) {
                warn!("Heartbeat failed: {e}");
            }
            self.last_heartbeat = now;
        }
    }

    /// Sleep out the current backoff delay, waking early for traffic.
    fn idle_wait(&mut self) {
        let delay_ms = self.backoff.current_ms() as i64;
        if delay_ms == 0 {
            return;
        }
        let mut items = [self.socket.as_poll_item(zmq::POLLIN)];
        let _ = poll_readable(&mut items, delay_ms);
    }
}

fn send_message(socket: &zmq::Socket, msg: Message) -> Result<()> {
    send_frames(socket, msg.pack())?;
    Ok(())
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
    use remus_protocol::{ContentEncoding, JobContent, MeshIOType};
    use std::thread;

    fn reqs() -> JobRequirements {
        JobRequirements::new(MeshIOType::new("Edges", "Mesh2D"), "triangle")
    }

    fn recv_message(router: &zmq::Socket) -> (Vec<u8>, Message) {
        let frames = router.recv_multipart(0).expect("router recv");
        assert!(frames.len() >= 3);
        let identity = frames[0].clone();
        let msg = Message::unpack(&frames[1..]).expect("well-formed frames");
        (identity, msg)
    }

    /// Drive a scripted broker over inproc: the worker registers, asks for
    /// work, meshes the assignment, and reports progress then a result.
    #[test]
    fn test_worker_lifecycle_against_scripted_broker() {
        let ctx = MessagingContext::new();
        let router = ctx.socket(zmq::ROUTER).unwrap();
        router.set_rcvtimeo(2000).unwrap();
        router.bind("inproc://worker-lifecycle").unwrap();

        let mut config = WorkerConfig::new(Endpoint::inproc("worker-lifecycle"), vec![reqs()]);
        config.polling = PollingRates::new(10, 50);
        let mut worker = Worker::connect(config, Some(ctx.clone())).unwrap();

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut handler = |job: &ActiveJob, ctx: &mut JobContext<'_>| -> Result<Vec<u8>> {
                ctx.update_progress(Some(50), Some("halfway"))?;
                assert!(!ctx.terminate_requested());
                let data = job.submission.get("data").expect("data key");
                Ok(data.payload.iter().rev().copied().collect())
            };
            worker.run_with_shutdown(&mut handler, stop_rx).unwrap();
        });

        // Registration arrives first.
        let (_identity, msg) = recv_message(&router);
        assert_eq!(msg.service, ServiceType::WorkerRegister);
        let advertised = JobRequirements::decode_payload(&msg.payload).unwrap();
        assert_eq!(advertised, reqs());

        // Answer the first ask with an assignment.
        let assignment = loop {
            let (ask_identity, msg) = recv_message(&router);
            match msg.service {
                ServiceType::AskForJob => {
                    let job_id = JobId::mint();
                    let mut submission = JobSubmission::new(reqs());
                    submission.insert(
                        "data",
                        JobContent::in_memory("raw", ContentEncoding::Binary, vec![1, 2, 3]),
                    );
                    let assignment = JobAssignment { job_id, submission };
                    let mut frames = vec![ask_identity];
                    frames.extend(
                        Message::new(ServiceType::AskForJob, assignment.encode()).pack(),
                    );
                    router.send_multipart(frames, 0).unwrap();
                    break assignment;
                }
                ServiceType::Heartbeat => continue,
                other => panic!("unexpected {other:?}"),
            }
        };

        // Progress reports (the automatic one plus the handler's), then the
        // reversed payload as the result.
        let mut saw_halfway = false;
        loop {
            let (_, msg) = recv_message(&router);
            match msg.service {
                ServiceType::Progress => {
                    let info = JobStatusInfo::decode_payload(&msg.payload).unwrap();
                    assert_eq!(info.job_id, assignment.job_id);
                    assert_eq!(info.state, JobState::InProgress);
                    if info.progress.message.as_deref() == Some("halfway") {
                        assert_eq!(info.progress.value, Some(50));
                        saw_halfway = true;
                    }
                }
                ServiceType::Result => {
                    let result = JobResult::decode_payload(&msg.payload).unwrap();
                    assert_eq!(result.job_id, assignment.job_id);
                    assert_eq!(result.data, vec![3, 2, 1]);
                    break;
                }
                ServiceType::Heartbeat | ServiceType::AskForJob => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_halfway);

        stop_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    /// A failing handler reports Failure rather than a result.
    #[test]
    fn test_failing_handler_reports_failure() {
        let ctx = MessagingContext::new();
        let router = ctx.socket(zmq::ROUTER).unwrap();
        router.set_rcvtimeo(2000).unwrap();
        router.bind("inproc://worker-failure").unwrap();

        let mut config = WorkerConfig::new(Endpoint::inproc("worker-failure"), vec![reqs()]);
        config.polling = PollingRates::new(10, 50);
        let mut worker = Worker::connect(config, Some(ctx.clone())).unwrap();

        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut handler = |_: &ActiveJob, _: &mut JobContext<'_>| -> Result<Vec<u8>> {
                anyhow::bail!("mesher exploded")
            };
            worker.run_with_shutdown(&mut handler, stop_rx).unwrap();
        });

        let job_id = JobId::mint();
        loop {
            let (identity, msg) = recv_message(&router);
            match msg.service {
                ServiceType::AskForJob => {
                    let assignment = JobAssignment {
                        job_id,
                        submission: JobSubmission::new(reqs()),
                    };
                    let mut frames = vec![identity];
                    frames.extend(
                        Message::new(ServiceType::AskForJob, assignment.encode()).pack(),
                    );
                    router.send_multipart(frames, 0).unwrap();
                    break;
                }
                _ => continue,
            }
        }

        loop {
            let (_, msg) = recv_message(&router);
            match msg.service {
                ServiceType::Failure => {
                    assert_eq!(wire::decode_job_id(&msg.payload).unwrap(), job_id);
                    break;
                }
                ServiceType::Progress | ServiceType::Heartbeat | ServiceType::AskForJob => {
                    continue
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        stop_tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
