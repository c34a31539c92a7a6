//! Remus client library.
//!
//! A simple synchronous client for submitting mesh-generation jobs to a
//! Remus broker and tracking them to completion, plus a subscriber for the
//! broker's best-effort status stream.

use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::debug;

use remus_protocol::{
    wire, JobId, JobRequirements, JobResult, JobStatusInfo, JobSubmission, Message, MeshIOType,
    ServiceType, StatusEvent,
};
use remus_transport::{Endpoint, MessagingContext};

/// Default timeout for broker requests (5 seconds)
const DEFAULT_TIMEOUT_MS: i32 = 5000;

/// Client for the broker's job services.
pub struct Client {
    socket: zmq::Socket,
    context: MessagingContext,
}

impl Client {
    /// Connect to the broker's client endpoint.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_with(
            endpoint,
            None,
            Duration::from_millis(DEFAULT_TIMEOUT_MS as u64),
        )
    }

    /// Connect with an explicit context (required for `inproc` brokers) and
    /// request timeout.
    pub fn connect_with(
        endpoint: &Endpoint,
        context: Option<MessagingContext>,
        timeout: Duration,
    ) -> Result<Self> {
        let context = context.unwrap_or_default();
        let socket = context
            .socket(zmq::DEALER)
            .context("Failed to create DEALER socket")?;

        let timeout_ms = timeout.as_millis() as i32;
        socket
            .set_rcvtimeo(timeout_ms)
            .context("Failed to set receive timeout")?;
        socket
            .set_sndtimeo(timeout_ms)
            .context("Failed to set send timeout")?;
        socket.set_linger(0).context("Failed to set linger")?;

        socket
            .connect(&endpoint.to_string())
            .with_context(|| format!("Failed to connect to broker at {endpoint}"))?;

        Ok(Self { socket, context })
    }

    /// The context this client's socket lives on.
    pub fn messaging_context(&self) -> MessagingContext {
        self.context.clone()
    }

    /// Send a request and wait for the matching reply.
    fn request(&self, msg: Message) -> Result<Message> {
        let service = msg.service;
        self.socket
            .send_multipart(msg.pack(), 0)
            .context("Failed to send request")?;

        // Replies arrive in order on this socket; skip anything that is not
        // an answer to the outstanding request.
        loop {
            let frames = self
                .socket
                .recv_multipart(0)
                .context("No reply from broker (timeout or connection error)")?;
            let reply = Message::unpack(&frames).context("Malformed reply from broker")?;
            if reply.service == service {
                return Ok(reply);
            }
            debug!("Skipping out-of-band {:?} reply", reply.service);
        }
    }

    /// Can anything (connected or launchable) mesh this IO type?
    pub fn can_mesh(&self, io: &MeshIOType) -> Result<bool> {
        let reply = self.request(Message::new(ServiceType::CanMeshType, io.encode()))?;
        Ok(wire::decode_bool(&reply.payload)?)
    }

    /// Can anything serve exactly these requirements?
    pub fn can_mesh_requirements(&self, reqs: &JobRequirements) -> Result<bool> {
        let reply = self.request(Message::new(
            ServiceType::CanMeshRequirements,
            reqs.encode(),
        ))?;
        Ok(wire::decode_bool(&reply.payload)?)
    }

    /// Every requirement variant available for an IO type.
    pub fn retrieve_requirements(&self, io: &MeshIOType) -> Result<Vec<JobRequirements>> {
        let reply = self.request(Message::new(ServiceType::RetrieveRequirements, io.encode()))?;
        Ok(wire::decode_requirements_set(&reply.payload)?)
    }

    /// Submit a job; returns the broker-minted job identifier.
    pub fn submit_job(&self, submission: &JobSubmission) -> Result<JobId> {
        let reply = self.request(Message::new(ServiceType::SubmitJob, submission.encode()))?;
        if reply.is_empty() {
            bail!("Broker refused the submission");
        }
        Ok(wire::decode_job_id(&reply.payload)?)
    }

    /// Current status of a job. Unknown or reaped identifiers come back
    /// with the invalid-status marker state.
    pub fn job_status(&self, job_id: JobId) -> Result<JobStatusInfo> {
        let reply = self.request(Message::new(
            ServiceType::QueryStatus,
            wire::encode_job_id(job_id),
        ))?;
        Ok(JobStatusInfo::decode_payload(&reply.payload)?)
    }

    /// Fetch the result of a finished job. `None` when no result is
    /// available (not finished, already retrieved, or expired).
    pub fn retrieve_results(&self, job_id: JobId) -> Result<Option<Vec<u8>>> {
        let reply = self.request(Message::new(
            ServiceType::Retrieve,
            wire::encode_job_id(job_id),
        ))?;
        if reply.is_empty() {
            return Ok(None);
        }
        let result = JobResult::decode_payload(&reply.payload)?;
        Ok(Some(result.data))
    }

    /// Ask the broker to cancel a job. True means the request was accepted,
    /// not that the job is already gone; poll [`Client::job_status`] for
    /// the final state.
    pub fn terminate_job(&self, job_id: JobId) -> Result<bool> {
        let reply = self.request(Message::new(
            ServiceType::TerminateJob,
            wire::encode_job_id(job_id),
        ))?;
        Ok(wire::decode_bool(&reply.payload)?)
    }
}

/// Subscriber for the broker's status stream.
///
/// The stream is best-effort: events may be dropped, and correctness-
/// sensitive callers must poll [`Client::job_status`] instead.
pub struct StatusListener {
    socket: zmq::Socket,
    #[allow(dead_code)]
    context: MessagingContext, // Keep context alive
}

impl StatusListener {
    pub fn connect(endpoint: &Endpoint, context: Option<MessagingContext>) -> Result<Self> {
        let context = context.unwrap_or_default();
        let socket = context
            .socket(zmq::SUB)
            .context("Failed to create SUB socket")?;
        socket
            .set_subscribe(b"")
            .context("Failed to subscribe to status stream")?;
        socket
            .connect(&endpoint.to_string())
            .with_context(|| format!("Failed to connect to status stream at {endpoint}"))?;
        Ok(Self { socket, context })
    }

    /// Wait up to `timeout` for the next status event.
    pub fn next_event(&self, timeout: Duration) -> Result<Option<StatusEvent>> {
        self.socket
            .set_rcvtimeo(timeout.as_millis() as i32)
            .context("Failed to set receive timeout")?;
        match self.socket.recv_bytes(0) {
            Ok(bytes) => {
                let event: StatusEvent =
                    serde_json::from_slice(&bytes).context("Malformed status event")?;
                Ok(Some(event))
            }
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e).context("Status stream receive failed"),
        }
    }
}
