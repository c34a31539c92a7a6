//! Core data model for the job broker.
//!
//! These types travel between clients, the server, and workers. The broker
//! treats job payloads as opaque bytes; only the requirements key and the
//! lifecycle state are interpreted.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique job identifier (16 raw bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Mint a fresh identifier.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered pair of mesh-kind tags: what goes in, what comes out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshIOType {
    pub input: String,
    pub output: String,
}

impl MeshIOType {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for MeshIOType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.input, self.output)
    }
}

/// The matchable key used to route a job to a compatible worker.
///
/// An empty `worker_name` means "any worker that handles the IO type".
/// The optional payload is opaque to the broker and compared bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRequirements {
    pub io_type: MeshIOType,
    pub worker_name: String,
    pub payload: Option<Vec<u8>>,
}

impl JobRequirements {
    pub fn new(io_type: MeshIOType, worker_name: impl Into<String>) -> Self {
        Self {
            io_type,
            worker_name: worker_name.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// True when a job asking for `self` can run on a worker advertising
    /// `advertised`. Structural equality, except that an empty worker name
    /// on the job side is a wildcard.
    pub fn matches(&self, advertised: &JobRequirements) -> bool {
        self.io_type == advertised.io_type
            && (self.worker_name.is_empty() || self.worker_name == advertised.worker_name)
            && self.payload == advertised.payload
    }
}

/// Where a content payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    InMemory,
    FilePath,
}

impl ContentSource {
    pub fn as_u8(self) -> u8 {
        match self {
            ContentSource::InMemory => 0,
            ContentSource::FilePath => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ContentSource::InMemory),
            1 => Some(ContentSource::FilePath),
            _ => None,
        }
    }
}

/// How the payload bytes should be interpreted by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    Text,
    Binary,
}

impl ContentEncoding {
    pub fn as_u8(self) -> u8 {
        match self {
            ContentEncoding::Text => 0,
            ContentEncoding::Binary => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ContentEncoding::Text),
            1 => Some(ContentEncoding::Binary),
            _ => None,
        }
    }
}

/// User-defined format tag on a content payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFormat {
    pub name: String,
    pub encoding: ContentEncoding,
}

/// One payload item inside a submission. Opaque to the broker; persisted
/// verbatim until the job is handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContent {
    pub source: ContentSource,
    pub format: ContentFormat,
    pub payload: Vec<u8>,
}

impl JobContent {
    /// In-memory payload with a named format.
    pub fn in_memory(
        name: impl Into<String>,
        encoding: ContentEncoding,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            source: ContentSource::InMemory,
            format: ContentFormat {
                name: name.into(),
                encoding,
            },
            payload,
        }
    }

    /// Payload referring to a file the worker should read itself.
    pub fn file_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source: ContentSource::FilePath,
            format: ContentFormat {
                name: name.into(),
                encoding: ContentEncoding::Text,
            },
            payload: path.into().into_bytes(),
        }
    }
}

/// A requirements value plus a keyed bag of payload contents.
///
/// Keys are unique and iteration preserves insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub requirements: JobRequirements,
    entries: Vec<(String, JobContent)>,
}

impl JobSubmission {
    pub fn new(requirements: JobRequirements) -> Self {
        Self {
            requirements,
            entries: Vec::new(),
        }
    }

    /// Insert a keyed payload. Returns false (and leaves the submission
    /// unchanged) when the key is already present.
    pub fn insert(&mut self, key: impl Into<String>, content: JobContent) -> bool {
        let key = key.into();
        if self.entries.iter().any(|(k, _)| *k == key) {
            return false;
        }
        self.entries.push((key, content));
        true
    }

    pub fn get(&self, key: &str) -> Option<&JobContent> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobContent)> {
        self.entries.iter().map(|(k, c)| (k.as_str(), c))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lifecycle state of a job as visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    InProgress,
    Finished,
    Failed,
    Expired,
    #[serde(rename = "INVALID_STATUS")]
    Invalid,
}

impl JobState {
    pub fn as_u8(self) -> u8 {
        match self {
            JobState::Queued => 1,
            JobState::InProgress => 2,
            JobState::Finished => 3,
            JobState::Failed => 4,
            JobState::Expired => 5,
            JobState::Invalid => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(JobState::Queued),
            2 => Some(JobState::InProgress),
            3 => Some(JobState::Finished),
            4 => Some(JobState::Failed),
            5 => Some(JobState::Expired),
            6 => Some(JobState::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Expired => "EXPIRED",
            JobState::Invalid => "INVALID_STATUS",
        }
    }

    /// Terminal states never transition again (except to expiry reaping).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Expired
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-reported progress: a 1..=100 value and/or a free-form message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub value: Option<u32>,
    pub message: Option<String>,
}

impl JobProgress {
    pub fn with_value(value: u32) -> Self {
        Self {
            value: Some(value.clamp(1, 100)),
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            value: None,
            message: Some(message.into()),
        }
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = Some(value.clamp(1, 100));
    }
}

/// Full status of a job: lifecycle state, latest progress, and whether a
/// result is waiting to be retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusInfo {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: JobProgress,
    pub result_available: bool,
}

impl JobStatusInfo {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            progress: JobProgress::default(),
            result_available: false,
        }
    }

    /// The reply for identifiers the broker does not know (anymore).
    pub fn invalid(job_id: JobId) -> Self {
        Self::new(job_id, JobState::Invalid)
    }
}

/// Final output of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: JobId,
    pub data: Vec<u8>,
}

impl JobResult {
    pub fn new(job_id: JobId, data: Vec<u8>) -> Self {
        Self { job_id, data }
    }
}

/// A job handed to a worker: the minted identifier plus the submission
/// payload the client uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAssignment {
    pub job_id: JobId,
    pub submission: JobSubmission,
}

/// One entry of the status-publish stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub state: JobState,
}
