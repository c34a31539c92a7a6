//! Wire protocol for the Remus job broker.
//!
//! Every message is a multipart frame sequence. Routed sockets carry the
//! peer identity as frame 0; the codec below sees the frames after it:
//!
//! ```text
//! [VERSION:1][SERVICE_TAG:1][PAYLOAD...]
//! ```
//!
//! - VERSION: one-byte protocol version (0x01)
//! - SERVICE_TAG: one-byte service selector ([`ServiceType`])
//! - PAYLOAD: zero or one frame of service-specific binary encoding
//!   (see [`wire`]); a missing payload frame is an empty reply
//!
//! Field encoding inside a payload frame: 64-bit little-endian lengths,
//! length-prefixed UTF-8 strings, 16 raw bytes for job IDs.

pub mod error;
pub mod types;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use types::{
    ContentEncoding, ContentFormat, ContentSource, JobAssignment, JobContent, JobId, JobProgress,
    JobRequirements, JobResult, JobState, JobStatusInfo, JobSubmission, MeshIOType, StatusEvent,
};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Service selector carried in the second frame of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceType {
    // Client -> Server (request/reply)
    CanMeshType = 0x01,        // MeshIOType -> bool
    CanMeshRequirements = 0x02, // JobRequirements -> bool
    RetrieveRequirements = 0x03, // MeshIOType -> requirements set
    SubmitJob = 0x04,          // JobSubmission -> job id
    QueryStatus = 0x05,        // job id -> JobStatusInfo
    Retrieve = 0x06,           // job id -> JobResult or empty
    TerminateJob = 0x07,       // job id -> bool

    // Worker <-> Server
    WorkerRegister = 0x10, // JobRequirements
    AskForJob = 0x11,      // JobRequirements -> JobAssignment or empty
    Progress = 0x12,       // JobStatusInfo
    Result = 0x13,         // JobResult
    Failure = 0x14,        // job id
    Heartbeat = 0x15,      // no payload
    Terminate = 0x16,      // job id (server -> worker)
}

impl ServiceType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ServiceType::CanMeshType),
            0x02 => Ok(ServiceType::CanMeshRequirements),
            0x03 => Ok(ServiceType::RetrieveRequirements),
            0x04 => Ok(ServiceType::SubmitJob),
            0x05 => Ok(ServiceType::QueryStatus),
            0x06 => Ok(ServiceType::Retrieve),
            0x07 => Ok(ServiceType::TerminateJob),
            0x10 => Ok(ServiceType::WorkerRegister),
            0x11 => Ok(ServiceType::AskForJob),
            0x12 => Ok(ServiceType::Progress),
            0x13 => Ok(ServiceType::Result),
            0x14 => Ok(ServiceType::Failure),
            0x15 => Ok(ServiceType::Heartbeat),
            0x16 => Ok(ServiceType::Terminate),
            other => Err(ProtocolError::InvalidServiceTag(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded protocol message: the service selector plus its raw payload.
///
/// Payload interpretation is up to the handler; [`wire`] holds the
/// per-service encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub service: ServiceType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(service: ServiceType, payload: Vec<u8>) -> Self {
        Self { service, payload }
    }

    /// A message with no payload frame (empty reply, heartbeat).
    pub fn empty(service: ServiceType) -> Self {
        Self {
            service,
            payload: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Pack into wire frames (version, tag, payload when present).
    pub fn pack(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![vec![PROTOCOL_VERSION], vec![self.service.as_u8()]];
        if !self.payload.is_empty() {
            frames.push(self.payload.clone());
        }
        frames
    }

    /// Unpack from wire frames (after any routing prefix was stripped).
    pub fn unpack(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() < 2 {
            return Err(ProtocolError::InvalidFrameCount {
                expected: 2,
                got: frames.len(),
            });
        }
        if frames.len() > 3 {
            return Err(ProtocolError::InvalidFrameCount {
                expected: 3,
                got: frames.len(),
            });
        }

        let version_frame = &frames[0];
        if version_frame.len() != 1 {
            return Err(ProtocolError::MalformedFrame {
                what: "version",
                len: version_frame.len(),
            });
        }
        if version_frame[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version_frame[0],
            });
        }

        let tag_frame = &frames[1];
        if tag_frame.len() != 1 {
            return Err(ProtocolError::MalformedFrame {
                what: "service tag",
                len: tag_frame.len(),
            });
        }
        let service = ServiceType::from_u8(tag_frame[0])?;

        let payload = frames.get(2).cloned().unwrap_or_default();
        Ok(Self { service, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_pack_unpack() {
        let msg = Message::new(ServiceType::SubmitJob, b"payload".to_vec());
        let frames = msg.pack();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![PROTOCOL_VERSION]);
        assert_eq!(frames[1], vec![0x04]);

        let unpacked = Message::unpack(&frames).unwrap();
        assert_eq!(unpacked, msg);
    }

    #[test]
    fn test_empty_message_has_two_frames() {
        let msg = Message::empty(ServiceType::Heartbeat);
        let frames = msg.pack();
        assert_eq!(frames.len(), 2);

        let unpacked = Message::unpack(&frames).unwrap();
        assert_eq!(unpacked.service, ServiceType::Heartbeat);
        assert!(unpacked.is_empty());
    }

    #[test]
    fn test_service_tag_roundtrip() {
        for tag in [
            ServiceType::CanMeshType,
            ServiceType::CanMeshRequirements,
            ServiceType::RetrieveRequirements,
            ServiceType::SubmitJob,
            ServiceType::QueryStatus,
            ServiceType::Retrieve,
            ServiceType::TerminateJob,
            ServiceType::WorkerRegister,
            ServiceType::AskForJob,
            ServiceType::Progress,
            ServiceType::Result,
            ServiceType::Failure,
            ServiceType::Heartbeat,
            ServiceType::Terminate,
        ] {
            assert_eq!(ServiceType::from_u8(tag.as_u8()).unwrap(), tag);
        }
    }

    #[test]
    fn test_unknown_service_tag() {
        let frames = vec![vec![PROTOCOL_VERSION], vec![0x42]];
        let err = Message::unpack(&frames).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidServiceTag(0x42)));
    }

    #[test]
    fn test_version_mismatch() {
        let frames = vec![vec![0x09], vec![0x01]];
        let err = Message::unpack(&frames).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch { expected: 0x01, got: 0x09 }
        ));
    }

    #[test]
    fn test_short_and_long_frame_sequences() {
        assert!(matches!(
            Message::unpack(&[vec![PROTOCOL_VERSION]]).unwrap_err(),
            ProtocolError::InvalidFrameCount { got: 1, .. }
        ));

        let frames = vec![vec![PROTOCOL_VERSION], vec![0x01], vec![], vec![]];
        assert!(matches!(
            Message::unpack(&frames).unwrap_err(),
            ProtocolError::InvalidFrameCount { got: 4, .. }
        ));
    }

    #[test]
    fn test_multibyte_version_frame_rejected() {
        let frames = vec![vec![PROTOCOL_VERSION, 0x00], vec![0x01]];
        let err = Message::unpack(&frames).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedFrame { what: "version", .. }
        ));
    }
}
