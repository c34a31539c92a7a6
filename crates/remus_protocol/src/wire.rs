//! Binary payload encoding.
//!
//! All lengths are 64-bit little-endian; strings are length-prefixed UTF-8;
//! job IDs are 16 raw bytes. Every encoding is self-delimiting so compound
//! payloads concatenate without separators.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{ProtocolError, Result};
use crate::types::{
    ContentEncoding, ContentFormat, ContentSource, JobAssignment, JobContent, JobId, JobProgress,
    JobRequirements, JobResult, JobState, JobStatusInfo, JobSubmission, MeshIOType,
};

/// Sequential reader over a payload frame.
pub struct Reader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(payload),
        }
    }

    fn remaining(&self) -> usize {
        self.cur.get_ref().len() - self.cur.position() as usize
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8> {
        self.cur
            .read_u8()
            .map_err(|_| ProtocolError::Truncated { what })
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32> {
        self.cur
            .read_u32::<LittleEndian>()
            .map_err(|_| ProtocolError::Truncated { what })
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64> {
        self.cur
            .read_u64::<LittleEndian>()
            .map_err(|_| ProtocolError::Truncated { what })
    }

    /// Length-prefixed byte run.
    pub fn bytes(&mut self, what: &'static str) -> Result<Vec<u8>> {
        let len = self.u64(what)?;
        let remaining = self.remaining();
        if len > remaining as u64 {
            return Err(ProtocolError::LengthOverrun { len, remaining });
        }
        let mut buf = vec![0u8; len as usize];
        self.cur
            .read_exact(&mut buf)
            .map_err(|_| ProtocolError::Truncated { what })?;
        Ok(buf)
    }

    pub fn string(&mut self, what: &'static str) -> Result<String> {
        let raw = self.bytes(what)?;
        String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8 { what })
    }

    pub fn job_id(&mut self) -> Result<JobId> {
        let mut raw = [0u8; 16];
        self.cur
            .read_exact(&mut raw)
            .map_err(|_| ProtocolError::Truncated { what: "job id" })?;
        Ok(JobId::from_bytes(raw))
    }

    /// Reject trailing garbage after a completed decode.
    pub fn finish(self) -> Result<()> {
        let remaining = self.remaining();
        if remaining > 0 {
            return Err(ProtocolError::TrailingBytes { remaining });
        }
        Ok(())
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    put_u64(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

impl MeshIOType {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_str(out, &self.input);
        put_str(out, &self.output);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let input = r.string("mesh input kind")?;
        let output = r.string("mesh output kind")?;
        Ok(Self { input, output })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

impl JobRequirements {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.io_type.encode_into(out);
        put_str(out, &self.worker_name);
        match &self.payload {
            Some(blob) => {
                out.push(1);
                put_bytes(out, blob);
            }
            None => out.push(0),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let io_type = MeshIOType::decode(r)?;
        let worker_name = r.string("worker name")?;
        let payload = match r.u8("requirements payload flag")? {
            0 => None,
            _ => Some(r.bytes("requirements payload")?),
        };
        Ok(Self {
            io_type,
            worker_name,
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

impl JobContent {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.source.as_u8());
        out.push(self.format.encoding.as_u8());
        put_str(out, &self.format.name);
        put_bytes(out, &self.payload);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let source_flag = r.u8("content source flag")?;
        let source = ContentSource::from_u8(source_flag)
            .ok_or(ProtocolError::InvalidContentSource(source_flag))?;
        let encoding_flag = r.u8("content encoding flag")?;
        let encoding = ContentEncoding::from_u8(encoding_flag)
            .ok_or(ProtocolError::InvalidContentEncoding(encoding_flag))?;
        let name = r.string("content format name")?;
        let payload = r.bytes("content payload")?;
        Ok(Self {
            source,
            format: ContentFormat { name, encoding },
            payload,
        })
    }
}

impl JobSubmission {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.requirements.encode_into(out);
        put_u64(out, self.len() as u64);
        for (key, content) in self.iter() {
            put_str(out, key);
            content.encode_into(out);
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let requirements = JobRequirements::decode(r)?;
        let count = r.u64("submission entry count")?;
        let mut submission = JobSubmission::new(requirements);
        for _ in 0..count {
            let key = r.string("submission key")?;
            let content = JobContent::decode(r)?;
            if !submission.insert(key.clone(), content) {
                return Err(ProtocolError::DuplicateContentKey(key));
            }
        }
        Ok(submission)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let value = Self::decode(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

impl JobStatusInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.job_id.as_bytes());
        out.push(self.state.as_u8());
        match self.progress.value {
            Some(value) => {
                out.push(1);
                put_u32(&mut out, value);
            }
            None => {
                out.push(0);
                put_u32(&mut out, 0);
            }
        }
        put_str(&mut out, self.progress.message.as_deref().unwrap_or(""));
        out.push(u8::from(self.result_available));
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let job_id = r.job_id()?;
        let state_byte = r.u8("job state")?;
        let state =
            JobState::from_u8(state_byte).ok_or(ProtocolError::InvalidJobState(state_byte))?;
        let has_value = r.u8("progress flag")? != 0;
        let raw_value = r.u32("progress value")?;
        let message = r.string("progress message")?;
        let result_available = r.u8("result flag")? != 0;
        r.finish()?;
        Ok(Self {
            job_id,
            state,
            progress: JobProgress {
                value: has_value.then_some(raw_value),
                message: (!message.is_empty()).then_some(message),
            },
            result_available,
        })
    }
}

impl JobResult {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.job_id.as_bytes());
        put_bytes(&mut out, &self.data);
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let job_id = r.job_id()?;
        let data = r.bytes("result data")?;
        r.finish()?;
        Ok(Self { job_id, data })
    }
}

impl JobAssignment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.job_id.as_bytes());
        self.submission.encode_into(&mut out);
        out
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let job_id = r.job_id()?;
        let submission = JobSubmission::decode(&mut r)?;
        r.finish()?;
        Ok(Self { job_id, submission })
    }
}

/// Encode a bare job identifier payload.
pub fn encode_job_id(job_id: JobId) -> Vec<u8> {
    job_id.as_bytes().to_vec()
}

pub fn decode_job_id(payload: &[u8]) -> Result<JobId> {
    let mut r = Reader::new(payload);
    let job_id = r.job_id()?;
    r.finish()?;
    Ok(job_id)
}

/// Encode a boolean reply payload.
pub fn encode_bool(value: bool) -> Vec<u8> {
    vec![u8::from(value)]
}

pub fn decode_bool(payload: &[u8]) -> Result<bool> {
    let mut r = Reader::new(payload);
    let value = r.u8("boolean")? != 0;
    r.finish()?;
    Ok(value)
}

/// Encode a count-prefixed requirements set.
pub fn encode_requirements_set(set: &[JobRequirements]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u64(&mut out, set.len() as u64);
    for reqs in set {
        reqs.encode_into(&mut out);
    }
    out
}

pub fn decode_requirements_set(payload: &[u8]) -> Result<Vec<JobRequirements>> {
    let mut r = Reader::new(payload);
    let count = r.u64("requirements count")?;
    let mut set = Vec::new();
    for _ in 0..count {
        set.push(JobRequirements::decode(&mut r)?);
    }
    r.finish()?;
    Ok(set)
}
