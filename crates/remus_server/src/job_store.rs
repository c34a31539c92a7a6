//! Job store.
//!
//! Insertion-ordered map of every known job plus the FIFO queue of jobs
//! still waiting for a worker. The server is ephemeral: nothing here is
//! persisted, and terminal jobs are reaped after a retention window. All
//! access happens on the broker loop thread.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use remus_protocol::{
    JobId, JobProgress, JobRequirements, JobState, JobStatusInfo, JobSubmission,
};

/// The broker's canonical record of one job.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub submitter: Vec<u8>,
    pub requirements: JobRequirements,
    /// Retained until the job is handed to its worker, then dropped.
    pub submission: Option<JobSubmission>,
    pub status: JobState,
    pub progress: JobProgress,
    /// Present only once the job finished; cleared on first retrieval.
    pub result: Option<Vec<u8>>,
    pub assigned_worker: Option<Vec<u8>>,
    /// Result was handed to the submitter; the job only awaits expiry.
    pub drop_pending: bool,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: f64,
    pub last_heartbeat: f64,
}

impl Job {
    pub fn new(id: JobId, submitter: Vec<u8>, submission: JobSubmission, now: f64) -> Self {
        let requirements = submission.requirements.clone();
        Self {
            id,
            submitter,
            requirements,
            submission: Some(submission),
            status: JobState::Queued,
            progress: JobProgress::default(),
            result: None,
            assigned_worker: None,
            drop_pending: false,
            created_at: Utc::now(),
            status_changed_at: now,
            last_heartbeat: now,
        }
    }

    pub fn status_info(&self) -> JobStatusInfo {
        JobStatusInfo {
            job_id: self.id,
            state: self.status,
            progress: self.progress.clone(),
            result_available: self.result.is_some(),
        }
    }
}

/// All jobs the broker knows about.
#[derive(Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    /// Insertion order of every live job, for deterministic iteration.
    order: Vec<JobId>,
    /// FIFO queue of jobs in `QUEUED` that have no reserved worker yet.
    queue: VecDeque<JobId>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: Job) {
        let id = job.id;
        self.order.push(id);
        self.queue.push_back(id);
        self.jobs.insert(id, job);
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Queued job IDs in FIFO order.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.queue.iter().copied().collect()
    }

    /// First queued job whose requirements can run on `advertised`.
    pub fn first_queued_matching(&self, advertised: &[JobRequirements]) -> Option<JobId> {
        self.queue.iter().copied().find(|id| {
            self.jobs
                .get(id)
                .map(|job| advertised.iter().any(|adv| job.requirements.matches(adv)))
                .unwrap_or(false)
        })
    }

    /// Reserve a queued job for a worker. The job leaves the dispatch queue
    /// but stays `QUEUED` until the worker's first progress report.
    pub fn assign(&mut self, id: JobId, worker: Vec<u8>) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.status != JobState::Queued || job.assigned_worker.is_some() {
            return false;
        }
        job.assigned_worker = Some(worker);
        self.queue.retain(|queued| *queued != id);
        true
    }

    /// Hand the submission payload over; it is not retained afterwards.
    pub fn take_submission(&mut self, id: JobId) -> Option<JobSubmission> {
        self.jobs.get_mut(&id).and_then(|job| job.submission.take())
    }

    /// Move a job to a new lifecycle state. Transitions out of a terminal
    /// state are refused.
    pub fn update_status(&mut self, id: JobId, status: JobState, now: f64) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        job.status = status;
        job.status_changed_at = now;
        if status != JobState::Queued {
            self.queue.retain(|queued| *queued != id);
        }
        if status.is_terminal() {
            job.submission = None;
        }
        true
    }

    pub fn set_result(&mut self, id: JobId, result: Vec<u8>) -> bool {
        match self.jobs.get_mut(&id) {
            Some(job) => {
                job.result = Some(result);
                true
            }
            None => false,
        }
    }

    /// Hand the result to the submitter. The job is marked drop-pending and
    /// will be reaped by the next expiry pass.
    pub fn take_result(&mut self, id: JobId, now: f64) -> Option<Vec<u8>> {
        let job = self.jobs.get_mut(&id)?;
        let result = job.result.take()?;
        job.drop_pending = true;
        job.status_changed_at = now;
        Some(result)
    }

    pub fn drop_job(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        self.order.retain(|kept| *kept != id);
        self.queue.retain(|queued| *queued != id);
        Some(job)
    }

    /// Remove terminal (and drop-pending) jobs whose last status change is
    /// older than `cutoff`. Returns the removed jobs.
    pub fn expire_before(&mut self, cutoff: f64) -> Vec<Job> {
        let expired: Vec<JobId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .map(|job| {
                        (job.status.is_terminal() || job.drop_pending)
                            && job.status_changed_at < cutoff
                    })
                    .unwrap_or(false)
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.drop_job(id))
            .collect()
    }

    /// Jobs currently in `IN_PROGRESS`, for invariant checks and liveness
    /// accounting.
    pub fn in_progress_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.status == JobState::InProgress)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remus_protocol::{ContentEncoding, JobContent, MeshIOType};

    fn submission() -> JobSubmission {
        let reqs = JobRequirements::new(MeshIOType::new("Edges", "Mesh2D"), "tri");
        let mut sub = JobSubmission::new(reqs);
        sub.insert(
            "data",
            JobContent::in_memory("raw", ContentEncoding::Text, b"payload".to_vec()),
        );
        sub
    }

    fn store_with_jobs(count: usize) -> (JobStore, Vec<JobId>) {
        let mut store = JobStore::new();
        let mut ids = Vec::new();
        for i in 0..count {
            let id = JobId::mint();
            store.enqueue(Job::new(id, format!("client-{i}").into_bytes(), submission(), 0.0));
            ids.push(id);
        }
        (store, ids)
    }

    #[test]
    fn test_queue_is_fifo() {
        let (store, ids) = store_with_jobs(3);
        assert_eq!(store.queued_ids(), ids);
    }

    #[test]
    fn test_assign_removes_from_queue_but_keeps_queued_state() {
        let (mut store, ids) = store_with_jobs(2);
        assert!(store.assign(ids[0], b"w1".to_vec()));

        assert_eq!(store.queued_ids(), vec![ids[1]]);
        let job = store.get(ids[0]).unwrap();
        assert_eq!(job.status, JobState::Queued);
        assert_eq!(job.assigned_worker.as_deref(), Some(b"w1".as_slice()));

        // Double assignment must be refused.
        assert!(!store.assign(ids[0], b"w2".to_vec()));
    }

    #[test]
    fn test_take_submission_releases_payload() {
        let (mut store, ids) = store_with_jobs(1);
        assert!(store.take_submission(ids[0]).is_some());
        assert!(store.take_submission(ids[0]).is_none());
        assert!(store.get(ids[0]).unwrap().submission.is_none());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let (mut store, ids) = store_with_jobs(1);
        assert!(store.update_status(ids[0], JobState::InProgress, 1.0));
        assert!(store.update_status(ids[0], JobState::Failed, 2.0));
        assert!(!store.update_status(ids[0], JobState::InProgress, 3.0));
        assert_eq!(store.get(ids[0]).unwrap().status, JobState::Failed);
    }

    #[test]
    fn test_take_result_marks_drop_pending() {
        let (mut store, ids) = store_with_jobs(1);
        store.update_status(ids[0], JobState::InProgress, 1.0);
        store.set_result(ids[0], b"mesh".to_vec());
        store.update_status(ids[0], JobState::Finished, 2.0);

        assert_eq!(store.take_result(ids[0], 3.0).unwrap(), b"mesh");
        assert!(store.take_result(ids[0], 4.0).is_none());
        assert!(store.get(ids[0]).unwrap().drop_pending);
    }

    #[test]
    fn test_expire_before_reaps_terminal_jobs_only() {
        let (mut store, ids) = store_with_jobs(3);
        store.update_status(ids[0], JobState::Failed, 1.0);
        store.update_status(ids[1], JobState::InProgress, 1.0);

        let expired = store.expire_before(5.0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, ids[0]);

        assert!(store.get(ids[0]).is_none());
        assert!(store.get(ids[1]).is_some());
        assert!(store.get(ids[2]).is_some());
    }

    #[test]
    fn test_expire_before_respects_cutoff() {
        let (mut store, ids) = store_with_jobs(1);
        store.update_status(ids[0], JobState::Finished, 10.0);
        assert!(store.expire_before(5.0).is_empty());
        assert_eq!(store.expire_before(11.0).len(), 1);
    }

    #[test]
    fn test_first_queued_matching_respects_fifo() {
        let mut store = JobStore::new();
        let io2d = MeshIOType::new("Edges", "Mesh2D");
        let io3d = MeshIOType::new("Model", "Mesh3D");

        let mut ids = Vec::new();
        for io in [io3d.clone(), io2d.clone(), io2d.clone()] {
            let id = JobId::mint();
            let sub = JobSubmission::new(JobRequirements::new(io, ""));
            store.enqueue(Job::new(id, b"c".to_vec(), sub, 0.0));
            ids.push(id);
        }

        let advertised = vec![JobRequirements::new(io2d, "tri")];
        assert_eq!(store.first_queued_matching(&advertised), Some(ids[1]));
    }

    #[test]
    fn test_in_progress_count() {
        let (mut store, ids) = store_with_jobs(3);
        store.update_status(ids[0], JobState::InProgress, 1.0);
        store.update_status(ids[1], JobState::InProgress, 1.0);
        store.update_status(ids[1], JobState::Finished, 2.0);
        assert_eq!(store.in_progress_count(), 1);
    }
}
