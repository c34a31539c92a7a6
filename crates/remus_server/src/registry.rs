//! Peer registry.
//!
//! In-memory view of every connected client and worker, keyed by the
//! transport-assigned routing identity. The broker never trusts a
//! peer-supplied name; the identity the socket layer stamps on each message
//! is the only key. All access happens on the broker loop thread.

use std::collections::{HashMap, HashSet};

use remus_protocol::{JobId, JobRequirements, MeshIOType};

/// What a worker is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    /// A job has been reserved for this worker but not yet picked up.
    Assigned,
    /// The worker has started reporting progress on its job.
    Executing,
}

/// Connected worker state (kept in memory, not persisted).
///
/// Note: identity is NOT stored here - it's the key in the workers map.
#[derive(Debug, Clone)]
pub struct ConnectedWorker {
    pub status: WorkerStatus,
    /// Requirement variants this worker advertised. One worker may serve
    /// several.
    pub requirements: Vec<JobRequirements>,
    pub current_job: Option<JobId>,
    pub last_seen: f64,
    /// When the worker last became idle; drives the LRU tie-break.
    pub idle_since: f64,
}

impl ConnectedWorker {
    fn new(requirements: Vec<JobRequirements>, now: f64) -> Self {
        Self {
            status: WorkerStatus::Idle,
            requirements,
            current_job: None,
            last_seen: now,
            idle_since: now,
        }
    }
}

/// Connected client state.
#[derive(Debug, Clone, Default)]
pub struct ConnectedClient {
    pub last_seen: f64,
    pub jobs: HashSet<JobId>,
}

/// Registry of every known peer.
#[derive(Default)]
pub struct PeerRegistry {
    workers: HashMap<Vec<u8>, ConnectedWorker>,
    clients: HashMap<Vec<u8>, ConnectedClient>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing its advertised requirement set.
    /// Re-registration keeps the worker's current assignment.
    pub fn register_worker(
        &mut self,
        identity: Vec<u8>,
        requirements: Vec<JobRequirements>,
        now: f64,
    ) {
        match self.workers.get_mut(&identity) {
            Some(worker) => {
                worker.requirements = requirements;
                worker.last_seen = now;
            }
            None => {
                self.workers
                    .insert(identity, ConnectedWorker::new(requirements, now));
            }
        }
    }

    /// Remove a worker, returning the job it held (if any) so the caller
    /// can fail it.
    pub fn unregister_worker(&mut self, identity: &[u8]) -> Option<JobId> {
        self.workers
            .remove(identity)
            .and_then(|worker| worker.current_job)
    }

    pub fn worker(&self, identity: &[u8]) -> Option<&ConnectedWorker> {
        self.workers.get(identity)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn touch_worker(&mut self, identity: &[u8], now: f64) -> bool {
        match self.workers.get_mut(identity) {
            Some(worker) => {
                worker.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Record client activity, creating the entry on first contact.
    pub fn touch_client(&mut self, identity: &[u8], now: f64) {
        let client = self.clients.entry(identity.to_vec()).or_default();
        client.last_seen = now;
    }

    pub fn record_submission(&mut self, identity: &[u8], job_id: JobId, now: f64) {
        let client = self.clients.entry(identity.to_vec()).or_default();
        client.last_seen = now;
        client.jobs.insert(job_id);
    }

    pub fn forget_job(&mut self, submitter: &[u8], job_id: JobId) {
        if let Some(client) = self.clients.get_mut(submitter) {
            client.jobs.remove(&job_id);
        }
    }

    /// Pick an idle worker whose advertised set covers `reqs`. When several
    /// qualify the one idle the longest wins, spreading load.
    pub fn find_idle_worker(&self, reqs: &JobRequirements) -> Option<Vec<u8>> {
        self.workers
            .iter()
            .filter(|(_, w)| {
                w.status == WorkerStatus::Idle
                    && w.requirements.iter().any(|adv| reqs.matches(adv))
            })
            .min_by(|(_, a), (_, b)| {
                a.idle_since
                    .partial_cmp(&b.idle_since)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(identity, _)| identity.clone())
    }

    /// Reserve a worker for a job.
    pub fn assign_worker(&mut self, identity: &[u8], job_id: JobId) -> bool {
        match self.workers.get_mut(identity) {
            Some(worker) if worker.status == WorkerStatus::Idle => {
                worker.status = WorkerStatus::Assigned;
                worker.current_job = Some(job_id);
                true
            }
            _ => false,
        }
    }

    /// First progress on the assigned job arrived.
    pub fn mark_executing(&mut self, identity: &[u8]) {
        if let Some(worker) = self.workers.get_mut(identity) {
            if worker.status == WorkerStatus::Assigned {
                worker.status = WorkerStatus::Executing;
            }
        }
    }

    /// Return a worker to the idle pool.
    pub fn release_worker(&mut self, identity: &[u8], now: f64) {
        if let Some(worker) = self.workers.get_mut(identity) {
            worker.status = WorkerStatus::Idle;
            worker.current_job = None;
            worker.idle_since = now;
        }
    }

    /// True when any connected worker advertises an IO type equal to `io`.
    pub fn any_worker_for_io(&self, io: &MeshIOType) -> bool {
        self.workers
            .values()
            .any(|w| w.requirements.iter().any(|r| r.io_type == *io))
    }

    /// True when any connected worker can serve `reqs`.
    pub fn any_worker_for_requirements(&self, reqs: &JobRequirements) -> bool {
        self.workers
            .values()
            .any(|w| w.requirements.iter().any(|adv| reqs.matches(adv)))
    }

    /// All advertised requirement variants matching an IO type.
    pub fn requirements_for_io(&self, io: &MeshIOType) -> HashSet<JobRequirements> {
        self.workers
            .values()
            .flat_map(|w| w.requirements.iter())
            .filter(|r| r.io_type == *io)
            .cloned()
            .collect()
    }

    /// Remove workers not seen within `threshold` seconds. Returns the
    /// evicted identities with the job each one was holding.
    pub fn reap_workers(&mut self, now: f64, threshold: f64) -> Vec<(Vec<u8>, Option<JobId>)> {
        let cutoff = now - threshold;
        let stale: Vec<Vec<u8>> = self
            .workers
            .iter()
            .filter(|(_, w)| w.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.workers
                    .remove(&id)
                    .map(|worker| (id, worker.current_job))
            })
            .collect()
    }

    /// Remove clients not seen within `threshold` seconds. Returns the
    /// evicted identities with the jobs each one had submitted.
    pub fn reap_clients(&mut self, now: f64, threshold: f64) -> Vec<(Vec<u8>, HashSet<JobId>)> {
        let cutoff = now - threshold;
        let stale: Vec<Vec<u8>> = self
            .clients
            .iter()
            .filter(|(_, c)| c.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.clients.remove(&id).map(|client| (id, client.jobs)))
            .collect()
    }

    /// Count of workers currently holding a job (assigned or executing).
    pub fn busy_worker_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status != WorkerStatus::Idle)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remus_protocol::MeshIOType;

    fn reqs(name: &str) -> JobRequirements {
        JobRequirements::new(MeshIOType::new("Edges", "Mesh2D"), name)
    }

    #[test]
    fn test_register_is_idempotent_and_replaces() {
        let mut registry = PeerRegistry::new();
        registry.register_worker(b"w1".to_vec(), vec![reqs("a")], 1.0);
        registry.register_worker(b"w1".to_vec(), vec![reqs("a"), reqs("b")], 2.0);

        assert_eq!(registry.worker_count(), 1);
        let worker = registry.worker(b"w1").unwrap();
        assert_eq!(worker.requirements.len(), 2);
        assert_eq!(worker.last_seen, 2.0);
    }

    #[test]
    fn test_find_idle_worker_prefers_longest_idle() {
        let mut registry = PeerRegistry::new();
        registry.register_worker(b"fresh".to_vec(), vec![reqs("tri")], 10.0);
        registry.register_worker(b"stale".to_vec(), vec![reqs("tri")], 1.0);

        let picked = registry.find_idle_worker(&reqs("tri")).unwrap();
        assert_eq!(picked, b"stale".to_vec());
    }

    #[test]
    fn test_assigned_worker_is_not_idle() {
        let mut registry = PeerRegistry::new();
        registry.register_worker(b"w1".to_vec(), vec![reqs("tri")], 0.0);
        assert!(registry.assign_worker(b"w1", JobId::mint()));

        assert!(registry.find_idle_worker(&reqs("tri")).is_none());
        // A second assignment to the same worker must be refused.
        assert!(!registry.assign_worker(b"w1", JobId::mint()));
    }

    #[test]
    fn test_release_restores_idleness_and_lru_order() {
        let mut registry = PeerRegistry::new();
        registry.register_worker(b"w1".to_vec(), vec![reqs("tri")], 0.0);
        registry.register_worker(b"w2".to_vec(), vec![reqs("tri")], 1.0);

        // w1 takes a job and comes back later; w2 should now be preferred.
        assert!(registry.assign_worker(b"w1", JobId::mint()));
        registry.release_worker(b"w1", 50.0);

        let picked = registry.find_idle_worker(&reqs("tri")).unwrap();
        assert_eq!(picked, b"w2".to_vec());
    }

    #[test]
    fn test_unregister_worker_surrenders_held_job() {
        let mut registry = PeerRegistry::new();
        let job = JobId::mint();
        registry.register_worker(b"w1".to_vec(), vec![reqs("tri")], 0.0);
        registry.assign_worker(b"w1", job);

        assert_eq!(registry.unregister_worker(b"w1"), Some(job));
        assert_eq!(registry.worker_count(), 0);
        assert_eq!(registry.unregister_worker(b"w1"), None);
    }

    #[test]
    fn test_reap_workers_returns_held_job() {
        let mut registry = PeerRegistry::new();
        let job = JobId::mint();
        registry.register_worker(b"dead".to_vec(), vec![reqs("tri")], 0.0);
        registry.register_worker(b"alive".to_vec(), vec![reqs("tri")], 9.0);
        registry.assign_worker(b"dead", job);

        let reaped = registry.reap_workers(10.0, 5.0);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, b"dead".to_vec());
        assert_eq!(reaped[0].1, Some(job));
        assert_eq!(registry.worker_count(), 1);
    }

    #[test]
    fn test_reap_clients_returns_their_jobs() {
        let mut registry = PeerRegistry::new();
        let job = JobId::mint();
        registry.record_submission(b"c1", job, 0.0);
        registry.touch_client(b"c2", 9.0);

        let reaped = registry.reap_clients(10.0, 5.0);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, b"c1".to_vec());
        assert!(reaped[0].1.contains(&job));
    }

    #[test]
    fn test_requirements_for_io_collects_across_workers() {
        let mut registry = PeerRegistry::new();
        registry.register_worker(b"w1".to_vec(), vec![reqs("tri")], 0.0);
        registry.register_worker(b"w2".to_vec(), vec![reqs("quad"), reqs("tri")], 0.0);

        let io = MeshIOType::new("Edges", "Mesh2D");
        let found = registry.requirements_for_io(&io);
        assert_eq!(found.len(), 2);
        assert!(registry.any_worker_for_io(&io));
        assert!(!registry.any_worker_for_io(&MeshIOType::new("Model", "Mesh3D")));
    }
}
