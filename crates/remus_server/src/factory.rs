//! Worker factories.
//!
//! The broker never launches meshers itself; it asks a pluggable factory
//! whether a worker satisfying some requirements can be brought up, and the
//! factory decides. The default implementation spawns configured worker
//! commands as child processes; the always-support variant exists for
//! deployments (and tests) where workers connect entirely on their own.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use remus_protocol::{JobRequirements, MeshIOType};
use tracing::{info, warn};

/// Default cap on concurrently-outstanding factory-launched workers.
pub const DEFAULT_MAX_WORKERS: usize = 1;

/// Admission control for bringing new workers online.
///
/// `create_worker` returning true means "a worker will appear"; the broker
/// never blocks waiting for it, the job simply stays queued until the
/// worker registers and asks for work.
pub trait WorkerFactory: Send {
    /// IO types any launchable worker would advertise.
    fn supported_io_types(&self) -> Vec<MeshIOType>;

    /// Requirement variants launchable for a given IO type.
    fn worker_requirements(&self, io: &MeshIOType) -> Vec<JobRequirements>;

    /// Can some launchable worker serve these requirements?
    fn have_support(&self, reqs: &JobRequirements) -> bool;

    /// Try to bring up a worker for these requirements.
    fn create_worker(&mut self, reqs: &JobRequirements) -> bool;

    /// Refresh internal bookkeeping (reap exited workers).
    fn update_worker_count(&mut self);

    fn current_worker_count(&self) -> usize;

    fn max_worker_count(&self) -> usize;

    fn set_max_worker_count(&mut self, limit: usize);
}

/// Factory that claims support for everything and launches nothing.
///
/// Useful when workers are managed externally and the broker should accept
/// any submission, and as a fixture for exercising the queue without
/// workers.
pub struct AlwaysSupportFactory {
    io_types: Vec<MeshIOType>,
    max_workers: usize,
}

impl AlwaysSupportFactory {
    pub fn new(io_types: Vec<MeshIOType>) -> Self {
        Self {
            io_types,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl WorkerFactory for AlwaysSupportFactory {
    fn supported_io_types(&self) -> Vec<MeshIOType> {
        self.io_types.clone()
    }

    fn worker_requirements(&self, io: &MeshIOType) -> Vec<JobRequirements> {
        vec![JobRequirements::new(io.clone(), "")]
    }

    fn have_support(&self, _reqs: &JobRequirements) -> bool {
        true
    }

    fn create_worker(&mut self, _reqs: &JobRequirements) -> bool {
        false
    }

    fn update_worker_count(&mut self) {}

    fn current_worker_count(&self) -> usize {
        0
    }

    fn max_worker_count(&self) -> usize {
        self.max_workers
    }

    fn set_max_worker_count(&mut self, limit: usize) {
        self.max_workers = limit;
    }
}

/// One launchable worker kind: the requirements it would advertise and the
/// command line that starts it.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub requirements: JobRequirements,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(requirements: JobRequirements, program: impl Into<PathBuf>) -> Self {
        Self {
            requirements,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Factory that launches workers as child processes.
pub struct ProcessWorkerFactory {
    commands: Vec<WorkerCommand>,
    children: Vec<Child>,
    max_workers: usize,
}

impl ProcessWorkerFactory {
    pub fn new(commands: Vec<WorkerCommand>) -> Self {
        Self {
            commands,
            children: Vec::new(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    /// A factory with nothing to launch; externally-started workers only.
    pub fn without_commands() -> Self {
        Self::new(Vec::new())
    }

    fn command_for(&self, reqs: &JobRequirements) -> Option<&WorkerCommand> {
        self.commands
            .iter()
            .find(|cmd| reqs.matches(&cmd.requirements))
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn supported_io_types(&self) -> Vec<MeshIOType> {
        let mut io_types: Vec<MeshIOType> = Vec::new();
        for cmd in &self.commands {
            if !io_types.contains(&cmd.requirements.io_type) {
                io_types.push(cmd.requirements.io_type.clone());
            }
        }
        io_types
    }

    fn worker_requirements(&self, io: &MeshIOType) -> Vec<JobRequirements> {
        self.commands
            .iter()
            .filter(|cmd| cmd.requirements.io_type == *io)
            .map(|cmd| cmd.requirements.clone())
            .collect()
    }

    fn have_support(&self, reqs: &JobRequirements) -> bool {
        self.command_for(reqs).is_some()
    }

    fn create_worker(&mut self, reqs: &JobRequirements) -> bool {
        self.update_worker_count();
        if self.children.len() >= self.max_workers {
            return false;
        }
        let Some(command) = self.command_for(reqs) else {
            return false;
        };

        match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!(
                    "Launched worker '{}' (pid {}) for {}",
                    command.program.display(),
                    child.id(),
                    reqs.io_type
                );
                self.children.push(child);
                true
            }
            Err(e) => {
                warn!(
                    "Failed to launch worker '{}': {}",
                    command.program.display(),
                    e
                );
                false
            }
        }
    }

    fn update_worker_count(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                info!("Worker process {} exited: {}", child.id(), status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll worker process {}: {}", child.id(), e);
                false
            }
        });
    }

    fn current_worker_count(&self) -> usize {
        self.children.len()
    }

    fn max_worker_count(&self) -> usize {
        self.max_workers
    }

    fn set_max_worker_count(&mut self, limit: usize) {
        self.max_workers = limit;
    }
}

impl Drop for ProcessWorkerFactory {
    fn drop(&mut self) {
        for child in &mut self.children {
            if child.try_wait().map(|s| s.is_none()).unwrap_or(false) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(input: &str, output: &str, name: &str) -> JobRequirements {
        JobRequirements::new(MeshIOType::new(input, output), name)
    }

    #[test]
    fn test_always_support_claims_everything_creates_nothing() {
        let io = MeshIOType::new("Model", "Mesh3D");
        let mut factory = AlwaysSupportFactory::new(vec![io.clone()]);

        assert!(factory.have_support(&reqs("Any", "Thing", "whatever")));
        assert!(!factory.create_worker(&reqs("Model", "Mesh3D", "")));
        assert_eq!(factory.current_worker_count(), 0);
        assert_eq!(factory.supported_io_types(), vec![io]);
    }

    #[test]
    fn test_process_factory_support_is_command_driven() {
        let factory = ProcessWorkerFactory::new(vec![WorkerCommand::new(
            reqs("Edges", "Mesh2D", "triangle"),
            "/usr/bin/true",
        )]);

        assert!(factory.have_support(&reqs("Edges", "Mesh2D", "triangle")));
        assert!(factory.have_support(&reqs("Edges", "Mesh2D", "")));
        assert!(!factory.have_support(&reqs("Model", "Mesh3D", "")));
        assert_eq!(
            factory.worker_requirements(&MeshIOType::new("Edges", "Mesh2D")),
            vec![reqs("Edges", "Mesh2D", "triangle")]
        );
    }

    #[test]
    fn test_empty_factory_supports_nothing() {
        let factory = ProcessWorkerFactory::without_commands();
        assert!(!factory.have_support(&reqs("Edges", "Mesh2D", "")));
        assert!(factory.supported_io_types().is_empty());
    }

    #[test]
    fn test_create_worker_respects_cap() {
        let mut factory = ProcessWorkerFactory::new(vec![WorkerCommand::new(
            reqs("Edges", "Mesh2D", ""),
            "/bin/sleep",
        )
        .with_args(vec!["5".to_string()])]);
        factory.set_max_worker_count(1);

        let wanted = reqs("Edges", "Mesh2D", "");
        assert!(factory.create_worker(&wanted));
        assert_eq!(factory.current_worker_count(), 1);
        // Cap reached, second launch is refused.
        assert!(!factory.create_worker(&wanted));
    }

    #[test]
    fn test_update_worker_count_reaps_exited_children() {
        let mut factory = ProcessWorkerFactory::new(vec![WorkerCommand::new(
            reqs("Edges", "Mesh2D", ""),
            "/bin/true",
        )]);
        assert!(factory.create_worker(&reqs("Edges", "Mesh2D", "")));

        // /bin/true exits immediately; give it a moment then reap.
        std::thread::sleep(std::time::Duration::from_millis(200));
        factory.update_worker_count();
        assert_eq!(factory.current_worker_count(), 0);
    }

    #[test]
    fn test_launch_failure_returns_false() {
        let mut factory = ProcessWorkerFactory::new(vec![WorkerCommand::new(
            reqs("Edges", "Mesh2D", ""),
            "/nonexistent/mesher-binary",
        )]);
        assert!(!factory.create_worker(&reqs("Edges", "Mesh2D", "")));
        assert_eq!(factory.current_worker_count(), 0);
    }
}
