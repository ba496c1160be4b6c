
use crate::{
    executors::Executor,
    queue::{JobId, JobQueue, QueueError},
    slots::{SlotError, SlotId, SlotRegistry},
    sync::SyncError,
};
use std::{
    fs::OpenOptions,
    path::PathBuf,
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("Failed to open generation log {path:?}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn the next generation from {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// the slot is still claimed, a successor has to take over
    Respawn,
    /// the slot was released by someone else while the job ran
    Released,
    /// nothing left to do, the slot has been released
    Exhausted,
}

/// What got recorded for the job a generation worked on
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobOutcome {
    Finished(f64),
    Failed,
}

/// One process worth of work: a single job on a single slot
pub struct Generation<E> {
    base: PathBuf,
    slot: SlotId,
    queue: JobQueue,
    registry: SlotRegistry,
    executor: E,
}

impl<E: Executor> Generation<E> {
    pub fn new(
        base: PathBuf,
        slot: SlotId,
        queue: JobQueue,
        registry: SlotRegistry,
        executor: E,
    ) -> Self {
        Self {
            base,
            slot,
            queue,
            registry,
            executor,
        }
    }

    pub fn slot(&self) -> &SlotId {
        &self.slot
    }

    /// Dequeue, execute and record one job, then decide whether the chain goes on
    pub fn run(&self) -> Result<Outcome, WorkerError> {
        // held until this generation is done, reconcile treats the slot as alive meanwhile
        let _live = self.registry.hold(&self.slot)?;

        let job = match self.queue.dequeue_for_slot(&self.slot) {
            Ok(Some(job)) => job,
            Ok(None) => {
                info!(slot = %self.slot, "Queue drained, ending chain");

                return self.terminate();
            }
            Err(QueueError::Sync(SyncError::DocumentNotFound(path))) => {
                warn!(path = ?path, slot = %self.slot, "No queue document, nothing was ever enqueued");

                return self.terminate();
            }
            Err(error) => return Err(error.into()),
        };

        let completed = self.execute(&job);
        let outcome = self.record(&job, completed)?;
        debug!(job = %job, outcome = ?outcome, "Recorded job");

        if self.registry.is_claimed(&self.slot)? {
            Ok(Outcome::Respawn)
        } else {
            info!(slot = %self.slot, "Slot was released, ending chain");

            Ok(Outcome::Released)
        }
    }

    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.base.join(job.as_str())
    }

    /// Prepare and run `job`, true only if the driver ran and exited cleanly.
    ///
    /// Failures are only logged here, they end up as a failed job in `record`.
    fn execute(&self, job: &JobId) -> bool {
        let job_dir = self.job_dir(job);

        if let Err(error) = self.executor.prepare(&job_dir, job) {
            error!(error = ?error, job = %job, "Failed to prepare job: {error}");

            return false;
        }

        match self.executor.run(&job_dir, &self.slot) {
            Ok(status) if status.success() => {
                debug!(job = %job, "Job ran to completion");

                true
            }
            Ok(status) => {
                warn!(job = %job, "Driver exited with {status}");

                false
            }
            Err(error) => {
                error!(error = ?error, job = %job, "Failed to run job: {error}");

                false
            }
        }
    }

    fn record(&self, job: &JobId, completed: bool) -> Result<JobOutcome, WorkerError> {
        // a result file left behind by an earlier attempt must not count for this one
        let result = if completed {
            self.executor.read_result(&self.job_dir(job)).map_err(|error| {
                warn!(error = ?error, job = %job, "No usable result: {error}");
            })
        } else {
            Err(())
        };

        match result {
            Ok(value) => {
                self.queue.mark_finished(job, value)?;

                Ok(JobOutcome::Finished(value))
            }
            Err(()) => {
                self.queue.mark_failed(job)?;

                Ok(JobOutcome::Failed)
            }
        }
    }

    fn terminate(&self) -> Result<Outcome, WorkerError> {
        self.registry.release(&self.slot)?;

        Ok(Outcome::Exhausted)
    }
}

/// Claim `slot` for a new chain, fails hard if another chain owns it
pub fn bootstrap(registry: &SlotRegistry, slot: &SlotId) -> Result<(), WorkerError> {
    registry.claim(slot)?;

    Ok(())
}

/// Everything needed to start the next generation of this binary
#[derive(Debug, Clone)]
pub struct Successor {
    program: PathBuf,
    base: PathBuf,
    config: Option<PathBuf>,
}

impl Successor {
    pub fn new(program: PathBuf, base: PathBuf, config: Option<PathBuf>) -> Self {
        Self {
            program,
            base,
            config,
        }
    }

    /// log file a generation on `slot` writes to
    pub fn log_path(&self, slot: &SlotId) -> PathBuf {
        self.base.join(format!("worker-{slot}.log"))
    }

    /// The slot travels as an argument, the environment is inherited untouched
    pub fn command(&self, slot: &SlotId) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--base").arg(&self.base);

        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }

        command
            .arg("worker")
            .arg("--slot")
            .arg(slot.as_str())
            .current_dir(&self.base);

        command
    }

    /// Start a detached generation on `slot` and return its pid
    pub fn spawn(&self, slot: &SlotId) -> Result<u32, WorkerError> {
        let log_path = self.log_path(slot);
        let open_log = || {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .map_err(|source| WorkerError::Log {
                    path: log_path.clone(),
                    source,
                })
        };

        let child = self
            .command(slot)
            .stdin(Stdio::null())
            .stdout(Stdio::from(open_log()?))
            .stderr(Stdio::from(open_log()?))
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        info!(slot = %slot, pid = child.id(), log = ?log_path, "Spawned next generation");

        // the child outlives this process, nobody waits for it here
        Ok(child.id())
    }
}
