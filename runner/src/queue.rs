
use crate::{
    slots::SlotId,
    sync::{SharedDocument, SyncError},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// serialized `QueueDocument`
pub const QUEUE_FILE: &str = "pep_queue";
/// lock file guarding `QUEUE_FILE`
pub const QUEUE_LOCK: &str = ".slf.lck";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),
    #[error("No jobs given")]
    EmptyBatch,
    #[error("Job {0} is already known to the queue")]
    Duplicate(JobId),
    #[error("Job {0} is not running")]
    NotRunning(JobId),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Identifier of a job, doubles as the name of its working directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id: String = id.into();

        if id.is_empty()
            || id.starts_with('.')
            || id.contains(std::path::is_separator)
            || id.contains(char::is_whitespace)
        {
            Err(QueueError::InvalidJobId(id))
        } else {
            Ok(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// End of `queued` that `dequeue_for_slot` serves from
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DequeueOrder {
    /// most recently enqueued job first
    #[default]
    Lifo,
    /// oldest job first
    Fifo,
}

/// The whole persisted queue state, every job id lives in exactly one partition
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueDocument {
    pub queued: Vec<JobId>,
    pub running: BTreeMap<JobId, SlotId>,
    pub finished: BTreeMap<JobId, Option<f64>>,
    pub failed: BTreeMap<JobId, SlotId>,
}

impl QueueDocument {
    pub fn contains(&self, job: &JobId) -> bool {
        self.queued.contains(job)
            || self.running.contains_key(job)
            || self.finished.contains_key(job)
            || self.failed.contains_key(job)
    }

    /// Append a batch, all or nothing
    fn push(&mut self, jobs: Vec<JobId>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        let mut seen = BTreeSet::new();
        for job in jobs.iter() {
            if self.contains(job) || !seen.insert(job) {
                return Err(QueueError::Duplicate(job.clone()));
            }
        }

        let count = jobs.len();
        self.queued.extend(jobs);

        Ok(count)
    }

    fn take(&mut self, order: DequeueOrder, slot: &SlotId) -> Option<JobId> {
        let job = match order {
            DequeueOrder::Lifo => self.queued.pop(),
            DequeueOrder::Fifo if self.queued.is_empty() => None,
            DequeueOrder::Fifo => Some(self.queued.remove(0)),
        }?;

        self.running.insert(job.clone(), slot.clone());

        Some(job)
    }

    fn finish(&mut self, job: &JobId, result: f64) -> Result<(), QueueError> {
        self.running
            .remove(job)
            .ok_or_else(|| QueueError::NotRunning(job.clone()))?;
        self.finished.insert(job.clone(), Some(result));

        Ok(())
    }

    fn fail(&mut self, job: &JobId) -> Result<SlotId, QueueError> {
        let slot = self
            .running
            .remove(job)
            .ok_or_else(|| QueueError::NotRunning(job.clone()))?;
        self.failed.insert(job.clone(), slot.clone());

        Ok(slot)
    }

    /// running entries on slots no generation is alive on
    pub fn stale(&self, is_idle: impl Fn(&SlotId) -> bool) -> Vec<(JobId, SlotId)> {
        self.running
            .iter()
            .filter(|(_, slot)| is_idle(slot))
            .map(|(job, slot)| (job.clone(), slot.clone()))
            .collect()
    }
}

/// Handle on the shared queue document below a base path
#[derive(Debug, Clone)]
pub struct JobQueue {
    document: SharedDocument<QueueDocument>,
    order: DequeueOrder,
}

impl JobQueue {
    pub fn open(base: &Path, order: DequeueOrder) -> Self {
        Self {
            document: SharedDocument::new(base.join(QUEUE_FILE), base.join(QUEUE_LOCK)),
            order,
        }
    }

    /// Add jobs to the queue, creating the queue document on first use
    pub fn enqueue(&self, jobs: Vec<JobId>) -> Result<usize, QueueError> {
        let count = self
            .document
            .update_or_init(QueueDocument::default, |queue| queue.push(jobs))?;

        info!(count = count, "Enqueued jobs");

        Ok(count)
    }

    /// Move the next queued job to `running` on behalf of `slot`, `None` once the queue is drained
    pub fn dequeue_for_slot(&self, slot: &SlotId) -> Result<Option<JobId>, QueueError> {
        let order = self.order;
        let job = self
            .document
            .update(|queue| Ok::<_, QueueError>(queue.take(order, slot)))?;

        match &job {
            Some(job) => info!(job = %job, slot = %slot, "Dequeued job"),
            None => debug!(slot = %slot, "Queue is empty"),
        }

        Ok(job)
    }

    pub fn mark_finished(&self, job: &JobId, result: f64) -> Result<(), QueueError> {
        self.document.update(|queue| queue.finish(job, result))?;

        info!(job = %job, result = result, "Job finished");

        Ok(())
    }

    /// Move `job` to `failed`, keeping the slot that produced it
    pub fn mark_failed(&self, job: &JobId) -> Result<SlotId, QueueError> {
        let slot = self.document.update(|queue| queue.fail(job))?;

        warn!(job = %job, slot = %slot, "Job failed");

        Ok(slot)
    }

    pub fn path(&self) -> &Path {
        self.document.path()
    }

    pub fn snapshot(&self) -> Result<QueueDocument, QueueError> {
        Ok(self.document.read()?)
    }

    /// Put stale running entries back at the tail of `queued`.
    ///
    /// Only entries that are still running on the slot they were reported with are moved, so a
    /// job picked up again in the meantime is left alone.
    pub fn requeue(&self, stale: &[(JobId, SlotId)]) -> Result<Vec<JobId>, QueueError> {
        let moved = self.document.update(|queue| {
            let mut moved = Vec::new();

            for (job, slot) in stale {
                if queue.running.get(job) == Some(slot) {
                    queue.running.remove(job);
                    queue.queued.push(job.clone());
                    moved.push(job.clone());
                }
            }

            Ok::<_, QueueError>(moved)
        })?;

        for job in moved.iter() {
            info!(job = %job, "Requeued stale job");
        }

        Ok(moved)
    }
}
