pub mod amber;
pub mod residues;
pub mod templates;

use crate::{
    ingest::{self, IngestorError},
    queue::JobId,
    slots::SlotId,
};
use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to prepare {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown residue code '{0}'")]
    UnknownResidue(char),
    #[error("Failed to spawn {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
    #[error("Job exceeded the timeout of {0:?} and was killed")]
    Timeout(Duration),
}

/// Everything a generation needs from the simulation side.
///
/// Implementations must not touch the shared queue or slot documents, a generation records the
/// outcome itself.
pub trait Executor {
    /// create the working directory and everything the driver needs inside it
    fn prepare(&self, job_dir: &Path, job: &JobId) -> Result<(), ExecutorError>;

    /// run the prepared driver to completion on `slot`
    fn run(&self, job_dir: &Path, slot: &SlotId) -> Result<ExitStatus, ExecutorError>;

    fn read_result(&self, job_dir: &Path) -> Result<f64, IngestorError> {
        ingest::read_result(job_dir)
    }
}
